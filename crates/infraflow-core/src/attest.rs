//! Attestation gate: signed provenance for non-empty plans.
//!
//! The gate fires only for [`PlanState::ChangesDetected`]. Empty plans get
//! [`AttestOutcome::NotApplicable`] and the signer is never called. Signing
//! or recording failures are returned as [`PipelineError::Attestation`] and
//! are never retried.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::digest::{canonical_json, compute_digest};
use crate::error::{PipelineError, PipelineResult};
use crate::plan::{PlanResult, PlanState};
use crate::report::{ReportCategory, ReportStore};

/// Category name under which attestation records are stored.
pub const ATTESTATION_CATEGORY: &str = "attestation";

/// Produces signatures over attestation payloads.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex-encoded public key recorded alongside each signature.
    fn public_key_hex(&self) -> String;

    /// Sign `payload`, returning raw signature bytes.
    async fn sign(&self, payload: &[u8]) -> PipelineResult<Vec<u8>>;
}

/// Ed25519 signer holding a local key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Build from a 64-character hex seed.
    pub fn from_hex_seed(seed_hex: &str) -> PipelineResult<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| PipelineError::Configuration(format!("signing seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            PipelineError::Configuration(format!(
                "signing seed must be 32 bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    async fn sign(&self, payload: &[u8]) -> PipelineResult<Vec<u8>> {
        use ed25519_dalek::Signer as _;
        Ok(self.key.sign(payload).to_bytes().to_vec())
    }
}

/// Signed provenance record binding a plan artifact to its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub artifact_ref: Option<String>,
    pub artifact_hash: String,
    pub subject_identity: String,
    pub timestamp: DateTime<Utc>,
    /// Hex signature over [`Attestation::signed_payload`].
    pub signature: String,
    pub public_key: String,
}

impl Attestation {
    /// Canonical bytes covered by the signature.
    pub fn signed_payload(
        artifact_hash: &str,
        subject_identity: &str,
        timestamp: &DateTime<Utc>,
    ) -> PipelineResult<Vec<u8>> {
        let value = json!({
            "artifact_hash": artifact_hash,
            "subject_identity": subject_identity,
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        Ok(canonical_json(&value)?.into_bytes())
    }

    /// `sha256:<hex>` of the canonical record.
    pub fn reference(&self) -> PipelineResult<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| PipelineError::Attestation(format!("encode attestation: {e}")))?;
        Ok(format!("sha256:{}", compute_digest(&value)?))
    }
}

/// Check `attestation` against `public_key_hex`.
pub fn verify_attestation(attestation: &Attestation, public_key_hex: &str) -> PipelineResult<()> {
    let invalid = |what: &str| PipelineError::Attestation(format!("invalid {what}"));

    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|_| invalid("public key"))?
        .try_into()
        .map_err(|_| invalid("public key"))?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid("public key"))?;

    let sig_bytes = hex::decode(&attestation.signature).map_err(|_| invalid("signature"))?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| invalid("signature"))?;

    let payload = Attestation::signed_payload(
        &attestation.artifact_hash,
        &attestation.subject_identity,
        &attestation.timestamp,
    )?;
    key.verify(&payload, &signature)
        .map_err(|_| PipelineError::Attestation("signature does not verify".to_string()))
}

/// Result of the attest stage: an attestation, or an explicit marker that
/// there was nothing to attest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttestOutcome {
    Attested {
        attestation: Attestation,
        attestation_ref: String,
    },
    NotApplicable,
}

impl AttestOutcome {
    pub fn attestation(&self) -> Option<&Attestation> {
        match self {
            AttestOutcome::Attested { attestation, .. } => Some(attestation),
            AttestOutcome::NotApplicable => None,
        }
    }
}

/// Signs and records attestations for one run.
#[derive(Clone)]
pub struct AttestationGate {
    signer: Arc<dyn Signer>,
    store: Arc<dyn ReportStore>,
    environment: String,
    subject_identity: String,
}

impl AttestationGate {
    pub fn new(
        signer: Arc<dyn Signer>,
        store: Arc<dyn ReportStore>,
        environment: impl Into<String>,
        subject_identity: impl Into<String>,
    ) -> Self {
        Self {
            signer,
            store,
            environment: environment.into(),
            subject_identity: subject_identity.into(),
        }
    }

    /// Whether `plan` requires an attestation.
    pub fn applies_to(plan: &PlanResult) -> bool {
        plan.state == PlanState::ChangesDetected
    }

    /// Attest `plan` if it has changes.
    pub async fn attest(&self, plan: &PlanResult) -> PipelineResult<AttestOutcome> {
        if !Self::applies_to(plan) {
            debug!(state = ?plan.state, "nothing to attest");
            return Ok(AttestOutcome::NotApplicable);
        }

        let artifact_hash = plan.artifact_hash.clone().ok_or_else(|| {
            PipelineError::Attestation("plan produced no artifact hash".to_string())
        })?;
        let timestamp = Utc::now();
        let payload = Attestation::signed_payload(&artifact_hash, &self.subject_identity, &timestamp)?;

        let signature = self
            .signer
            .sign(&payload)
            .await
            .map_err(|e| match e {
                PipelineError::Attestation(_) => e,
                other => PipelineError::Attestation(other.to_string()),
            })?;

        let attestation = Attestation {
            artifact_ref: plan.artifact_ref.clone(),
            artifact_hash,
            subject_identity: self.subject_identity.clone(),
            timestamp,
            signature: hex::encode(signature),
            public_key: self.signer.public_key_hex(),
        };
        let attestation_ref = attestation.reference()?;

        let bytes = serde_json::to_vec_pretty(&attestation)
            .map_err(|e| PipelineError::Attestation(format!("encode attestation: {e}")))?;
        let category = ReportCategory::new(ATTESTATION_CATEGORY, &self.environment);
        self.store
            .put(&category, &bytes)
            .await
            .map_err(|e| PipelineError::Attestation(format!("record attestation: {e}")))?;

        info!(
            event = "attestation.recorded",
            attestation_ref = %attestation_ref,
            artifact_hash = %attestation.artifact_hash,
            subject = %attestation.subject_identity,
        );

        Ok(AttestOutcome::Attested {
            attestation,
            attestation_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChangeCounts;
    use crate::report::MemoryReportStore;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    fn plan(state: PlanState) -> PlanResult {
        PlanResult {
            state,
            summary_text: String::new(),
            counts: Some(ChangeCounts::default()),
            artifact_ref: Some("out.tfplan".into()),
            artifact_hash: Some("sha256:abc".into()),
            exit_signal: state.exit_signal(),
            raw_exit_code: Some(0),
            error: None,
        }
    }

    fn gate() -> (AttestationGate, Arc<Ed25519Signer>, Arc<MemoryReportStore>) {
        let signer = Arc::new(Ed25519Signer::from_hex_seed(SEED).unwrap());
        let store = Arc::new(MemoryReportStore::new());
        (
            AttestationGate::new(signer.clone(), store.clone(), "prod", "ci@example"),
            signer,
            store,
        )
    }

    #[test]
    fn test_seed_validation() {
        assert!(Ed25519Signer::from_hex_seed("zz").is_err());
        assert!(Ed25519Signer::from_hex_seed("abcd").is_err());
        assert!(Ed25519Signer::from_hex_seed(SEED).is_ok());
    }

    #[tokio::test]
    async fn test_no_changes_is_not_applicable() {
        let (gate, _, store) = gate();
        let out = gate.attest(&plan(PlanState::NoChanges)).await.unwrap();
        assert_eq!(out, AttestOutcome::NotApplicable);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_changes_are_signed_stored_and_verifiable() {
        let (gate, signer, store) = gate();
        let out = gate.attest(&plan(PlanState::ChangesDetected)).await.unwrap();
        let AttestOutcome::Attested {
            attestation,
            attestation_ref,
        } = out
        else {
            panic!("expected attestation");
        };
        assert!(attestation_ref.starts_with("sha256:"));
        assert_eq!(attestation.subject_identity, "ci@example");
        assert_eq!(store.keys(), vec!["attestation@prod".to_string()]);
        verify_attestation(&attestation, &signer.public_key_hex()).unwrap();
    }

    #[tokio::test]
    async fn test_tampered_attestation_fails_verification() {
        let (gate, signer, _) = gate();
        let out = gate.attest(&plan(PlanState::ChangesDetected)).await.unwrap();
        let mut attestation = out.attestation().unwrap().clone();
        attestation.artifact_hash = "sha256:other".into();
        assert!(verify_attestation(&attestation, &signer.public_key_hex()).is_err());
    }

    #[tokio::test]
    async fn test_attestation_survives_json_round_trip() {
        let (gate, signer, _) = gate();
        let out = gate.attest(&plan(PlanState::ChangesDetected)).await.unwrap();
        let json = serde_json::to_string(out.attestation().unwrap()).unwrap();
        let back: Attestation = serde_json::from_str(&json).unwrap();
        verify_attestation(&back, &signer.public_key_hex()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_artifact_hash_is_attestation_error() {
        let (gate, _, _) = gate();
        let mut p = plan(PlanState::ChangesDetected);
        p.artifact_hash = None;
        assert!(matches!(
            gate.attest(&p).await,
            Err(PipelineError::Attestation(_))
        ));
    }
}

//! Report storage keyed by `{scanner, environment}` category.
//!
//! Two environments writing the same scanner's report never collide because
//! the environment is part of the key.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{PipelineError, PipelineResult};

/// Collision-free category for a stored report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportCategory {
    pub scanner: String,
    pub environment: String,
}

impl ReportCategory {
    pub fn new(scanner: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            scanner: scanner.into(),
            environment: environment.into(),
        }
    }

    /// `"<scanner>@<environment>"`, each part percent-encoded so the `@`
    /// separator is unambiguous.
    pub fn key(&self) -> String {
        format!(
            "{}@{}",
            urlencoding::encode(&self.scanner),
            urlencoding::encode(&self.environment)
        )
    }
}

impl fmt::Display for ReportCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Opaque handle to a stored report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportRef(pub String);

impl fmt::Display for ReportRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Destination for scanner reports and attestation records.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store `payload` under `category`, replacing any previous payload for
    /// the same category.
    async fn put(&self, category: &ReportCategory, payload: &[u8]) -> PipelineResult<ReportRef>;

    async fn get(&self, category: &ReportCategory) -> PipelineResult<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// MemoryReportStore
// ---------------------------------------------------------------------------

/// In-memory store backed by a `HashMap<ReportCategory, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<ReportCategory, Vec<u8>>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .reports
            .lock()
            .map(|r| r.keys().map(ReportCategory::key).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn put(&self, category: &ReportCategory, payload: &[u8]) -> PipelineResult<ReportRef> {
        let mut reports = self
            .reports
            .lock()
            .map_err(|_| PipelineError::Storage("report store lock poisoned".into()))?;
        reports.insert(category.clone(), payload.to_vec());
        Ok(ReportRef(format!("memory://{}", category.key())))
    }

    async fn get(&self, category: &ReportCategory) -> PipelineResult<Option<Vec<u8>>> {
        let reports = self
            .reports
            .lock()
            .map_err(|_| PipelineError::Storage("report store lock poisoned".into()))?;
        Ok(reports.get(category).cloned())
    }
}

// ---------------------------------------------------------------------------
// FsReportStore
// ---------------------------------------------------------------------------

/// Filesystem-backed store.
///
/// Layout: `<root>/<environment>/<scanner>.json`
#[derive(Debug, Clone)]
pub struct FsReportStore {
    root: PathBuf,
}

impl FsReportStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> PipelineResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| storage_err(&root, e))?;
        Ok(Self { root })
    }

    fn report_path(&self, category: &ReportCategory) -> PathBuf {
        self.root
            .join(path_component(&category.environment))
            .join(format!("{}.json", path_component(&category.scanner)))
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn put(&self, category: &ReportCategory, payload: &[u8]) -> PipelineResult<ReportRef> {
        let path = self.report_path(category);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir).map_err(|e| storage_err(&dir, e))?;

        // Write to a temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| storage_err(&dir, e))?;
        tmp.write_all(payload).map_err(|e| storage_err(&path, e))?;
        tmp.persist(&path).map_err(|e| storage_err(&path, e.error))?;

        Ok(ReportRef(path.display().to_string()))
    }

    async fn get(&self, category: &ReportCategory) -> PipelineResult<Option<Vec<u8>>> {
        let path = self.report_path(category);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(&path, e)),
        }
    }
}

/// Reversible, separator-free file name for `component`.
///
/// Percent-encoding keeps distinct inputs distinct. A leading `.` is encoded
/// as well so no component can be `.`, `..` or hidden; `encode` never emits
/// `%2E` itself, so this stays injective.
fn path_component(component: &str) -> String {
    if component.is_empty() {
        return "%".to_string();
    }
    let encoded = urlencoding::encode(component);
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded.into_owned(),
    }
}

fn storage_err(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Storage(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_key_includes_environment() {
        let a = ReportCategory::new("tfsec", "staging");
        let b = ReportCategory::new("tfsec", "prod");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), "tfsec@staging");
    }

    #[tokio::test]
    async fn test_memory_store_keeps_environments_apart() {
        let store = MemoryReportStore::new();
        store
            .put(&ReportCategory::new("tfsec", "staging"), b"staging")
            .await
            .unwrap();
        store
            .put(&ReportCategory::new("tfsec", "prod"), b"prod")
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        let staging = store
            .get(&ReportCategory::new("tfsec", "staging"))
            .await
            .unwrap();
        assert_eq!(staging.as_deref(), Some(&b"staging"[..]));
    }

    #[tokio::test]
    async fn test_fs_store_layout_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::new(dir.path()).unwrap();
        let category = ReportCategory::new("checkov", "prod");

        let reference = store.put(&category, b"{\"ok\":true}").await.unwrap();
        assert!(reference.0.ends_with("checkov.json"));
        assert!(dir.path().join("prod").join("checkov.json").exists());

        let back = store.get(&category).await.unwrap().unwrap();
        assert_eq!(back, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_fs_store_missing_report_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::new(dir.path()).unwrap();
        let missing = store
            .get(&ReportCategory::new("tflint", "dev"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_path_component_blocks_traversal() {
        assert_eq!(path_component("../etc"), "%2E.%2Fetc");
        assert_eq!(path_component(".."), "%2E.");
        assert_eq!(path_component("prod/eu"), "prod%2Feu");
        assert_eq!(path_component("prod_eu"), "prod_eu");
        assert_ne!(path_component(".x"), path_component("%2Ex"));
    }

    #[test]
    fn test_category_key_escapes_separator() {
        let a = ReportCategory::new("a@b", "c");
        let b = ReportCategory::new("a", "b@c");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), "a%40b@c");
    }

    #[tokio::test]
    async fn test_memory_store_separator_in_names_does_not_collide() {
        let store = MemoryReportStore::new();
        store.put(&ReportCategory::new("a@b", "c"), b"first").await.unwrap();
        store.put(&ReportCategory::new("a", "b@c"), b"second").await.unwrap();

        assert_eq!(store.len(), 2);
        let first = store.get(&ReportCategory::new("a@b", "c")).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn test_fs_store_environments_differing_in_punctuation_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::new(dir.path()).unwrap();
        let slash = ReportCategory::new("tfsec", "prod/eu");
        let underscore = ReportCategory::new("tfsec", "prod_eu");

        store.put(&slash, b"PROD-EU").await.unwrap();
        store.put(&underscore, b"PROD_EU").await.unwrap();

        assert_eq!(store.get(&slash).await.unwrap().unwrap(), b"PROD-EU");
        assert_eq!(store.get(&underscore).await.unwrap().unwrap(), b"PROD_EU");
    }

    #[tokio::test]
    async fn test_fs_store_never_escapes_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("reports");
        let store = FsReportStore::new(&root).unwrap();

        let reference = store
            .put(&ReportCategory::new("..", ".."), b"x")
            .await
            .unwrap();
        assert!(Path::new(&reference.0).starts_with(&root));
    }
}

//! infraflow - infrastructure-change validation pipeline
//!
//! ## Commands
//!
//! - `run`: validate, scan, gate, plan and attest one environment
//! - `parse-plan`: classify a saved plan summary and exit with its signal
//! - `graph`: print the stage graph in execution waves

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use infraflow_core::{
    parse_plan_summary, AttestOutcome, Collaborators, Ed25519Signer, FsReportStore,
    MemoryReportStore, Pipeline, PipelineError, PipelineResult, PipelineRun, PlanState,
    ReportStore, RunConfig, Signer, StageGraph,
};

#[derive(Parser)]
#[command(name = "infraflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Infrastructure-change validation pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one environment
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory for scan reports and attestations (in-memory if omitted)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// File holding the hex Ed25519 signing seed (takes precedence over the seed)
        #[arg(long)]
        signing_key_file: Option<PathBuf>,

        /// Hex Ed25519 signing seed
        #[arg(long, env = "INFRAFLOW_SIGNING_SEED", hide_env_values = true)]
        signing_seed: Option<String>,

        /// Identity recorded in attestations
        #[arg(long, env = "INFRAFLOW_IDENTITY", default_value = "infraflow")]
        identity: String,

        /// Maximum stages executing at once
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Output format for the run record
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Classify a saved plan summary
    ParsePlan {
        /// File containing the plan command's textual output
        file: PathBuf,
    },

    /// Print the stage graph for a configuration
    Graph {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Target environment
    #[arg(long, env = "INFRAFLOW_ENVIRONMENT")]
    environment: Option<String>,

    /// Infrastructure configuration directory
    #[arg(long)]
    working_directory: Option<PathBuf>,

    /// Variable file passed to scanners and plan
    #[arg(long)]
    var_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named parameter, e.g. `enable-tfsec=false` (repeatable)
    #[arg(short, long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// Layer: defaults < file < flags < `--param`.
fn build_config(args: &ConfigArgs) -> Result<RunConfig> {
    let mut builder = RunConfig::builder();
    if let Some(path) = &args.config {
        builder = builder
            .file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
    }
    if let Some(env) = &args.environment {
        builder = builder.environment(env);
    }
    if let Some(dir) = &args.working_directory {
        builder = builder.working_directory(dir);
    }
    if let Some(var_file) = &args.var_file {
        builder = builder.var_file(var_file);
    }
    let builder = builder.params(args.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    Ok(builder.build()?)
}

/// Stand-in signer when no key was configured; attesting fails the run.
struct NoSigningKey;

#[async_trait]
impl Signer for NoSigningKey {
    fn public_key_hex(&self) -> String {
        String::new()
    }

    async fn sign(&self, _payload: &[u8]) -> PipelineResult<Vec<u8>> {
        Err(PipelineError::Attestation(
            "no signing key configured (--signing-key-file or INFRAFLOW_SIGNING_SEED)".to_string(),
        ))
    }
}

fn load_signer(key_file: Option<&Path>, seed: Option<&str>) -> Result<Arc<dyn Signer>> {
    let seed = match (key_file, seed) {
        (Some(path), _) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read signing key {}", path.display()))?,
        ),
        (None, Some(seed)) => Some(seed.to_string()),
        (None, None) => None,
    };
    let signer: Arc<dyn Signer> = match seed {
        Some(seed) => Arc::new(Ed25519Signer::from_hex_seed(&seed)?),
        None => Arc::new(NoSigningKey),
    };
    Ok(signer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    infraflow_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            report_dir,
            signing_key_file,
            signing_seed,
            identity,
            max_concurrency,
            output,
        } => {
            let config = build_config(&config)?;
            let signer = load_signer(signing_key_file.as_deref(), signing_seed.as_deref())?;
            let code = cmd_run(
                config,
                report_dir.as_deref(),
                signer,
                &identity,
                max_concurrency,
                output,
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::ParsePlan { file } => {
            let code = cmd_parse_plan(&file)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Graph { config } => cmd_graph(&build_config(&config)?),
    }
}

async fn cmd_run(
    config: RunConfig,
    report_dir: Option<&Path>,
    signer: Arc<dyn Signer>,
    identity: &str,
    max_concurrency: Option<usize>,
    output: OutputFormat,
) -> Result<i32> {
    let store: Arc<dyn ReportStore> = match report_dir {
        Some(dir) => Arc::new(
            FsReportStore::new(dir)
                .with_context(|| format!("Failed to open report dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryReportStore::new()),
    };

    info!(environment = %config.environment, "starting pipeline");
    let mut pipeline = Pipeline::new(config, Collaborators::terraform(signer, store), identity);
    if let Some(limit) = max_concurrency {
        pipeline = pipeline.with_max_concurrency(limit);
    }
    let run = pipeline.run().await.context("Pipeline failed to start")?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
        OutputFormat::Text => print_run(&run),
    }
    Ok(run.exit_code())
}

fn print_run(run: &PipelineRun) {
    println!("Run ID: {}", run.run_id);
    println!("Environment: {}", run.environment);
    println!();

    for record in run.stages.values() {
        let detail = match (record.state.skip_reason(), record.duration_ms) {
            (Some(reason), _) => format!(" ({reason:?})"),
            (None, Some(ms)) => format!(" ({ms}ms)"),
            (None, None) => String::new(),
        };
        println!("  {:<18} {}{}", record.id, record.state.label(), detail);
    }
    println!();

    if let Some(aggregate) = &run.aggregate {
        println!(
            "Gate: {}",
            if aggregate.all_passed { "PASSED" } else { "FAILED" }
        );
        for name in aggregate.failing() {
            println!("  - {name}");
        }
    }
    if let Some(plan) = &run.plan {
        println!("Plan: {:?} (exit signal {})", plan.state, plan.exit_signal);
        if let Some(counts) = &plan.counts {
            println!(
                "  {} to add, {} to change, {} to destroy",
                counts.add, counts.change, counts.destroy
            );
        }
    }
    match &run.attestation {
        Some(AttestOutcome::Attested {
            attestation_ref, ..
        }) => println!("Attestation: {attestation_ref}"),
        Some(AttestOutcome::NotApplicable) => println!("Attestation: not applicable"),
        None => {}
    }
    if let Some(halt) = &run.halted_by {
        println!("Halted by {}: {}", halt.stage, halt.message);
    }
    println!();
    println!(
        "Status: {}",
        if run.succeeded() { "PASSED" } else { "FAILED" }
    );
}

/// Prints the classification and returns the plan's exit signal.
fn cmd_parse_plan(file: &Path) -> Result<i32> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    match parse_plan_summary(&text) {
        Ok(counts) => {
            let state = PlanState::from_counts(&counts);
            println!(
                "{:?}: {} to add, {} to change, {} to destroy",
                state, counts.add, counts.change, counts.destroy
            );
            Ok(state.exit_signal())
        }
        Err(e) => {
            eprintln!("Errored: {e}");
            Ok(PlanState::Errored.exit_signal())
        }
    }
}

fn cmd_graph(config: &RunConfig) -> Result<()> {
    let graph = StageGraph::standard(config)?;
    for (i, wave) in graph.levels()?.iter().enumerate() {
        let ids: Vec<String> = wave
            .iter()
            .map(|node| {
                let disabled = match &node.kind {
                    infraflow_core::StageKind::Scan(name) => {
                        config.scanner(name).is_some_and(|s| !s.enabled)
                    }
                    _ => false,
                };
                if disabled {
                    format!("{} (disabled)", node.id)
                } else {
                    node.id.clone()
                }
            })
            .collect();
        println!("{}: {}", i + 1, ids.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(params: &[(&str, &str)]) -> ConfigArgs {
        ConfigArgs {
            environment: Some("dev".into()),
            working_directory: None,
            var_file: None,
            config: None,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("enable-tfsec=false").unwrap(),
            ("enable-tfsec".to_string(), "false".to_string())
        );
        assert_eq!(
            parse_key_val("backend-key=a=b").unwrap(),
            ("backend-key".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_params_override_flags() {
        let config = build_config(&args(&[("environment", "prod")])).unwrap();
        assert_eq!(config.environment, "prod");
    }

    #[test]
    fn test_missing_environment_fails() {
        let mut a = args(&[]);
        a.environment = None;
        assert!(build_config(&a).is_err());
    }

    #[test]
    fn test_config_file_is_layered_under_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("infraflow.toml");
        std::fs::write(
            &path,
            "environment = \"staging\"\n[scanners.tfsec]\nenabled = false\n",
        )
        .unwrap();
        let mut a = args(&[]);
        a.config = Some(path);
        let config = build_config(&a).unwrap();
        assert_eq!(config.environment, "dev");
        assert!(!config.scanner("tfsec").unwrap().enabled);
    }

    #[test]
    fn test_parse_plan_exit_signals() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("Plan: 0 to add, 0 to change, 0 to destroy.", 0),
            ("Plan: 3 to add, 1 to change, 0 to destroy.", 2),
            ("No changes. Your infrastructure matches the configuration.", 0),
            ("Plan: 18446744073709551615 to add, 1 to change, 0 to destroy.", 1),
            ("nothing recognizable", 1),
        ];
        for (summary, expected) in cases {
            let path = dir.path().join("plan.txt");
            std::fs::write(&path, summary).unwrap();
            assert_eq!(cmd_parse_plan(&path).unwrap(), expected, "{summary}");
        }
    }

    #[test]
    fn test_signer_loading() {
        let seed = "11".repeat(32);
        assert!(load_signer(None, Some(&seed)).is_ok());
        assert!(load_signer(None, Some("bad")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, format!("{seed}\n")).unwrap();
        let signer = load_signer(Some(&path), None).unwrap();
        assert_eq!(signer.public_key_hex().len(), 64);
    }

    #[tokio::test]
    async fn test_missing_key_signer_fails() {
        assert!(matches!(
            NoSigningKey.sign(b"x").await,
            Err(PipelineError::Attestation(_))
        ));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "infraflow",
            "run",
            "--environment",
            "prod",
            "-p",
            "enable-checkov=false",
            "--output",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { config, output, .. } => {
                assert_eq!(config.environment.as_deref(), Some("prod"));
                assert_eq!(config.params.len(), 1);
                assert!(output == OutputFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }
}

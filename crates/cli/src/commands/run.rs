//! Run Command
//!
//! Loads scenario files, runs them against the configured endpoint and
//! reports per-scenario results.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use restament::{
    load_scenarios, DbConfig, Restament, RestamentConfig, ScenarioResult, SuiteResult,
};
use tracing::{debug, info};

use crate::output::{
    print_error, print_json, print_success, render_table, truncate, OutputFormat, TableDisplay,
};

const DEFAULT_CONFIG_FILE: &str = "restament.toml";
const ERROR_DISPLAY_LENGTH: usize = 80;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory containing scenario YAML files
    #[arg(short, long, default_value = "tests/scenarios")]
    pub specs: PathBuf,

    /// Configuration file (defaults to ./restament.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Base URL of the application under test
    #[arg(long, env = "RESTAMENT_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Directory the application writes uploads to
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Directory for image diffs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// SQLite database shared with the application
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Per-scenario timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Run only scenarios with this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Run only scenarios whose name contains this text
    #[arg(short, long)]
    pub name: Option<String>,

    /// Write test-results.json to this directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl TableDisplay for ScenarioResult {
    fn headers() -> Vec<&'static str> {
        vec!["", "Scenario", "Title", "Duration", "Failed Step", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            if self.success { "✓".to_string() } else { "✗".to_string() },
            self.name.clone(),
            self.title.clone(),
            format!("{} ms", self.duration_ms),
            self.failed_step.map(|s| s.to_string()).unwrap_or_default(),
            self.error
                .as_ref()
                .map(|e| truncate(&e.message, ERROR_DISPLAY_LENGTH))
                .unwrap_or_default(),
        ]
    }
}

/// Returns whether every scenario passed
pub async fn execute(args: RunArgs, format: OutputFormat) -> Result<bool> {
    let config = build_config(&args)?;

    let scenarios = load_scenarios(&args.specs, args.tag.as_deref(), args.name.as_deref())
        .with_context(|| format!("failed to load scenarios from {}", args.specs.display()))?;
    if scenarios.is_empty() {
        bail!("no scenarios matched under {}", args.specs.display());
    }
    info!("Loaded {} scenario(s) from {}", scenarios.len(), args.specs.display());

    let restament = Restament::new(config)?;
    let suite = restament.test(&scenarios).await?;

    match format {
        OutputFormat::Table => print_summary(&suite),
        OutputFormat::Json => print_json(&suite),
    }

    if let Some(dir) = &args.output {
        suite.write_results(dir)?;
    }

    Ok(suite.success())
}

/// Config file first, then command-line overrides
fn build_config(args: &RunArgs) -> Result<RestamentConfig> {
    let file = match &args.config {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    let mut config = match file {
        Some(path) => load_config(&path)?,
        None => RestamentConfig::new(""),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(dir) = &args.upload_dir {
        config.upload_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = Some(dir.clone());
    }
    if let Some(db) = &args.db {
        config.db = Some(DbConfig::sqlite(db));
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    if config.endpoint.trim().is_empty() {
        bail!(
            "no endpoint configured; pass --endpoint, set RESTAMENT_ENDPOINT or add it to {}",
            DEFAULT_CONFIG_FILE
        );
    }
    Ok(config)
}

fn load_config(path: &Path) -> Result<RestamentConfig> {
    debug!("Loading configuration from {}", path.display());
    RestamentConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn print_summary(suite: &SuiteResult) {
    println!("{}", render_table(&suite.results));

    let summary = format!(
        "{} passed, {} failed, {} total ({} ms)",
        suite.passed, suite.failed, suite.total, suite.duration_ms
    );
    if suite.success() {
        print_success(&summary.green().to_string());
    } else {
        print_error(&summary.red().to_string());
    }
}

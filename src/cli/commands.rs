//! CLI command definitions

use crate::core::SecurityLevel;
use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub config: String,

    /// Set the `force_release` flag seen by stage conditions
    #[arg(long)]
    pub force_release: bool,

    /// Security gate enforcement
    #[arg(long, value_enum, default_value_t = SecurityLevelArg::Standard)]
    pub security_level: SecurityLevelArg,

    /// Notification recipient
    #[arg(long)]
    pub notify: Option<String>,

    /// Source branch (defaults to $BRANCH_NAME)
    #[arg(long)]
    pub branch: Option<String>,

    /// Artifact version (defaults to $BUILD_VERSION)
    #[arg(long)]
    pub version: Option<String>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub config: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run by ID
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Security level argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SecurityLevelArg {
    Standard,
    Strict,
}

impl From<SecurityLevelArg> for SecurityLevel {
    fn from(arg: SecurityLevelArg) -> Self {
        match arg {
            SecurityLevelArg::Standard => SecurityLevel::Standard,
            SecurityLevelArg::Strict => SecurityLevel::Strict,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

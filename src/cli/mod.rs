//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Deployment pipeline orchestrator
#[derive(Debug, Parser, Clone)]
#[command(name = "release-pipeline")]
#[command(author = "Release Pipeline Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Build, gate and blue-green release a service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    RunPipeline(RunCommand),

    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SecurityLevel;
    use commands::SecurityLevelArg;

    #[test]
    fn test_parse_run_pipeline() {
        let cli = Cli::try_parse_from([
            "release-pipeline",
            "run-pipeline",
            "--config",
            "pipeline.yaml",
            "--force-release",
            "--security-level",
            "strict",
            "--notify",
            "ops@example.com",
            "--variable",
            "region=eu-west-1",
            "--variable",
            "replicas=2",
        ])
        .unwrap();

        let Command::RunPipeline(cmd) = cli.command else {
            panic!("expected run-pipeline");
        };
        assert_eq!(cmd.config, "pipeline.yaml");
        assert!(cmd.force_release);
        assert_eq!(SecurityLevel::from(cmd.security_level), SecurityLevel::Strict);
        assert_eq!(cmd.notify.as_deref(), Some("ops@example.com"));
        assert_eq!(cmd.variable.len(), 2);
        assert_eq!(cmd.variable[0], ("region".to_string(), "eu-west-1".to_string()));
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["release-pipeline", "run-pipeline", "-c", "p.yaml"]).unwrap();
        let Command::RunPipeline(cmd) = cli.command else {
            panic!("expected run-pipeline");
        };
        assert!(!cmd.force_release);
        assert_eq!(cmd.security_level, SecurityLevelArg::Standard);
        assert!(cmd.version.is_none());
    }

    #[test]
    fn test_rejects_unknown_security_level() {
        assert!(Cli::try_parse_from([
            "release-pipeline",
            "run-pipeline",
            "-c",
            "p.yaml",
            "--security-level",
            "paranoid",
        ])
        .is_err());
    }

    #[test]
    fn test_bad_variable() {
        assert!(Cli::try_parse_from(["release-pipeline", "run-pipeline", "-c", "p.yaml", "--variable", "novalue"])
            .is_err());
    }
}

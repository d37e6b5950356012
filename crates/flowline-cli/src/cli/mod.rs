//! CLI command definitions for the `flowline` binary.
//!
//! Uses clap derive macros for argument parsing. Handlers live in the
//! `workflow` and `schedule` submodules.

pub mod schedule;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// Run agent workflows and cron jobs.
#[derive(Parser)]
#[command(name = "flowline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "FLOWLINE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "info,flowline_core=debug,flowline=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow definition file.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Preview the next fire times of a cron expression or alias.
    #[command(name = "next-runs")]
    NextRuns {
        /// 5-field cron expression or alias such as "every 15 minutes".
        expr: String,

        /// Number of fire times to show.
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,

        /// "UTC" or a fixed offset such as "+05:30" (defaults to the configured timezone).
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Run a workflow file once against the built-in demo agents.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// JSON input for the run.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Approve approval gates automatically instead of rejecting them.
        #[arg(long)]
        approve: bool,

        /// Print every engine event while the run progresses.
        #[arg(long)]
        events: bool,
    },

    /// Run the cron scheduler for the jobs in a YAML file.
    Schedule {
        /// Path to the jobs YAML file.
        file: PathBuf,

        /// Run every enabled job once right away, print the results and exit.
        #[arg(long)]
        once: bool,
    },

    /// Print the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_runs_with_flags() {
        let cli = Cli::try_parse_from([
            "flowline",
            "next-runs",
            "every 15 minutes",
            "--count",
            "3",
            "--timezone",
            "+02:00",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::NextRuns {
                expr,
                count,
                timezone,
            } => {
                assert_eq!(expr, "every 15 minutes");
                assert_eq!(count, 3);
                assert_eq!(timezone.as_deref(), Some("+02:00"));
            }
            _ => panic!("expected next-runs"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["flowline", "run", "order.yaml", "--config", "custom.toml"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert!(!cli.otel);
        match cli.command {
            Commands::Run {
                file,
                input,
                approve,
                events,
            } => {
                assert_eq!(file, PathBuf::from("order.yaml"));
                assert_eq!(input, "{}");
                assert!(!approve);
                assert!(!events);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["flowline"]).is_err());
    }
}

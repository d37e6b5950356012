//! Flowline CLI entry point.
//!
//! Binary name: `flowline`
//!
//! Parses CLI arguments, initializes tracing, loads the configuration, wires
//! the engine, runner and scheduler, then dispatches to a command handler.

mod agents;
mod cli;
mod config;
mod state;

use clap::Parser;
use flowline_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: cli.log_filter().to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: cli.otel,
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = config::load_config(&cli.config);

    match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.json),

        Commands::NextRuns {
            expr,
            count,
            timezone,
        } => {
            let timezone = timezone.unwrap_or_else(|| config.scheduler.default_timezone.clone());
            cli::schedule::handle_next_runs(&expr, &timezone, count, cli.json)
        }

        Commands::Run {
            file,
            input,
            approve,
            events,
        } => {
            let state = AppState::init(config);
            cli::workflow::handle_run(&state, &file, &input, approve, events, cli.json).await
        }

        Commands::Schedule { file, once } => {
            let state = AppState::init(config);
            cli::schedule::handle_schedule(&state, &file, once, cli.json).await
        }

        Commands::Config => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("# effective configuration ({})", cli.config.display());
                print!("{}", config::render_config(&config)?);
            }
            Ok(())
        }
    }
}

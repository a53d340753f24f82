//! HL7 Loader - Main entry point

use clap::Parser;
use hl7_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use hl7_ingest::commands::{self, load::LoadOptions, EXIT_ABORTED};
use hl7_ingest::{Cli, Commands};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Console logs go to stderr; the report owns stdout
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("hl7-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid HL7_LOG_* settings: {}", e);
        LogConfig::default()
    });

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let code = match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            EXIT_ABORTED
        },
    };

    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn execute_command(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Load {
            file,
            dry_run,
            format,
            project,
            dataset,
            max_batch_rows,
            concurrency,
            inference,
        } => {
            commands::load::run(LoadOptions {
                file,
                dry_run,
                format,
                project,
                dataset,
                max_batch_rows,
                concurrency,
                inference,
            })
            .await
        },

        Commands::Inspect {
            file,
            format,
            inference,
        } => commands::inspect::run(&file, format, &inference).await,
    }
}

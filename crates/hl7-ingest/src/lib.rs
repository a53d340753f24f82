//! HL7 Loader Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads HL7 v2 message files into a BigQuery dataset, one table per segment
//! type.
//!
//! # Overview
//!
//! - **Decoding**: split a file into messages and segments ([`decoder`])
//! - **Inference**: coerce field values and derive a schema per segment
//!   ([`inference`])
//! - **Provisioning**: create or widen one table per segment name, once per run
//!   ([`registry`])
//! - **Loading**: batch rows with retries and per-row failure isolation
//!   ([`pipeline`], [`retry`])
//! - **Reporting**: per-segment counts and an exit status ([`summary`])
//!
//! [`orchestrator::RunOrchestrator`] ties these together; [`config::LoaderConfig`]
//! wires one up from the environment.

pub mod commands;
pub mod config;
pub mod decoder;
pub mod inference;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod store;
pub mod summary;

// Re-export commonly used types
pub use config::LoaderConfig;
pub use decoder::{Decoder, Message, Segment};
pub use inference::{ColumnType, InferredSchema, SchemaInferrer};
pub use orchestrator::{RunOrchestrator, RunState};
pub use store::{InMemoryStore, RemoteStore, TableRef};
pub use summary::{RunOutcome, RunSummary};

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// HL7 Loader - load HL7 v2 files into BigQuery
#[derive(Parser, Debug)]
#[command(name = "hl7-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load an HL7 file into BigQuery
    Load {
        /// HL7 v2 source file
        file: PathBuf,

        /// Load into an in-memory store instead of BigQuery
        #[arg(long)]
        dry_run: bool,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// GCP project id
        #[arg(long)]
        project: Option<String>,

        /// BigQuery dataset
        #[arg(long)]
        dataset: Option<String>,

        /// Maximum rows per insert request
        #[arg(long)]
        max_batch_rows: Option<usize>,

        /// Segment types flushed concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        #[command(flatten)]
        inference: InferenceArgs,
    },

    /// Print the schema inferred for each segment type
    Inspect {
        /// HL7 v2 source file
        file: PathBuf,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        #[command(flatten)]
        inference: InferenceArgs,
    },
}

/// Options shared by `load` and `inspect`
#[derive(Args, Debug, Clone, Default)]
pub struct InferenceArgs {
    /// Segment types to skip (default MSH; pass "" to load every type)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Keep every value as a string
    #[arg(long)]
    pub no_infer_types: bool,

    /// JSON file naming columns per segment field position
    #[arg(long)]
    pub field_dictionary: Option<PathBuf>,
}

impl InferenceArgs {
    /// Apply these flags over the environment configuration
    pub fn apply(&self, config: &mut LoaderConfig) {
        if !self.exclude.is_empty() {
            config.load.exclude_segments = config::split_list(&self.exclude.join(","));
        }
        if self.no_infer_types {
            config.load.infer_types = false;
        }
        if let Some(path) = &self.field_dictionary {
            config.load.field_dictionary = Some(path.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

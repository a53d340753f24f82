//! `hl7-ingest load` command implementation

use crate::config::LoaderConfig;
use crate::retry::TokioClock;
use crate::store::{InMemoryStore, RemoteStore};
use crate::{InferenceArgs, OutputFormat};
use anyhow::Context;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Flags accepted by `load`
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub file: PathBuf,
    pub dry_run: bool,
    pub format: OutputFormat,
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub max_batch_rows: Option<usize>,
    pub concurrency: Option<usize>,
    pub inference: InferenceArgs,
}

impl LoadOptions {
    fn apply(&self, config: &mut LoaderConfig) {
        if let Some(project) = &self.project {
            config.bigquery.project_id = Some(project.clone());
        }
        if let Some(dataset) = &self.dataset {
            config.bigquery.dataset = dataset.clone();
        }
        if let Some(rows) = self.max_batch_rows {
            config.batch.max_rows = rows;
        }
        if let Some(concurrency) = self.concurrency {
            config.load.concurrency = concurrency;
        }
        self.inference.apply(config);
    }
}

/// Load one file and print the run report
pub async fn run(options: LoadOptions) -> anyhow::Result<i32> {
    let mut config = LoaderConfig::from_env();
    options.apply(&mut config);
    config.validate().context("Invalid loader configuration")?;

    let dry_run_store = options.dry_run.then(|| Arc::new(InMemoryStore::new()));
    let store: Arc<dyn RemoteStore> = match &dry_run_store {
        Some(memory) => memory.clone(),
        None => {
            config.project_id()?;
            Arc::new(config.bigquery_store()?)
        },
    };

    let run_id = Uuid::new_v4().simple().to_string();
    let orchestrator = config.build_orchestrator(store, Arc::new(TokioClock), &run_id)?;

    info!(
        run_id = %run_id,
        dry_run = options.dry_run,
        dataset = %config.bigquery.dataset,
        "Loading HL7 file"
    );
    let summary = orchestrator.run(&options.file).await;

    match options.format {
        OutputFormat::Json => println!("{}", summary.to_json()?),
        OutputFormat::Text => {
            print!("{}", summary.render_text());
            if let Some(memory) = &dry_run_store {
                print!("{}", render_dry_run_tables(memory));
            }
        },
    }

    Ok(summary.exit_code())
}

fn render_dry_run_tables(store: &InMemoryStore) -> String {
    let names = store.table_names();
    if names.is_empty() {
        return String::new();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Table", "Rows", "Columns"]);

    for name in names {
        let columns = store
            .schema(&name)
            .map(|schema| {
                schema
                    .columns()
                    .iter()
                    .map(|c| format!("{}:{}", c.name, c.column_type))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        table.add_row(vec![name.clone(), store.rows(&name).len().to_string(), columns]);
    }

    format!("Dry run tables:\n{}\n", table)
}

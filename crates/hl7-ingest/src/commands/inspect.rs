//! `hl7-ingest inspect` command implementation
//!
//! Decodes a file and prints the schema each segment type would get, without
//! contacting any store.

use super::EXIT_ABORTED;
use crate::config::LoaderConfig;
use crate::orchestrator::{inspect, SegmentInspection};
use crate::{InferenceArgs, OutputFormat};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::error;

pub async fn run(file: &Path, format: OutputFormat, inference: &InferenceArgs) -> anyhow::Result<i32> {
    let mut config = LoaderConfig::from_env();
    inference.apply(&mut config);
    let inferrer = config.inferrer()?;

    let segments = match inspect(file, &inferrer, &config.load.exclude_segments) {
        Ok(segments) => segments,
        Err(e) => {
            error!(error = %e, file = %file.display(), "Inspection failed");
            eprintln!("Error: {}", e);
            return Ok(EXIT_ABORTED);
        },
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&segments)?),
        OutputFormat::Text => print!("{}", render_text(&segments)),
    }

    Ok(0)
}

fn render_text(segments: &BTreeMap<String, SegmentInspection>) -> String {
    if segments.is_empty() {
        return "No segments found.\n".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Segment", "Rows", "Column", "Type", "String fallbacks"]);

    for (name, inspection) in segments {
        let mut first = true;
        for column in inspection.schema.columns() {
            let (segment, rows, fallbacks) = if first {
                (
                    name.clone(),
                    inspection.rows.to_string(),
                    inspection.string_fallbacks.to_string(),
                )
            } else {
                (String::new(), String::new(), String::new())
            };
            first = false;
            table.add_row(vec![
                segment,
                rows,
                column.name.clone(),
                column.column_type.to_string(),
                fallbacks,
            ]);
        }
        if first {
            table.add_row(vec![
                name.clone(),
                inspection.rows.to_string(),
                "-".to_string(),
                "-".to_string(),
                inspection.string_fallbacks.to_string(),
            ]);
        }
    }

    format!("{}\n", table)
}

//! Run orchestrator
//!
//! Drives one load run through its states:
//!
//! ```text
//! Idle -> Decoding -> Processing -> Flushing -> Done
//!   |        |
//!   +--------+-> Aborted (dataset unavailable, decode error)
//! ```
//!
//! Every run arms the retry deadline afresh and confirms the target dataset
//! before decoding.
//!
//! Processing walks every segment of every message in source order: infer,
//! ensure the segment's table, buffer the row. A segment name whose table
//! cannot be ensured is fatal for that name only; its buffered and later
//! rows are tallied as failed. Flushing submits each segment buffer through
//! the load pipeline, several segment types at a time.

use crate::decoder::{Decoder, Message};
use crate::inference::{InferredRow, InferredSchema, SchemaInferrer};
use crate::pipeline::{FailureKind, LoadPipeline, LoadResult, RowRejection};
use crate::registry::TableRegistry;
use crate::retry::Retrier;
use crate::summary::RunSummary;
use futures::stream::{self, StreamExt};
use hl7_common::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of segment types flushed concurrently
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Decoding,
    Processing,
    Flushing,
    Done,
    Aborted,
}

#[derive(Debug, Default)]
struct SegmentBuffer {
    rows: Vec<InferredRow>,
    failed: bool,
}

pub struct RunOrchestrator {
    decoder: Decoder,
    inferrer: SchemaInferrer,
    registry: TableRegistry,
    pipeline: LoadPipeline,
    retrier: Arc<Retrier>,
    excluded: HashSet<String>,
    concurrency: usize,
    run_timeout: Option<Duration>,
    state: Mutex<RunState>,
}

impl RunOrchestrator {
    pub fn new(
        inferrer: SchemaInferrer,
        registry: TableRegistry,
        pipeline: LoadPipeline,
        retrier: Arc<Retrier>,
    ) -> Self {
        Self {
            decoder: Decoder::new(),
            inferrer,
            registry,
            pipeline,
            retrier,
            excluded: HashSet::new(),
            concurrency: DEFAULT_CONCURRENCY,
            run_timeout: None,
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Segment names to skip entirely, e.g. `MSH`
    pub fn with_excluded_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded = segments
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "Run state transition");
        *state = next;
    }

    /// Load one HL7 file. Never fails: every outcome is in the summary.
    pub async fn run(&self, source: &Path) -> RunSummary {
        let mut summary = RunSummary::new(self.pipeline.run_id(), source.display().to_string());
        info!(run_id = %self.pipeline.run_id(), source = %source.display(), "Starting load run");

        let deadline = self.retrier.deadline();
        let previous = match self.run_timeout {
            Some(timeout) => deadline.arm(self.retrier.clock().now() + timeout),
            None => deadline.disarm(),
        };
        if previous.is_some() {
            debug!("Replaced the previous run's deadline");
        }

        if let Err(e) = self.registry.check_dataset().await {
            error!(error = %e, "Target dataset unavailable, aborting run");
            summary.abort(e.to_string());
            self.transition(RunState::Aborted);
            return summary;
        }

        self.transition(RunState::Decoding);
        let messages = match self.decoder.decode_file(source) {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Decoding failed, aborting run");
                summary.abort(e.to_string());
                self.transition(RunState::Aborted);
                return summary;
            },
        };
        summary.record_messages(messages.len());

        self.transition(RunState::Processing);
        let buffers = self.process(&messages, &mut summary).await;

        self.transition(RunState::Flushing);
        for (segment, result) in self.flush(buffers).await {
            summary.record_load(&segment, result);
        }

        summary.finish();
        self.transition(RunState::Done);

        let totals = summary.totals();
        info!(
            messages = summary.messages(),
            succeeded = totals.succeeded,
            failed = totals.failed(),
            fatal_segments = summary.fatal_conditions().len(),
            "Load run finished"
        );
        summary
    }

    async fn process(
        &self,
        messages: &[Message],
        summary: &mut RunSummary,
    ) -> BTreeMap<String, SegmentBuffer> {
        let mut buffers: BTreeMap<String, SegmentBuffer> = BTreeMap::new();

        for message in messages {
            for segment in &message.segments {
                if self.excluded.contains(&segment.name) {
                    continue;
                }

                let inference = self.inferrer.infer(segment, message.index);
                summary.record_attempt(&segment.name, inference.string_fallbacks);

                let buffer = buffers.entry(segment.name.clone()).or_default();
                if buffer.failed {
                    summary.record_failed_rows(&segment.name, 1, FailureKind::Permanent);
                    continue;
                }

                match self.registry.ensure(&segment.name, &inference.schema).await {
                    Ok(_) => buffer.rows.push(inference.row),
                    Err(e) => {
                        warn!(
                            segment = %segment.name,
                            message = message.index,
                            error = %e,
                            "Segment failed, skipping its remaining rows"
                        );
                        summary.record_fatal(&segment.name, &e);
                        summary.record_failed_rows(
                            &segment.name,
                            buffer.rows.len() + 1,
                            FailureKind::Permanent,
                        );
                        buffer.rows.clear();
                        buffer.failed = true;
                    },
                }
            }
        }

        buffers
    }

    async fn flush(&self, buffers: BTreeMap<String, SegmentBuffer>) -> Vec<(String, LoadResult)> {
        let work: Vec<(String, Vec<InferredRow>)> = buffers
            .into_iter()
            .filter(|(_, buffer)| !buffer.failed && !buffer.rows.is_empty())
            .map(|(segment, buffer)| (segment, buffer.rows))
            .collect();

        info!(
            segments = work.len(),
            concurrency = self.concurrency,
            "Flushing segment buffers"
        );

        stream::iter(work)
            .map(|(segment, rows)| async move {
                let result = match self.registry.descriptor(&segment).await {
                    Some(descriptor) => self.pipeline.submit(&descriptor, &rows).await,
                    None => LoadResult {
                        rejected: rows
                            .iter()
                            .map(|row| RowRejection {
                                message_index: row.message_index,
                                reason: format!("no table is available for segment {}", segment),
                                kind: FailureKind::Permanent,
                            })
                            .collect(),
                        ..LoadResult::default()
                    },
                };
                (segment, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

/// Schema and row count inferred for one segment name
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInspection {
    pub rows: usize,
    pub string_fallbacks: usize,
    pub schema: InferredSchema,
}

/// Decode a file and infer the merged schema of every segment name without
/// touching a store
pub fn inspect(
    source: &Path,
    inferrer: &SchemaInferrer,
    excluded: &[String],
) -> Result<BTreeMap<String, SegmentInspection>> {
    let messages = Decoder::new().decode_file(source)?;
    let mut segments: BTreeMap<String, SegmentInspection> = BTreeMap::new();

    for message in &messages {
        for segment in &message.segments {
            if excluded.iter().any(|e| e.eq_ignore_ascii_case(&segment.name)) {
                continue;
            }

            let inference = inferrer.infer(segment, message.index);
            let entry = segments
                .entry(segment.name.clone())
                .or_insert_with(|| SegmentInspection {
                    rows: 0,
                    string_fallbacks: 0,
                    schema: InferredSchema::new(),
                });
            entry.rows += 1;
            entry.string_fallbacks += inference.string_fallbacks;
            entry.schema.merge(&inference.schema);
        }
    }

    Ok(segments)
}

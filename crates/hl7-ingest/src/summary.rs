//! Run summary and report rendering
//!
//! Every row of a run ends in exactly one bucket: succeeded, failed after
//! exhausting transient retries, or failed permanently.

use crate::pipeline::{BatchFailure, FailureKind, LoadResult};
use chrono::{DateTime, Utc};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use hl7_common::IngestError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Per-segment row counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentTally {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed_transient: usize,
    pub failed_permanent: usize,
    /// Values kept as strings because no typed rule matched
    pub string_fallbacks: usize,
}

impl SegmentTally {
    pub fn failed(&self) -> usize {
        self.failed_transient + self.failed_permanent
    }

    /// Every attempted row is accounted for
    pub fn is_balanced(&self) -> bool {
        self.attempted == self.succeeded + self.failed()
    }

    fn add(&mut self, other: &SegmentTally) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed_transient += other.failed_transient;
        self.failed_permanent += other.failed_permanent;
        self.string_fallbacks += other.string_fallbacks;
    }
}

/// A segment name that stopped loading, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalCondition {
    pub segment: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    run_id: String,
    source: String,
    outcome: RunOutcome,
    messages: usize,
    segments: BTreeMap<String, SegmentTally>,
    fatal_conditions: Vec<FatalCondition>,
    failed_batches: Vec<BatchFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abort_reason: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub(crate) fn new(run_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            source: source.into(),
            outcome: RunOutcome::Running,
            messages: 0,
            segments: BTreeMap::new(),
            fatal_conditions: Vec::new(),
            failed_batches: Vec::new(),
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn record_messages(&mut self, count: usize) {
        self.messages = count;
    }

    /// One segment occurrence seen, becoming one row
    pub(crate) fn record_attempt(&mut self, segment: &str, string_fallbacks: usize) {
        let tally = self.tally_mut(segment);
        tally.attempted += 1;
        tally.string_fallbacks += string_fallbacks;
    }

    pub(crate) fn record_fatal(&mut self, segment: &str, error: &IngestError) {
        self.tally_mut(segment);
        self.fatal_conditions.push(FatalCondition {
            segment: segment.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        });
    }

    /// Rows that never reached the pipeline because their segment failed
    pub(crate) fn record_failed_rows(&mut self, segment: &str, rows: usize, kind: FailureKind) {
        let tally = self.tally_mut(segment);
        match kind {
            FailureKind::Permanent => tally.failed_permanent += rows,
            FailureKind::TransientExhausted => tally.failed_transient += rows,
        }
    }

    pub(crate) fn record_load(&mut self, segment: &str, result: LoadResult) {
        let tally = self.tally_mut(segment);
        tally.succeeded += result.accepted;
        for rejection in &result.rejected {
            match rejection.kind {
                FailureKind::Permanent => tally.failed_permanent += 1,
                FailureKind::TransientExhausted => tally.failed_transient += 1,
            }
        }
        self.failed_batches.extend(result.failed_batches);
    }

    pub(crate) fn abort(&mut self, reason: impl Into<String>) {
        self.outcome = RunOutcome::Aborted;
        self.abort_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self) {
        if self.outcome == RunOutcome::Running {
            self.outcome = RunOutcome::Completed;
        }
        self.finished_at = Some(Utc::now());
    }

    fn tally_mut(&mut self, segment: &str) -> &mut SegmentTally {
        self.segments.entry(segment.to_string()).or_default()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    pub fn segments(&self) -> &BTreeMap<String, SegmentTally> {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentTally> {
        self.segments.get(name)
    }

    pub fn fatal_conditions(&self) -> &[FatalCondition] {
        &self.fatal_conditions
    }

    pub fn failed_batches(&self) -> &[BatchFailure] {
        &self.failed_batches
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn totals(&self) -> SegmentTally {
        let mut totals = SegmentTally::default();
        for tally in self.segments.values() {
            totals.add(tally);
        }
        totals
    }

    /// 0 when every row loaded, 1 on any segment or batch failure, 2 when the
    /// run was aborted
    pub fn exit_code(&self) -> i32 {
        if self.outcome == RunOutcome::Aborted {
            return 2;
        }
        if !self.fatal_conditions.is_empty()
            || !self.failed_batches.is_empty()
            || self.totals().failed() > 0
        {
            return 1;
        }
        0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let status = match self.outcome {
            RunOutcome::Aborted => "ABORTED",
            _ if self.exit_code() == 0 => "OK",
            _ => "COMPLETED WITH FAILURES",
        };
        let _ = writeln!(out, "Run {} ({}): {}", self.run_id, self.source, status);
        let _ = writeln!(out, "Messages decoded: {}", self.messages);

        if let Some(reason) = &self.abort_reason {
            let _ = writeln!(out, "Abort reason: {}", reason);
        }

        if !self.segments.is_empty() {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    "Segment",
                    "Attempted",
                    "Succeeded",
                    "Failed (transient)",
                    "Failed (permanent)",
                    "String fallbacks",
                ]);

            let totals = self.totals();
            let rows = self
                .segments
                .iter()
                .map(|(name, tally)| (name.as_str(), tally))
                .chain(std::iter::once(("TOTAL", &totals)));

            for (name, tally) in rows {
                table.add_row(vec![
                    name.to_string(),
                    tally.attempted.to_string(),
                    tally.succeeded.to_string(),
                    tally.failed_transient.to_string(),
                    tally.failed_permanent.to_string(),
                    tally.string_fallbacks.to_string(),
                ]);
            }

            let _ = writeln!(out, "{}", table);
        }

        if !self.fatal_conditions.is_empty() {
            let _ = writeln!(out, "Fatal segment conditions:");
            for fatal in &self.fatal_conditions {
                let _ = writeln!(out, "  {} [{}] {}", fatal.segment, fatal.kind, fatal.reason);
            }
        }

        if !self.failed_batches.is_empty() {
            let _ = writeln!(out, "Failed batches:");
            for batch in &self.failed_batches {
                let _ = writeln!(
                    out,
                    "  {} #{} ({} rows, {}): {}",
                    batch.table, batch.sequence, batch.rows, batch.kind, batch.reason
                );
            }
        }

        out
    }
}

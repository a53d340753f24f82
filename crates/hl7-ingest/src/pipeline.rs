//! Batched row loading with retry and per-batch failure isolation
//!
//! Rows are shaped against the table's current schema, grouped into
//! [`LoadBatch`]es bounded by row count and encoded size, and submitted in
//! order. A batch that fails permanently or exhausts its retries is recorded
//! and the next batch proceeds.

use crate::inference::{InferredRow, InferredSchema};
use crate::registry::TableDescriptor;
use crate::retry::Retrier;
use crate::store::{InsertRow, RemoteError, RemoteStore, TableRef};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Default maximum rows per insert request
pub const DEFAULT_MAX_BATCH_ROWS: usize = 500;

/// Default maximum encoded row bytes per insert request
pub const DEFAULT_MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by shaping or by the store, or cut off by the run deadline
    Permanent,
    /// Transient failures outlasted the retry budget
    TransientExhausted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Permanent => f.write_str("permanent"),
            FailureKind::TransientExhausted => f.write_str("transient_exhausted"),
        }
    }
}

/// A row that was not loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub message_index: usize,
    pub reason: String,
    pub kind: FailureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub table: String,
    pub sequence: u64,
    pub rows: usize,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub accepted: usize,
    pub rejected: Vec<RowRejection>,
    pub failed_batches: Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq)]
struct ShapedRow {
    message_index: usize,
    json: Map<String, Value>,
    bytes: usize,
}

/// Bounded ordered rows bound for one table. Single use.
#[derive(Debug)]
pub struct LoadBatch {
    pub sequence: u64,
    pub table: TableRef,
    rows: Vec<ShapedRow>,
    bytes: usize,
}

impl LoadBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Insert id for row `row` of batch `sequence`; retries reuse it so the store
/// can drop duplicates
pub fn insert_id(run_id: &str, sequence: u64, row: usize) -> String {
    format!("{}-{}-{}", run_id, sequence, row)
}

/// Render a row at the schema's column types
pub fn shape_row(schema: &InferredSchema, row: &InferredRow) -> Result<Map<String, Value>, String> {
    let mut json = Map::with_capacity(row.cells.len());
    for (name, cell) in &row.cells {
        let column_type = schema
            .get(name)
            .ok_or_else(|| format!("column {} is not in the table schema", name))?;
        let value = cell
            .render(column_type)
            .map_err(|e| format!("column {}: {}", name, e))?;
        if json.insert(name.clone(), value).is_some() {
            return Err(format!("column {} appears twice in the row", name));
        }
    }
    Ok(json)
}

/// Shape a row and measure its encoded size
fn encode_row(schema: &InferredSchema, row: &InferredRow) -> Result<(Map<String, Value>, usize), String> {
    let json = shape_row(schema, row)?;
    let bytes = serde_json::to_vec(&json)
        .map_err(|e| format!("row cannot be encoded: {}", e))?
        .len();
    Ok((json, bytes))
}

pub struct LoadPipeline {
    store: Arc<dyn RemoteStore>,
    retrier: Arc<Retrier>,
    run_id: String,
    max_rows: usize,
    max_bytes: usize,
    next_sequence: AtomicU64,
}

impl LoadPipeline {
    pub fn new(store: Arc<dyn RemoteStore>, retrier: Arc<Retrier>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            retrier,
            run_id: run_id.into(),
            max_rows: DEFAULT_MAX_BATCH_ROWS,
            max_bytes: DEFAULT_MAX_BATCH_BYTES,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn with_limits(mut self, max_rows: usize, max_bytes: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self.max_bytes = max_bytes.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Load `rows` into the descriptor's table, batches in order
    #[instrument(skip_all, fields(table = %descriptor.table, rows = rows.len()))]
    pub async fn submit(&self, descriptor: &TableDescriptor, rows: &[InferredRow]) -> LoadResult {
        let mut result = LoadResult::default();
        let mut shaped = Vec::with_capacity(rows.len());

        for row in rows {
            match encode_row(&descriptor.schema, row) {
                Ok((json, bytes)) => {
                    shaped.push(ShapedRow {
                        message_index: row.message_index,
                        json,
                        bytes,
                    });
                },
                Err(reason) => {
                    debug!(message = row.message_index, %reason, "Row cannot be shaped");
                    result.rejected.push(RowRejection {
                        message_index: row.message_index,
                        reason,
                        kind: FailureKind::Permanent,
                    });
                },
            }
        }

        for batch in self.batch(&descriptor.table, shaped) {
            self.send(batch, &mut result).await;
        }

        result
    }

    fn batch(&self, table: &TableRef, rows: Vec<ShapedRow>) -> Vec<LoadBatch> {
        let mut batches = Vec::new();
        let mut current: Vec<ShapedRow> = Vec::new();
        let mut bytes = 0;

        for row in rows {
            let full = current.len() >= self.max_rows || bytes + row.bytes > self.max_bytes;
            if !current.is_empty() && full {
                batches.push(self.close(table, std::mem::take(&mut current), bytes));
                bytes = 0;
            }
            bytes += row.bytes;
            current.push(row);
        }

        if !current.is_empty() {
            batches.push(self.close(table, current, bytes));
        }
        batches
    }

    fn close(&self, table: &TableRef, rows: Vec<ShapedRow>, bytes: usize) -> LoadBatch {
        LoadBatch {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            table: table.clone(),
            rows,
            bytes,
        }
    }

    async fn send(&self, batch: LoadBatch, result: &mut LoadResult) {
        let rows: Vec<InsertRow> = batch
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| InsertRow {
                insert_id: insert_id(&self.run_id, batch.sequence, i),
                json: row.json.clone(),
            })
            .collect();

        let label = format!("insert {} batch {}", batch.table, batch.sequence);
        let outcome = self
            .retrier
            .run(&label, |_| self.store.insert_rows(&batch.table, &rows))
            .await;

        let err = match outcome {
            Ok(()) => {
                debug!(
                    sequence = batch.sequence,
                    rows = batch.len(),
                    bytes = batch.bytes(),
                    "Batch loaded"
                );
                result.accepted += batch.len();
                return;
            },
            Err(err) => err,
        };

        let kind = if err.is_exhausted() {
            FailureKind::TransientExhausted
        } else {
            FailureKind::Permanent
        };
        let reason = err.to_string();

        let per_row: HashMap<usize, String> = match err.into_error() {
            Some(RemoteError::RowsRejected(errors)) => {
                errors.into_iter().map(|e| (e.index, e.reason)).collect()
            },
            _ => HashMap::new(),
        };

        warn!(
            table = %batch.table,
            sequence = batch.sequence,
            rows = batch.len(),
            %kind,
            %reason,
            "Batch failed"
        );

        for (i, row) in batch.rows.iter().enumerate() {
            result.rejected.push(RowRejection {
                message_index: row.message_index,
                reason: per_row.get(&i).cloned().unwrap_or_else(|| reason.clone()),
                kind,
            });
        }
        result.failed_batches.push(BatchFailure {
            table: batch.table.to_string(),
            sequence: batch.sequence,
            rows: batch.len(),
            kind,
            reason,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::inference::{Cell, Column, ColumnType, TypedValue};
    use crate::retry::{BackoffPolicy, Clock, ManualClock};
    use crate::store::memory::{InMemoryStore, Operation};
    use crate::store::RowError;
    use std::time::Duration;

    fn descriptor() -> TableDescriptor {
        TableDescriptor {
            segment: "obx".to_string(),
            table: TableRef::new("p", "d", "obx"),
            schema: InferredSchema::from_columns([
                Column::new("obx_1", ColumnType::Integer),
                Column::new("obx_5", ColumnType::Float),
            ]),
        }
    }

    fn row(index: usize, value: f64) -> InferredRow {
        InferredRow {
            message_index: index,
            cells: vec![
                ("obx_1".to_string(), Cell::new(index.to_string(), TypedValue::Integer(index as i64))),
                ("obx_5".to_string(), Cell::new(value.to_string(), TypedValue::Float(value))),
            ],
        }
    }

    fn pipeline(store: Arc<InMemoryStore>, max_rows: usize, max_bytes: usize) -> LoadPipeline {
        let retrier = Retrier::new(BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        })
        .with_clock(Arc::new(ManualClock::new()));

        LoadPipeline::new(store, Arc::new(retrier), "run1").with_limits(max_rows, max_bytes)
    }

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new().with_table("obx", descriptor().schema))
    }

    #[tokio::test]
    async fn test_rows_batched_by_count_in_order() {
        let store = store();
        let rows: Vec<InferredRow> = (0..5).map(|i| row(i, 98.6)).collect();

        let result = pipeline(store.clone(), 2, usize::MAX).submit(&descriptor(), &rows).await;

        assert_eq!(result.accepted, 5);
        assert!(result.rejected.is_empty());
        assert_eq!(store.calls(Operation::InsertRows), 3);

        let order: Vec<i64> = store
            .rows("obx")
            .iter()
            .map(|r| r["obx_1"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_byte_limit_and_oversized_rows() {
        let pipeline = pipeline(store(), 100, 40);
        let shaped = |bytes: usize| ShapedRow {
            message_index: 0,
            json: Map::new(),
            bytes,
        };

        let batches = pipeline.batch(
            &descriptor().table,
            vec![shaped(15), shaped(15), shaped(15), shaped(90), shaped(5)],
        );

        let sizes: Vec<usize> = batches.iter().map(LoadBatch::len).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
        assert_eq!(batches[2].bytes(), 90);

        let sequences: Vec<u64> = batches.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unshapeable_row_rejected_without_sending() {
        let store = store();
        let mut bad = row(1, 1.0);
        bad.cells[0].1 = Cell::text("one");

        let result = pipeline(store.clone(), 10, usize::MAX)
            .submit(&descriptor(), &[row(0, 1.0), bad])
            .await;

        assert_eq!(result.accepted, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].message_index, 1);
        assert_eq!(result.rejected[0].kind, FailureKind::Permanent);
        assert!(result.rejected[0].reason.contains("obx_1"));
        assert!(result.failed_batches.is_empty());
        assert_eq!(store.calls(Operation::InsertRows), 1);
    }

    #[tokio::test]
    async fn test_store_row_rejections_are_not_retried() {
        let store = store();
        store.inject_fault(
            "obx",
            Operation::InsertRows,
            RemoteError::RowsRejected(vec![RowError {
                index: 1,
                reason: "invalid: obx_5".to_string(),
            }]),
        );

        let result = pipeline(store.clone(), 10, usize::MAX)
            .submit(&descriptor(), &[row(0, 1.0), row(1, 2.0)])
            .await;

        assert_eq!(store.calls(Operation::InsertRows), 1);
        assert_eq!(result.accepted, 0);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].kind, FailureKind::Permanent);
        assert_eq!(result.rejected[1].reason, "invalid: obx_5");
        assert!(result.rejected[0].reason.contains("rows rejected"));
    }

    #[tokio::test]
    async fn test_exhausted_batch_does_not_stop_the_next() {
        let store = store();
        for _ in 0..3 {
            store.inject_fault("obx", Operation::InsertRows, RemoteError::Transient("503".into()));
        }

        let rows: Vec<InferredRow> = (0..4).map(|i| row(i, 1.5)).collect();
        let result = pipeline(store.clone(), 2, usize::MAX).submit(&descriptor(), &rows).await;

        assert_eq!(result.accepted, 2);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].sequence, 0);
        assert_eq!(result.failed_batches[0].kind, FailureKind::TransientExhausted);
        assert!(result
            .rejected
            .iter()
            .all(|r| r.kind == FailureKind::TransientExhausted && r.message_index < 2));
        assert_eq!(store.rows("obx").len(), 2);
    }

    #[tokio::test]
    async fn test_transient_then_success_loads_once() {
        let store = store();
        store.inject_fault("obx", Operation::InsertRows, RemoteError::Transient("429".into()));

        let result = pipeline(store.clone(), 10, usize::MAX)
            .submit(&descriptor(), &[row(0, 1.0)])
            .await;

        assert_eq!(result.accepted, 1);
        assert!(result.failed_batches.is_empty());
        assert_eq!(store.rows("obx").len(), 1);
    }

    #[test]
    fn test_encode_row_measures_and_rejects_duplicates() {
        let (json, bytes) = encode_row(&descriptor().schema, &row(3, 1.5)).unwrap();
        assert_eq!(bytes, serde_json::to_vec(&json).unwrap().len());

        let mut doubled = row(3, 1.5);
        doubled
            .cells
            .push(("obx_5".to_string(), Cell::new("2.5", TypedValue::Float(2.5))));
        let err = encode_row(&descriptor().schema, &doubled).unwrap_err();
        assert!(err.contains("obx_5 appears twice"));
    }

    #[tokio::test]
    async fn test_duplicate_column_rejects_only_that_row() {
        let store = store();
        let mut doubled = row(1, 2.0);
        doubled
            .cells
            .push(("obx_1".to_string(), Cell::new("9", TypedValue::Integer(9))));

        let result = pipeline(store.clone(), 10, usize::MAX)
            .submit(&descriptor(), &[row(0, 1.0), doubled])
            .await;

        assert_eq!(result.accepted, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].message_index, 1);
        assert_eq!(result.rejected[0].kind, FailureKind::Permanent);
        assert!(result.rejected[0].reason.contains("appears twice"));
        assert_eq!(store.rows("obx").len(), 1);
        assert_eq!(store.rows("obx")[0]["obx_1"], 0);
    }

    #[tokio::test]
    async fn test_run_deadline_fails_batch_permanently() {
        let store = store();
        for _ in 0..5 {
            store.inject_fault("obx", Operation::InsertRows, RemoteError::Transient("503".into()));
        }

        let clock = Arc::new(ManualClock::new());
        let retrier = Retrier::new(BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        })
        .with_clock(clock.clone());
        retrier.deadline().arm(clock.now() + Duration::from_millis(150));
        let pipeline = LoadPipeline::new(store.clone(), Arc::new(retrier), "run1");

        let result = pipeline.submit(&descriptor(), &[row(0, 1.0), row(1, 2.0)]).await;

        // One 100ms backoff fits, the following 200ms one does not
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
        assert_eq!(store.calls(Operation::InsertRows), 2);
        assert_eq!(result.accepted, 0);
        assert_eq!(result.failed_batches.len(), 1);
        assert_eq!(result.failed_batches[0].kind, FailureKind::Permanent);
        assert!(result.failed_batches[0].reason.contains("deadline"));
        assert_eq!(result.rejected.len(), 2);
        assert!(result.rejected.iter().all(|r| r.kind == FailureKind::Permanent));
    }

    #[test]
    fn test_insert_id_format() {
        assert_eq!(insert_id("3f2a", 7, 12), "3f2a-7-12");
    }
}

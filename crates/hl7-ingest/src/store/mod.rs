//! Remote analytical store boundary
//!
//! [`RemoteStore`] is the seam between the loader and the columnar store.
//! Two implementations ship with the crate:
//!
//! - [`memory::InMemoryStore`] for dry runs and tests, with fault injection
//! - [`bigquery::BigQueryStore`] speaking the BigQuery v2 REST API

pub mod bigquery;
pub mod memory;

use crate::inference::InferredSchema;
use async_trait::async_trait;
use hl7_common::IngestError;
use serde_json::{Map, Value};
use thiserror::Error;

pub use bigquery::BigQueryStore;
pub use memory::InMemoryStore;

/// Fully qualified remote table identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// A row ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    /// Deduplication key, stable across retries of the same batch
    pub insert_id: String,
    pub json: Map<String, Value>,
}

/// Per-row rejection reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index of the row within the submitted request
    pub index: usize,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("permanent remote failure: {0}")]
    Permanent(String),

    #[error("table {0} already exists")]
    AlreadyExists(String),

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("{} rows rejected by the store", .0.len())]
    RowsRejected(Vec<RowError>),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Map into the shared taxonomy, scoped to `table`
    pub fn into_ingest_error(self, table: &TableRef) -> IngestError {
        match self {
            RemoteError::Transient(msg) => IngestError::TransientRemote(msg),
            RemoteError::SchemaConflict(message) => IngestError::SchemaConflict {
                table: table.to_string(),
                message,
            },
            other => IngestError::PermanentRemote(format!("{}: {}", table, other)),
        }
    }
}

/// Operations the loader needs from a columnar store.
///
/// Implementations must make `create_table` report an existing table as
/// [`RemoteError::AlreadyExists`] and `update_schema` refuse anything other
/// than additive changes with [`RemoteError::SchemaConflict`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Confirm the target dataset exists and is reachable
    async fn check_dataset(&self, project: &str, dataset: &str) -> Result<(), RemoteError>;

    /// Current schema, or `None` when the table does not exist
    async fn get_table(&self, table: &TableRef) -> Result<Option<InferredSchema>, RemoteError>;

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> Result<(), RemoteError>;

    /// Replace the table schema with `schema`, a superset of the current one
    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> Result<(), RemoteError>;

    async fn insert_rows(&self, table: &TableRef, rows: &[InsertRow]) -> Result<(), RemoteError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_display() {
        let table = TableRef::new("acme-health", "hl7_data", "pid");
        assert_eq!(table.to_string(), "acme-health.hl7_data.pid");
    }

    #[test]
    fn test_remote_error_mapping() {
        let table = TableRef::new("p", "d", "obx");

        let err = RemoteError::SchemaConflict("obx_5 is BOOL".into()).into_ingest_error(&table);
        assert_eq!(err.kind(), "schema_conflict");

        let err = RemoteError::Transient("503".into()).into_ingest_error(&table);
        assert!(err.is_transient());

        let err = RemoteError::RowsRejected(vec![RowError {
            index: 0,
            reason: "invalid".into(),
        }])
        .into_ingest_error(&table);
        assert_eq!(err.kind(), "permanent_remote_error");
        assert!(err.to_string().contains("p.d.obx"));
    }
}

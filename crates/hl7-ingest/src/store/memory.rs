//! In-memory store used for dry runs and tests
//!
//! Behaves like a forgiving columnar store: tables are keyed by table name,
//! schema updates must be additive, inserted rows are validated against the
//! current schema and deduplicated by insert id. Faults can be queued per
//! table and operation to exercise retry and isolation paths.

use super::{InsertRow, RemoteError, RemoteStore, RowError, TableRef};
use crate::inference::{ColumnType, InferredSchema};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CheckDataset,
    GetTable,
    CreateTable,
    UpdateSchema,
    InsertRows,
}

#[derive(Debug, Default)]
struct StoredTable {
    schema: InferredSchema,
    rows: Vec<Map<String, Value>>,
    insert_ids: HashSet<String>,
    frozen: bool,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, StoredTable>,
    faults: HashMap<(String, Operation), VecDeque<RemoteError>>,
    calls: HashMap<Operation, usize>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, so concurrent callers interleave
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a table that already exists remotely
    pub fn with_table(self, table: &str, schema: InferredSchema) -> Self {
        self.lock().tables.insert(
            table.to_string(),
            StoredTable {
                schema,
                ..StoredTable::default()
            },
        );
        self
    }

    /// Queue an error returned by the next `op` call on `table`. Faults for
    /// [`Operation::CheckDataset`] are keyed by dataset name.
    pub fn inject_fault(&self, table: &str, op: Operation, error: RemoteError) {
        self.lock()
            .faults
            .entry((table.to_string(), op))
            .or_default()
            .push_back(error);
    }

    /// Refuse every schema change on `table`
    pub fn freeze_schema(&self, table: &str) {
        if let Some(stored) = self.lock().tables.get_mut(table) {
            stored.frozen = true;
        }
    }

    pub fn schema(&self, table: &str) -> Option<InferredSchema> {
        self.lock().tables.get(table).map(|t| t.schema.clone())
    }

    pub fn rows(&self, table: &str) -> Vec<Map<String, Value>> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of calls made for `op`, including faulted ones
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply latency, then pop any queued fault
    async fn enter(&self, table: &TableRef, op: Operation) -> Result<(), RemoteError> {
        self.enter_key(&table.table, op).await
    }

    async fn enter_key(&self, key: &str, op: Operation) -> Result<(), RemoteError> {
        *self.lock().calls.entry(op).or_default() += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self
            .lock()
            .faults
            .get_mut(&(key.to_string(), op))
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn check_dataset(&self, _project: &str, dataset: &str) -> Result<(), RemoteError> {
        self.enter_key(dataset, Operation::CheckDataset).await
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<InferredSchema>, RemoteError> {
        self.enter(table, Operation::GetTable).await?;
        Ok(self.schema(&table.table))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> Result<(), RemoteError> {
        self.enter(table, Operation::CreateTable).await?;

        let mut state = self.lock();
        if state.tables.contains_key(&table.table) {
            return Err(RemoteError::AlreadyExists(table.to_string()));
        }
        state.tables.insert(
            table.table.clone(),
            StoredTable {
                schema: schema.clone(),
                ..StoredTable::default()
            },
        );
        Ok(())
    }

    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> Result<(), RemoteError> {
        self.enter(table, Operation::UpdateSchema).await?;

        let mut state = self.lock();
        let stored = state
            .tables
            .get_mut(&table.table)
            .ok_or_else(|| RemoteError::Permanent(format!("table {} not found", table)))?;

        let changes = schema
            .changes_from(&stored.schema)
            .map_err(RemoteError::SchemaConflict)?;

        if stored.frozen && !changes.is_empty() {
            return Err(RemoteError::SchemaConflict(format!(
                "table {} does not accept schema changes",
                table
            )));
        }

        stored.schema.merge(schema);
        Ok(())
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[InsertRow]) -> Result<(), RemoteError> {
        self.enter(table, Operation::InsertRows).await?;

        let mut state = self.lock();
        let stored = state
            .tables
            .get_mut(&table.table)
            .ok_or_else(|| RemoteError::Permanent(format!("table {} not found", table)))?;

        let errors: Vec<RowError> = rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| {
                validate_row(&stored.schema, &row.json)
                    .err()
                    .map(|reason| RowError { index, reason })
            })
            .collect();

        // The whole request fails when any row is invalid
        if !errors.is_empty() {
            return Err(RemoteError::RowsRejected(errors));
        }

        for row in rows {
            if stored.insert_ids.insert(row.insert_id.clone()) {
                stored.rows.push(row.json.clone());
            }
        }
        Ok(())
    }
}

fn validate_row(schema: &InferredSchema, row: &Map<String, Value>) -> Result<(), String> {
    for (name, value) in row {
        let column_type = schema
            .get(name)
            .ok_or_else(|| format!("no such field: {}", name))?;

        let fits = match (column_type, value) {
            (_, Value::Null) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        };

        if !fits {
            return Err(format!("invalid {} value for field {}: {}", column_type, name, value));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::inference::Column;
    use serde_json::json;

    fn table(name: &str) -> TableRef {
        TableRef::new("test-project", "hl7_data", name)
    }

    fn schema(cols: &[(&str, ColumnType)]) -> InferredSchema {
        InferredSchema::from_columns(cols.iter().map(|(n, t)| Column::new(*n, *t)))
    }

    fn row(id: &str, value: Value) -> InsertRow {
        InsertRow {
            insert_id: id.to_string(),
            json: value.as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_then_already_exists() {
        let store = InMemoryStore::new();
        let pid = schema(&[("pid_1", ColumnType::String)]);

        store.create_table(&table("pid"), &pid).await.unwrap();
        let err = store.create_table(&table("pid"), &pid).await.unwrap_err();

        assert!(matches!(err, RemoteError::AlreadyExists(_)));
        assert_eq!(store.get_table(&table("pid")).await.unwrap(), Some(pid));
        assert_eq!(store.get_table(&table("obx")).await.unwrap(), None);
        assert_eq!(store.calls(Operation::CreateTable), 2);
    }

    #[tokio::test]
    async fn test_update_schema_is_additive_only() {
        let store = InMemoryStore::new().with_table("obx", schema(&[("obx_5", ColumnType::Integer)]));

        store
            .update_schema(
                &table("obx"),
                &schema(&[("obx_5", ColumnType::Float), ("obx_6", ColumnType::String)]),
            )
            .await
            .unwrap();
        assert_eq!(store.schema("obx").unwrap().get("obx_5"), Some(ColumnType::Float));

        let err = store
            .update_schema(&table("obx"), &schema(&[("obx_5", ColumnType::Integer)]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn test_frozen_table_refuses_changes() {
        let store = InMemoryStore::new().with_table("pid", schema(&[("pid_1", ColumnType::String)]));
        store.freeze_schema("pid");

        let same = schema(&[("pid_1", ColumnType::String)]);
        assert!(store.update_schema(&table("pid"), &same).await.is_ok());

        let wider = schema(&[("pid_1", ColumnType::String), ("pid_2", ColumnType::String)]);
        assert!(matches!(
            store.update_schema(&table("pid"), &wider).await,
            Err(RemoteError::SchemaConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_validates_and_deduplicates() {
        let store = InMemoryStore::new().with_table(
            "obx",
            schema(&[("obx_1", ColumnType::Integer), ("obx_5", ColumnType::Float)]),
        );

        let rows = vec![
            row("run-0-0", json!({"obx_1": 1, "obx_5": 98.6})),
            row("run-0-1", json!({"obx_1": 2})),
        ];
        store.insert_rows(&table("obx"), &rows).await.unwrap();
        // A retried request with the same insert ids is absorbed
        store.insert_rows(&table("obx"), &rows).await.unwrap();
        assert_eq!(store.rows("obx").len(), 2);

        let err = store
            .insert_rows(
                &table("obx"),
                &[
                    row("run-1-0", json!({"obx_1": 3})),
                    row("run-1-1", json!({"obx_1": "three"})),
                ],
            )
            .await
            .unwrap_err();
        match err {
            RemoteError::RowsRejected(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].index, 1);
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.rows("obx").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = InMemoryStore::new().with_table("pid", InferredSchema::new());
        store.inject_fault("pid", Operation::GetTable, RemoteError::Transient("503".into()));
        store.inject_fault("pid", Operation::GetTable, RemoteError::Permanent("400".into()));

        assert!(store.get_table(&table("pid")).await.unwrap_err().is_transient());
        assert!(!store.get_table(&table("pid")).await.unwrap_err().is_transient());
        assert!(store.get_table(&table("pid")).await.is_ok());
        assert_eq!(store.calls(Operation::GetTable), 3);
    }
}

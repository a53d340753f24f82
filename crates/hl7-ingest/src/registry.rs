//! Table registry: segment name to remote table
//!
//! Tables are provisioned lazily the first time a segment type is seen and
//! extended whenever a later segment adds columns or widens a type. Each
//! segment name has its own async lock, so concurrent `ensure` calls for the
//! same new name issue exactly one create while other names proceed.
//!
//! A segment name whose table cannot be provisioned or extended is marked
//! failed for the rest of the run; later calls fail fast without remote calls.

use crate::inference::InferredSchema;
use crate::retry::{Retrier, RetryError};
use crate::store::{RemoteError, RemoteStore, TableRef};
use hl7_common::{IngestError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

/// Remote identity and believed schema of one segment type's table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Lowercased segment name
    pub segment: String,
    pub table: TableRef,
    pub schema: InferredSchema,
}

#[derive(Debug, Clone)]
struct Failure {
    table: String,
    message: String,
    conflict: bool,
}

impl Failure {
    fn from_retry(table: &TableRef, err: RetryError<RemoteError>) -> Self {
        let conflict = matches!(
            err,
            RetryError::Fatal {
                error: RemoteError::SchemaConflict(_),
                ..
            }
        );
        let message = match err {
            RetryError::Fatal {
                error: RemoteError::SchemaConflict(message),
                ..
            } => message,
            other => other.to_string(),
        };

        Self {
            table: table.to_string(),
            message,
            conflict,
        }
    }

    fn to_error(&self) -> IngestError {
        if self.conflict {
            IngestError::SchemaConflict {
                table: self.table.clone(),
                message: self.message.clone(),
            }
        } else {
            IngestError::PermanentRemote(format!("{}: {}", self.table, self.message))
        }
    }
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Unknown,
    Ready(TableDescriptor),
    Failed(Failure),
}

pub struct TableRegistry {
    store: Arc<dyn RemoteStore>,
    project: String,
    dataset: String,
    retrier: Arc<Retrier>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl TableRegistry {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        project: impl Into<String>,
        dataset: impl Into<String>,
        retrier: Arc<Retrier>,
    ) -> Self {
        Self {
            store,
            project: project.into(),
            dataset: dataset.into(),
            retrier,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Confirm the target dataset exists before anything is provisioned
    #[instrument(skip(self), fields(project = %self.project, dataset = %self.dataset))]
    pub async fn check_dataset(&self) -> Result<()> {
        let outcome = self
            .retrier
            .run("check dataset", |_| {
                self.store.check_dataset(&self.project, &self.dataset)
            })
            .await;

        match outcome {
            Ok(()) => {
                debug!("Dataset check passed");
                Ok(())
            },
            Err(err) => {
                warn!(error = %err, "Dataset check failed");
                Err(IngestError::PermanentRemote(format!(
                    "dataset {}:{} is not usable: {}",
                    self.project, self.dataset, err
                )))
            },
        }
    }

    /// Remote table for a segment name: `project.dataset.<segment lowercase>`
    pub fn table_ref(&self, segment: &str) -> TableRef {
        TableRef::new(
            self.project.as_str(),
            self.dataset.as_str(),
            segment.to_ascii_lowercase(),
        )
    }

    /// Make sure the segment's table exists and holds at least `schema`
    #[instrument(skip(self, schema), fields(columns = schema.len()))]
    pub async fn ensure(&self, segment: &str, schema: &InferredSchema) -> Result<TableDescriptor> {
        let key = segment.to_ascii_lowercase();
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        let outcome = match &*guard {
            Slot::Failed(failure) => return Err(failure.to_error()),
            Slot::Ready(current) => self.extend(current, schema).await,
            Slot::Unknown => {
                let table = self.table_ref(&key);
                self.provision(&table, schema)
                    .await
                    .map(|schema| TableDescriptor {
                        segment: key.clone(),
                        table,
                        schema,
                    })
            },
        };

        match outcome {
            Ok(descriptor) => {
                *guard = Slot::Ready(descriptor.clone());
                Ok(descriptor)
            },
            Err(failure) => {
                warn!(
                    segment = %key,
                    table = %failure.table,
                    reason = %failure.message,
                    "Segment table unusable for the rest of the run"
                );
                let err = failure.to_error();
                *guard = Slot::Failed(failure);
                Err(err)
            },
        }
    }

    /// Cached descriptor for a segment name, if its table is ready
    pub async fn descriptor(&self, segment: &str) -> Option<TableDescriptor> {
        let slot = self.existing_slot(&segment.to_ascii_lowercase())?;
        let guard = slot.lock().await;
        match &*guard {
            Slot::Ready(descriptor) => Some(descriptor.clone()),
            _ => None,
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<AsyncMutex<Slot>>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// First sight of a segment type: adopt or create the remote table
    async fn provision(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> std::result::Result<InferredSchema, Failure> {
        let remote = match self.fetch(table).await? {
            Some(remote) => {
                debug!(table = %table, "Adopting existing table");
                remote
            },
            None => {
                let created = self
                    .retrier
                    .run(&format!("create {}", table), |_| {
                        self.store.create_table(table, schema)
                    })
                    .await;

                match created {
                    Ok(()) => {
                        info!(table = %table, columns = schema.len(), "Created table");
                        return Ok(schema.clone());
                    },
                    Err(RetryError::Fatal {
                        error: RemoteError::AlreadyExists(_),
                        ..
                    }) => {
                        debug!(table = %table, "Table created concurrently, fetching its schema");
                        self.fetch(table).await?.ok_or_else(|| Failure {
                            table: table.to_string(),
                            message: "table reported as existing but could not be fetched"
                                .to_string(),
                            conflict: false,
                        })?
                    },
                    Err(err) => return Err(Failure::from_retry(table, err)),
                }
            },
        };

        let (merged, changes) = remote.union(schema);
        if !changes.is_empty() {
            self.update(table, &merged, changes.len()).await?;
        }
        Ok(merged)
    }

    /// Known segment type: widen the remote table when `schema` needs it
    async fn extend(
        &self,
        current: &TableDescriptor,
        schema: &InferredSchema,
    ) -> std::result::Result<TableDescriptor, Failure> {
        let (merged, changes) = current.schema.union(schema);
        if changes.is_empty() {
            return Ok(current.clone());
        }

        for change in &changes {
            debug!(table = %current.table, %change, "Schema change");
        }
        self.update(&current.table, &merged, changes.len()).await?;

        Ok(TableDescriptor {
            schema: merged,
            ..current.clone()
        })
    }

    async fn fetch(
        &self,
        table: &TableRef,
    ) -> std::result::Result<Option<InferredSchema>, Failure> {
        self.retrier
            .run(&format!("get {}", table), |_| self.store.get_table(table))
            .await
            .map_err(|e| Failure::from_retry(table, e))
    }

    async fn update(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
        changes: usize,
    ) -> std::result::Result<(), Failure> {
        self.retrier
            .run(&format!("update {}", table), |_| {
                self.store.update_schema(table, schema)
            })
            .await
            .map_err(|e| Failure::from_retry(table, e))?;

        info!(table = %table, changes, columns = schema.len(), "Extended table schema");
        Ok(())
    }
}

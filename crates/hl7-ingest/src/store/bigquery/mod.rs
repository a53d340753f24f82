//! BigQuery REST client implementing [`RemoteStore`]
//!
//! | Operation | Call |
//! |---|---|
//! | `check_dataset` | `GET .../datasets/{dataset}` (404 means the dataset is missing) |
//! | `get_table` | `GET .../tables/{table}` (404 means absent) |
//! | `create_table` | `POST .../tables` (409 means already exists) |
//! | `update_schema` | `PATCH .../tables/{table}`, plus `ALTER COLUMN` for INT64 to FLOAT64 |
//! | `insert_rows` | `POST .../tables/{table}/insertAll` |
//!
//! Status classification: 408, 429, 5xx gateway errors, 403 `rateLimitExceeded`
//! and transport failures are transient. Other 4xx are permanent.

pub mod endpoints;
pub mod types;

use super::{InsertRow, RemoteError, RemoteStore, RowError, TableRef};
use crate::inference::{ColumnType, InferredSchema, SchemaChange};
use async_trait::async_trait;
use hl7_common::{IngestError, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};
use types::{
    ErrorBody, ErrorResponse, InsertAllRequest, InsertAllResponse, InsertAllRow, QueryRequest,
    TableReference, TableResource, TableSchema,
};

/// Default timeout for API requests in seconds
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

pub struct BigQueryStore {
    client: Client,
    base_url: String,
    access_token: String,
}

impl BigQueryStore {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, RemoteError> {
        request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn alter_column_type(
        &self,
        table: &TableRef,
        column: &str,
        to: ColumnType,
    ) -> std::result::Result<(), RemoteError> {
        let url = endpoints::query_url(&self.base_url, &table.project);
        let request = QueryRequest {
            query: format!(
                "ALTER TABLE `{}` ALTER COLUMN {} SET DATA TYPE {}",
                table,
                column,
                types::type_name(to)
            ),
            use_legacy_sql: false,
        };

        info!(table = %table, column, to = %to, "Widening remote column");
        let response = self.send(self.client.post(&url).json(&request)).await?;
        if !response.status().is_success() {
            return Err(error_from_response(table, response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for BigQueryStore {
    async fn check_dataset(
        &self,
        project: &str,
        dataset: &str,
    ) -> std::result::Result<(), RemoteError> {
        let url = endpoints::dataset_url(&self.base_url, project, dataset);
        let label = format!("dataset {}:{}", project, dataset);
        let response = self.send(self.client.get(&url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RemoteError::Permanent(format!(
                "{} not found; create it with `bq mk --dataset {}:{}`",
                label, project, dataset
            ))),
            s if s.is_success() => {
                debug!(project, dataset, "Dataset is reachable");
                Ok(())
            },
            _ => Err(error_from_response(&label, response).await),
        }
    }

    async fn get_table(
        &self,
        table: &TableRef,
    ) -> std::result::Result<Option<InferredSchema>, RemoteError> {
        let url = endpoints::table_url(&self.base_url, table);
        let response = self.send(self.client.get(&url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let resource: TableResource = read_json(response).await?;
                Ok(Some(
                    resource.schema.unwrap_or_default().to_inferred(),
                ))
            },
            _ => Err(error_from_response(table, response).await),
        }
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> std::result::Result<(), RemoteError> {
        let url = endpoints::tables_url(&self.base_url, &table.project, &table.dataset);
        let resource = TableResource {
            table_reference: TableReference {
                project_id: table.project.clone(),
                dataset_id: table.dataset.clone(),
                table_id: table.table.clone(),
            },
            schema: Some(TableSchema::from(schema)),
        };

        let response = self.send(self.client.post(&url).json(&resource)).await?;
        if !response.status().is_success() {
            return Err(error_from_response(table, response).await);
        }
        debug!(table = %table, columns = schema.len(), "Created table");
        Ok(())
    }

    async fn update_schema(
        &self,
        table: &TableRef,
        schema: &InferredSchema,
    ) -> std::result::Result<(), RemoteError> {
        let current = self
            .get_table(table)
            .await?
            .ok_or_else(|| RemoteError::Permanent(format!("table {} not found", table)))?;

        let changes = schema
            .changes_from(&current)
            .map_err(RemoteError::SchemaConflict)?;
        if changes.is_empty() {
            return Ok(());
        }

        // Check every type change before touching the table
        let mut widenings = Vec::new();
        for change in &changes {
            if let SchemaChange::Widen { name, from, to } = change {
                if (*from, *to) != (ColumnType::Integer, ColumnType::Float) {
                    return Err(RemoteError::SchemaConflict(format!(
                        "BigQuery cannot change column {} from {} to {}",
                        name,
                        types::type_name(*from),
                        types::type_name(*to)
                    )));
                }
                widenings.push((name.as_str(), *to));
            }
        }

        for (column, to) in widenings {
            self.alter_column_type(table, column, to).await?;
        }

        if changes
            .iter()
            .any(|c| matches!(c, SchemaChange::AddColumn { .. }))
        {
            let url = endpoints::table_url(&self.base_url, table);
            let body = serde_json::json!({ "schema": TableSchema::from(schema) });
            let response = self.send(self.client.patch(&url).json(&body)).await?;
            if !response.status().is_success() {
                return Err(error_from_response(table, response).await);
            }
        }

        debug!(table = %table, changes = changes.len(), "Updated table schema");
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[InsertRow],
    ) -> std::result::Result<(), RemoteError> {
        let url = endpoints::insert_all_url(&self.base_url, table);
        let request = InsertAllRequest {
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            rows: rows
                .iter()
                .map(|r| InsertAllRow {
                    insert_id: &r.insert_id,
                    json: &r.json,
                })
                .collect(),
        };

        let response = self.send(self.client.post(&url).json(&request)).await?;

        // Streaming inserts into a freshly created table can see a short
        // window of 404s
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Transient(format!(
                "table {} not yet visible to streaming inserts",
                table
            )));
        }
        if !response.status().is_success() {
            return Err(error_from_response(table, response).await);
        }

        let result: InsertAllResponse = read_json(response).await?;
        if result.insert_errors.is_empty() {
            return Ok(());
        }

        Err(RemoteError::RowsRejected(
            result
                .insert_errors
                .into_iter()
                .map(|e| RowError {
                    index: e.index,
                    reason: e
                        .errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                })
                .collect(),
        ))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        RemoteError::Permanent(format!("invalid request: {}", err))
    } else {
        RemoteError::Transient(format!("request failed: {}", err))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> std::result::Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Permanent(format!("unexpected response body: {}", e)))
}

async fn error_from_response<T>(target: &T, response: Response) -> RemoteError
where
    T: std::fmt::Display + ?Sized,
{
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .map(|r| r.error);
    classify(target, status, error.as_ref(), &body)
}

/// Map an HTTP error status onto the remote error taxonomy
pub(crate) fn classify<T>(
    target: &T,
    status: StatusCode,
    error: Option<&ErrorBody>,
    body: &str,
) -> RemoteError
where
    T: std::fmt::Display + ?Sized,
{
    let detail = match error {
        Some(e) if !e.message.is_empty() => e.message.clone(),
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    let message = format!("{} returned HTTP {}: {}", target, status.as_u16(), detail);

    match status.as_u16() {
        409 => RemoteError::AlreadyExists(target.to_string()),
        408 | 429 | 500 | 502 | 503 | 504 => RemoteError::Transient(message),
        403 if error.is_some_and(|e| e.has_reason("rateLimitExceeded")) => {
            RemoteError::Transient(message)
        },
        _ => RemoteError::Permanent(message),
    }
}

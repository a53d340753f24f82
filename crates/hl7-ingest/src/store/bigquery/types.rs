//! BigQuery REST request and response types
//!
//! Only the fields the loader reads or writes are modelled.

use crate::inference::{Column, ColumnType, InferredSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableResource {
    pub table_reference: TableReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl From<&InferredSchema> for TableSchema {
    fn from(schema: &InferredSchema) -> Self {
        Self {
            fields: schema
                .columns()
                .iter()
                .map(|c| FieldSchema {
                    name: c.name.clone(),
                    field_type: type_name(c.column_type).to_string(),
                    mode: Some("NULLABLE".to_string()),
                })
                .collect(),
        }
    }
}

impl TableSchema {
    pub fn to_inferred(&self) -> InferredSchema {
        InferredSchema::from_columns(
            self.fields
                .iter()
                .map(|f| Column::new(f.name.as_str(), column_type(&f.field_type))),
        )
    }
}

/// BigQuery standard SQL type for a column type
pub fn type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "INT64",
        ColumnType::Float => "FLOAT64",
        ColumnType::Boolean => "BOOL",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::String => "STRING",
    }
}

/// Column type for a remote field type, accepting legacy SQL names. Types the
/// loader never creates are treated as strings.
pub fn column_type(field_type: &str) -> ColumnType {
    match field_type.to_ascii_uppercase().as_str() {
        "INT64" | "INTEGER" => ColumnType::Integer,
        "FLOAT64" | "FLOAT" => ColumnType::Float,
        "BOOL" | "BOOLEAN" => ColumnType::Boolean,
        "TIMESTAMP" => ColumnType::Timestamp,
        _ => ColumnType::String,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllRequest<'a> {
    pub skip_invalid_rows: bool,
    pub ignore_unknown_values: bool,
    pub rows: Vec<InsertAllRow<'a>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllRow<'a> {
    pub insert_id: &'a str,
    pub json: &'a Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllResponse {
    #[serde(default)]
    pub insert_errors: Vec<InsertErrors>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsertErrors {
    pub index: usize,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorProto {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ErrorProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.location.is_empty(), self.reason.is_empty()) {
            (true, true) => write!(f, "{}", self.message),
            (true, false) => write!(f, "{}: {}", self.reason, self.message),
            (false, _) => write!(f, "{} ({}): {}", self.reason, self.location, self.message),
        }
    }
}

/// Error envelope returned with non-2xx statuses
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

impl ErrorBody {
    pub fn has_reason(&self, reason: &str) -> bool {
        self.errors.iter().any(|e| e.reason == reason)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    pub use_legacy_sql: bool,
}

//! Ordered column schemas and their additive evolution

use super::types::ColumnType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One additive step between two schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SchemaChange {
    AddColumn {
        name: String,
        column_type: ColumnType,
    },
    Widen {
        name: String,
        from: ColumnType,
        to: ColumnType,
    },
}

impl std::fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaChange::AddColumn { name, column_type } => {
                write!(f, "add {} {}", name, column_type)
            },
            SchemaChange::Widen { name, from, to } => {
                write!(f, "widen {} {} -> {}", name, from, to)
            },
        }
    }
}

/// Ordered mapping of column name to semantic type.
///
/// Column order is first-seen order. Columns are only ever added, and a
/// column's type only ever widens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InferredSchema {
    columns: Vec<Column>,
}

impl InferredSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from columns, widening repeated names
    pub fn from_columns<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = Column>,
    {
        let mut schema = Self::new();
        for column in columns {
            schema.observe(&column.name, column.column_type);
        }
        schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Record that column `name` holds a value of type `observed`
    pub fn observe(&mut self, name: &str, observed: ColumnType) -> Option<SchemaChange> {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => {
                let widened = column.column_type.widen(observed);
                if widened == column.column_type {
                    return None;
                }
                let from = column.column_type;
                column.column_type = widened;
                Some(SchemaChange::Widen {
                    name: name.to_string(),
                    from,
                    to: widened,
                })
            },
            None => {
                self.columns.push(Column::new(name, observed));
                Some(SchemaChange::AddColumn {
                    name: name.to_string(),
                    column_type: observed,
                })
            },
        }
    }

    /// Column-wise union with `other`, applied in place
    pub fn merge(&mut self, other: &InferredSchema) -> Vec<SchemaChange> {
        other
            .columns
            .iter()
            .filter_map(|c| self.observe(&c.name, c.column_type))
            .collect()
    }

    /// Column-wise union without mutating either side
    pub fn union(&self, other: &InferredSchema) -> (InferredSchema, Vec<SchemaChange>) {
        let mut merged = self.clone();
        let changes = merged.merge(other);
        (merged, changes)
    }

    /// Steps that turn `base` into `self`, or a description of the first
    /// column that would be dropped or narrowed
    pub fn changes_from(&self, base: &InferredSchema) -> Result<Vec<SchemaChange>, String> {
        for existing in &base.columns {
            match self.get(&existing.name) {
                None => return Err(format!("column {} would be dropped", existing.name)),
                Some(proposed) if !existing.column_type.can_widen_to(proposed) => {
                    return Err(format!(
                        "column {} cannot change from {} to {}",
                        existing.name, existing.column_type, proposed
                    ));
                },
                Some(_) => {},
            }
        }

        let mut widened = base.clone();
        Ok(widened.merge(self))
    }
}

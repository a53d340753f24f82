//! Segment-to-schema inference
//!
//! [`SchemaInferrer::infer`] turns one decoded segment into a column schema
//! and one typed row. Field values run through the [`coerce`] chain; values
//! no rule claims become strings and are counted as string fallbacks. Empty
//! fields are null and leave no trace in the schema.

pub mod coerce;
pub mod dictionary;
pub mod schema;
pub mod types;

pub use coerce::Coercion;
pub use dictionary::FieldDictionary;
pub use schema::{Column, InferredSchema, SchemaChange};
pub use types::{Cell, ColumnType, TypedValue};

use crate::decoder::Segment;
use tracing::trace;

/// One typed row, cells in field order. Missing columns are null.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredRow {
    /// Index of the source message, for ordering and diagnostics
    pub message_index: usize,
    pub cells: Vec<(String, Cell)>,
}

impl InferredRow {
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }
}

/// Result of inferring one segment
#[derive(Debug, Clone)]
pub struct Inference {
    pub schema: InferredSchema,
    pub row: InferredRow,
    /// Non-null values no typed rule matched
    pub string_fallbacks: usize,
}

#[derive(Debug, Clone)]
pub struct SchemaInferrer {
    dictionary: FieldDictionary,
    infer_types: bool,
}

impl Default for SchemaInferrer {
    fn default() -> Self {
        Self::new(FieldDictionary::default())
    }
}

impl SchemaInferrer {
    pub fn new(dictionary: FieldDictionary) -> Self {
        Self {
            dictionary,
            infer_types: true,
        }
    }

    /// With inference off every column is a string
    pub fn with_type_inference(mut self, enabled: bool) -> Self {
        self.infer_types = enabled;
        self
    }

    pub fn column_name(&self, segment: &str, position: usize) -> String {
        self.dictionary.column_name(segment, position)
    }

    pub fn infer(&self, segment: &Segment, message_index: usize) -> Inference {
        let mut schema = InferredSchema::new();
        let mut cells = Vec::with_capacity(segment.fields.len());
        let mut string_fallbacks = 0;

        for field in segment.fields.iter().filter(|f| !f.is_null()) {
            let name = self.dictionary.column_name(&segment.name, field.position);

            let cell = if self.infer_types {
                match coerce::coerce(&field.value) {
                    Coercion::Matched(value) => Cell::new(field.value.as_str(), value),
                    Coercion::NoMatch => {
                        trace!(column = %name, "No typed rule matched, keeping string");
                        string_fallbacks += 1;
                        Cell::text(field.value.as_str())
                    },
                }
            } else {
                Cell::text(field.value.as_str())
            };

            schema.observe(&name, cell.column_type());
            cells.push((name, cell));
        }

        Inference {
            schema,
            row: InferredRow {
                message_index,
                cells,
            },
            string_fallbacks,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_inference() {
        let segment = Segment::from_values("ZZZ", ["20230401120000", "Y", "N", "42", "42.5", ""]);
        let inference = SchemaInferrer::default().infer(&segment, 0);

        let s = &inference.schema;
        assert_eq!(s.get("zzz_1"), Some(ColumnType::Timestamp));
        assert_eq!(s.get("zzz_2"), Some(ColumnType::Boolean));
        assert_eq!(s.get("zzz_3"), Some(ColumnType::Boolean));
        assert_eq!(s.get("zzz_4"), Some(ColumnType::Integer));
        assert_eq!(s.get("zzz_5"), Some(ColumnType::Float));
        assert_eq!(s.get("zzz_6"), None);
        assert_eq!(s.len(), 5);
        assert_eq!(inference.row.cells.len(), 5);
        assert_eq!(inference.string_fallbacks, 0);
    }

    #[test]
    fn test_pid_identifiers_stay_strings() {
        let segment = Segment::from_values("PID", ["001", "Alice", "19900101"]);
        let inference = SchemaInferrer::default().infer(&segment, 3);

        assert_eq!(inference.schema.get("pid_1"), Some(ColumnType::String));
        assert_eq!(inference.schema.get("pid_2"), Some(ColumnType::String));
        assert_eq!(inference.schema.get("pid_3"), Some(ColumnType::Timestamp));
        assert_eq!(inference.string_fallbacks, 2);
        assert_eq!(inference.row.message_index, 3);
        assert_eq!(inference.row.cell("pid_1").unwrap().raw, "001");
    }

    #[test]
    fn test_explicit_null_contributes_nothing() {
        let segment = Segment::from_values("PV1", ["1", "\"\"", "I"]);
        let inference = SchemaInferrer::default().infer(&segment, 0);

        assert_eq!(inference.schema.get("pv1_2"), None);
        assert!(inference.row.cell("pv1_2").is_none());
        assert_eq!(inference.schema.len(), 2);
    }

    #[test]
    fn test_dictionary_names_columns() {
        let mut dictionary = FieldDictionary::new();
        dictionary.insert("OBX", 5, "observation_value").unwrap();
        let segment = Segment::from_values("OBX", ["1", "NM", "8310-5", "", "98.6"]);

        let inference = SchemaInferrer::new(dictionary).infer(&segment, 0);
        assert_eq!(inference.schema.get("observation_value"), Some(ColumnType::Float));
        assert_eq!(inference.schema.get("obx_1"), Some(ColumnType::Integer));
    }

    #[test]
    fn test_dictionary_columns_keep_every_value() {
        let mut dictionary = FieldDictionary::new();
        dictionary.insert("PID", 2, "name").unwrap();
        assert!(dictionary.insert("PID", 3, "name").is_err());

        let segment = Segment::from_values("PID", ["001", "Alice", "19900101"]);
        let inference = SchemaInferrer::new(dictionary).infer(&segment, 0);

        assert_eq!(inference.row.cells.len(), 3);
        assert_eq!(inference.schema.len(), 3);
        assert_eq!(inference.row.cell("name").unwrap().raw, "Alice");
        assert_eq!(inference.schema.get("pid_3"), Some(ColumnType::Timestamp));
    }

    #[test]
    fn test_type_inference_disabled() {
        let segment = Segment::from_values("OBX", ["1", "NM", "98.6"]);
        let inference = SchemaInferrer::default()
            .with_type_inference(false)
            .infer(&segment, 0);

        assert!(inference
            .schema
            .columns()
            .iter()
            .all(|c| c.column_type == ColumnType::String));
        assert_eq!(inference.string_fallbacks, 0);
    }

    #[test]
    fn test_naming_is_deterministic() {
        let segment = Segment::from_values("OBX", ["1", "NM", "98.6"]);
        let inferrer = SchemaInferrer::default();
        assert_eq!(
            inferrer.infer(&segment, 0).schema,
            inferrer.infer(&segment, 1).schema
        );
    }
}

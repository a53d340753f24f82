//! Semantic column types and typed cell values

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic type of an inferred column.
///
/// Widening is monotonic: `Integer < Float < String`, and `Boolean` /
/// `Timestamp` widen straight to `String` on any conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Timestamp,
    String,
}

impl ColumnType {
    /// Smallest type able to hold values of both `self` and `other`
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// Whether a column of type `self` may be changed to `target` without
    /// narrowing
    pub fn can_widen_to(self, target: ColumnType) -> bool {
        self.widen(target) == target
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::String => "string",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value after coercion
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    String(String),
}

impl TypedValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            TypedValue::Integer(_) => ColumnType::Integer,
            TypedValue::Float(_) => ColumnType::Float,
            TypedValue::Boolean(_) => ColumnType::Boolean,
            TypedValue::Timestamp(_) => ColumnType::Timestamp,
            TypedValue::String(_) => ColumnType::String,
        }
    }
}

/// One non-null field of an inferred row: the raw HL7 text plus its
/// coerced value
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub raw: String,
    pub value: TypedValue,
}

impl Cell {
    pub fn new(raw: impl Into<String>, value: TypedValue) -> Self {
        Self {
            raw: raw.into(),
            value,
        }
    }

    pub fn text(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            value: TypedValue::String(raw.clone()),
            raw,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        self.value.column_type()
    }

    /// Render the cell as JSON for a column of type `target`.
    ///
    /// A string column always receives the raw text. Integers may be stored
    /// in float columns. Any other mismatch is a structural rejection.
    pub fn render(&self, target: ColumnType) -> Result<Value, String> {
        match (&self.value, target) {
            (_, ColumnType::String) => Ok(Value::String(self.raw.clone())),
            (TypedValue::Integer(i), ColumnType::Integer) => Ok(Value::from(*i)),
            (TypedValue::Integer(i), ColumnType::Float) => float_json(*i as f64, &self.raw),
            (TypedValue::Float(f), ColumnType::Float) => float_json(*f, &self.raw),
            (TypedValue::Boolean(b), ColumnType::Boolean) => Ok(Value::Bool(*b)),
            (TypedValue::Timestamp(ts), ColumnType::Timestamp) => Ok(Value::String(
                ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )),
            (value, target) => Err(format!(
                "{} value '{}' does not fit a {} column",
                value.column_type(),
                self.raw,
                target
            )),
        }
    }
}

fn float_json(value: f64, raw: &str) -> Result<Value, String> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| format!("'{}' is not a finite number", raw))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_widening_order() {
        use ColumnType::*;

        assert_eq!(Integer.widen(Integer), Integer);
        assert_eq!(Integer.widen(Float), Float);
        assert_eq!(Float.widen(Integer), Float);
        assert_eq!(Float.widen(String), String);
        assert_eq!(Boolean.widen(Integer), String);
        assert_eq!(Timestamp.widen(Float), String);
        assert_eq!(Timestamp.widen(Boolean), String);
    }

    #[test]
    fn test_can_widen_to_never_narrows() {
        use ColumnType::*;

        assert!(Integer.can_widen_to(Float));
        assert!(Integer.can_widen_to(String));
        assert!(Timestamp.can_widen_to(String));
        assert!(!Float.can_widen_to(Integer));
        assert!(!String.can_widen_to(Timestamp));
        assert!(!Boolean.can_widen_to(Integer));
    }

    #[test]
    fn test_render_widened_cells() {
        let int = Cell::new("42", TypedValue::Integer(42));
        assert_eq!(int.render(ColumnType::Integer).unwrap(), Value::from(42));
        assert_eq!(int.render(ColumnType::Float).unwrap(), Value::from(42.0));
        assert_eq!(int.render(ColumnType::String).unwrap(), Value::from("42"));

        let ts = Cell::new(
            "20230401120000",
            TypedValue::Timestamp(Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap()),
        );
        assert_eq!(
            ts.render(ColumnType::Timestamp).unwrap(),
            Value::from("2023-04-01T12:00:00Z")
        );
        assert_eq!(
            ts.render(ColumnType::String).unwrap(),
            Value::from("20230401120000")
        );
    }

    #[test]
    fn test_render_rejects_narrowing() {
        let text = Cell::text("abc");
        let err = text.render(ColumnType::Integer).unwrap_err();
        assert!(err.contains("abc"));

        let float = Cell::new("1.5", TypedValue::Float(1.5));
        assert!(float.render(ColumnType::Integer).is_err());
    }
}

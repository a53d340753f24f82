//! Optional field-name dictionary
//!
//! Maps `(segment, position)` to a human-readable column name. The file is
//! JSON keyed by segment, then by field position:
//!
//! ```json
//! { "PID": { "3": "patient_identifier", "5": "patient_name" } }
//! ```
//!
//! Every column of a segment must get a distinct name, so a dictionary may
//! not give two positions the same name nor reuse the positional name of
//! another position (`pid_3` for PID-2).

use hl7_common::{IngestError, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct FieldDictionary {
    names: HashMap<String, HashMap<usize, String>>,
}

impl FieldDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: HashMap<String, HashMap<usize, String>> = serde_json::from_str(content)?;
        let mut dictionary = Self::new();
        for (segment, fields) in raw {
            let mut fields: Vec<(usize, String)> = fields.into_iter().collect();
            fields.sort();
            for (position, name) in fields {
                dictionary.insert(&segment, position, &name)?;
            }
        }
        Ok(dictionary)
    }

    /// Register a name; names that sanitise to nothing are ignored. Fails
    /// when the name would collide with another column of the segment.
    pub fn insert(&mut self, segment: &str, position: usize, name: &str) -> Result<()> {
        let name = sanitize(name);
        if name.is_empty() {
            return Ok(());
        }

        let prefix = format!("{}_", segment.to_ascii_lowercase());
        if let Some(other) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.parse::<usize>().ok())
            .filter(|&n| n != position && format!("{}{}", prefix, n) == name)
        {
            return Err(IngestError::Config(format!(
                "field dictionary names {}-{} '{}', the positional name of {}-{}",
                segment, position, name, segment, other
            )));
        }

        let fields = self.names.entry(segment.to_ascii_uppercase()).or_default();
        if let Some((&other, _)) = fields
            .iter()
            .find(|(p, existing)| **p != position && **existing == name)
        {
            return Err(IngestError::Config(format!(
                "field dictionary names both {}-{} and {}-{} '{}'",
                segment, other, segment, position, name
            )));
        }

        fields.insert(position, name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column name for a field: the dictionary entry if any, else
    /// `<segment lowercase>_<position>`
    pub fn column_name(&self, segment: &str, position: usize) -> String {
        self.names
            .get(&segment.to_ascii_uppercase())
            .and_then(|fields| fields.get(&position))
            .cloned()
            .unwrap_or_else(|| format!("{}_{}", segment.to_ascii_lowercase(), position))
    }
}

/// Lowercase, map every other character to `_`, and never start with a digit
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();

    if out.chars().all(|c| c == '_') {
        return String::new();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_positional_fallback() {
        let dict = FieldDictionary::new();
        assert_eq!(dict.column_name("PID", 5), "pid_5");
        assert_eq!(dict.column_name("ZX1", 12), "zx1_12");
    }

    #[test]
    fn test_dictionary_names_are_sanitised() {
        let dict = FieldDictionary::from_json_str(
            r#"{"PID": {"5": "Patient Name", "7": "Date/Time of Birth"}, "obx": {"5": "3value"}}"#,
        )
        .unwrap();

        assert_eq!(dict.len(), 3);
        assert_eq!(dict.column_name("PID", 5), "patient_name");
        assert_eq!(dict.column_name("PID", 7), "date_time_of_birth");
        assert_eq!(dict.column_name("OBX", 5), "_3value");
        assert_eq!(dict.column_name("PID", 8), "pid_8");
    }

    #[test]
    fn test_unusable_names_are_ignored() {
        let mut dict = FieldDictionary::new();
        dict.insert("PID", 2, " -- ").unwrap();
        assert!(dict.is_empty());
        assert_eq!(dict.column_name("PID", 2), "pid_2");
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut dict = FieldDictionary::new();
        dict.insert("PID", 2, "name").unwrap();

        let err = dict.insert("PID", 3, "Name").unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert_eq!(dict.column_name("PID", 3), "pid_3");

        // Same name in another segment is fine
        dict.insert("NK1", 2, "name").unwrap();
        // Renaming a position keeps it unique
        dict.insert("PID", 2, "patient_name").unwrap();
        assert_eq!(dict.column_name("PID", 2), "patient_name");
    }

    #[test]
    fn test_positional_name_of_another_field_is_rejected() {
        let mut dict = FieldDictionary::new();
        assert!(dict.insert("OBX", 2, "obx_1").is_err());
        assert!(dict.insert("OBX", 2, "obx_2").is_ok());
        assert!(dict.insert("OBX", 3, "obx_value").is_ok());

        assert!(FieldDictionary::from_json_str(r#"{"PID": {"2": "name", "3": "name"}}"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"OBX": {{"5": "observation_value"}}}}"#).unwrap();

        let dict = FieldDictionary::load(file.path()).unwrap();
        assert_eq!(dict.column_name("OBX", 5), "observation_value");
    }

    #[test]
    fn test_malformed_dictionary_is_an_error() {
        assert!(FieldDictionary::from_json_str(r#"{"PID": ["a"]}"#).is_err());
        assert!(FieldDictionary::from_json_str(r#"{"PID": {"five": "x"}}"#).is_err());
    }
}

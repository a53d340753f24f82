//! Error types for the HL7 loader

use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Failure taxonomy shared by every loader component.
///
/// Only [`IngestError::Decode`] is fatal to a whole run. Schema conflicts are
/// fatal to one segment name, remote errors to one batch or segment name.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Decode error at line {line}: {message}")]
    Decode { line: usize, message: String },

    #[error("Schema conflict on table {table}: {message}")]
    SchemaConflict { table: String, message: String },

    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    #[error("Permanent remote error: {0}")]
    PermanentRemote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    pub fn decode(line: usize, message: impl Into<String>) -> Self {
        IngestError::Decode {
            line,
            message: message.into(),
        }
    }

    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientRemote(_))
    }

    /// Short machine-readable label used in run reports
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Decode { .. } => "decode_error",
            IngestError::SchemaConflict { .. } => "schema_conflict",
            IngestError::TransientRemote(_) => "transient_remote_error",
            IngestError::PermanentRemote(_) => "permanent_remote_error",
            IngestError::Config(_) => "config_error",
            IngestError::Io(_) => "io_error",
            IngestError::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_remote_is_transient() {
        assert!(IngestError::TransientRemote("503".into()).is_transient());
        assert!(!IngestError::PermanentRemote("400".into()).is_transient());
        assert!(!IngestError::decode(3, "bad segment").is_transient());
    }

    #[test]
    fn test_decode_display_includes_line() {
        let err = IngestError::decode(7, "segment name 'P1' is not three characters");
        assert_eq!(
            err.to_string(),
            "Decode error at line 7: segment name 'P1' is not three characters"
        );
        assert_eq!(err.kind(), "decode_error");
    }
}

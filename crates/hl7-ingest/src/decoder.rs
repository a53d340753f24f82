//! HL7 v2 ER7 message decoder
//!
//! Splits a pipe-delimited HL7 v2 file into messages, segments and positional
//! fields. Field values are kept raw: components, repetitions and escape
//! sequences are not interpreted.
//!
//! # Format
//! ```text
//! MSH|^~\&|LAB|HOSP|||20230401120000||ORU^R01|MSG0001|P|2.5
//! PID|001|Alice|19900101
//! OBX|1|NM|8310-5^Body temperature||98.6
//! ```
//!
//! Segments are separated by CR, LF or CRLF. Every message starts with an
//! `MSH` segment, which also declares the field separator used by the rest of
//! that message. Batch envelope segments (`FHS`, `BHS`, `BTS`, `FTS`) are
//! skipped.

use hl7_common::{IngestError, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Segment that opens every message
pub const HEADER_SEGMENT: &str = "MSH";

const ENVELOPE_SEGMENTS: [&str; 4] = ["FHS", "BHS", "BTS", "FTS"];

/// HL7 explicit null: the field is present but deliberately empty
const EXPLICIT_NULL: &str = "\"\"";

/// A single positional field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// 1-based HL7 field number (`PID-5` has position 5)
    pub position: usize,
    pub value: String,
}

impl Field {
    pub fn new(position: usize, value: impl Into<String>) -> Self {
        Self {
            position,
            value: value.into(),
        }
    }

    /// Empty and explicit-null values carry no data
    pub fn is_null(&self) -> bool {
        self.value.is_empty() || self.value == EXPLICIT_NULL
    }
}

/// A named, ordered group of fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Segment {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Build a segment from values numbered 1, 2, 3, ...
    pub fn from_values<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Field::new(i + 1, v))
            .collect();
        Self::new(name, fields)
    }

    pub fn field(&self, position: usize) -> Option<&Field> {
        self.fields.iter().find(|f| f.position == position)
    }
}

/// One decoded message, identified by its position in the source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub index: usize,
    pub segments: Vec<Segment>,
}

impl Message {
    /// MSH-10, the sender's message control id
    pub fn control_id(&self) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.name == HEADER_SEGMENT)
            .and_then(|s| s.field(10))
            .map(|f| f.value.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Decoder for pipe-delimited (ER7) HL7 v2 files
#[derive(Debug, Clone, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Read and decode a whole file
    pub fn decode_file(&self, path: &Path) -> Result<Vec<Message>> {
        let bytes = std::fs::read(path)?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "Source is not valid UTF-8, replacing invalid bytes"
                );
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            },
        };

        self.decode_str(&content)
    }

    /// Decode in-memory content
    pub fn decode_str(&self, content: &str) -> Result<Vec<Message>> {
        let normalized = content
            .trim_start_matches('\u{feff}')
            .replace("\r\n", "\n")
            .replace('\r', "\n");

        let mut messages: Vec<Message> = Vec::new();
        let mut current: Option<Message> = None;
        let mut separator = '|';

        for (idx, raw) in normalized.lines().enumerate() {
            let line_num = idx + 1;
            let line = raw.trim_end();

            if line.trim().is_empty() {
                continue;
            }

            if line.starts_with(HEADER_SEGMENT) {
                let (header, sep) = Self::parse_header(line, line_num)?;
                separator = sep;

                if let Some(done) = current.take() {
                    messages.push(done);
                }
                current = Some(Message {
                    index: messages.len(),
                    segments: vec![header],
                });
                continue;
            }

            let segment = Self::parse_segment(line, separator, line_num)?;

            if ENVELOPE_SEGMENTS.contains(&segment.name.as_str()) {
                debug!(line = line_num, segment = %segment.name, "Skipping batch envelope segment");
                continue;
            }

            match current.as_mut() {
                Some(message) => message.segments.push(segment),
                None => {
                    return Err(IngestError::decode(
                        line_num,
                        format!("segment {} appears before any MSH header", segment.name),
                    ));
                },
            }
        }

        if let Some(done) = current.take() {
            messages.push(done);
        }

        if messages.is_empty() {
            return Err(IngestError::decode(0, "no HL7 messages found"));
        }

        debug!("Decoded {} messages", messages.len());
        Ok(messages)
    }

    /// Parse an MSH line. MSH-1 is the field separator itself and MSH-2 the
    /// encoding characters, so the remaining values start at position 3.
    fn parse_header(line: &str, line_num: usize) -> Result<(Segment, char)> {
        let mut chars = line[HEADER_SEGMENT.len()..].chars();
        let separator = chars.next().ok_or_else(|| {
            IngestError::decode(line_num, "MSH segment does not declare a field separator")
        })?;

        if separator.is_ascii_alphanumeric() || separator.is_whitespace() {
            return Err(IngestError::decode(
                line_num,
                format!("invalid field separator '{}'", separator),
            ));
        }

        let rest = chars.as_str();
        if rest.is_empty() {
            return Err(IngestError::decode(
                line_num,
                "MSH segment does not declare encoding characters",
            ));
        }

        let mut fields = vec![Field::new(1, separator.to_string())];
        fields.extend(
            rest.split(separator)
                .enumerate()
                .map(|(i, value)| Field::new(i + 2, value)),
        );

        Ok((Segment::new(HEADER_SEGMENT, fields), separator))
    }

    fn parse_segment(line: &str, separator: char, line_num: usize) -> Result<Segment> {
        let mut parts = line.split(separator);
        let name = parts.next().unwrap_or_default();

        if !is_segment_name(name) {
            return Err(IngestError::decode(
                line_num,
                format!("'{}' is not a valid segment name", name),
            ));
        }

        let fields = parts
            .enumerate()
            .map(|(i, value)| Field::new(i + 1, value))
            .collect();

        Ok(Segment::new(name, fields))
    }
}

/// Three characters: an uppercase letter followed by uppercase letters or digits
fn is_segment_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 3
        && bytes[0].is_ascii_uppercase()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

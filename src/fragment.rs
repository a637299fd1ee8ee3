//! The message shape both roles agree on.
//!
//! A [`Fragment`] is one source row tagged with its sequence number. On the
//! wire it is a compact JSON object:
//!
//! ```json
//! {"row": ["1.a", "1.b", "1.notes"], "line_number": 0}
//! {"row": [], "line_number": 2, "eof": true}
//! ```
//!
//! `eof` is only written when it is `true`, and a missing `eof` reads as
//! `false`. The task a fragment belongs to travels in the message headers
//! ([`HEADER_FILENAME`], [`HEADER_TASK_ID`]), not in the payload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Header carrying the original basename of the source file.
pub const HEADER_FILENAME: &str = "filename";
/// Header carrying the task identifier.
pub const HEADER_TASK_ID: &str = "task_id";

/// Message headers: a plain string-to-string map.
pub type Headers = HashMap<String, String>;

/// One row of a task, numbered from zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// The row's fields, already split by the source's delimiter rules.
    pub row: Vec<String>,
    /// Position of this fragment within its task.
    pub line_number: u64,
    /// Set on exactly one fragment per task, the one with the highest number.
    #[serde(default, skip_serializing_if = "is_false")]
    pub eof: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

impl Fragment {
    pub fn new(row: Vec<String>, line_number: u64, eof: bool) -> Self {
        Self {
            row,
            line_number,
            eof,
        }
    }

    /// Serialize the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .with_context(|| format!("serialize fragment #{}", self.line_number))
    }

    /// Encode the row the way it is appended to the target file.
    ///
    /// Fields are joined by `delimiter`. A field is quoted, with its quotes
    /// doubled, only if it holds the delimiter or a line break, or starts
    /// with a quote; any other quote is written as-is. A row made of one
    /// empty field is written as `""` so it does not read back as a blank
    /// line. `terminator` follows unless this is the final fragment. A
    /// zero-field row contributes no field bytes.
    #[must_use]
    pub fn encode(&self, delimiter: u8, terminator: &str) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.row.iter().map(|f| f.len() + 3).sum::<usize>() + terminator.len());
        if matches!(self.row.as_slice(), [only] if only.is_empty()) {
            out.extend_from_slice(b"\"\"");
        } else {
            for (i, field) in self.row.iter().enumerate() {
                if i > 0 {
                    out.push(delimiter);
                }
                write_field(&mut out, field.as_bytes(), delimiter);
            }
        }
        if !self.eof {
            out.extend_from_slice(terminator.as_bytes());
        }
        out
    }
}

fn needs_quotes(field: &[u8], delimiter: u8) -> bool {
    field.first() == Some(&b'"')
        || field
            .iter()
            .any(|&b| b == delimiter || b == b'\n' || b == b'\r')
}

fn write_field(out: &mut Vec<u8>, field: &[u8], delimiter: u8) {
    if !needs_quotes(field, delimiter) {
        out.extend_from_slice(field);
        return;
    }
    out.push(b'"');
    for &b in field {
        if b == b'"' {
            out.push(b'"');
        }
        out.push(b);
    }
    out.push(b'"');
}

/// Which task a fragment belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef {
    pub task_id: String,
    pub filename: String,
}

impl TaskRef {
    pub fn new(task_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            filename: filename.into(),
        }
    }

    /// The headers a producer attaches to every fragment of this task.
    #[must_use]
    pub fn headers(&self) -> Headers {
        let mut h = Headers::with_capacity(2);
        h.insert(HEADER_FILENAME.to_string(), self.filename.clone());
        h.insert(HEADER_TASK_ID.to_string(), self.task_id.clone());
        h
    }

    /// Read the task out of message headers.
    ///
    /// # Errors
    ///
    /// Returns a [`FragmentError`] if a header is missing, empty, or would
    /// address a file outside the working directory.
    pub fn from_headers(headers: &Headers) -> Result<Self, FragmentError> {
        let filename = required_header(headers, HEADER_FILENAME)?;
        let task_id = required_header(headers, HEADER_TASK_ID)?;
        Ok(Self::new(task_id, filename))
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.filename)
    }
}

/// Identifies a fragment across redeliveries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub task_id: String,
    pub line_number: u64,
}

/// Why a delivered message could not be turned into a fragment.
///
/// All of these are permanent: the message is dropped and acknowledged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("missing header `{0}`")]
    MissingHeader(&'static str),

    #[error("empty header `{0}`")]
    EmptyHeader(&'static str),

    #[error("header `{name}` is not a plain file name: {value:?}")]
    UnsafeHeader { name: &'static str, value: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

fn required_header(headers: &Headers, name: &'static str) -> Result<String, FragmentError> {
    let value = headers.get(name).ok_or(FragmentError::MissingHeader(name))?;
    if value.is_empty() {
        return Err(FragmentError::EmptyHeader(name));
    }
    if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(FragmentError::UnsafeHeader {
            name,
            value: value.clone(),
        });
    }
    Ok(value.clone())
}

/// Parse a delivered message into its task and fragment.
///
/// # Errors
///
/// Returns a [`FragmentError`] for an empty or unparsable payload and for
/// missing or unsafe headers.
pub fn decode(payload: &[u8], headers: &Headers) -> Result<(TaskRef, Fragment), FragmentError> {
    if payload.is_empty() {
        return Err(FragmentError::EmptyPayload);
    }
    let fragment: Fragment = serde_json::from_slice(payload)
        .map_err(|e| FragmentError::InvalidPayload(e.to_string()))?;
    let task = TaskRef::from_headers(headers)?;
    Ok((task, fragment))
}

/// Short hex digest of a file name, shared by every message of that file.
#[must_use]
pub fn filename_hash(filename: &str) -> String {
    let digest = Sha256::digest(filename.as_bytes());
    digest.iter().take(3).map(|b| format!("{b:02x}")).collect()
}

/// Transport idempotency key: `<6 hex chars of hash(filename)>_<line_number>`.
///
/// A bus redelivering the identical message reuses the key; a new row of the
/// same file never does.
#[must_use]
pub fn message_key(filename: &str, line_number: u64) -> String {
    format!("{}_{line_number}", filename_hash(filename))
}

//! Opaque resume positions and their string codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for cursor handling.
#[derive(Error, Debug)]
pub enum CursorError {
    /// The stored cursor cannot be decoded, or its shape does not match
    /// the collection it is being replayed against. Fatal to the run:
    /// silently restarting from the beginning would duplicate work.
    #[error("corrupt cursor: {0}")]
    Corrupt(String),
}

/// A resume position within a collection.
///
/// Produced and consumed only by the batch enumerator; everything else
/// treats the encoded form as an opaque string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Position {
    /// Number of items already consumed from a randomly sliceable
    /// collection. Resumes at exactly this offset.
    Offset(u64),
    /// The ordering-key values of the last processed item of a keyed
    /// collection. Resumes strictly after this key, which stays correct
    /// when rows are inserted or deleted ahead of the cursor while a run
    /// is paused.
    Key(Vec<serde_json::Value>),
}

impl Position {
    /// Serialize to the opaque form stored on the run record.
    pub fn encode(&self) -> String {
        // Both variants are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a stored cursor.
    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        serde_json::from_str(raw).map_err(|e| CursorError::Corrupt(e.to_string()))
    }
}

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Machine-readable failure classes reported on per-replica status
/// rows and tagged onto metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The template source is syntactically invalid.
    ParseError,
    /// The generated constraint schema could not be created.
    CreateError,
    /// The generated schema or a status object could not be updated.
    UpdateError,
    /// Conversion between template representations failed.
    ConversionError,
    /// The engine rejected the compiled program.
    IngestError,
}

impl ErrorCode {
    /// The wire representation, also used as a metric label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse_error",
            ErrorCode::CreateError => "create_error",
            ErrorCode::UpdateError => "update_error",
            ErrorCode::ConversionError => "conversion_error",
            ErrorCode::IngestError => "ingest_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failure entry on a per-replica status row.
///
/// The aggregate `by_pod` array on the template composes these across
/// replicas; consumers key on [`StatusError::code`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusError {
    /// Failure class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl StatusError {
    /// Build an entry from a code and anything displayable.
    pub fn new(code: ErrorCode, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

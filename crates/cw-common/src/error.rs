//! Error types for cpuwatch.
//!
//! Errors are grouped into categories that decide how the monitor reacts:
//! - Format: the producer's output shape changed; fatal
//! - Row: a single malformed row; recovered locally by skipping it
//! - Value: a numeric field failed to parse; aborts only the current tick
//! - Collaborator: state query or stop/kill action failed; fatal at the top level
//! - Producer: the external producer could not start or exited; fatal
//! - Construction / Config: invalid settings; fail at startup

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cpuwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Format,
    Row,
    Value,
    Collaborator,
    Producer,
    Construction,
    Config,
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Format => write!(f, "format"),
            ErrorCategory::Row => write!(f, "row"),
            ErrorCategory::Value => write!(f, "value"),
            ErrorCategory::Collaborator => write!(f, "collaborator"),
            ErrorCategory::Producer => write!(f, "producer"),
            ErrorCategory::Construction => write!(f, "construction"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for cpuwatch.
#[derive(Error, Debug)]
pub enum Error {
    #[error("producer output format changed: {0}")]
    FormatIncompatible(String),

    #[error("malformed row {line:?}: {reason}")]
    RowParse { line: String, reason: String },

    #[error("cannot parse {field} from {value:?}")]
    ValueConversion { field: &'static str, value: String },

    #[error("state query failed: {0}")]
    StateQuery(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("producer failed: {0}")]
    Producer(String),

    #[error("invalid construction: {0}")]
    Construction(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::FormatIncompatible(_) => ErrorCategory::Format,
            Error::RowParse { .. } => ErrorCategory::Row,
            Error::ValueConversion { .. } => ErrorCategory::Value,
            Error::StateQuery(_) | Error::ActionFailed(_) => ErrorCategory::Collaborator,
            Error::Producer(_) => ErrorCategory::Producer,
            Error::Construction(_) => ErrorCategory::Construction,
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether the monitor must stop when this error reaches the top level.
    ///
    /// Row errors are skipped where they occur and value errors only abort
    /// the tick they belong to; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Row | ErrorCategory::Value)
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Format => {
                "The reporting command's output layout changed; check the `top` version and column flags."
            }
            ErrorCategory::Row => "Transient malformed output; the row was skipped.",
            ErrorCategory::Value => "Transient malformed value; the tick was skipped.",
            ErrorCategory::Collaborator => {
                "Check that the state script and stop/kill commands run outside cpuwatch."
            }
            ErrorCategory::Producer => "Check that the reporting command is installed and runnable.",
            ErrorCategory::Construction | ErrorCategory::Config => {
                "Fix the flag or config value named in the message; run 'cpuwatch config' to inspect."
            }
            ErrorCategory::Io => "Check permissions and retry.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            Error::FormatIncompatible("x".into()).category(),
            ErrorCategory::Format
        );
        assert_eq!(
            Error::ValueConversion {
                field: "cpu",
                value: "n/a".into()
            }
            .category(),
            ErrorCategory::Value
        );
        assert_eq!(
            Error::StateQuery("boom".into()).category(),
            ErrorCategory::Collaborator
        );
        assert_eq!(
            Error::ActionFailed("boom".into()).category(),
            ErrorCategory::Collaborator
        );
    }

    #[test]
    fn only_row_and_value_errors_are_recoverable() {
        assert!(!Error::RowParse {
            line: "1 2".into(),
            reason: "short".into()
        }
        .is_fatal());
        assert!(!Error::ValueConversion {
            field: "pid",
            value: "x".into()
        }
        .is_fatal());
        assert!(Error::FormatIncompatible("hdr".into()).is_fatal());
        assert!(Error::Producer("exit 1".into()).is_fatal());
        assert!(Error::Construction("window".into()).is_fatal());
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::ValueConversion {
            field: "cpu",
            value: "abc".into(),
        };
        assert_eq!(err.to_string(), "cannot parse cpu from \"abc\"");
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Collaborator).unwrap();
        assert_eq!(json, "\"collaborator\"");
    }
}

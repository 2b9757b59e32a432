//! Error types for otter-handles
//!
//! Lookup misses, stale tables and bad encodings are ordinary outcomes at the
//! script boundary. They are returned as [`HandleError`] and can always be
//! turned into a script-visible error value with
//! [`HandleError::to_script_value`].

use crate::id::{HandleId, TableId};
use thiserror::Error;

/// Errors that can occur during handle operations
#[derive(Error, Debug)]
pub enum HandleError {
    /// The id is not live in the table (already disposed or forged)
    #[error("Handle {id} not found in table {table}")]
    NotFound { table: TableId, id: HandleId },

    /// The id is live but wraps a value of another type
    #[error("Handle {id} in table {table} does not hold a value of type {expected}")]
    TypeMismatch {
        table: TableId,
        id: HandleId,
        expected: &'static str,
    },

    /// No live table with this id exists in the runtime
    #[error("Unknown handle table {0}")]
    UnknownTable(TableId),

    /// The table has been disposed and no longer accepts resources
    #[error("Handle table {0} is disposed")]
    TableDisposed(TableId),

    /// The table belongs to a different runtime
    #[error("Handle table {0} belongs to another runtime")]
    ForeignTable(TableId),

    /// The owning runtime was dropped while a table was still referenced
    #[error("Handle runtime has been dropped")]
    RuntimeGone,

    /// Every id up to the ceiling is live
    #[error("Handle id space exhausted in table {table} (ceiling {ceiling})")]
    IdSpaceExhausted { table: TableId, ceiling: u32 },

    /// A numeric handle coming from script is not an exact id
    #[error("Invalid handle encoding: {0}")]
    InvalidEncoding(f64),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HandleError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error comes from a stale or forged handle reference.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::TypeMismatch { .. }
                | Self::UnknownTable(_)
                | Self::TableDisposed(_)
                | Self::InvalidEncoding(_)
        )
    }

    /// Name of the script error class this error surfaces as.
    pub fn script_error_name(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::UnknownTable(_) | Self::TableDisposed(_) => {
                "ReferenceError"
            }
            Self::TypeMismatch { .. } | Self::InvalidEncoding(_) => "TypeError",
            Self::IdSpaceExhausted { .. } => "RangeError",
            _ => "Error",
        }
    }

    /// Build the error value handed back to script code.
    ///
    /// The shape is `{"name": ..., "message": ...}` so generated glue can
    /// throw it as-is.
    pub fn to_script_value(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.script_error_name(),
            "message": self.to_string(),
        })
    }
}

/// Result type alias for handle operations
pub type HandleResult<T> = Result<T, HandleError>;

/// Errors reported by [`crate::TaskQueue::try_push`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task queue is full")]
    Full,

    #[error("Task queue is disposed")]
    Disposed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_reference_error() {
        let err = HandleError::NotFound {
            table: TableId::new(3),
            id: HandleId::new(7),
        };
        assert!(err.is_stale());
        assert_eq!(err.script_error_name(), "ReferenceError");

        let value = err.to_script_value();
        assert_eq!(value["name"], "ReferenceError");
        assert_eq!(value["message"], "Handle 7 not found in table 3");
    }

    #[test]
    fn test_type_mismatch_is_type_error() {
        let err = HandleError::TypeMismatch {
            table: TableId::new(1),
            id: HandleId::new(0),
            expected: "alloc::string::String",
        };
        assert!(err.is_stale());
        assert_eq!(err.to_script_value()["name"], "TypeError");
    }

    #[test]
    fn test_config_error_is_not_stale() {
        let err = HandleError::config("bad ceiling");
        assert!(!err.is_stale());
        assert_eq!(err.script_error_name(), "Error");
    }
}

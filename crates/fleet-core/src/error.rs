//! # Error Types
//!
//! Domain-specific error types for fleet-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Where Errors Live                               │
//! │                                                                         │
//! │  fleet-core errors (this file)                                         │
//! │  ├── CoreError        - Bad statuses and unbuildable commands          │
//! │  └── ValidationError  - Rejected identifiers and target lists          │
//! │                                                                         │
//! │  fleet-db errors (separate crate)                                      │
//! │  └── DbError          - Store failures                                 │
//! │                                                                         │
//! │  fleet-sync errors (separate crate)                                    │
//! │  └── SyncError        - Transport, protocol and orchestration failures │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → daemon logs           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status string read back from storage or a webhook is unknown.
    #[error("Unknown command status: '{0}'")]
    UnknownStatus(String),

    /// A command cannot be built for the given request type.
    ///
    /// ## When This Occurs
    /// - A `Custom` command was created without a request type
    /// - An install-profile command has an empty payload
    #[error("Invalid command {request_type}: {reason}")]
    InvalidCommand {
        request_type: String,
        reason: String,
    },

    
    #[error("Rejected input: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Rejections raised by the `validation` helpers.
///
/// Raised before any network call or database write is attempted.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Missing or blank.
    #[error("{field} is required")]
    Required { field: String },

    /// A list that must carry at least one element is empty.
    #[error("at least one {field} is required")]
    Empty { field: String },

    /// e.g. a page size of zero.
    #[error("{field} must lie in {min}..={max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid URL).
    #[error("{field} is malformed: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Creates a `Required` error for the given field.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Result alias used across fleet-core.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages_name_the_field() {
        let err = ValidationError::required("udid");
        assert_eq!(err.to_string(), "udid is required");

        let err = ValidationError::Empty {
            field: "target id".to_string(),
        };
        assert_eq!(err.to_string(), "at least one target id is required");
    }

    #[test]
    fn test_rejected_input_lifts_into_core_error() {
        let core_err: CoreError = ValidationError::required("udid").into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}

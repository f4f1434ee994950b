//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       What Can Go Wrong                                 │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Validation     │  │   Transport     │  │     Protocol            │ │
//! │  │  (no network)   │  │                 │  │                         │ │
//! │  │  EmptyTargets   │  │  Http           │  │  Protocol{status,body}  │ │
//! │  │  ClientNotInit. │  │  RetriesExhaus. │  │  CommandRejected        │ │
//! │  │  DeviceNotFound │  │  Cancelled      │  │  DeclarationStep        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Configuration   │  │    Database     │  │      Scheduling         │ │
//! │  │  InvalidConfig  │  │  Database(DbErr)│  │  Duplicate              │ │
//! │  │  ConfigLoad...  │  │                 │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-target failures inside an otherwise successful response are NOT
//! errors at this level; they live in [`crate::commands::ApiResult`].

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;

use crate::synchronizer::DeclarationStep;

/// Result alias for everything in fleet-sync.
pub type SyncResult<T> = Result<T, SyncError>;

/// The last response seen before the retry budget ran out, buffered so
/// callers can still inspect status and body.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
}

impl ResponseSnapshot {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sync error type covering all engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Validation Errors (raised before any network call)
    // =========================================================================
    /// A protocol call was made with no target IDs.
    #[error("At least one target ID is required")]
    EmptyTargets,

    /// Input failed a domain check.
    #[error("Validation failed: {0}")]
    Validation(#[from] fleet_core::ValidationError),

    /// A command could not be built.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// No command protocol client has been configured.
    #[error("Command protocol client is not initialized")]
    ClientNotInitialized,

    /// The target device is not in the local directory.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The HTTP client failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The retry budget is spent; the last response (if any) is attached.
    #[error("Gave up after {attempts} attempts (last status: {status:?}): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        status: Option<u16>,
        last_error: String,
        response: Option<ResponseSnapshot>,
    },

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Non-success status not covered by the retry rules.
    #[error("Unexpected status {status}: {body}")]
    Protocol { status: u16, body: String },

    /// A response body could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// A request body could not be encoded.
    #[error("Could not encode request body: {0}")]
    Serialization(String),

    /// The enqueue round trip succeeded but the server refused the command
    /// for this target.
    #[error("Command rejected for {udid}: {reason}")]
    CommandRejected { udid: String, reason: String },

    /// One step of a declaration push or delete failed.
    #[error("Declaration step {step} failed for profile {profile}: {source}")]
    DeclarationStep {
        step: DeclarationStep,
        profile: String,
        #[source]
        source: Box<SyncError>,
    },

    /// The server reported the object does not exist.
    #[error("Server has no {0}")]
    NotFound(String),

    /// The configured dialect has no such operation.
    #[error("Operation not supported by the {dialect} dialect: {operation}")]
    Unsupported {
        dialect: &'static str,
        operation: &'static str,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Could not read director config: {0}")]
    ConfigLoadFailed(String),

    #[error("Could not write director config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    #[error("Store error: {0}")]
    Database(#[from] fleet_db::DbError),

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// A task with the same key is already pending inside its window.
    #[error("Task {0} is already scheduled")]
    Duplicate(String),

    #[error("Director is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fleet_core::CoreError> for SyncError {
    fn from(err: fleet_core::CoreError) -> Self {
        match err {
            fleet_core::CoreError::Validation(v) => SyncError::Validation(v),
            other => SyncError::InvalidCommand(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<plist::Error> for SyncError {
    fn from(err: plist::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Builds a protocol error from a status and raw body.
    pub fn protocol(status: StatusCode, body: impl AsRef<[u8]>) -> Self {
        SyncError::Protocol {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body.as_ref()).into_owned(),
        }
    }

    /// Returns true if a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(err) => crate::transport::is_transient(err),
            SyncError::RetriesExhausted { .. } => true,
            SyncError::Database(err) => err.is_transient(),
            SyncError::DeclarationStep { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for errors raised before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::EmptyTargets
                | SyncError::Validation(_)
                | SyncError::InvalidCommand(_)
                | SyncError::ClientNotInitialized
                | SyncError::DeviceNotFound(_)
        )
    }

    /// Returns true when the server reported a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Protocol { status, .. } => *status == StatusCode::NOT_FOUND.as_u16(),
            SyncError::Database(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Takes the last response out of an exhausted-retries error.
    pub fn into_response(self) -> Option<ResponseSnapshot> {
        match self {
            SyncError::RetriesExhausted { response, .. } => response,
            _ => None,
        }
    }
}

//! # fleet-core: Pure Domain Logic for Fleet Director
//!
//! This crate holds the rules that decide *what* Fleet Director sends to a
//! device. It never talks to a database or a network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Fleet Director Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                fleet-sync (delivery engine)                     │   │
//! │  │   Scheduler ──► Command Queue ──► Declaration Sync ──► Clients │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fleet-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  command  │  │declaration│  │ schedule  │  │   │
//! │  │   │  Device   │  │CommandSpec│  │ IDs, sets │  │NeedsPush  │  │   │
//! │  │   │  Command  │  │ RequestTy │  │ sanitize  │  │ quota     │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  fleet-db (Database Layer)                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Device, Command, Enrollment, Profile records
//! - [`command`] - Request types and `CommandSpec` builders
//! - [`declaration`] - Deterministic declaration identifiers and payloads
//! - [`schedule`] - Push eligibility and dispatch throttling rules
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use fleet_core::declaration::DeclarationIds;
//!
//! let ids = DeclarationIds::derive("com.example.director", "D1", "com.example.wifi");
//! assert_eq!(ids.legacy, "com.example.director.D1.legacy_profile.com.example.wifi");
//! assert_eq!(
//!     ids.activation,
//!     "com.example.director.D1.legacy_profile_activation.com.example.wifi"
//! );
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod command;
pub mod declaration;
pub mod error;
pub mod schedule;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use command::{CommandSpec, RequestType};
pub use declaration::{Declaration, DeclarationIds, DeclarationKind};
pub use error::{CoreError, CoreResult, ValidationError};
pub use schedule::PushDecision;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Commands still pending after this many days are expired (hard-deleted).
pub const COMMAND_EXPIRY_DAYS: i64 = 30;

/// Information reported by a device is considered fresh for this many hours.
pub const INFO_FRESHNESS_HOURS: i64 = 24;

/// Transient unlock PINs are kept for this many minutes.
pub const UNLOCK_PIN_TTL_MINUTES: i64 = 30;

/// Namespace used for declaration identifiers when none is configured.
pub const DEFAULT_DECLARATION_NAMESPACE: &str = "com.fleetdirector";

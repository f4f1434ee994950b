//! # fleet-db: Device Directory Store
//!
//! Local persistence for the Fleet Director. SQLite through sqlx, one
//! repository per table family.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Fleet Director Data Flow                           │
//! │                                                                         │
//! │  Push scheduler / command queue (fleet-sync)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fleet-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────────┐  ┌──────────────┐ │   │
//! │  │   │   Database    │    │   Repositories    │  │  Migrations  │ │   │
//! │  │   │   (pool.rs)   │    │                   │  │  (embedded)  │ │   │
//! │  │   │               │    │ DeviceRepository  │  │              │ │   │
//! │  │   │ SqlitePool    │◄───│ CommandRepository │  │ 001_init.sql │ │   │
//! │  │   │               │    │ ProfileRepository │  │              │ │   │
//! │  │   │               │    │ Housekeeping...   │  │              │ │   │
//! │  │   └───────────────┘    └───────────────────┘  └──────────────┘ │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (director.db)                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleet_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("director.db")).await?;
//! let devices = db.devices().list_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::application::ApplicationRepository;
pub use repository::command::CommandRepository;
pub use repository::device::DeviceRepository;
pub use repository::housekeeping::{HousekeepingReport, HousekeepingRepository};
pub use repository::profile::ProfileRepository;

//! # fleet-sync: Delivery & Scheduling Engine for Fleet Director
//!
//! Everything that talks to the downstream device-management servers:
//! enrollment discovery, command delivery in two wire dialects, declarative
//! profile synchronization, and the periodic push scheduler.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Director Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  DirectorAgent (Main Orchestrator)               │  │
//! │  │  Builds clients from DirectorConfig, owns the background loops   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ PushScheduler  │  │  CommandQueue  │  │  DeclarationSync       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Eligibility,   │  │ Send, dedup,   │  │ Profile → declaration  │    │
//! │  │ throttling,    │  │ acknowledge,   │  │ → set → enrollment     │    │
//! │  │ housekeeping   │  │ expire         │  │ step sequences         │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │ PushTaskQueue     │                       │                  │
//! │          ▼                   ▼                       ▼                  │
//! │  ┌──────────────────────────────────┐  ┌────────────────────────────┐  │
//! │  │ CommandDispatcher                │  │ DeclarationApi             │  │
//! │  │  EnqueueClient (plist, per-ID)   │  │  DeclarationClient         │  │
//! │  │  LegacyCommandClient (JSON)      │  │                            │  │
//! │  └────────────────┬─────────────────┘  └─────────────┬──────────────┘  │
//! │                   └──────────────┬───────────────────┘                  │
//! │                                  ▼                                      │
//! │                 RetryingTransport (reqwest + backoff)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Plumbing
//! - [`config`] - Director configuration (servers, retry, scheduler, queue)
//! - [`error`] - Sync error types
//! - [`transport`] - Retrying HTTP transport and server endpoints
//!
//! ### Protocol Clients
//! - [`commands`] - Dispatcher trait and the structured enqueue dialect
//! - [`legacy`] - Legacy command-server dialect
//! - [`declarations`] - Declaration server client
//! - [`enrollment`] - Paginated enrollment discovery
//!
//! ### Engine
//! - [`queue`] - Command queue manager
//! - [`synchronizer`] - Declaration synchronizer
//! - [`tasks`] - Deduplicating push task queue
//! - [`scheduler`] - Push scheduler
//! - [`agent`] - `DirectorAgent` orchestrator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleet_sync::{DirectorAgent, DirectorConfig};
//! use fleet_db::{Database, DbConfig};
//!
//! let config = DirectorConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let mut agent = DirectorAgent::new(config, db)?;
//! agent.start().await?;
//!
//! let status = agent.status().await;
//! println!("Ready: {}", status.enrollment_ready);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod transport;

pub mod commands;
pub mod declarations;
pub mod enrollment;
pub mod legacy;

pub mod agent;
pub mod queue;
pub mod scheduler;
pub mod synchronizer;
pub mod tasks;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{DirectorAgent, DirectorStatus};
pub use commands::{ApiResult, CommandDispatcher, EnqueueClient, EnqueueOptions, QueuedCommand};
pub use config::{CommandDialect, DirectorConfig};
pub use declarations::{DeclarationApi, DeclarationClient, PutOutcome};
pub use enrollment::{EnrollmentFilter, EnrollmentSource};
pub use error::{SyncError, SyncResult};
pub use legacy::LegacyCommandClient;
pub use queue::{ClearReport, CommandPayload, CommandQueue, CounterSnapshot};
pub use scheduler::{CycleStats, PushScheduler};
pub use synchronizer::{BulkReport, DeclarationStep, DeclarationSync};
pub use tasks::{PushHandler, PushTaskQueue};
pub use transport::{Endpoint, RetryConfig, RetryingTransport};

//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories                                         │
//! │                                                                         │
//! │  db.devices()       → DeviceRepository       devices                   │
//! │  db.commands()      → CommandRepository      commands                  │
//! │  db.profiles()      → ProfileRepository      device_/shared_profiles   │
//! │  db.applications()  → ApplicationRepository  device_install_apps       │
//! │  db.housekeeping()  → HousekeepingRepository certificates,             │
//! │                                              profile_lists,            │
//! │                                              unlock_pins               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each repository wraps a clone of the pool and owns the SQL for its tables.

pub mod application;
pub mod command;
pub mod device;
pub mod housekeeping;
pub mod profile;

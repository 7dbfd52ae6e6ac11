#![forbid(unsafe_code)]

//! Core domain model and scheduling logic for the Refill tracker.
//!
//! This crate provides:
//! - Domain types (prescriptions, intervals, reminder plans)
//! - Depletion and reminder plan computation
//! - Refill state machine
//! - Persistence (JSON store, notification outbox, CSV export)
//! - Scheduling coordinator tying the above together

pub mod types;
pub mod error;
pub mod interval;
pub mod depletion;
pub mod plan;
pub mod refill;
pub mod supply;
pub mod config;
pub mod logging;
pub mod store;
pub mod dispatch;
pub mod coordinator;
pub mod calendar;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use interval::{advance, Interval, IntervalUnit, StartAnchor};
pub use refill::{RefillEffect, RefillEvent, RefillState};
pub use supply::SupplyClass;
pub use config::{Config, PastDuePolicy};
pub use depletion::compute_depletion;
pub use plan::generate_plan;
pub use store::{JsonFileStore, PrescriptionStore, RecordLock};
pub use dispatch::{DispatchError, JsonlOutbox, NotificationDispatcher};
pub use coordinator::SchedulingCoordinator;

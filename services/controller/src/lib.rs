//! jobsync Work Controller Library
//!
//! Keeps a local job queue and a platform work scheduler in agreement.
//! Every queued job is mirrored by a work request on the scheduler; crashes,
//! host-side evictions and missed callbacks can leave the two views apart,
//! so a reconciliation pass periodically detects and repairs the drift.
//!
//! ## Architecture
//!
//! ```text
//! WorkController            (wake/sleep lifecycle, serialized signals)
//! ├── Reconciler            (cross-process locked repair passes)
//! │   └── Sentinel          (per-state drift detection, fan-out queries)
//! ├── JobStore              (local SQLite job records)
//! └── WorkScheduler         (platform scheduler seam, mock in dev)
//! ```
//!
//! ## Modules
//!
//! - `controller`: Wake/sleep state machine and signal handling
//! - `reconciler`: Locked reconciliation passes and request re-submission
//! - `sentinel`: Mismatch detection between jobs and live work requests
//! - `scheduler`: Work scheduler trait and mock implementation
//! - `store`: SQLite-backed job records

pub mod config;
pub mod controller;
pub mod reconciler;
pub mod scheduler;
pub mod sentinel;
pub mod store;

// Re-export commonly used types
pub use controller::{ControllerHandle, ControllerState, Signal, WorkController};
pub use reconciler::{ReconcileLock, ReconcileStats, Reconciler};
pub use scheduler::{ExistingWorkPolicy, MockScheduler, WorkQuery, WorkScheduler};
pub use sentinel::{Mismatch, Sentinel};
pub use store::{JobRecord, JobStore};

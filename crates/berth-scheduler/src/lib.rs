//! berth-scheduler — the scheduling contract and the job reconciler.
//!
//! - [`Scheduler`] is the capability every cluster backend implements:
//!   submit a manifest, remove an app, scale, restart, list tasks, and run
//!   one-off processes.
//! - [`JobScheduler`] is the narrower unit-level contract the job
//!   [`Manager`] drives.
//! - [`CallContext`] carries cancellation and the tracing span through
//!   every remote call.
//! - [`FakeScheduler`] implements both contracts in memory.
//!
//! # Architecture
//!
//! ```text
//! Manager (per-release job reconciliation)
//!   ├── StateStore (persisted Job records)
//!   └── JobScheduler (schedule / unschedule / job_states)
//!
//! Scheduler (per-app desired state)
//!   └── backend: berth-ecs converger or stack backend, or FakeScheduler
//! ```

pub mod context;
pub mod error;
pub mod fake;
pub mod manager;
pub mod scheduler;

pub use context::CallContext;
pub use error::{ApiError, ApiErrorKind, ApiResult, SchedulerError, SchedulerResult};
pub use fake::FakeScheduler;
pub use manager::{JobState, Manager};
pub use scheduler::{
    JobScheduler, RunIo, RunReport, Scheduler, Status, StatusStream, UnitState, publish,
};

//! berth-ecs — container-cluster backend for the Berth scheduler.
//!
//! Implements [`Scheduler`](berth_scheduler::Scheduler) against a cluster
//! API modelled on a task/service container orchestrator:
//!
//! - [`Converger`] drives services and task definitions directly
//! - [`StackBackend`] renders one declarative stack per app and lets the
//!   cluster's orchestration engine realize it
//! - [`TaskAggregator`] joins tasks, task definitions and hosts into
//!   [`Task`](berth_core::Task) views
//! - [`AttachedRunner`] starts one-off tasks and bridges the caller's
//!   stdio to the container
//! - [`EcsJobScheduler`] runs the job manager's jobs as standalone tasks
//!
//! # Architecture
//!
//! ```text
//! EcsScheduler / StackScheduler
//!   ├── Converger | StackBackend ── ClusterApi | StackApi
//!   ├── TaskAggregator ──────────── ClusterApi
//!   └── AttachedRunner ──────────── ClusterApi, InstanceApi, RuntimeConnector
//! ```
//!
//! Remote APIs sit behind the traits in [`api`]; [`MemoryCluster`]
//! implements all of them in process.

pub mod aggregator;
pub mod api;
pub mod attach;
pub mod converger;
pub mod jobs;
pub mod memory;
pub mod scheduler;
pub mod settings;
pub mod stack;
pub mod types;

pub use aggregator::TaskAggregator;
pub use api::{ClusterApi, InstanceApi, RuntimeClient, RuntimeConnector, StackApi};
pub use attach::{AttachedRunner, RunPhase, RunSpec};
pub use converger::{Converger, TaskDefinitionBuilder};
pub use jobs::EcsJobScheduler;
pub use memory::MemoryCluster;
pub use scheduler::{ClusterHandles, EcsScheduler, StackScheduler};
pub use settings::EcsSettings;
pub use stack::StackBackend;

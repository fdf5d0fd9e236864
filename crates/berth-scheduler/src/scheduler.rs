//! The scheduling contract.

use std::fmt;

use async_trait::async_trait;
use berth_core::{Manifest, Process, Task};
use berth_state::Job;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::context::CallContext;
use crate::error::{SchedulerError, SchedulerResult};

/// Progress message emitted while a submission converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub message: String,
}

impl Status {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Sink for submission progress.
pub trait StatusStream: Send + Sync {
    fn publish(&self, status: Status) -> Result<(), String>;
}

impl<F> StatusStream for F
where
    F: Fn(Status) -> Result<(), String> + Send + Sync,
{
    fn publish(&self, status: Status) -> Result<(), String> {
        self(status)
    }
}

/// Publish to an optional stream. Failures are logged and never fail the
/// operation being reported on.
pub fn publish(stream: Option<&dyn StatusStream>, message: impl Into<String>) {
    let Some(stream) = stream else {
        return;
    };
    let message = message.into();
    if let Err(error) = stream.publish(Status::new(message.clone())) {
        warn!(%message, %error, "failed to publish status");
    }
}

/// Caller I/O for an attached run.
pub struct RunIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl RunIo {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }
}

impl fmt::Debug for RunIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunIo").finish_non_exhaustive()
    }
}

/// Outcome of a one-off run.
#[derive(Debug)]
pub struct RunReport {
    /// Cluster id of the task that was started.
    pub task_id: String,
    pub attached: bool,
    /// Set when the session succeeded but stopping the task afterwards did
    /// not.
    pub cleanup_warning: Option<SchedulerError>,
}

/// Capability implemented by every cluster backend.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Converge the cluster onto `manifest`.
    async fn submit(
        &self,
        manifest: &Manifest,
        status: Option<&dyn StatusStream>,
        ctx: &CallContext,
    ) -> SchedulerResult<()>;

    /// Remove every resource owned by the app.
    async fn remove(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()>;

    /// Set the instance count of one process type.
    async fn scale(
        &self,
        app_id: &str,
        process_type: &str,
        quantity: u32,
        ctx: &CallContext,
    ) -> SchedulerResult<()>;

    /// Replace every running instance of the app.
    async fn restart(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()>;

    /// Observed tasks of the app, across all process types.
    async fn tasks(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<Vec<Task>>;

    async fn stop_task(&self, task_id: &str, ctx: &CallContext) -> SchedulerResult<()>;

    /// Start a one-off instance of `process`, using its command and
    /// environment as overrides. With `io`, the caller is attached to the
    /// instance until it exits and the instance is stopped afterwards.
    async fn run(
        &self,
        manifest: &Manifest,
        process: &Process,
        io: Option<RunIo>,
        ctx: &CallContext,
    ) -> SchedulerResult<RunReport>;
}

/// State of one unit as reported by a [`JobScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub name: String,
    pub machine_id: String,
    pub state: String,
}

/// Unit-level scheduling contract driven by the job [`Manager`](crate::Manager).
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: &Job, ctx: &CallContext) -> SchedulerResult<()>;

    async fn unschedule(&self, name: &str, ctx: &CallContext) -> SchedulerResult<()>;

    async fn job_states(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<Vec<UnitState>>;
}

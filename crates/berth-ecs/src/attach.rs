//! AttachedRunner — one-off tasks with the caller attached.
//!
//! An attached run moves through these phases:
//!
//! ```text
//! Submitted ──▶ Pending ──▶ Running ──▶ Attached ──▶ Stopped
//!     │            │           │            │
//!     └────────────┴───────────┴────────────┴──────▶ Failed
//! ```
//!
//! Once the task has been submitted it is stopped exactly once, whichever
//! way the run ends: normal exit, any failure after submission, or the
//! caller cancelling or dropping the run. The stop is owned by a
//! [`StopGuard`]; if the run future is dropped before the guard is released,
//! the guard's `Drop` issues the stop on the ambient runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use berth_core::resource_id;
use berth_scheduler::{
    ApiError, ApiErrorKind, CallContext, RunIo, RunReport, SchedulerError, SchedulerResult,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::aggregator::reject_failures;
use crate::api::{ClusterApi, InstanceApi, RuntimeConnector};
use crate::types::*;

/// Runtime label that names the task a container belongs to.
pub const TASK_ARN_LABEL: &str = "com.amazonaws.ecs.task-arn";

/// Environment that asks the cluster agent for a TTY and an open stdin.
pub const ATTACHED_ENV: [(&str, &str); 2] = [
    ("ECS_DOCKER_CONFIG_TTY", "true"),
    ("ECS_DOCKER_CONFIG_OPEN_STDIN", "true"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Submitted,
    Pending,
    Running,
    Attached,
    Stopped,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Submitted => "submitted",
            RunPhase::Pending => "pending",
            RunPhase::Running => "running",
            RunPhase::Attached => "attached",
            RunPhase::Stopped => "stopped",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Tag recorded on the task; the app id.
    pub started_by: String,
    pub task_definition: String,
    /// Container to override; the process type.
    pub container: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

pub struct AttachedRunner {
    api: Arc<dyn ClusterApi>,
    instances: Arc<dyn InstanceApi>,
    runtime: Arc<dyn RuntimeConnector>,
    cluster: String,
    pending_timeout: Duration,
}

impl AttachedRunner {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        instances: Arc<dyn InstanceApi>,
        runtime: Arc<dyn RuntimeConnector>,
        cluster: impl Into<String>,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            api,
            instances,
            runtime,
            cluster: cluster.into(),
            pending_timeout,
        }
    }

    /// Start the task and return without waiting for it.
    pub async fn run_detached(&self, spec: RunSpec, ctx: &CallContext) -> SchedulerResult<ClusterTask> {
        let task = self.submit(spec, ctx).await?;
        info!(task = %task.arn, "detached task started");
        Ok(task)
    }

    /// Start the task, attach `io` to its container, and stop the task when
    /// the session ends.
    ///
    /// A failed stop after a successful session is reported through
    /// [`RunReport::cleanup_warning`]; after a failed session the session
    /// error wins and the stop failure is logged.
    pub async fn run_attached(
        &self,
        mut spec: RunSpec,
        io: RunIo,
        ctx: &CallContext,
    ) -> SchedulerResult<RunReport> {
        spec.environment.extend(
            ATTACHED_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let task = self.submit(spec, ctx).await?;
        let guard = StopGuard::new(self.api.clone(), &self.cluster, &task.arn);
        debug!(task = %task.arn, phase = %RunPhase::Submitted, "attached run");

        let session = self.session(&task, io, ctx).await;
        let cleanup = guard.release().await;

        match (session, cleanup) {
            (Ok(()), Ok(())) => {
                debug!(task = %task.arn, phase = %RunPhase::Stopped, "attached run");
                Ok(RunReport {
                    task_id: resource_id(&task.arn).to_string(),
                    attached: true,
                    cleanup_warning: None,
                })
            }
            (Ok(()), Err(cleanup)) => {
                warn!(task = %task.arn, error = %cleanup, "session ended but task was not stopped");
                Ok(RunReport {
                    task_id: resource_id(&task.arn).to_string(),
                    attached: true,
                    cleanup_warning: Some(cleanup),
                })
            }
            (Err(e), cleanup) => {
                if let Err(cleanup) = cleanup {
                    warn!(task = %task.arn, error = %cleanup, "failed to stop task after failed run");
                }
                debug!(task = %task.arn, phase = %RunPhase::Failed, error = %e, "attached run");
                Err(e)
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn submit(&self, spec: RunSpec, ctx: &CallContext) -> SchedulerResult<ClusterTask> {
        let req = RunTaskRequest {
            cluster: self.cluster.clone(),
            task_definition: spec.task_definition.clone(),
            started_by: spec.started_by,
            count: 1,
            overrides: vec![ContainerOverride {
                name: spec.container,
                command: spec.command,
                environment: spec.environment,
            }],
        };
        let output = ctx
            .call("RunTask", &spec.task_definition, self.api.run_task(req))
            .await?;

        // Stop anything that did start before reporting the failure.
        if let Err(e) = reject_failures("RunTask", &output.failures) {
            for task in &output.tasks {
                StopGuard::new(self.api.clone(), &self.cluster, &task.arn)
                    .release()
                    .await
                    .unwrap_or_else(|stop| warn!(task = %task.arn, error = %stop, "stop failed"));
            }
            return Err(e);
        }
        output
            .tasks
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::not_found("started task", spec.task_definition))
    }

    async fn session(&self, task: &ClusterTask, mut io: RunIo, ctx: &CallContext) -> SchedulerResult<()> {
        let ci_arn = task
            .container_instance_arn
            .clone()
            .ok_or_else(|| SchedulerError::not_found("container instance for task", &task.arn))?;

        let described = ctx
            .call(
                "DescribeContainerInstances",
                &ci_arn,
                self.api
                    .describe_container_instances(&self.cluster, std::slice::from_ref(&ci_arn)),
            )
            .await?;
        reject_failures("DescribeContainerInstances", &described.failures)?;
        let instance = described
            .container_instances
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::not_found("container instance", &ci_arn))?;

        let host = ctx
            .call(
                "DescribeInstances",
                &instance.instance_id,
                self.instances.describe_instance(&instance.instance_id),
            )
            .await?;

        debug!(task = %task.arn, phase = %RunPhase::Pending, "attached run");
        let arns = [task.arn.clone()];
        let wait = ctx.call(
            "WaitUntilTasksNotPending",
            &task.arn,
            self.api.wait_tasks_not_pending(&self.cluster, &arns),
        );
        match tokio::time::timeout(self.pending_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SchedulerError::Timeout {
                    operation: "WaitUntilTasksNotPending",
                    after: self.pending_timeout,
                });
            }
        }
        debug!(task = %task.arn, phase = %RunPhase::Running, "attached run");

        let mut client = ctx
            .call(
                "ConnectRuntime",
                &host.instance_id,
                self.runtime.connect(&host),
            )
            .await?;
        let filter = ContainerFilter {
            label: (TASK_ARN_LABEL.to_string(), task.arn.clone()),
            all: true,
        };
        let containers = ctx
            .call("ListContainers", &task.arn, client.list_containers(&filter))
            .await?;
        let container = match containers.as_slice() {
            [one] => one.id.clone(),
            other => {
                return Err(SchedulerError::AmbiguousContainer {
                    task: task.arn.clone(),
                    found: other.len(),
                });
            }
        };

        let banner = format!("Attaching to {}...\r\n", resource_id(&task.arn));
        if let Err(e) = io.stderr.write_all(banner.as_bytes()).await {
            debug!(error = %e, "failed to write attach banner");
        }

        debug!(task = %task.arn, %container, phase = %RunPhase::Attached, "attached run");
        ctx.call(
            "AttachToContainer",
            &container,
            client.attach(&container, AttachOptions::interactive(), io),
        )
        .await
    }
}

/// Owns the obligation to stop one task.
pub(crate) struct StopGuard {
    api: Arc<dyn ClusterApi>,
    cluster: String,
    task: String,
    armed: bool,
}

impl StopGuard {
    pub(crate) fn new(api: Arc<dyn ClusterApi>, cluster: &str, task: &str) -> Self {
        Self {
            api,
            cluster: cluster.to_string(),
            task: task.to_string(),
            armed: true,
        }
    }

    /// Stop the task now. Not subject to the caller's cancellation: the
    /// stop runs as its own task, so dropping this future mid-call neither
    /// aborts it nor issues a second one.
    pub(crate) async fn release(mut self) -> SchedulerResult<()> {
        self.armed = false;
        let (api, cluster, task) = (self.api.clone(), self.cluster.clone(), self.task.clone());
        let stop = tokio::spawn(async move { api.stop_task(&cluster, &task).await });
        let result = match stop.await {
            Ok(result) => result,
            Err(e) => Err(ApiError::new(ApiErrorKind::Other, format!("stop task: {e}"))),
        };
        match result {
            Ok(()) => {
                debug!(task = %self.task, "task stopped");
                Ok(())
            }
            Err(source) => Err(SchedulerError::Cleanup {
                task: self.task.clone(),
                source: Box::new(SchedulerError::backend("StopTask", &self.task, source)),
            }),
        }
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let (api, cluster, task) = (self.api.clone(), self.cluster.clone(), self.task.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%task, "run abandoned; stopping task in background");
                handle.spawn(async move {
                    if let Err(e) = api.stop_task(&cluster, &task).await {
                        warn!(%task, error = %e, "failed to stop abandoned task");
                    }
                });
            }
            Err(_) => warn!(%task, "run abandoned outside a runtime; task left running"),
        }
    }
}

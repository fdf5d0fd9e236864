//! EcsJobScheduler — runs the job manager's jobs as standalone cluster tasks.
//!
//! Each job becomes one task started with the app id as its tag and the job
//! name in [`JOB_ENV`] on its container override, which is how the task is
//! found again. Scheduling is idempotent: a job whose task is still live is
//! left alone.
//!
//! The task definition comes from the process's family when its latest
//! revision already runs the job's image and release; otherwise a revision
//! is registered from the job.

use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{App, Manifest, Process};
use berth_scheduler::manager::RELEASE_ENV;
use berth_scheduler::{
    ApiError, ApiErrorKind, CallContext, JobScheduler, SchedulerError, SchedulerResult, UnitState,
};
use berth_state::Job;
use tracing::{debug, info};

use crate::aggregator::TaskAggregator;
use crate::api::ClusterApi;
use crate::attach::{AttachedRunner, RunSpec};
use crate::converger::TaskDefinitionBuilder;
use crate::scheduler::ClusterHandles;
use crate::settings::EcsSettings;
use crate::types::*;

/// Container environment naming the job a task runs.
pub const JOB_ENV: &str = "BERTH_JOB";

/// The job a cluster task was started for, if any.
pub fn job_name(task: &ClusterTask) -> Option<&str> {
    task.overrides
        .iter()
        .find_map(|o| o.environment.get(JOB_ENV))
        .map(String::as_str)
}

pub struct EcsJobScheduler {
    api: Arc<dyn ClusterApi>,
    cluster: String,
    builder: TaskDefinitionBuilder,
    aggregator: TaskAggregator,
    runner: AttachedRunner,
}

impl EcsJobScheduler {
    pub fn new(handles: ClusterHandles, settings: &EcsSettings) -> Self {
        Self {
            builder: TaskDefinitionBuilder::new(settings.names.clone(), settings.log_driver.clone()),
            aggregator: TaskAggregator::new(handles.cluster.clone(), &settings.cluster),
            runner: AttachedRunner::new(
                handles.cluster.clone(),
                handles.instances,
                handles.runtime,
                &settings.cluster,
                settings.pending_timeout,
            ),
            api: handles.cluster,
            cluster: settings.cluster.clone(),
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Live task ARNs running the named job.
    async fn job_task_arns(
        &self,
        app_id: &str,
        name: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<String>> {
        Ok(self
            .aggregator
            .job_cluster_tasks(app_id, ctx)
            .await?
            .into_iter()
            .filter(|task| job_name(task) == Some(name))
            .map(|task| task.arn)
            .collect())
    }

    async fn task_definition(&self, job: &Job, ctx: &CallContext) -> SchedulerResult<String> {
        let family = self.builder.family(&job.app_id, &job.process_type);
        let latest = ctx
            .call(
                "DescribeTaskDefinition",
                &family,
                self.api.describe_task_definition(&family),
            )
            .await;
        match latest {
            Ok(definition) if runs_job(&definition, job) => return Ok(definition.arn),
            Ok(_) => {}
            Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => {}
            Err(e) => return Err(e),
        }

        let manifest = Manifest {
            app: App {
                id: job.app_id.clone(),
                name: job.app_id.clone(),
                image: job.image.clone(),
                env: job.environment.clone(),
                ..App::default()
            },
            release: job.version.clone(),
            processes: Vec::new(),
        };
        let process = Process::new(job.process_type.clone(), job.command.clone());
        let definition = ctx
            .call(
                "RegisterTaskDefinition",
                &family,
                self.api
                    .register_task_definition(self.builder.build(&manifest, &process)),
            )
            .await?;
        debug!(%family, revision = definition.revision, "task definition registered for job");
        Ok(definition.arn)
    }
}

#[async_trait]
impl JobScheduler for EcsJobScheduler {
    async fn schedule(&self, job: &Job, ctx: &CallContext) -> SchedulerResult<()> {
        let name = job.name();
        let running = self.job_task_arns(&job.app_id, &name, ctx).await?;
        if !running.is_empty() {
            debug!(job = %name, tasks = running.len(), "job already running");
            return Ok(());
        }

        let task_definition = self.task_definition(job, ctx).await?;
        let mut environment = job.environment.clone();
        environment.insert(JOB_ENV.to_string(), name.clone());
        let task = self
            .runner
            .run_detached(
                RunSpec {
                    started_by: job.app_id.clone(),
                    task_definition,
                    container: job.process_type.clone(),
                    command: job.command.clone(),
                    environment,
                },
                ctx,
            )
            .await?;
        info!(job = %name, task = %task.arn, "job started");
        Ok(())
    }

    async fn unschedule(&self, name: &str, ctx: &CallContext) -> SchedulerResult<()> {
        let app_id = job_app_id(name)?;
        for arn in self.job_task_arns(app_id, name, ctx).await? {
            let stopped = ctx
                .call("StopTask", &arn, self.api.stop_task(&self.cluster, &arn))
                .await;
            match stopped {
                Ok(()) => info!(job = %name, task = %arn, "job stopped"),
                Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => {
                    debug!(job = %name, task = %arn, "job task already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn job_states(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<Vec<UnitState>> {
        Ok(self
            .aggregator
            .job_tasks(app_id, ctx)
            .await?
            .into_iter()
            .map(|(name, task)| UnitState {
                name,
                machine_id: task.host.id,
                state: task.state.to_string(),
            })
            .collect())
    }
}

/// Job names start with the app id; app ids never contain a `.`.
fn job_app_id(name: &str) -> SchedulerResult<&str> {
    match name.split_once('.') {
        Some((app_id, _)) if !app_id.is_empty() => Ok(app_id),
        _ => Err(SchedulerError::backend(
            "StopTask",
            name,
            ApiError::validation(format!("{name} is not a job name")),
        )),
    }
}

fn runs_job(definition: &TaskDefinition, job: &Job) -> bool {
    definition.containers.first().is_some_and(|container| {
        container.name == job.process_type
            && container.image == job.image
            && container.environment.get(RELEASE_ENV) == Some(&job.version)
    })
}

//! Scheduler implementations over the cluster API.
//!
//! [`EcsScheduler`] converges services directly through the [`Converger`];
//! [`StackScheduler`] hands the whole app to a [`StackBackend`] and reads
//! service and task definition ids back from the stack's outputs. Both share
//! the task views, restarts and one-off runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{Manifest, Process, Task, resource_id};
use berth_scheduler::manager::RELEASE_ENV;
use berth_scheduler::{
    ApiErrorKind, CallContext, RunIo, RunReport, Scheduler, SchedulerError, SchedulerResult,
    StatusStream,
};
use berth_state::StateStore;
use tracing::info;

use crate::aggregator::TaskAggregator;
use crate::api::{ClusterApi, InstanceApi, RuntimeConnector, StackApi};
use crate::attach::{AttachedRunner, RunSpec};
use crate::converger::Converger;
use crate::settings::EcsSettings;
use crate::stack::{SERVICES_OUTPUT, StackBackend, TASK_DEFINITIONS_OUTPUT};
use crate::types::*;

/// Remote handles a scheduler is built from.
#[derive(Clone)]
pub struct ClusterHandles {
    pub cluster: Arc<dyn ClusterApi>,
    pub instances: Arc<dyn InstanceApi>,
    pub runtime: Arc<dyn RuntimeConnector>,
}

/// Parts common to both schedulers.
struct Runtime {
    api: Arc<dyn ClusterApi>,
    cluster: String,
    aggregator: TaskAggregator,
    runner: AttachedRunner,
}

impl Runtime {
    fn new(handles: ClusterHandles, settings: &EcsSettings) -> Self {
        Self {
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

    /// Stop every task of the given services.
    async fn restart(
        &self,
        app_id: &str,
        services: &BTreeMap<String, String>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let mut stopped = 0usize;
        for service in services.values() {
            let arns = self
                .aggregator
                .task_arns(TaskSelector::Service(service.clone()), ctx)
                .await?;
            for arn in &arns {
                self.stop(arn, ctx).await?;
            }
            stopped += arns.len();
        }
        info!(%app_id, count = stopped, "app restarted");
        Ok(())
    }

    async fn stop(&self, task: &str, ctx: &CallContext) -> SchedulerResult<()> {
        match ctx
            .call("StopTask", task, self.api.stop_task(&self.cluster, task))
            .await
        {
            Err(e) if e.api_kind() == Some(ApiErrorKind::NotFound) => {
                Err(SchedulerError::not_found("task", task))
            }
            other => other,
        }
    }

    async fn run(
        &self,
        manifest: &Manifest,
        process: &Process,
        task_definition: String,
        io: Option<RunIo>,
        ctx: &CallContext,
    ) -> SchedulerResult<RunReport> {
        let mut environment = manifest.process_env(process);
        environment.insert(RELEASE_ENV.to_string(), manifest.release.clone());
        let spec = RunSpec {
            started_by: manifest.app.id.clone(),
            task_definition,
            container: process.process_type.clone(),
            command: process.command.clone(),
            environment,
        };
        match io {
            Some(io) => self.runner.run_attached(spec, io, ctx).await,
            None => {
                let task = self.runner.run_detached(spec, ctx).await?;
                Ok(RunReport {
                    task_id: resource_id(&task.arn).to_string(),
                    attached: false,
                    cleanup_warning: None,
                })
            }
        }
    }
}

// ── Direct services ────────────────────────────────────────────────

pub struct EcsScheduler {
    converger: Converger,
    runtime: Runtime,
}

impl EcsScheduler {
    pub fn new(handles: ClusterHandles, settings: &EcsSettings) -> Self {
        Self {
            converger: Converger::new(handles.cluster.clone(), settings),
            runtime: Runtime::new(handles, settings),
        }
    }

    pub fn converger(&self) -> &Converger {
        &self.converger
    }
}

#[async_trait]
impl Scheduler for EcsScheduler {
    async fn submit(
        &self,
        manifest: &Manifest,
        status: Option<&dyn StatusStream>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        self.converger.converge(manifest, status, ctx).await
    }

    async fn remove(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        self.converger.teardown(app_id, ctx).await
    }

    async fn scale(
        &self,
        app_id: &str,
        process_type: &str,
        quantity: u32,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        self.converger.scale(app_id, process_type, quantity, ctx).await
    }

    async fn restart(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        let services = self.converger.services(app_id, ctx).await?;
        self.runtime.restart(app_id, &services, ctx).await
    }

    async fn tasks(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<Vec<Task>> {
        let services = self.converger.services(app_id, ctx).await?;
        self.runtime.aggregator.tasks(app_id, &services, ctx).await
    }

    async fn stop_task(&self, task_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        self.runtime.stop(task_id, ctx).await
    }

    async fn run(
        &self,
        manifest: &Manifest,
        process: &Process,
        io: Option<RunIo>,
        ctx: &CallContext,
    ) -> SchedulerResult<RunReport> {
        let definition = self
            .converger
            .task_definition(&manifest.app.id, &process.process_type, ctx)
            .await?;
        self.runtime
            .run(manifest, process, definition.arn, io, ctx)
            .await
    }
}

// ── Stacks ─────────────────────────────────────────────────────────

pub struct StackScheduler {
    stacks: StackBackend,
    runtime: Runtime,
}

impl StackScheduler {
    pub fn new(
        handles: ClusterHandles,
        stacks: Arc<dyn StackApi>,
        store: StateStore,
        settings: &EcsSettings,
    ) -> Self {
        Self {
            stacks: StackBackend::new(stacks, store, settings),
            runtime: Runtime::new(handles, settings),
        }
    }

    pub fn backend(&self) -> &StackBackend {
        &self.stacks
    }

    /// Services of the app; empty while the stack is still being created.
    async fn services(
        &self,
        app_id: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<BTreeMap<String, String>> {
        match self.stacks.output(app_id, SERVICES_OUTPUT, ctx).await {
            Err(SchedulerError::StackNotReady { .. }) => Ok(BTreeMap::new()),
            other => other,
        }
    }
}

#[async_trait]
impl Scheduler for StackScheduler {
    async fn submit(
        &self,
        manifest: &Manifest,
        status: Option<&dyn StatusStream>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        self.stacks.submit(manifest, status, ctx).await
    }

    async fn remove(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        self.stacks.remove(app_id, ctx).await
    }

    async fn scale(
        &self,
        app_id: &str,
        process_type: &str,
        quantity: u32,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let services = self.services(app_id, ctx).await?;
        let service = services
            .get(process_type)
            .ok_or_else(|| SchedulerError::not_found("process", process_type))?;
        let update = ServiceUpdate {
            cluster: self.runtime.cluster.clone(),
            service: service.clone(),
            desired_count: Some(quantity),
            task_definition: None,
        };
        match ctx
            .call("UpdateService", service, self.runtime.api.update_service(update))
            .await
        {
            Ok(_) => {
                info!(%service, quantity, "service scaled");
                Ok(())
            }
            Err(e) if e.is_service_gone() => Err(SchedulerError::not_found("process", process_type)),
            Err(e) => Err(e),
        }
    }

    async fn restart(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        let services = self.services(app_id, ctx).await?;
        self.runtime.restart(app_id, &services, ctx).await
    }

    async fn tasks(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<Vec<Task>> {
        let services = self.services(app_id, ctx).await?;
        self.runtime.aggregator.tasks(app_id, &services, ctx).await
    }

    async fn stop_task(&self, task_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        self.runtime.stop(task_id, ctx).await
    }

    async fn run(
        &self,
        manifest: &Manifest,
        process: &Process,
        io: Option<RunIo>,
        ctx: &CallContext,
    ) -> SchedulerResult<RunReport> {
        let definitions = self
            .stacks
            .output(&manifest.app.id, TASK_DEFINITIONS_OUTPUT, ctx)
            .await?;
        let definition = definitions
            .get(&process.process_type)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("process", &process.process_type))?;
        self.runtime.run(manifest, process, definition, io, ctx).await
    }
}

//! TaskAggregator — builds [`Task`] views from raw cluster data.
//!
//! One call to [`TaskAggregator::tasks`]:
//!
//! 1. lists task ARNs for every service the app owns plus every task the app
//!    started directly (one-off runs), following pagination;
//! 2. describes the tasks in chunks of [`MAX_DESCRIBE_TASKS`];
//! 3. fetches each distinct task definition once;
//! 4. resolves container instances to host ids, grouped per cluster and in
//!    chunks of [`MAX_DESCRIBE_CONTAINER_INSTANCES`].
//!
//! A failure entry in any describe response fails the whole call, as does a
//! container instance the describe silently leaves out; partial task lists
//! are never returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use berth_core::batch::{
    MAX_DESCRIBE_CONTAINER_INSTANCES, MAX_DESCRIBE_TASKS, chunked, drain, pages,
};
use berth_core::{Constraints, Host, MB, Task, TaskState, resource_id};
use berth_scheduler::manager::RELEASE_ENV;
use berth_scheduler::{CallContext, SchedulerError, SchedulerResult};
use futures_util::future::try_join_all;
use tracing::debug;

use crate::api::ClusterApi;
use crate::jobs::job_name;
use crate::types::*;

/// Host id reported for tasks that run without a container instance.
pub const UNMANAGED_HOST: &str = "FARGATE";

/// Version reported when a task definition carries no release tag.
pub const DEFAULT_VERSION: &str = "v0";

pub struct TaskAggregator {
    api: Arc<dyn ClusterApi>,
    cluster: String,
}

impl TaskAggregator {
    pub fn new(api: Arc<dyn ClusterApi>, cluster: impl Into<String>) -> Self {
        Self {
            api,
            cluster: cluster.into(),
        }
    }

    /// Every task of the app: tasks of the given services (process type to
    /// service name) and tasks started directly by the app.
    pub async fn tasks(
        &self,
        app_id: &str,
        services: &BTreeMap<String, String>,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<Task>> {
        let mut arns = Vec::new();
        for service in services.values() {
            arns.extend(
                self.task_arns(TaskSelector::Service(service.clone()), ctx)
                    .await?,
            );
        }
        arns.extend(
            self.task_arns(TaskSelector::StartedBy(app_id.to_string()), ctx)
                .await?,
        );
        let mut seen = BTreeSet::new();
        arns.retain(|arn| seen.insert(arn.clone()));

        if arns.is_empty() {
            return Ok(Vec::new());
        }

        let described = self.describe_tasks(&arns, ctx).await?;
        self.views(&described, ctx)
            .await
            .map(|views| views.into_iter().map(|(_, task)| task).collect())
    }

    /// Tasks the app started for scheduled jobs, as the cluster reports them.
    pub async fn job_cluster_tasks(
        &self,
        app_id: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<ClusterTask>> {
        let arns = self
            .task_arns(TaskSelector::StartedBy(app_id.to_string()), ctx)
            .await?;
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let mut described = self.describe_tasks(&arns, ctx).await?;
        described.retain(|task| job_name(task).is_some());
        Ok(described)
    }

    /// Task views of the app's job tasks, paired with the job each runs.
    pub async fn job_tasks(
        &self,
        app_id: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<(String, Task)>> {
        let described = self.job_cluster_tasks(app_id, ctx).await?;
        let views = self.views(&described, ctx).await?;
        Ok(views
            .into_iter()
            .filter_map(|(raw, task)| job_name(raw).map(|job| (job.to_string(), task)))
            .collect())
    }

    /// Task ARNs for one selector, across all pages.
    pub async fn task_arns(
        &self,
        selector: TaskSelector,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<String>> {
        let (api, cluster) = (&self.api, self.cluster.as_str());
        drain(pages(move |next_token| {
            let req = ListTasksRequest {
                cluster: cluster.to_string(),
                selector: selector.clone(),
                next_token,
            };
            ctx.call("ListTasks", cluster, api.list_tasks(req))
        }))
        .await
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn views<'a>(
        &self,
        described: &'a [ClusterTask],
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<(&'a ClusterTask, Task)>> {
        let definitions = self.task_definitions(described, ctx).await?;
        let hosts = self.hosts(described, ctx).await?;

        let mut tasks = Vec::with_capacity(described.len());
        for task in described {
            let Some(definition) = definitions.get(&task.task_definition_arn) else {
                continue;
            };
            let Some(container) = definition.containers.first() else {
                debug!(task = %task.arn, "task definition has no containers");
                continue;
            };

            let id = resource_id(&task.arn).to_string();
            let version = container
                .environment
                .get(RELEASE_ENV)
                .cloned()
                .unwrap_or_else(|| DEFAULT_VERSION.to_string());
            let process_type = container.name.clone();
            let command = task
                .overrides
                .iter()
                .find(|o| o.name == container.name && !o.command.is_empty())
                .map(|o| o.command.clone())
                .unwrap_or_else(|| container.command.clone());
            let host = match &task.container_instance_arn {
                Some(ci) => hosts.get(ci).cloned().ok_or_else(|| {
                    SchedulerError::PartialBatchFailure {
                        operation: "DescribeContainerInstances",
                        item: ci.clone(),
                        reason: "MISSING".to_string(),
                    }
                })?,
                None => UNMANAGED_HOST.to_string(),
            };
            let state = TaskState::from_cluster_status(&task.last_status);
            let updated_at = match state {
                TaskState::Pending => task.created_at,
                TaskState::Running => task.started_at,
                TaskState::Stopped => task.stopped_at,
                TaskState::Other(_) => None,
            };

            tasks.push((
                task,
                Task {
                    name: format!("{version}.{process_type}.{id}"),
                    id,
                    version,
                    process_type,
                    command,
                    constraints: container_constraints(container),
                    state,
                    updated_at,
                    host: Host { id: host },
                },
            ));
        }
        Ok(tasks)
    }

    async fn describe_tasks(
        &self,
        arns: &[String],
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<ClusterTask>> {
        let calls = chunked(arns, MAX_DESCRIBE_TASKS).map(|chunk| async move {
            let output = ctx
                .call(
                    "DescribeTasks",
                    &self.cluster,
                    self.api.describe_tasks(&self.cluster, chunk),
                )
                .await?;
            reject_failures("DescribeTasks", &output.failures)?;
            Ok::<_, SchedulerError>(output.tasks)
        });
        let chunks = try_join_all(calls).await?;
        Ok(chunks.into_iter().flatten().collect())
    }

    async fn task_definitions(
        &self,
        tasks: &[ClusterTask],
        ctx: &CallContext,
    ) -> SchedulerResult<HashMap<String, TaskDefinition>> {
        let mut definitions = HashMap::new();
        for task in tasks {
            if definitions.contains_key(&task.task_definition_arn) {
                continue;
            }
            let definition = ctx
                .call(
                    "DescribeTaskDefinition",
                    &task.task_definition_arn,
                    self.api.describe_task_definition(&task.task_definition_arn),
                )
                .await?;
            definitions.insert(task.task_definition_arn.clone(), definition);
        }
        Ok(definitions)
    }

    /// Container instance ARN to compute instance id.
    async fn hosts(
        &self,
        tasks: &[ClusterTask],
        ctx: &CallContext,
    ) -> SchedulerResult<HashMap<String, String>> {
        let mut by_cluster: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for task in tasks {
            if let Some(ci) = &task.container_instance_arn {
                by_cluster
                    .entry(task.cluster_arn.as_str())
                    .or_default()
                    .insert(ci.clone());
            }
        }

        let mut hosts = HashMap::new();
        for (cluster, instances) in by_cluster {
            let instances: Vec<String> = instances.into_iter().collect();
            for chunk in chunked(&instances, MAX_DESCRIBE_CONTAINER_INSTANCES) {
                let output = ctx
                    .call(
                        "DescribeContainerInstances",
                        cluster,
                        self.api.describe_container_instances(cluster, chunk),
                    )
                    .await?;
                reject_failures("DescribeContainerInstances", &output.failures)?;
                for ci in output.container_instances {
                    hosts.insert(ci.arn, ci.instance_id);
                }
            }
        }
        Ok(hosts)
    }
}

pub(crate) fn reject_failures(operation: &'static str, failures: &[Failure]) -> SchedulerResult<()> {
    match failures.first() {
        Some(failure) => Err(SchedulerError::PartialBatchFailure {
            operation,
            item: failure.arn.clone(),
            reason: failure.reason.clone(),
        }),
        None => Ok(()),
    }
}

fn container_constraints(container: &ContainerDefinition) -> Constraints {
    let nproc = container
        .ulimits
        .iter()
        .find(|u| u.name == "nproc")
        .map(|u| u32::try_from(u.hard_limit).unwrap_or(u32::MAX))
        .unwrap_or(0);
    Constraints {
        cpu_shares: container.cpu,
        memory_bytes: container.memory_mib * MB,
        nproc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_rejected() {
        let failures = vec![Failure {
            arn: "arn:task/1".into(),
            reason: "MISSING".into(),
        }];
        let err = reject_failures("DescribeTasks", &failures).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::PartialBatchFailure { ref reason, .. } if reason == "MISSING"
        ));
        assert!(reject_failures("DescribeTasks", &[]).is_ok());
    }

    #[test]
    fn constraints_come_from_container() {
        let container = ContainerDefinition {
            name: "web".into(),
            image: "acme".into(),
            command: vec![],
            cpu: 512,
            memory_mib: 1024,
            environment: BTreeMap::new(),
            labels: BTreeMap::new(),
            port_mappings: vec![],
            ulimits: vec![Ulimit {
                name: "nproc".into(),
                soft_limit: 512,
                hard_limit: 512,
            }],
            essential: true,
            log_driver: None,
        };
        assert_eq!(container_constraints(&container), Constraints::TWO_X);
    }
}

//! Remote API seams.
//!
//! Each trait is one remote service. Implementations translate their
//! transport's errors into [`ApiError`] with the closest [`ApiErrorKind`];
//! callers rely on `ServiceNotFound`, `ServiceNotActive` and `StackNotFound`
//! being reported precisely.
//!
//! [`ApiErrorKind`]: berth_scheduler::ApiErrorKind

use async_trait::async_trait;
use berth_core::Page;
use berth_scheduler::RunIo;

pub use berth_scheduler::{ApiError, ApiErrorKind, ApiResult};

use crate::types::*;

/// Services, task definitions and tasks of a container cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// One page of service ARNs in the cluster.
    async fn list_services(&self, req: ListServicesRequest) -> ApiResult<Page<String>>;

    async fn create_service(&self, def: ServiceDefinition) -> ApiResult<Service>;

    async fn update_service(&self, update: ServiceUpdate) -> ApiResult<Service>;

    /// Fails with `Validation` while the service still has a non-zero
    /// desired count.
    async fn delete_service(&self, cluster: &str, service: &str) -> ApiResult<()>;

    /// Block until the services' running counts match their desired counts.
    async fn wait_services_stable(&self, cluster: &str, services: &[String]) -> ApiResult<()>;

    async fn register_task_definition(&self, input: TaskDefinitionInput)
    -> ApiResult<TaskDefinition>;

    /// Accepts an ARN, `family:revision`, or a bare family (latest revision).
    async fn describe_task_definition(&self, task_definition: &str) -> ApiResult<TaskDefinition>;

    async fn run_task(&self, req: RunTaskRequest) -> ApiResult<RunTaskOutput>;

    async fn stop_task(&self, cluster: &str, task: &str) -> ApiResult<()>;

    /// One page of task ARNs.
    async fn list_tasks(&self, req: ListTasksRequest) -> ApiResult<Page<String>>;

    /// At most [`MAX_DESCRIBE_TASKS`](berth_core::batch::MAX_DESCRIBE_TASKS) ids per call.
    async fn describe_tasks(&self, cluster: &str, tasks: &[String])
    -> ApiResult<DescribeTasksOutput>;

    /// At most
    /// [`MAX_DESCRIBE_CONTAINER_INSTANCES`](berth_core::batch::MAX_DESCRIBE_CONTAINER_INSTANCES)
    /// ids per call.
    async fn describe_container_instances(
        &self,
        cluster: &str,
        container_instances: &[String],
    ) -> ApiResult<DescribeContainerInstancesOutput>;

    /// Block until none of the tasks is pending.
    async fn wait_tasks_not_pending(&self, cluster: &str, tasks: &[String]) -> ApiResult<()>;
}

/// Declarative stacks realized by the cluster's orchestration engine.
#[async_trait]
pub trait StackApi: Send + Sync {
    /// `StackNotFound` if no stack has the name.
    async fn describe_stack(&self, name: &str) -> ApiResult<Stack>;

    async fn create_stack(&self, input: StackInput) -> ApiResult<()>;

    async fn update_stack(&self, input: StackInput) -> ApiResult<()>;

    async fn delete_stack(&self, name: &str) -> ApiResult<()>;

    async fn wait_stack(&self, name: &str, until: StackWait) -> ApiResult<()>;
}

/// Compute instances behind container instances.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> ApiResult<HostInstance>;
}

/// Opens a session with the container runtime on one host.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, host: &HostInstance) -> ApiResult<Box<dyn RuntimeClient>>;
}

/// Session with one host's container runtime.
#[async_trait]
pub trait RuntimeClient: Send {
    async fn list_containers(&mut self, filter: &ContainerFilter) -> ApiResult<Vec<ContainerSummary>>;

    /// Attach `io` to the container and pump until its output ends.
    async fn attach(
        self: Box<Self>,
        container_id: &str,
        options: AttachOptions,
        io: RunIo,
    ) -> ApiResult<()>;
}

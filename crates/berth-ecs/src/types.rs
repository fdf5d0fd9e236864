//! Request and response types of the cluster, stack, instance and runtime
//! APIs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Services ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerRef {
    pub name: String,
    pub container_name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub cluster: String,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: u32,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerRef>,
    /// Role the cluster assumes to register tasks with the load balancer.
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceUpdate {
    pub cluster: String,
    pub service: String,
    pub desired_count: Option<u32>,
    pub task_definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub arn: String,
    pub name: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub running_count: u32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListServicesRequest {
    pub cluster: String,
    pub next_token: Option<String>,
}

// ── Task definitions ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Zero asks the cluster for a dynamic host port.
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub name: String,
    pub soft_limit: u64,
    pub hard_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub cpu: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub ulimits: Vec<Ulimit>,
    pub essential: bool,
    #[serde(default)]
    pub log_driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionInput {
    pub family: String,
    pub containers: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub revision: u32,
    pub containers: Vec<ContainerDefinition>,
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Which tasks a listing returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSelector {
    /// Tasks launched by the named service.
    Service(String),
    /// Tasks launched with the given started-by tag.
    StartedBy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTasksRequest {
    pub cluster: String,
    pub selector: TaskSelector,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOverride {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub started_by: String,
    pub count: u32,
    pub overrides: Vec<ContainerOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTask {
    pub arn: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    /// Absent for tasks on infrastructure the cluster does not manage hosts for.
    pub container_instance_arn: Option<String>,
    pub last_status: String,
    /// `service:{name}` for service-launched tasks.
    pub group: Option<String>,
    pub started_by: Option<String>,
    pub created_at: Option<u64>,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    #[serde(default)]
    pub overrides: Vec<ContainerOverride>,
}

/// Per-item failure reported by a batch API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub arn: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunTaskOutput {
    pub tasks: Vec<ClusterTask>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescribeTasksOutput {
    pub tasks: Vec<ClusterTask>,
    pub failures: Vec<Failure>,
}

// ── Hosts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub arn: String,
    /// Id of the compute instance backing this container instance.
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescribeContainerInstancesOutput {
    pub container_instances: Vec<ContainerInstance>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInstance {
    pub instance_id: String,
    pub private_ip: Option<String>,
}

// ── Stacks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateRollbackInProgress,
    UpdateRollbackComplete,
    RollbackInProgress,
    RollbackComplete,
    DeleteInProgress,
    DeleteComplete,
    Other(String),
}

impl StackStatus {
    pub fn is_create_in_progress(&self) -> bool {
        matches!(self, StackStatus::CreateInProgress)
    }

    /// A create or update is running and a new update would be rejected.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            StackStatus::CreateInProgress
                | StackStatus::UpdateInProgress
                | StackStatus::UpdateCompleteCleanupInProgress
                | StackStatus::UpdateRollbackInProgress
                | StackStatus::RollbackInProgress
        )
    }

    /// The state a running operation settles in, if one is running that
    /// can still end with a usable stack.
    pub fn settles_at(&self) -> Option<StackWait> {
        match self {
            StackStatus::CreateInProgress => Some(StackWait::CreateComplete),
            StackStatus::UpdateInProgress | StackStatus::UpdateCompleteCleanupInProgress => {
                Some(StackWait::UpdateComplete)
            }
            StackStatus::UpdateRollbackInProgress => Some(StackWait::UpdateRollbackComplete),
            _ => None,
        }
    }

    /// The initial create failed; the stack can only be deleted.
    pub fn is_failed_create(&self) -> bool {
        matches!(
            self,
            StackStatus::CreateFailed | StackStatus::RollbackInProgress | StackStatus::RollbackComplete
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub status: StackStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInput {
    pub name: String,
    pub template_body: String,
    pub tags: BTreeMap<String, String>,
}

/// Terminal state a stack wait blocks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackWait {
    CreateComplete,
    UpdateComplete,
    UpdateRollbackComplete,
    DeleteComplete,
}

// ── Runtime ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFilter {
    pub label: (String, String),
    /// Include stopped containers.
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    pub logs: bool,
    pub stream: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// The container has a TTY, so output is not multiplexed.
    pub raw_terminal: bool,
}

impl AttachOptions {
    /// Everything on, as used for interactive one-off runs.
    pub fn interactive() -> Self {
        Self {
            logs: true,
            stream: true,
            stdin: true,
            stdout: true,
            stderr: true,
            raw_terminal: true,
        }
    }
}

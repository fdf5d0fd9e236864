//! MemoryCluster — an in-process cluster implementing every API seam.
//!
//! Behaves like the real services where callers depend on it:
//!
//! - listings are paginated (`page_size` items per page)
//! - describe calls reject more ids than the per-call limits allow
//! - services cannot be deleted while their desired count is non-zero
//! - services launch and stop tasks to match their desired count
//! - stacks move through in-progress states until waited on or settled
//!
//! Every call is counted per operation and can be made to fail once via
//! [`MemoryCluster::fail_next`]. All state sits behind one mutex that is never
//! held across an await point.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::Page;
use berth_core::batch::{MAX_DESCRIBE_CONTAINER_INSTANCES, MAX_DESCRIBE_TASKS};
use berth_core::resource_id;
use berth_scheduler::RunIo;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::api::*;
use crate::attach::TASK_ARN_LABEL;
use crate::stack::{SERVICES_OUTPUT, StackTemplate, TASK_DEFINITIONS_OUTPUT, encode_process_map};
use crate::types::*;

const ARN_PREFIX: &str = "arn:aws:ecs:us-east-1:000000000000";
const DEFAULT_PAGE_SIZE: usize = 10;
const HOLD_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct MemoryContainer {
    id: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct MemoryStack {
    stack: Stack,
    template: Option<String>,
    services: BTreeSet<String>,
}

#[derive(Debug)]
struct Inner {
    cluster: String,
    page_size: usize,
    clock: u64,
    next_id: u64,
    services: BTreeMap<String, Service>,
    revisions: BTreeMap<String, u32>,
    task_definitions: BTreeMap<String, TaskDefinition>,
    tasks: BTreeMap<String, ClusterTask>,
    container_instances: BTreeMap<String, ContainerInstance>,
    hosts: BTreeMap<String, HostInstance>,
    containers: BTreeMap<String, Vec<MemoryContainer>>,
    stacks: BTreeMap<String, MemoryStack>,
    calls: BTreeMap<&'static str, usize>,
    batch_sizes: BTreeMap<&'static str, Vec<usize>>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    batch_failures: HashMap<&'static str, Vec<Failure>>,
    stopped: Vec<String>,
    omitted: BTreeSet<String>,
    hold_pending: bool,
    hold_stops: bool,
    block_attach: bool,
    attach_output: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryCluster {
    pub fn new(cluster: impl Into<String>) -> Self {
        let inner = Inner {
            cluster: cluster.into(),
            page_size: DEFAULT_PAGE_SIZE,
            clock: 1_700_000_000,
            next_id: 0,
            services: BTreeMap::new(),
            revisions: BTreeMap::new(),
            task_definitions: BTreeMap::new(),
            tasks: BTreeMap::new(),
            container_instances: BTreeMap::new(),
            hosts: BTreeMap::new(),
            containers: BTreeMap::new(),
            stacks: BTreeMap::new(),
            calls: BTreeMap::new(),
            batch_sizes: BTreeMap::new(),
            failures: HashMap::new(),
            batch_failures: HashMap::new(),
            stopped: Vec::new(),
            omitted: BTreeSet::new(),
            hold_pending: false,
            hold_stops: false,
            block_attach: false,
            attach_output: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Test controls ──────────────────────────────────────────────

    /// Register a host and its container instance. Returns the container
    /// instance ARN.
    pub fn add_host(&self, instance_id: &str, private_ip: &str) -> String {
        let mut inner = self.lock();
        let arn = format!(
            "{ARN_PREFIX}:container-instance/{}/{instance_id}",
            inner.cluster
        );
        inner.container_instances.insert(
            arn.clone(),
            ContainerInstance {
                arn: arn.clone(),
                instance_id: instance_id.to_string(),
            },
        );
        inner.hosts.insert(
            instance_id.to_string(),
            HostInstance {
                instance_id: instance_id.to_string(),
                private_ip: Some(private_ip.to_string()),
            },
        );
        arn
    }

    /// Place an extra container on a host.
    pub fn add_container(&self, instance_id: &str, labels: BTreeMap<String, String>) {
        let mut inner = self.lock();
        let id = inner.fresh_id("c");
        inner
            .containers
            .entry(instance_id.to_string())
            .or_default()
            .push(MemoryContainer { id, labels });
    }

    /// Remove every container on a host.
    pub fn clear_containers(&self, instance_id: &str) {
        self.lock().containers.remove(instance_id);
    }

    /// Leave a container instance out of describe responses without
    /// reporting it as a failure.
    pub fn omit_container_instance(&self, arn: &str) {
        self.lock().omitted.insert(arn.to_string());
    }

    /// Create a service directly, bypassing naming and task definitions.
    pub fn add_foreign_service(&self, name: &str) {
        let mut inner = self.lock();
        let arn = inner.service_arn(name);
        inner.services.insert(
            name.to_string(),
            Service {
                arn,
                name: name.to_string(),
                task_definition: String::new(),
                desired_count: 0,
                running_count: 0,
                status: "ACTIVE".to_string(),
            },
        );
    }

    pub fn set_service_status(&self, name: &str, status: &str) {
        if let Some(service) = self.lock().services.get_mut(name) {
            service.status = status.to_string();
        }
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ApiError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Report `failure` in every response of a batch `operation`.
    pub fn add_batch_failure(&self, operation: &'static str, failure: Failure) {
        self.lock()
            .batch_failures
            .entry(operation)
            .or_default()
            .push(failure);
    }

    /// Keep tasks pending: `wait_tasks_not_pending` blocks until released.
    pub fn hold_pending(&self, hold: bool) {
        self.lock().hold_pending = hold;
    }

    /// Keep `stop_task` calls in flight until released. Calls are counted
    /// as soon as they arrive.
    pub fn hold_stops(&self, hold: bool) {
        self.lock().hold_stops = hold;
    }

    /// Keep attach sessions open until the caller gives up.
    pub fn block_attach(&self, block: bool) {
        self.lock().block_attach = block;
    }

    /// Bytes every attached container writes to stdout.
    pub fn set_attach_output(&self, output: &[u8]) {
        self.lock().attach_output = output.to_vec();
    }

    pub fn set_stack(&self, stack: Stack) {
        let mut inner = self.lock();
        let entry = inner
            .stacks
            .entry(stack.name.clone())
            .or_insert_with(|| MemoryStack {
                stack: stack.clone(),
                template: None,
                services: BTreeSet::new(),
            });
        entry.stack = stack;
    }

    /// Complete any in-progress operation on the stack.
    pub fn settle_stack(&self, name: &str) -> ApiResult<()> {
        self.lock().settle_stack(name)
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Number of ids sent in each call of a batch operation.
    pub fn batch_sizes(&self, operation: &str) -> Vec<usize> {
        self.lock()
            .batch_sizes
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    /// Task ARNs passed to `stop_task`, in call order.
    pub fn stop_calls(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.lock().services.get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.lock().services.keys().cloned().collect()
    }

    pub fn task(&self, arn: &str) -> Option<ClusterTask> {
        self.lock().tasks.get(arn).cloned()
    }

    /// Tasks that are not stopped.
    pub fn live_tasks(&self) -> Vec<ClusterTask> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.last_status != "STOPPED")
            .cloned()
            .collect()
    }

    pub fn stack(&self, name: &str) -> Option<Stack> {
        self.lock().stacks.get(name).map(|s| s.stack.clone())
    }
}

impl Inner {
    fn record(&mut self, operation: &'static str) -> ApiResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn record_batch(&mut self, operation: &'static str, size: usize) {
        self.batch_sizes.entry(operation).or_default().push(size);
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:08x}", self.next_id)
    }

    fn cluster_arn(&self) -> String {
        format!("{ARN_PREFIX}:cluster/{}", self.cluster)
    }

    fn service_arn(&self, name: &str) -> String {
        format!("{ARN_PREFIX}:service/{}/{name}", self.cluster)
    }

    fn paginate(&self, items: Vec<String>, token: Option<String>) -> ApiResult<Page<String>> {
        let start = match token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ApiError::validation(format!("invalid next token {token:?}")))?,
        };
        let end = (start + self.page_size).min(items.len());
        let next_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items.get(start..end).map(<[String]>::to_vec).unwrap_or_default(),
            next_token,
        })
    }

    fn resolve_task_definition(&self, reference: &str) -> Option<&TaskDefinition> {
        if let Some(def) = self.task_definitions.get(reference) {
            return Some(def);
        }
        let (family, revision) = match reference.split_once(':') {
            Some((family, rev)) if !reference.starts_with("arn:") => (family, rev.parse().ok()),
            _ => (reference, None),
        };
        let revision = revision.or_else(|| self.revisions.get(family).copied())?;
        self.task_definitions
            .values()
            .find(|d| d.family == family && d.revision == revision)
    }

    fn register(&mut self, input: TaskDefinitionInput) -> TaskDefinition {
        let revision = self.revisions.entry(input.family.clone()).or_default();
        *revision += 1;
        let revision = *revision;
        let def = TaskDefinition {
            arn: format!("{ARN_PREFIX}:task-definition/{}:{revision}", input.family),
            family: input.family,
            revision,
            containers: input.containers,
        };
        self.task_definitions.insert(def.arn.clone(), def.clone());
        def
    }

    fn launch(
        &mut self,
        task_definition: &str,
        group: Option<String>,
        started_by: Option<String>,
        overrides: Vec<ContainerOverride>,
        running: bool,
    ) -> ClusterTask {
        let id = self.fresh_id("");
        let arn = format!("{ARN_PREFIX}:task/{}/{id}", self.cluster);
        let container_instance = if self.container_instances.is_empty() {
            None
        } else {
            let index = (self.next_id as usize) % self.container_instances.len();
            self.container_instances.values().nth(index).cloned()
        };
        let now = self.tick();
        let task = ClusterTask {
            arn: arn.clone(),
            cluster_arn: self.cluster_arn(),
            task_definition_arn: task_definition.to_string(),
            container_instance_arn: container_instance.as_ref().map(|ci| ci.arn.clone()),
            last_status: if running { "RUNNING" } else { "PENDING" }.to_string(),
            group,
            started_by,
            created_at: Some(now),
            started_at: running.then_some(now),
            stopped_at: None,
            overrides,
        };
        if let Some(ci) = container_instance {
            let container_id = self.fresh_id("c");
            self.containers
                .entry(ci.instance_id)
                .or_default()
                .push(MemoryContainer {
                    id: container_id,
                    labels: BTreeMap::from([(TASK_ARN_LABEL.to_string(), arn.clone())]),
                });
        }
        self.tasks.insert(arn, task.clone());
        task
    }

    /// Accepts a task ARN or a bare task id.
    fn stop(&mut self, task: &str) -> bool {
        let now = self.tick();
        let found = self
            .tasks
            .values_mut()
            .find(|t| t.arn == task || resource_id(&t.arn) == task);
        match found {
            Some(task) => {
                task.last_status = "STOPPED".to_string();
                task.stopped_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Launch or stop service tasks until the live count matches.
    fn reconcile_service(&mut self, name: &str) {
        let Some(service) = self.services.get(name).cloned() else {
            return;
        };
        let group = format!("service:{name}");
        let live: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.group.as_deref() == Some(group.as_str()) && t.last_status != "STOPPED")
            .map(|t| t.arn.clone())
            .collect();
        let desired = service.desired_count as usize;
        if live.len() < desired {
            for _ in live.len()..desired {
                self.launch(
                    &service.task_definition,
                    Some(group.clone()),
                    None,
                    Vec::new(),
                    true,
                );
            }
        } else {
            for arn in live.iter().skip(desired) {
                self.stop(arn);
            }
        }
        if let Some(service) = self.services.get_mut(name) {
            service.running_count = service.desired_count;
        }
    }

    fn create_service(&mut self, def: ServiceDefinition) -> ApiResult<Service> {
        // Inactive services may be replaced by name.
        let taken = self
            .services
            .get(&def.service_name)
            .is_some_and(|s| s.status == "ACTIVE");
        if taken {
            return Err(ApiError::validation(format!(
                "service {} already exists",
                def.service_name
            )));
        }
        let service = Service {
            arn: self.service_arn(&def.service_name),
            name: def.service_name.clone(),
            task_definition: def.task_definition,
            desired_count: def.desired_count,
            running_count: 0,
            status: "ACTIVE".to_string(),
        };
        self.services.insert(def.service_name.clone(), service);
        self.reconcile_service(&def.service_name);
        Ok(self.services[&def.service_name].clone())
    }

    fn update_service(&mut self, update: ServiceUpdate) -> ApiResult<Service> {
        let name = resource_id(&update.service).to_string();
        let service = self.services.get_mut(&name).ok_or_else(|| {
            ApiError::new(ApiErrorKind::ServiceNotFound, format!("service {name} not found"))
        })?;
        if service.status != "ACTIVE" {
            return Err(ApiError::new(
                ApiErrorKind::ServiceNotActive,
                format!("service {name} is {}", service.status),
            ));
        }
        if let Some(count) = update.desired_count {
            service.desired_count = count;
        }
        if let Some(td) = update.task_definition {
            service.task_definition = td;
        }
        self.reconcile_service(&name);
        Ok(self.services[&name].clone())
    }

    fn delete_service(&mut self, name: &str) -> ApiResult<()> {
        let name = resource_id(name);
        let service = self.services.get(name).ok_or_else(|| {
            ApiError::new(ApiErrorKind::ServiceNotFound, format!("service {name} not found"))
        })?;
        if service.desired_count != 0 {
            return Err(ApiError::validation(
                "The service cannot be stopped while it is scaled above 0.",
            ));
        }
        self.services.remove(name);
        Ok(())
    }

    /// Realize the stack's template and finish its in-progress operation.
    fn settle_stack(&mut self, name: &str) -> ApiResult<()> {
        let entry = self.stacks.get(name).cloned().ok_or_else(|| {
            ApiError::new(ApiErrorKind::StackNotFound, format!("stack {name} does not exist"))
        })?;
        let next = match entry.stack.status {
            StackStatus::CreateInProgress => StackStatus::CreateComplete,
            StackStatus::UpdateInProgress | StackStatus::UpdateCompleteCleanupInProgress => {
                StackStatus::UpdateComplete
            }
            StackStatus::DeleteInProgress => {
                for service in &entry.services {
                    self.remove_stack_service(service);
                }
                self.stacks.remove(name);
                return Ok(());
            }
            StackStatus::UpdateRollbackInProgress | StackStatus::RollbackInProgress => {
                if let Some(stack) = self.stacks.get_mut(name) {
                    stack.stack.status = match entry.stack.status {
                        StackStatus::RollbackInProgress => StackStatus::RollbackComplete,
                        _ => StackStatus::UpdateRollbackComplete,
                    };
                }
                return Ok(());
            }
            _ => return Ok(()),
        };
        let Some(body) = entry.template.as_deref() else {
            if let Some(stack) = self.stacks.get_mut(name) {
                stack.stack.status = next;
            }
            return Ok(());
        };
        let template: StackTemplate = serde_json::from_str(body)
            .map_err(|e| ApiError::validation(format!("invalid template: {e}")))?;

        let mut services = BTreeMap::new();
        let mut definitions = BTreeMap::new();
        let mut owned = BTreeSet::new();
        for process in template.processes {
            let def = self.register(process.task_definition);
            definitions.insert(process.process_type.clone(), def.arn.clone());
            let Some(spec) = process.service else {
                continue;
            };
            let service = if self.services.contains_key(&spec.name) {
                self.update_service(ServiceUpdate {
                    cluster: self.cluster.clone(),
                    service: spec.name.clone(),
                    desired_count: Some(spec.desired_count),
                    task_definition: Some(def.arn.clone()),
                })?
            } else {
                self.create_service(ServiceDefinition {
                    cluster: self.cluster.clone(),
                    service_name: spec.name.clone(),
                    task_definition: def.arn.clone(),
                    desired_count: spec.desired_count,
                    load_balancer: spec.load_balancer,
                    role: spec.role,
                })?
            };
            services.insert(process.process_type.clone(), service.arn);
            owned.insert(spec.name);
        }
        for stale in entry.services.difference(&owned) {
            self.remove_stack_service(stale);
        }

        if let Some(stack) = self.stacks.get_mut(name) {
            stack.stack.status = next;
            stack.services = owned;
            stack
                .stack
                .outputs
                .insert(SERVICES_OUTPUT.to_string(), encode_process_map(&services));
            stack
                .stack
                .outputs
                .insert(TASK_DEFINITIONS_OUTPUT.to_string(), encode_process_map(&definitions));
        }
        debug!(stack = %name, "stack settled");
        Ok(())
    }

    fn remove_stack_service(&mut self, name: &str) {
        if let Some(service) = self.services.get_mut(name) {
            service.desired_count = 0;
        }
        self.reconcile_service(name);
        self.services.remove(name);
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_services(&self, req: ListServicesRequest) -> ApiResult<Page<String>> {
        let mut inner = self.lock();
        inner.record("ListServices")?;
        let arns: Vec<String> = inner.services.values().map(|s| s.arn.clone()).collect();
        inner.paginate(arns, req.next_token)
    }

    async fn create_service(&self, def: ServiceDefinition) -> ApiResult<Service> {
        let mut inner = self.lock();
        inner.record("CreateService")?;
        inner.create_service(def)
    }

    async fn update_service(&self, update: ServiceUpdate) -> ApiResult<Service> {
        let mut inner = self.lock();
        inner.record("UpdateService")?;
        inner.update_service(update)
    }

    async fn delete_service(&self, _cluster: &str, service: &str) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("DeleteService")?;
        inner.delete_service(service)
    }

    async fn wait_services_stable(&self, _cluster: &str, services: &[String]) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("WaitServicesStable")?;
        for service in services {
            inner.reconcile_service(resource_id(service));
        }
        Ok(())
    }

    async fn register_task_definition(
        &self,
        input: TaskDefinitionInput,
    ) -> ApiResult<TaskDefinition> {
        let mut inner = self.lock();
        inner.record("RegisterTaskDefinition")?;
        Ok(inner.register(input))
    }

    async fn describe_task_definition(&self, task_definition: &str) -> ApiResult<TaskDefinition> {
        let mut inner = self.lock();
        inner.record("DescribeTaskDefinition")?;
        inner
            .resolve_task_definition(task_definition)
            .cloned()
            .ok_or_else(|| {
                ApiError::not_found(format!("unable to describe task definition {task_definition}"))
            })
    }

    async fn run_task(&self, req: RunTaskRequest) -> ApiResult<RunTaskOutput> {
        let mut inner = self.lock();
        inner.record("RunTask")?;
        let failures = inner.batch_failures.get("RunTask").cloned().unwrap_or_default();
        if !failures.is_empty() {
            return Ok(RunTaskOutput {
                tasks: Vec::new(),
                failures,
            });
        }
        let def = inner
            .resolve_task_definition(&req.task_definition)
            .cloned()
            .ok_or_else(|| {
                ApiError::validation(format!("unable to describe task definition {}", req.task_definition))
            })?;
        let tasks = (0..req.count.max(1))
            .map(|_| {
                inner.launch(
                    &def.arn,
                    None,
                    Some(req.started_by.clone()),
                    req.overrides.clone(),
                    false,
                )
            })
            .collect();
        Ok(RunTaskOutput {
            tasks,
            failures: Vec::new(),
        })
    }

    async fn stop_task(&self, _cluster: &str, task: &str) -> ApiResult<()> {
        {
            let mut inner = self.lock();
            inner.stopped.push(task.to_string());
            inner.record("StopTask")?;
        }
        loop {
            let hold = self.lock().hold_stops;
            if !hold {
                break;
            }
            tokio::time::sleep(HOLD_POLL).await;
        }
        let mut inner = self.lock();
        if inner.stop(task) {
            Ok(())
        } else {
            Err(ApiError::not_found(format!("task {task} not found")))
        }
    }

    async fn list_tasks(&self, req: ListTasksRequest) -> ApiResult<Page<String>> {
        let mut inner = self.lock();
        inner.record("ListTasks")?;
        let arns: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| t.last_status != "STOPPED")
            .filter(|t| match &req.selector {
                TaskSelector::Service(service) => {
                    t.group.as_deref() == Some(format!("service:{}", resource_id(service)).as_str())
                }
                TaskSelector::StartedBy(tag) => t.started_by.as_deref() == Some(tag.as_str()),
            })
            .map(|t| t.arn.clone())
            .collect();
        inner.paginate(arns, req.next_token)
    }

    async fn describe_tasks(&self, _cluster: &str, tasks: &[String]) -> ApiResult<DescribeTasksOutput> {
        let mut inner = self.lock();
        inner.record("DescribeTasks")?;
        if tasks.len() > MAX_DESCRIBE_TASKS {
            return Err(ApiError::validation(format!(
                "at most {MAX_DESCRIBE_TASKS} tasks per call, got {}",
                tasks.len()
            )));
        }
        inner.record_batch("DescribeTasks", tasks.len());
        let mut output = DescribeTasksOutput::default();
        for arn in tasks {
            match inner.tasks.get(arn) {
                Some(task) => output.tasks.push(task.clone()),
                None => output.failures.push(Failure {
                    arn: arn.clone(),
                    reason: "MISSING".to_string(),
                }),
            }
        }
        if let Some(injected) = inner.batch_failures.get("DescribeTasks") {
            output.failures.extend(injected.iter().cloned());
        }
        Ok(output)
    }

    async fn describe_container_instances(
        &self,
        _cluster: &str,
        container_instances: &[String],
    ) -> ApiResult<DescribeContainerInstancesOutput> {
        let mut inner = self.lock();
        inner.record("DescribeContainerInstances")?;
        if container_instances.len() > MAX_DESCRIBE_CONTAINER_INSTANCES {
            return Err(ApiError::validation(format!(
                "at most {MAX_DESCRIBE_CONTAINER_INSTANCES} container instances per call, got {}",
                container_instances.len()
            )));
        }
        inner.record_batch("DescribeContainerInstances", container_instances.len());
        let mut output = DescribeContainerInstancesOutput::default();
        for arn in container_instances {
            if inner.omitted.contains(arn) {
                continue;
            }
            match inner.container_instances.get(arn) {
                Some(ci) => output.container_instances.push(ci.clone()),
                None => output.failures.push(Failure {
                    arn: arn.clone(),
                    reason: "MISSING".to_string(),
                }),
            }
        }
        if let Some(injected) = inner.batch_failures.get("DescribeContainerInstances") {
            output.failures.extend(injected.iter().cloned());
        }
        Ok(output)
    }

    async fn wait_tasks_not_pending(&self, _cluster: &str, tasks: &[String]) -> ApiResult<()> {
        self.lock().record("WaitUntilTasksNotPending")?;
        loop {
            let hold = self.lock().hold_pending;
            if !hold {
                break;
            }
            tokio::time::sleep(HOLD_POLL).await;
        }
        let mut inner = self.lock();
        let now = inner.tick();
        for arn in tasks {
            if let Some(task) = inner.tasks.get_mut(arn) {
                if task.last_status == "PENDING" {
                    task.last_status = "RUNNING".to_string();
                    task.started_at = Some(now);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StackApi for MemoryCluster {
    async fn describe_stack(&self, name: &str) -> ApiResult<Stack> {
        let mut inner = self.lock();
        inner.record("DescribeStacks")?;
        inner
            .stacks
            .get(name)
            .map(|s| s.stack.clone())
            .ok_or_else(|| {
                ApiError::new(ApiErrorKind::StackNotFound, format!("stack {name} does not exist"))
            })
    }

    async fn create_stack(&self, input: StackInput) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("CreateStack")?;
        if inner.stacks.contains_key(&input.name) {
            return Err(ApiError::validation(format!("stack {} already exists", input.name)));
        }
        inner.stacks.insert(
            input.name.clone(),
            MemoryStack {
                stack: Stack {
                    name: input.name,
                    status: StackStatus::CreateInProgress,
                    outputs: BTreeMap::new(),
                    tags: input.tags,
                },
                template: Some(input.template_body),
                services: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn update_stack(&self, input: StackInput) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("UpdateStack")?;
        let entry = inner.stacks.get_mut(&input.name).ok_or_else(|| {
            ApiError::new(
                ApiErrorKind::StackNotFound,
                format!("stack {} does not exist", input.name),
            )
        })?;
        if entry.stack.status.is_in_progress() {
            return Err(ApiError::validation(format!(
                "stack {} is in {:?} state and can not be updated",
                input.name, entry.stack.status
            )));
        }
        entry.stack.status = StackStatus::UpdateInProgress;
        entry.stack.tags = input.tags;
        entry.template = Some(input.template_body);
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("DeleteStack")?;
        if let Some(entry) = inner.stacks.get_mut(name) {
            entry.stack.status = StackStatus::DeleteInProgress;
        }
        Ok(())
    }

    async fn wait_stack(&self, name: &str, until: StackWait) -> ApiResult<()> {
        let mut inner = self.lock();
        inner.record("WaitStack")?;
        if !inner.stacks.contains_key(name) {
            return match until {
                StackWait::DeleteComplete => Ok(()),
                _ => Err(ApiError::new(
                    ApiErrorKind::StackNotFound,
                    format!("stack {name} does not exist"),
                )),
            };
        }
        inner.settle_stack(name)?;
        let status = inner.stacks.get(name).map(|s| s.stack.status.clone());
        let reached = match (until, status) {
            (StackWait::DeleteComplete, None) => true,
            (StackWait::CreateComplete, Some(StackStatus::CreateComplete)) => true,
            (StackWait::UpdateComplete, Some(StackStatus::UpdateComplete)) => true,
            (StackWait::UpdateRollbackComplete, Some(StackStatus::UpdateRollbackComplete)) => true,
            _ => false,
        };
        if reached {
            Ok(())
        } else {
            Err(ApiError::validation(format!(
                "stack {name} did not reach {until:?}"
            )))
        }
    }
}

#[async_trait]
impl InstanceApi for MemoryCluster {
    async fn describe_instance(&self, instance_id: &str) -> ApiResult<HostInstance> {
        let mut inner = self.lock();
        inner.record("DescribeInstances")?;
        inner
            .hosts
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("instance {instance_id} not found")))
    }
}

#[async_trait]
impl RuntimeConnector for MemoryCluster {
    async fn connect(&self, host: &HostInstance) -> ApiResult<Box<dyn RuntimeClient>> {
        let mut inner = self.lock();
        inner.record("ConnectRuntime")?;
        if !inner.hosts.contains_key(&host.instance_id) {
            return Err(ApiError::transport(format!(
                "no runtime reachable on {}",
                host.instance_id
            )));
        }
        Ok(Box::new(MemoryRuntime {
            cluster: self.clone(),
            instance_id: host.instance_id.clone(),
        }))
    }
}

/// Runtime session with one host of a [`MemoryCluster`].
struct MemoryRuntime {
    cluster: MemoryCluster,
    instance_id: String,
}

#[async_trait]
impl RuntimeClient for MemoryRuntime {
    async fn list_containers(&mut self, filter: &ContainerFilter) -> ApiResult<Vec<ContainerSummary>> {
        let mut inner = self.cluster.lock();
        inner.record("ListContainers")?;
        let (key, value) = &filter.label;
        Ok(inner
            .containers
            .get(&self.instance_id)
            .map(|containers| {
                containers
                    .iter()
                    .filter(|c| c.labels.get(key) == Some(value))
                    .map(|c| ContainerSummary {
                        id: c.id.clone(),
                        labels: c.labels.clone(),
                        state: "running".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn attach(
        self: Box<Self>,
        container_id: &str,
        _options: AttachOptions,
        mut io: RunIo,
    ) -> ApiResult<()> {
        let (block, output) = {
            let mut inner = self.cluster.lock();
            inner.record("AttachToContainer")?;
            (inner.block_attach, inner.attach_output.clone())
        };
        if block {
            std::future::pending::<()>().await;
        }
        debug!(container = %container_id, bytes = output.len(), "attached");
        io.stdout
            .write_all(&output)
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;
        io.stdout
            .flush()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))
    }
}

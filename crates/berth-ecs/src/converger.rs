//! Converger — drives the cluster's services onto an app manifest.
//!
//! For every process in the manifest a fresh task definition revision is
//! registered and the process's service is updated to it (or created).
//! Scheduled processes only get the task definition. Services the app owns
//! but the manifest no longer names are scaled to zero and deleted.
//!
//! Ownership comes from the service name alone (see
//! [`NameScheme`](berth_core::NameScheme)); services whose names do not
//! parse are never touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::batch::{drain, pages};
use berth_core::{Manifest, NameScheme, Process, resource_id};
use berth_scheduler::manager::RELEASE_ENV;
use berth_scheduler::{CallContext, SchedulerError, SchedulerResult, StatusStream, publish};
use tracing::{debug, info, warn};

use crate::api::ClusterApi;
use crate::settings::EcsSettings;
use crate::types::*;

/// Port exposed processes listen on inside the container.
pub const CONTAINER_PORT: u16 = 8080;

/// Builds task definitions and load balancer wiring for processes.
#[derive(Debug, Clone)]
pub struct TaskDefinitionBuilder {
    names: NameScheme,
    log_driver: Option<String>,
}

impl TaskDefinitionBuilder {
    pub fn new(names: NameScheme, log_driver: Option<String>) -> Self {
        Self { names, log_driver }
    }

    /// Task definition family; identical to the service name.
    pub fn family(&self, app_id: &str, process_type: &str) -> String {
        self.names.service_name(app_id, process_type)
    }

    pub fn build(&self, manifest: &Manifest, process: &Process) -> TaskDefinitionInput {
        let mut environment = manifest.process_env(process);
        environment.insert(RELEASE_ENV.to_string(), manifest.release.clone());

        let mut port_mappings = Vec::new();
        if process.exposure.is_some() {
            environment.insert("PORT".to_string(), CONTAINER_PORT.to_string());
            port_mappings.push(PortMapping {
                host_port: 0,
                container_port: CONTAINER_PORT,
            });
        }

        let mut ulimits = Vec::new();
        if process.constraints.nproc != 0 {
            let limit = u64::from(process.constraints.nproc);
            ulimits.push(Ulimit {
                name: "nproc".to_string(),
                soft_limit: limit,
                hard_limit: limit,
            });
        }

        TaskDefinitionInput {
            family: self.family(&manifest.app.id, &process.process_type),
            containers: vec![ContainerDefinition {
                name: process.process_type.clone(),
                image: manifest.app.image.clone(),
                command: process.command.clone(),
                cpu: process.constraints.cpu_shares,
                memory_mib: process.constraints.memory_mib(),
                environment,
                labels: manifest.process_labels(process),
                port_mappings,
                ulimits,
                essential: true,
                log_driver: self.log_driver.clone(),
            }],
        }
    }

    /// Load balancer registration for exposed processes.
    pub fn load_balancer(&self, service_name: &str, process: &Process) -> Option<LoadBalancerRef> {
        process.exposure.as_ref().map(|_| LoadBalancerRef {
            name: service_name.to_string(),
            container_name: process.process_type.clone(),
            container_port: CONTAINER_PORT,
        })
    }
}

pub struct Converger {
    api: Arc<dyn ClusterApi>,
    cluster: String,
    names: NameScheme,
    service_role: Option<String>,
    stable_timeout: std::time::Duration,
    builder: TaskDefinitionBuilder,
}

impl Converger {
    pub fn new(api: Arc<dyn ClusterApi>, settings: &EcsSettings) -> Self {
        Self {
            api,
            cluster: settings.cluster.clone(),
            names: settings.names.clone(),
            service_role: settings.service_role.clone(),
            stable_timeout: settings.stable_timeout,
            builder: TaskDefinitionBuilder::new(settings.names.clone(), settings.log_driver.clone()),
        }
    }

    pub fn builder(&self) -> &TaskDefinitionBuilder {
        &self.builder
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Converge the app's services onto `manifest`.
    ///
    /// Names are validated before anything is changed. A failure part way
    /// through leaves earlier processes converged; resubmitting is safe.
    pub async fn converge(
        &self,
        manifest: &Manifest,
        status: Option<&dyn StatusStream>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let app_id = manifest.app.id.as_str();
        self.names.validate_app_id(app_id)?;
        for process in &manifest.processes {
            self.names.validate_process_type(&process.process_type)?;
        }

        let existing = self.services(app_id, ctx).await?;

        for process in &manifest.processes {
            let input = self.builder.build(manifest, process);
            let family = input.family.clone();
            let task_definition = ctx
                .call(
                    "RegisterTaskDefinition",
                    &family,
                    self.api.register_task_definition(input),
                )
                .await?;
            debug!(%family, revision = task_definition.revision, "task definition registered");

            if process.is_scheduled() {
                if existing.contains_key(&process.process_type) {
                    self.remove_process(app_id, &process.process_type, ctx).await?;
                }
                publish(status, format!("Registered scheduled process {family}"));
                continue;
            }

            let service_name = self.names.service_name(app_id, &process.process_type);
            if existing.contains_key(&process.process_type) {
                self.update_or_create(&service_name, process, &task_definition.arn, ctx)
                    .await?;
                publish(status, format!("Updated service {service_name}"));
            } else {
                self.create_service(&service_name, process, &task_definition.arn, ctx)
                    .await?;
                publish(status, format!("Created service {service_name}"));
            }
        }

        let desired = manifest.process_types();
        for process_type in existing.keys() {
            if !desired.contains(process_type.as_str()) {
                self.remove_process(app_id, process_type, ctx).await?;
                publish(
                    status,
                    format!("Removed service {}", self.names.service_name(app_id, process_type)),
                );
            }
        }

        info!(%app_id, release = %manifest.release, "app converged");
        Ok(())
    }

    /// Remove every service the app owns.
    pub async fn teardown(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        let existing = self.services(app_id, ctx).await?;
        for process_type in existing.keys() {
            self.remove_process(app_id, process_type, ctx).await?;
        }
        info!(%app_id, services = existing.len(), "app removed");
        Ok(())
    }

    /// Process type to service name, for every service the app owns.
    pub async fn services(
        &self,
        app_id: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<BTreeMap<String, String>> {
        let (api, cluster) = (&self.api, self.cluster.as_str());
        let arns = drain(pages(move |next_token| {
            let req = ListServicesRequest {
                cluster: cluster.to_string(),
                next_token,
            };
            ctx.call("ListServices", cluster, api.list_services(req))
        }))
        .await?;

        let mut services = BTreeMap::new();
        for arn in &arns {
            match self.names.split_service_name(arn) {
                Some((owner, process_type)) if owner == app_id => {
                    services.insert(process_type.to_string(), resource_id(arn).to_string());
                }
                Some(_) => {}
                None => debug!(service = %arn, "ignoring service outside the naming scheme"),
            }
        }
        Ok(services)
    }

    /// Scale one process's service to zero, wait for it to drain, and
    /// delete it. A service that is already gone counts as removed.
    pub async fn remove_process(
        &self,
        app_id: &str,
        process_type: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let service = self.names.service_name(app_id, process_type);

        let scaled = ctx
            .call(
                "UpdateService",
                &service,
                self.api.update_service(ServiceUpdate {
                    cluster: self.cluster.clone(),
                    service: service.clone(),
                    desired_count: Some(0),
                    task_definition: None,
                }),
            )
            .await;
        match scaled {
            Ok(_) => {}
            Err(e) if e.is_service_gone() => {
                debug!(%service, "service already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let names = [service.clone()];
        let wait = ctx.call(
            "WaitServicesStable",
            &service,
            self.api.wait_services_stable(&self.cluster, &names),
        );
        match tokio::time::timeout(self.stable_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SchedulerError::Timeout {
                    operation: "WaitServicesStable",
                    after: self.stable_timeout,
                });
            }
        }

        match ctx
            .call(
                "DeleteService",
                &service,
                self.api.delete_service(&self.cluster, &service),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_service_gone() => {}
            Err(e) => return Err(e),
        }
        info!(%service, "service removed");
        Ok(())
    }

    /// Set the desired count of one process's service.
    pub async fn scale(
        &self,
        app_id: &str,
        process_type: &str,
        quantity: u32,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let service = self.names.service_name(app_id, process_type);
        let result = ctx
            .call(
                "UpdateService",
                &service,
                self.api.update_service(ServiceUpdate {
                    cluster: self.cluster.clone(),
                    service: service.clone(),
                    desired_count: Some(quantity),
                    task_definition: None,
                }),
            )
            .await;
        match result {
            Ok(_) => {
                info!(%service, quantity, "service scaled");
                Ok(())
            }
            Err(e) if e.is_service_gone() => Err(SchedulerError::not_found("process", process_type)),
            Err(e) => Err(e),
        }
    }

    /// Latest task definition registered for a process.
    pub async fn task_definition(
        &self,
        app_id: &str,
        process_type: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<TaskDefinition> {
        let family = self.builder.family(app_id, process_type);
        let result = ctx
            .call(
                "DescribeTaskDefinition",
                &family,
                self.api.describe_task_definition(&family),
            )
            .await;
        match result {
            Err(e) if e.api_kind() == Some(berth_scheduler::ApiErrorKind::NotFound) => {
                Err(SchedulerError::not_found("process", process_type))
            }
            other => other,
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn update_or_create(
        &self,
        service_name: &str,
        process: &Process,
        task_definition: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let updated = ctx
            .call(
                "UpdateService",
                service_name,
                self.api.update_service(ServiceUpdate {
                    cluster: self.cluster.clone(),
                    service: service_name.to_string(),
                    desired_count: Some(process.quantity),
                    task_definition: Some(task_definition.to_string()),
                }),
            )
            .await;
        match updated {
            Ok(_) => Ok(()),
            Err(e) if e.is_service_gone() => {
                warn!(service = %service_name, "service vanished during update; recreating");
                self.create_service(service_name, process, task_definition, ctx)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_service(
        &self,
        service_name: &str,
        process: &Process,
        task_definition: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let load_balancer = self.builder.load_balancer(service_name, process);
        let role = load_balancer.as_ref().and(self.service_role.clone());
        let def = ServiceDefinition {
            cluster: self.cluster.clone(),
            service_name: service_name.to_string(),
            task_definition: task_definition.to_string(),
            desired_count: process.quantity,
            load_balancer,
            role,
        };
        ctx.call("CreateService", service_name, self.api.create_service(def))
            .await?;
        info!(service = %service_name, quantity = process.quantity, "service created");
        Ok(())
    }
}

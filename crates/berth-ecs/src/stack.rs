//! StackBackend — one declarative stack per app.
//!
//! Instead of driving services directly, the app's whole manifest is
//! rendered into a [`StackTemplate`] and handed to the cluster's
//! orchestration engine. The engine publishes two outputs the rest of the
//! backend reads back:
//!
//! - `Services`: `web=<service arn>,worker=<service arn>`
//! - `TaskDefinitions`: `web=<task definition arn>,...`
//!
//! The stack name assigned to an app is persisted in the state store the
//! first time the app is submitted and reused afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{Manifest, NameScheme};
use berth_scheduler::{
    ApiErrorKind, CallContext, SchedulerError, SchedulerResult, StatusStream, publish,
};
use berth_state::{StackRecord, StateStore, epoch_secs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::StackApi;
use crate::converger::TaskDefinitionBuilder;
use crate::settings::EcsSettings;
use crate::types::*;

pub const SERVICES_OUTPUT: &str = "Services";
pub const TASK_DEFINITIONS_OUTPUT: &str = "TaskDefinitions";

/// Tag carrying the owning app id on every stack.
pub const APP_ID_TAG: &str = "berth.app.id";
pub const APP_NAME_TAG: &str = "berth.app.name";

// ── Template ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTemplate {
    pub description: String,
    pub cluster: String,
    pub processes: Vec<StackProcess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackProcess {
    pub process_type: String,
    pub task_definition: TaskDefinitionInput,
    /// Absent for scheduled processes.
    #[serde(default)]
    pub service: Option<StackService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackService {
    pub name: String,
    pub desired_count: u32,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerRef>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Encode a process-type map as `a=b,c=d`, sorted by key.
pub fn encode_process_map(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode an `a=b,c=d` output. Malformed pairs are skipped.
pub fn decode_process_map(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                map.insert(k.to_string(), v.to_string());
            }
            _ => warn!(%pair, "skipping malformed stack output entry"),
        }
    }
    map
}

// ── Backend ────────────────────────────────────────────────────────

pub struct StackBackend {
    stacks: Arc<dyn StackApi>,
    store: StateStore,
    cluster: String,
    names: NameScheme,
    service_role: Option<String>,
    builder: TaskDefinitionBuilder,
    prefix: String,
    wait: bool,
    timeout: Duration,
}

impl StackBackend {
    pub fn new(stacks: Arc<dyn StackApi>, store: StateStore, settings: &EcsSettings) -> Self {
        Self {
            stacks,
            store,
            cluster: settings.cluster.clone(),
            names: settings.names.clone(),
            service_role: settings.service_role.clone(),
            builder: TaskDefinitionBuilder::new(settings.names.clone(), settings.log_driver.clone()),
            prefix: settings.stack_prefix.clone(),
            wait: settings.stack_wait,
            timeout: settings.stack_timeout,
        }
    }

    pub fn builder(&self) -> &TaskDefinitionBuilder {
        &self.builder
    }

    pub fn render(&self, manifest: &Manifest) -> StackTemplate {
        let processes = manifest
            .processes
            .iter()
            .map(|process| {
                let service = (!process.is_scheduled()).then(|| {
                    let name = self.names.service_name(&manifest.app.id, &process.process_type);
                    let load_balancer = self.builder.load_balancer(&name, process);
                    StackService {
                        role: load_balancer.as_ref().and(self.service_role.clone()),
                        load_balancer,
                        desired_count: process.quantity,
                        name,
                    }
                });
                StackProcess {
                    process_type: process.process_type.clone(),
                    task_definition: self.builder.build(manifest, process),
                    service,
                }
            })
            .collect();
        StackTemplate {
            description: format!("{} ({})", manifest.app.name, manifest.release),
            cluster: self.cluster.clone(),
            processes,
        }
    }

    /// Create or update the app's stack from `manifest`.
    pub async fn submit(
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

        let (stack_name, assigned) = match self.store.get_stack(app_id)? {
            Some(record) => (record.stack_name, false),
            None => {
                let record = StackRecord {
                    app_id: app_id.to_string(),
                    stack_name: format!("{}{}", self.prefix, manifest.app.name),
                    created_at: epoch_secs(),
                };
                self.store.put_stack(&record)?;
                (record.stack_name, true)
            }
        };

        let result = self.apply(manifest, &stack_name, status, ctx).await;
        if let Err(err) = &result {
            if assigned && nothing_created(err) {
                if let Err(e) = self.store.delete_stack(app_id) {
                    warn!(%app_id, error = %e, "failed to roll back stack assignment");
                }
            }
        }
        result
    }

    /// Delete the app's stack and forget its name.
    pub async fn remove(&self, app_id: &str, ctx: &CallContext) -> SchedulerResult<()> {
        let record = self
            .store
            .get_stack(app_id)?
            .ok_or_else(|| SchedulerError::not_found("stack for app", app_id))?;
        let name = record.stack_name.as_str();

        match ctx.call("DeleteStack", name, self.stacks.delete_stack(name)).await {
            Ok(()) => {}
            Err(e) if e.api_kind() == Some(ApiErrorKind::StackNotFound) => {}
            Err(e) => return Err(e),
        }
        if self.wait {
            self.wait_for(name, StackWait::DeleteComplete, ctx).await?;
        }
        self.store.delete_stack(app_id)?;
        info!(%app_id, stack = %name, "stack removed");
        Ok(())
    }

    /// Read a process map output (`Services` or `TaskDefinitions`).
    ///
    /// While the stack is still being created the output may not exist yet;
    /// that case is [`SchedulerError::StackNotReady`]. A missing output on a
    /// stack in any other state is a hard error.
    pub async fn output(
        &self,
        app_id: &str,
        output: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<BTreeMap<String, String>> {
        let record = self
            .store
            .get_stack(app_id)?
            .ok_or_else(|| SchedulerError::not_found("stack for app", app_id))?;
        let name = record.stack_name.as_str();
        let stack = ctx
            .call("DescribeStacks", name, self.stacks.describe_stack(name))
            .await?;

        match stack.outputs.get(output) {
            Some(value) => Ok(decode_process_map(value)),
            None if stack.status.is_create_in_progress() => Err(SchedulerError::StackNotReady {
                stack: stack.name,
                output: output.to_string(),
            }),
            None => Err(SchedulerError::not_found(
                "stack output",
                format!("{}/{output}", stack.name),
            )),
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn apply(
        &self,
        manifest: &Manifest,
        stack_name: &str,
        status: Option<&dyn StatusStream>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let template = self.render(manifest);
        let template_body = serde_json::to_string_pretty(&template).map_err(|e| {
            SchedulerError::backend(
                "RenderTemplate",
                stack_name,
                berth_scheduler::ApiError::validation(e.to_string()),
            )
        })?;
        let input = StackInput {
            name: stack_name.to_string(),
            template_body,
            tags: BTreeMap::from([
                (APP_ID_TAG.to_string(), manifest.app.id.clone()),
                (APP_NAME_TAG.to_string(), manifest.app.name.clone()),
            ]),
        };

        let existing = ctx
            .call(
                "DescribeStacks",
                stack_name,
                self.stacks.describe_stack(stack_name),
            )
            .await;
        match existing {
            Err(e) if e.api_kind() == Some(ApiErrorKind::StackNotFound) => {
                ctx.call("CreateStack", stack_name, self.stacks.create_stack(input))
                    .await?;
                publish(status, format!("Created stack {stack_name}"));
                if self.wait {
                    self.wait_for(stack_name, StackWait::CreateComplete, ctx)
                        .await?;
                }
            }
            Err(e) => return Err(e),
            Ok(stack) => {
                if stack.status.is_failed_create() {
                    return Err(SchedulerError::backend(
                        "UpdateStack",
                        stack_name,
                        berth_scheduler::ApiError::validation(format!(
                            "stack {stack_name} failed to create ({:?}); remove the app and submit it again",
                            stack.status
                        )),
                    ));
                }
                if let Some(until) = stack.status.settles_at() {
                    debug!(stack = %stack_name, status = ?stack.status, "waiting for running operation");
                    self.wait_for(stack_name, until, ctx).await?;
                }
                ctx.call("UpdateStack", stack_name, self.stacks.update_stack(input))
                    .await?;
                publish(status, format!("Updated stack {stack_name}"));
                if self.wait {
                    self.wait_for(stack_name, StackWait::UpdateComplete, ctx)
                        .await?;
                }
            }
        }
        info!(app_id = %manifest.app.id, stack = %stack_name, release = %manifest.release, "stack submitted");
        Ok(())
    }

    async fn wait_for(&self, name: &str, until: StackWait, ctx: &CallContext) -> SchedulerResult<()> {
        let wait = ctx.call("WaitStack", name, self.stacks.wait_stack(name, until));
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout {
                operation: "WaitStack",
                after: self.timeout,
            }),
        }
    }
}

/// The submit failed before the stack could exist on the cluster.
///
/// Once `CreateStack` has been accepted the stack may be live even if a
/// later step fails, so the assigned name must be kept for `remove`.
fn nothing_created(err: &SchedulerError) -> bool {
    matches!(
        err,
        SchedulerError::Backend {
            operation: "RenderTemplate" | "DescribeStacks" | "CreateStack",
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_map_codec() {
        let map = BTreeMap::from([
            ("worker".to_string(), "arn:b".to_string()),
            ("web".to_string(), "arn:a".to_string()),
        ]);
        let encoded = encode_process_map(&map);
        assert_eq!(encoded, "web=arn:a,worker=arn:b");
        assert_eq!(decode_process_map(&encoded), map);
    }

    #[test]
    fn decode_skips_malformed_pairs() {
        let map = decode_process_map("web=arn:a,,bogus,=x, worker=arn:b");
        assert_eq!(map.len(), 2);
        assert_eq!(map["worker"], "arn:b");
        assert!(decode_process_map("").is_empty());
    }
}

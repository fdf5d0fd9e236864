//! In-memory scheduler.
//!
//! Stores submitted manifests and scheduled units in mutex-guarded maps and
//! reports every process instance as running on a single fake host. Used by
//! tests and for running the control plane without a cluster.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use berth_core::{Host, Manifest, Process, Task, TaskState};
use berth_state::Job;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::CallContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{
    JobScheduler, RunIo, RunReport, Scheduler, StatusStream, UnitState, publish,
};

/// Host id reported for every fake task and unit.
pub const FAKE_HOST: &str = "fake";

#[derive(Debug, Clone)]
struct FakeUnit {
    app_id: String,
    state: String,
}

#[derive(Debug, Default)]
pub struct FakeScheduler {
    apps: Mutex<HashMap<String, Manifest>>,
    units: Mutex<BTreeMap<String, FakeUnit>>,
    restarts: Mutex<HashMap<String, u32>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manifest last submitted for the app, with scaling applied.
    pub async fn manifest(&self, app_id: &str) -> Option<Manifest> {
        self.apps.lock().await.get(app_id).cloned()
    }

    /// Names of every scheduled unit, sorted.
    pub async fn unit_names(&self) -> Vec<String> {
        self.units.lock().await.keys().cloned().collect()
    }

    pub async fn restart_count(&self, app_id: &str) -> u32 {
        self.restarts.lock().await.get(app_id).copied().unwrap_or(0)
    }

    /// Override the reported state of a unit.
    pub async fn set_unit_state(&self, name: &str, state: &str) {
        if let Some(unit) = self.units.lock().await.get_mut(name) {
            unit.state = state.to_string();
        }
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn submit(
        &self,
        manifest: &Manifest,
        status: Option<&dyn StatusStream>,
        _ctx: &CallContext,
    ) -> SchedulerResult<()> {
        self.apps
            .lock()
            .await
            .insert(manifest.app.id.clone(), manifest.clone());
        info!(app_id = %manifest.app.id, release = %manifest.release, "manifest accepted");
        publish(status, format!("Submitted {} {}", manifest.app.name, manifest.release));
        Ok(())
    }

    async fn remove(&self, app_id: &str, _ctx: &CallContext) -> SchedulerResult<()> {
        self.apps.lock().await.remove(app_id);
        debug!(%app_id, "app removed");
        Ok(())
    }

    async fn scale(
        &self,
        app_id: &str,
        process_type: &str,
        quantity: u32,
        _ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let mut apps = self.apps.lock().await;
        let manifest = apps
            .get_mut(app_id)
            .ok_or_else(|| SchedulerError::not_found("app", app_id))?;
        let process = manifest
            .process_mut(process_type)
            .ok_or_else(|| SchedulerError::not_found("process", process_type))?;
        process.quantity = quantity;
        Ok(())
    }

    async fn restart(&self, app_id: &str, _ctx: &CallContext) -> SchedulerResult<()> {
        *self
            .restarts
            .lock()
            .await
            .entry(app_id.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn tasks(&self, app_id: &str, _ctx: &CallContext) -> SchedulerResult<Vec<Task>> {
        let apps = self.apps.lock().await;
        let Some(manifest) = apps.get(app_id) else {
            return Ok(Vec::new());
        };
        let mut tasks = Vec::new();
        for process in manifest.processes.iter().filter(|p| !p.is_scheduled()) {
            for instance in 1..=process.quantity {
                let id = format!("{}.{instance}", process.process_type);
                tasks.push(Task {
                    name: format!("{}.{id}", manifest.release),
                    id,
                    version: manifest.release.clone(),
                    process_type: process.process_type.clone(),
                    command: process.command.clone(),
                    constraints: process.constraints,
                    state: TaskState::Running,
                    updated_at: None,
                    host: Host {
                        id: FAKE_HOST.to_string(),
                    },
                });
            }
        }
        Ok(tasks)
    }

    async fn stop_task(&self, task_id: &str, _ctx: &CallContext) -> SchedulerResult<()> {
        debug!(%task_id, "task stop requested");
        Ok(())
    }

    async fn run(
        &self,
        manifest: &Manifest,
        process: &Process,
        io: Option<RunIo>,
        _ctx: &CallContext,
    ) -> SchedulerResult<RunReport> {
        let task_id = format!("run.{}", process.process_type);
        let attached = io.is_some();
        if let Some(mut io) = io {
            let line = format!(
                "Fake output for `{}` on {}\n",
                process.command.join(" "),
                manifest.app.name
            );
            io.stdout
                .write_all(line.as_bytes())
                .await
                .map_err(|source| SchedulerError::Io {
                    context: "write run output".to_string(),
                    source,
                })?;
            io.stdout.flush().await.map_err(|source| SchedulerError::Io {
                context: "flush run output".to_string(),
                source,
            })?;
        }
        Ok(RunReport {
            task_id,
            attached,
            cleanup_warning: None,
        })
    }
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn schedule(&self, job: &Job, _ctx: &CallContext) -> SchedulerResult<()> {
        self.units.lock().await.insert(
            job.name(),
            FakeUnit {
                app_id: job.app_id.clone(),
                state: "running".to_string(),
            },
        );
        Ok(())
    }

    async fn unschedule(&self, name: &str, _ctx: &CallContext) -> SchedulerResult<()> {
        self.units.lock().await.remove(name);
        Ok(())
    }

    async fn job_states(&self, app_id: &str, _ctx: &CallContext) -> SchedulerResult<Vec<UnitState>> {
        let units = self.units.lock().await;
        Ok(units
            .iter()
            .filter(|(_, unit)| unit.app_id == app_id)
            .map(|(name, unit)| UnitState {
                name: name.clone(),
                machine_id: FAKE_HOST.to_string(),
                state: unit.state.clone(),
            })
            .collect())
    }
}

//! Job manager — reconciles a release's formation into scheduled jobs.
//!
//! A release with formation `{web: 2, worker: 1}` expands into the jobs
//! `web.1`, `web.2` and `worker.1`. The manager persists every job it
//! schedules, so a later release or scale operation can compute exactly which
//! jobs to add and which to take down.
//!
//! Each job is scheduled (or unscheduled) with the [`JobScheduler`] before
//! its record is written (or deleted). A failing step stops the operation and
//! reports the job it failed on; steps already taken are not rolled back.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::{Process, Release, merge_maps};
use berth_state::{Job, JobQuery, StateStore, epoch_secs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::CallContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::JobScheduler;

/// Environment variable carrying the release version into every job.
pub const RELEASE_ENV: &str = "BERTH_RELEASE";

/// Reported for jobs the scheduler has no unit for.
pub const UNKNOWN: &str = "unknown";

/// A persisted job joined with the scheduler's view of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job: Job,
    pub name: String,
    pub machine_id: String,
    pub state: String,
}

pub struct Manager {
    scheduler: Arc<dyn JobScheduler>,
    store: StateStore,
}

impl Manager {
    pub fn new(scheduler: Arc<dyn JobScheduler>, store: StateStore) -> Self {
        Self { scheduler, store }
    }

    /// Schedule every job of the release, taking down jobs the formation no
    /// longer asks for first.
    pub async fn schedule_release(
        &self,
        release: &Release,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let desired = build_jobs(release);
        let existing = self
            .store
            .list_jobs(&JobQuery::release(&release.app.id, &release.version))?;

        // Highest instance first within each type.
        let mut excess: Vec<&Job> = existing
            .iter()
            .filter(|job| match release.formation.get(&job.process_type) {
                Some(process) => job.instance > process.quantity,
                None => true,
            })
            .collect();
        excess.sort_by(|a, b| {
            a.process_type
                .cmp(&b.process_type)
                .then(b.instance.cmp(&a.instance))
        });

        for job in excess {
            self.unschedule(job, ctx).await?;
        }
        for job in &desired {
            self.schedule(job, ctx).await?;
        }

        info!(
            app_id = %release.app.id,
            version = %release.version,
            jobs = desired.len(),
            "release scheduled"
        );
        Ok(())
    }

    /// Adjust instance counts for the given process types.
    ///
    /// Scaling up schedules new instances numbered after the highest existing
    /// one; scaling down removes the highest-numbered instances. Types absent
    /// from the release formation are ignored.
    pub async fn scale_release(
        &self,
        release: &Release,
        quantities: &BTreeMap<String, u32>,
        ctx: &CallContext,
    ) -> SchedulerResult<()> {
        let jobs = self
            .store
            .list_jobs(&JobQuery::release(&release.app.id, &release.version))?;

        for (process_type, &target) in quantities {
            let Some(process) = release.formation.get(process_type) else {
                debug!(%process_type, "process type not in formation; skipping");
                continue;
            };
            let current: Vec<&Job> = jobs
                .iter()
                .filter(|job| &job.process_type == process_type)
                .collect();
            let count = current.len() as u32;

            if target > count {
                let last = current.iter().map(|job| job.instance).max().unwrap_or(0);
                for instance in (last + 1)..=(last + target - count) {
                    let job = build_job(release, process, instance);
                    self.schedule(&job, ctx).await?;
                }
            } else if target < count {
                // `current` is in instance order.
                for job in current.iter().rev().take((count - target) as usize) {
                    self.unschedule(job, ctx).await?;
                }
            }

            info!(
                app_id = %release.app.id,
                %process_type,
                from = count,
                to = target,
                "process scaled"
            );
        }
        Ok(())
    }

    /// Every persisted job of the app, with the scheduler's view of its unit.
    pub async fn job_states_by_app(
        &self,
        app_id: &str,
        ctx: &CallContext,
    ) -> SchedulerResult<Vec<JobState>> {
        let jobs = self.store.list_jobs(&JobQuery::app(app_id))?;
        let units: BTreeMap<String, _> = self
            .scheduler
            .job_states(app_id, ctx)
            .await?
            .into_iter()
            .map(|unit| (unit.name.clone(), unit))
            .collect();

        Ok(jobs
            .into_iter()
            .map(|job| {
                let name = job.name();
                let (machine_id, state) = match units.get(&name) {
                    Some(unit) => (unit.machine_id.clone(), unit.state.clone()),
                    None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
                };
                JobState {
                    job,
                    name,
                    machine_id,
                    state,
                }
            })
            .collect())
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn schedule(&self, job: &Job, ctx: &CallContext) -> SchedulerResult<()> {
        let name = job.name();
        self.scheduler
            .schedule(job, ctx)
            .await
            .map_err(|e| job_error("schedule", &name, e))?;
        self.store
            .put_job(job)
            .map_err(|e| job_error("schedule", &name, e.into()))?;
        debug!(job = %name, "job scheduled");
        Ok(())
    }

    async fn unschedule(&self, job: &Job, ctx: &CallContext) -> SchedulerResult<()> {
        let name = job.name();
        self.scheduler
            .unschedule(&name, ctx)
            .await
            .map_err(|e| job_error("unschedule", &name, e))?;
        self.store
            .delete_job(job)
            .map_err(|e| job_error("unschedule", &name, e.into()))?;
        debug!(job = %name, "job unscheduled");
        Ok(())
    }
}

fn job_error(action: &'static str, job: &str, source: SchedulerError) -> SchedulerError {
    SchedulerError::Job {
        action,
        job: job.to_string(),
        source: Box::new(source),
    }
}

/// Expand a release into its jobs, instances numbered from 1.
pub fn build_jobs(release: &Release) -> Vec<Job> {
    release
        .formation
        .iter()
        .flat_map(|process| {
            (1..=process.quantity).map(move |instance| build_job(release, process, instance))
        })
        .collect()
}

fn build_job(release: &Release, process: &Process, instance: u32) -> Job {
    let tag = BTreeMap::from([(RELEASE_ENV.to_string(), release.version.clone())]);
    Job {
        app_id: release.app.id.clone(),
        version: release.version.clone(),
        process_type: process.process_type.clone(),
        instance,
        image: release.app.image.clone(),
        command: process.command.clone(),
        environment: merge_maps([&release.app.env, &process.env, &tag]),
        updated_at: epoch_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeScheduler;
    use crate::scheduler::UnitState;
    use async_trait::async_trait;
    use berth_core::{App, Formation};
    use std::sync::Mutex;

    fn release(quantities: &[(&str, u32)]) -> Release {
        let formation: Formation = quantities
            .iter()
            .map(|(process_type, quantity)| Process {
                quantity: *quantity,
                ..Process::new(*process_type, vec![format!("./{process_type}")])
            })
            .collect();
        Release {
            app: App {
                id: "acme".into(),
                name: "acme".into(),
                image: "registry.local/acme:v7".into(),
                env: BTreeMap::from([("RAILS_ENV".to_string(), "production".to_string())]),
                ..App::default()
            },
            version: "v7".into(),
            formation,
        }
    }

    fn test_manager() -> (Manager, Arc<FakeScheduler>, StateStore) {
        let scheduler = Arc::new(FakeScheduler::new());
        let store = StateStore::open_in_memory().unwrap();
        let manager = Manager::new(scheduler.clone(), store.clone());
        (manager, scheduler, store)
    }

    /// Records every call, and fails `schedule` for one job name.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl JobScheduler for Recording {
        async fn schedule(&self, job: &Job, _ctx: &CallContext) -> SchedulerResult<()> {
            let name = job.name();
            self.calls.lock().unwrap().push(format!("schedule {name}"));
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(SchedulerError::not_found("machine", "none available"));
            }
            Ok(())
        }

        async fn unschedule(&self, name: &str, _ctx: &CallContext) -> SchedulerResult<()> {
            self.calls.lock().unwrap().push(format!("unschedule {name}"));
            Ok(())
        }

        async fn job_states(
            &self,
            _app_id: &str,
            _ctx: &CallContext,
        ) -> SchedulerResult<Vec<UnitState>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn jobs_carry_release_environment() {
        let jobs = build_jobs(&release(&[("web", 2), ("worker", 1)]));
        let names: Vec<String> = jobs.iter().map(Job::name).collect();
        assert_eq!(names, vec!["acme.v7.web.1", "acme.v7.web.2", "acme.v7.worker.1"]);
        assert_eq!(jobs[0].environment[RELEASE_ENV], "v7");
        assert_eq!(jobs[0].environment["RAILS_ENV"], "production");
        assert_eq!(jobs[0].image, "registry.local/acme:v7");
    }

    #[tokio::test]
    async fn schedule_release_persists_jobs() {
        let (manager, scheduler, store) = test_manager();
        let ctx = CallContext::background();
        manager
            .schedule_release(&release(&[("web", 2), ("worker", 1)]), &ctx)
            .await
            .unwrap();

        assert_eq!(store.list_jobs(&JobQuery::app("acme")).unwrap().len(), 3);
        assert_eq!(scheduler.unit_names().await.len(), 3);
    }

    #[tokio::test]
    async fn schedule_release_removes_dropped_types_and_excess() {
        let (manager, scheduler, store) = test_manager();
        let ctx = CallContext::background();
        manager
            .schedule_release(&release(&[("web", 3), ("worker", 1)]), &ctx)
            .await
            .unwrap();
        manager
            .schedule_release(&release(&[("web", 1)]), &ctx)
            .await
            .unwrap();

        let names: Vec<String> = store
            .list_jobs(&JobQuery::app("acme"))
            .unwrap()
            .iter()
            .map(Job::name)
            .collect();
        assert_eq!(names, vec!["acme.v7.web.1"]);
        assert_eq!(scheduler.unit_names().await, vec!["acme.v7.web.1"]);
    }

    #[tokio::test]
    async fn scale_up_continues_numbering() {
        let (manager, _scheduler, store) = test_manager();
        let ctx = CallContext::background();
        let release = release(&[("web", 2)]);
        manager.schedule_release(&release, &ctx).await.unwrap();

        manager
            .scale_release(&release, &BTreeMap::from([("web".to_string(), 4)]), &ctx)
            .await
            .unwrap();

        let instances: Vec<u32> = store
            .list_jobs(&JobQuery::app("acme"))
            .unwrap()
            .iter()
            .map(|job| job.instance)
            .collect();
        assert_eq!(instances, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn scale_down_removes_exactly_the_top_instances() {
        let recording = Arc::new(Recording::default());
        let store = StateStore::open_in_memory().unwrap();
        let manager = Manager::new(recording.clone(), store.clone());
        let ctx = CallContext::background();
        let release = release(&[("web", 5)]);
        manager.schedule_release(&release, &ctx).await.unwrap();
        recording.calls.lock().unwrap().clear();

        manager
            .scale_release(&release, &BTreeMap::from([("web".to_string(), 2)]), &ctx)
            .await
            .unwrap();

        assert_eq!(
            recording.calls.lock().unwrap().as_slice(),
            [
                "unschedule acme.v7.web.5",
                "unschedule acme.v7.web.4",
                "unschedule acme.v7.web.3",
            ]
        );
        assert_eq!(store.list_jobs(&JobQuery::app("acme")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scale_ignores_unknown_types() {
        let (manager, scheduler, _store) = test_manager();
        let ctx = CallContext::background();
        let release = release(&[("web", 1)]);
        manager.schedule_release(&release, &ctx).await.unwrap();
        manager
            .scale_release(&release, &BTreeMap::from([("clock".to_string(), 3)]), &ctx)
            .await
            .unwrap();
        assert_eq!(scheduler.unit_names().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_job_stops_the_release() {
        let recording = Arc::new(Recording {
            fail_on: Some("acme.v7.web.2".to_string()),
            ..Recording::default()
        });
        let store = StateStore::open_in_memory().unwrap();
        let manager = Manager::new(recording.clone(), store.clone());

        let err = manager
            .schedule_release(&release(&[("web", 3)]), &CallContext::background())
            .await
            .unwrap_err();

        match err {
            SchedulerError::Job { action, job, .. } => {
                assert_eq!(action, "schedule");
                assert_eq!(job, "acme.v7.web.2");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The first job stays scheduled and recorded.
        assert_eq!(store.list_jobs(&JobQuery::app("acme")).unwrap().len(), 1);
        assert_eq!(recording.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn job_states_fill_in_unknown_units() {
        let (manager, scheduler, _store) = test_manager();
        let ctx = CallContext::background();
        manager
            .schedule_release(&release(&[("web", 2)]), &ctx)
            .await
            .unwrap();
        scheduler.set_unit_state("acme.v7.web.1", "dead").await;
        scheduler.unschedule("acme.v7.web.2", &ctx).await.unwrap();

        let states = manager.job_states_by_app("acme", &ctx).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, "dead");
        assert_eq!(states[0].machine_id, crate::fake::FAKE_HOST);
        assert_eq!(states[1].name, "acme.v7.web.2");
        assert_eq!(states[1].state, UNKNOWN);
        assert_eq!(states[1].machine_id, UNKNOWN);
    }
}

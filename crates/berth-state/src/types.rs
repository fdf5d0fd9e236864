//! Persisted records for the Berth state store.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use berth_core::task_name;
use serde::{Deserialize, Serialize};

// ── Jobs ───────────────────────────────────────────────────────────

/// One scheduled instance of a process in a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub app_id: String,
    pub version: String,
    pub process_type: String,
    /// 1-based instance number within the process type.
    pub instance: u32,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Unix timestamp (seconds) when the job was last scheduled.
    pub updated_at: u64,
}

impl Job {
    /// Scheduler-facing name: `{app_id}.{version}.{process_type}.{instance}`.
    pub fn name(&self) -> String {
        task_name(&self.app_id, &self.version, &self.process_type, self.instance)
    }

    pub fn table_key(&self) -> String {
        job_key(&self.app_id, &self.version, &self.process_type, self.instance)
    }
}

/// Composite key for the jobs table. The instance is zero-padded so keys
/// sort numerically within a process type.
pub fn job_key(app_id: &str, version: &str, process_type: &str, instance: u32) -> String {
    format!("{app_id}/{version}/{process_type}/{instance:010}")
}

/// Selects jobs by app and, optionally, release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub app_id: String,
    pub version: Option<String>,
}

impl JobQuery {
    pub fn app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            version: None,
        }
    }

    pub fn release(app_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            version: Some(version.into()),
        }
    }

    pub(crate) fn key_prefix(&self) -> String {
        match &self.version {
            Some(version) => format!("{}/{version}/", self.app_id),
            None => format!("{}/", self.app_id),
        }
    }
}

// ── Stacks ─────────────────────────────────────────────────────────

/// Stack name assigned to an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackRecord {
    pub app_id: String,
    pub stack_name: String,
    /// Unix timestamp (seconds) when the stack name was assigned.
    pub created_at: u64,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

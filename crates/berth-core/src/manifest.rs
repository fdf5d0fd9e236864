//! Declarative application model.
//!
//! A [`Manifest`] is the full desired state of one app: its identity, the
//! release being deployed and one [`Process`] per process type. A
//! [`Release`] carries the same information as a [`Formation`] keyed by
//! process type, which is what the job reconciler works from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Process type that receives one instance by default.
pub const WEB_PROCESS: &str = "web";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Resource limits for one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub cpu_shares: u32,
    pub memory_bytes: u64,
    /// Process-count limit. Zero means unlimited.
    #[serde(default)]
    pub nproc: u32,
}

impl Default for Constraints {
    fn default() -> Self {
        Self::ONE_X
    }
}

impl Constraints {
    pub const ONE_X: Constraints = Constraints {
        cpu_shares: 256,
        memory_bytes: 512 * MB,
        nproc: 256,
    };
    pub const TWO_X: Constraints = Constraints {
        cpu_shares: 512,
        memory_bytes: GB,
        nproc: 512,
    };
    pub const PX: Constraints = Constraints {
        cpu_shares: 1024,
        memory_bytes: 6 * GB,
        nproc: 0,
    };

    /// Look up one of the named dyno sizes (`1X`, `2X`, `PX`).
    pub fn named(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "1X" => Some(Self::ONE_X),
            "2X" => Some(Self::TWO_X),
            "PX" => Some(Self::PX),
            _ => None,
        }
    }

    /// Memory limit in whole mebibytes, as cluster task definitions expect.
    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / MB
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Https { cert: String },
    Tcp,
    Ssl { cert: String },
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https { .. } => "https",
            Protocol::Tcp => "tcp",
            Protocol::Ssl { .. } => "ssl",
        }
    }

    pub fn cert(&self) -> Option<&str> {
        match self {
            Protocol::Https { cert } | Protocol::Ssl { cert } => Some(cert),
            Protocol::Http | Protocol::Tcp => None,
        }
    }
}

/// How a process is reachable from outside its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exposure {
    /// Internet-facing rather than internal.
    #[serde(default)]
    pub external: bool,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression. Scheduled processes never get a long-running service.
    Cron(String),
}

/// Configuration of one process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub process_type: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub exposure: Option<Exposure>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Process {
    pub fn new(process_type: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            process_type: process_type.into(),
            command,
            quantity: 0,
            constraints: Constraints::default(),
            exposure: None,
            schedule: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }
}

/// Full desired state of one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub app: App,
    /// Release tag, e.g. `v42`.
    pub release: String,
    pub processes: Vec<Process>,
}

impl Manifest {
    pub fn process(&self, process_type: &str) -> Option<&Process> {
        self.processes
            .iter()
            .find(|p| p.process_type == process_type)
    }

    pub fn process_mut(&mut self, process_type: &str) -> Option<&mut Process> {
        self.processes
            .iter_mut()
            .find(|p| p.process_type == process_type)
    }

    pub fn process_types(&self) -> BTreeSet<&str> {
        self.processes
            .iter()
            .map(|p| p.process_type.as_str())
            .collect()
    }

    /// App environment overlaid with the process environment.
    pub fn process_env(&self, process: &Process) -> BTreeMap<String, String> {
        merge_maps([&self.app.env, &process.env])
    }

    /// App labels overlaid with the process labels.
    pub fn process_labels(&self, process: &Process) -> BTreeMap<String, String> {
        merge_maps([&self.app.labels, &process.labels])
    }
}

/// Merge string maps left to right; later layers win on key collisions.
pub fn merge_maps<'a, I>(layers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    let mut merged = BTreeMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Process-type to process mapping for one release.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Formation(BTreeMap<String, Process>);

impl Formation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, process: Process) -> Option<Process> {
        self.0.insert(process.process_type.clone(), process)
    }

    pub fn get(&self, process_type: &str) -> Option<&Process> {
        self.0.get(process_type)
    }

    pub fn get_mut(&mut self, process_type: &str) -> Option<&mut Process> {
        self.0.get_mut(process_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build the formation for a new set of commands.
    ///
    /// Process types present in `prior` keep their quantity, constraints and
    /// exposure; new types start at the quantity found in `defaults` (zero if
    /// absent). Types missing from `commands` are dropped.
    pub fn merge(
        prior: &Formation,
        commands: &BTreeMap<String, Vec<String>>,
        defaults: &BTreeMap<String, u32>,
    ) -> Formation {
        let mut next = Formation::new();
        for (process_type, command) in commands {
            let process = match prior.get(process_type) {
                Some(existing) => Process {
                    command: command.clone(),
                    ..existing.clone()
                },
                None => Process {
                    quantity: defaults.get(process_type).copied().unwrap_or(0),
                    ..Process::new(process_type.clone(), command.clone())
                },
            };
            next.insert(process);
        }
        next
    }
}

impl FromIterator<Process> for Formation {
    fn from_iter<I: IntoIterator<Item = Process>>(iter: I) -> Self {
        let mut formation = Formation::new();
        for process in iter {
            formation.insert(process);
        }
        formation
    }
}

/// Default per-type quantities for new formations (`web = 1`).
pub fn default_quantities() -> BTreeMap<String, u32> {
    BTreeMap::from([(WEB_PROCESS.to_string(), 1)])
}

/// A released version of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub app: App,
    pub version: String,
    pub formation: Formation,
}

impl Release {
    pub fn manifest(&self) -> Manifest {
        Manifest {
            app: self.app.clone(),
            release: self.version.clone(),
            processes: self.formation.iter().cloned().collect(),
        }
    }
}

/// Lifecycle state of a running unit, normalized from cluster statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Stopped,
    /// A status this crate does not know how to classify.
    Other(String),
}

impl TaskState {
    pub fn from_cluster_status(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "PROVISIONING" | "PENDING" | "ACTIVATING" => TaskState::Pending,
            "RUNNING" => TaskState::Running,
            "DEACTIVATING" | "STOPPING" | "DEPROVISIONING" | "STOPPED" => TaskState::Stopped,
            _ => TaskState::Other(status.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Stopped => "stopped",
            TaskState::Other(s) => s,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
}

/// Observed view of one running unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Cluster-assigned task id.
    pub id: String,
    /// `{version}.{process_type}.{id}`.
    pub name: String,
    pub version: String,
    pub process_type: String,
    pub command: Vec<String>,
    pub constraints: Constraints,
    pub state: TaskState,
    /// Epoch seconds of the timestamp that matches `state`.
    pub updated_at: Option<u64>,
    pub host: Host,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn named_constraints() {
        let one = Constraints::named("1X").unwrap();
        assert_eq!(one.cpu_shares, 256);
        assert_eq!(one.memory_mib(), 512);
        assert_eq!(one.nproc, 256);

        let px = Constraints::named("px").unwrap();
        assert_eq!(px.memory_bytes, 6 * GB);
        assert_eq!(px.nproc, 0);

        assert!(Constraints::named("3X").is_none());
        assert_eq!(Constraints::default(), one);
    }

    #[test]
    fn process_env_prefers_process_values() {
        let mut manifest = Manifest {
            app: App {
                id: "1234".into(),
                name: "acme".into(),
                image: "acme:latest".into(),
                env: BTreeMap::from([
                    ("A".to_string(), "app".to_string()),
                    ("B".to_string(), "app".to_string()),
                ]),
                labels: BTreeMap::new(),
            },
            release: "v1".into(),
            processes: vec![Process::new("web", cmd("./web"))],
        };
        manifest
            .process_mut("web")
            .unwrap()
            .env
            .insert("B".into(), "process".into());

        let env = manifest.process_env(manifest.process("web").unwrap());
        assert_eq!(env["A"], "app");
        assert_eq!(env["B"], "process");
    }

    #[test]
    fn formation_merge_keeps_prior_quantities() {
        let mut prior = Formation::new();
        prior.insert(Process {
            quantity: 3,
            ..Process::new("web", cmd("./old-web"))
        });
        prior.insert(Process {
            quantity: 2,
            ..Process::new("legacy", cmd("./legacy"))
        });

        let commands = BTreeMap::from([
            ("web".to_string(), cmd("./web")),
            ("worker".to_string(), cmd("./worker")),
        ]);
        let next = Formation::merge(&prior, &commands, &default_quantities());

        assert_eq!(next.len(), 2);
        assert_eq!(next.get("web").unwrap().quantity, 3);
        assert_eq!(next.get("web").unwrap().command, cmd("./web"));
        assert_eq!(next.get("worker").unwrap().quantity, 0);
        assert!(next.get("legacy").is_none());
    }

    #[test]
    fn new_web_process_gets_default_quantity() {
        let commands = BTreeMap::from([("web".to_string(), cmd("./web"))]);
        let next = Formation::merge(&Formation::new(), &commands, &default_quantities());
        assert_eq!(next.get("web").unwrap().quantity, 1);
    }

    #[test]
    fn cluster_status_mapping() {
        assert_eq!(TaskState::from_cluster_status("PROVISIONING"), TaskState::Pending);
        assert_eq!(TaskState::from_cluster_status("PENDING"), TaskState::Pending);
        assert_eq!(TaskState::from_cluster_status("RUNNING"), TaskState::Running);
        assert_eq!(TaskState::from_cluster_status("DEPROVISIONING"), TaskState::Stopped);
        assert_eq!(TaskState::from_cluster_status("STOPPED"), TaskState::Stopped);
        assert_eq!(
            TaskState::from_cluster_status("DRAINING"),
            TaskState::Other("DRAINING".into())
        );
    }

    #[test]
    fn exposure_parses_from_toml() {
        let process: Process = toml::from_str(
            r#"
            type = "web"
            command = ["./web"]
            quantity = 2

            [exposure]
            external = true
            protocol = { type = "https", cert = "arn:cert" }
            "#,
        )
        .unwrap();
        let exposure = process.exposure.unwrap();
        assert!(exposure.external);
        assert_eq!(exposure.protocol.as_str(), "https");
        assert_eq!(exposure.protocol.cert(), Some("arn:cert"));
        assert_eq!(process.constraints, Constraints::default());
    }
}

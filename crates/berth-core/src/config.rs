//! berth.toml configuration parser.
//!
//! Every section is optional; an empty file yields a usable default config.
//!
//! ```toml
//! [cluster]
//! name = "production"
//! delimiter = "--"
//! service_role = "ecsServiceRole"
//!
//! [runtime]
//! port = 2375
//! pending_timeout = "10m"
//!
//! [stack]
//! name_prefix = "berth-"
//! wait = true
//!
//! [state]
//! data_dir = "/var/lib/berth"
//!
//! [formation.default_quantities]
//! web = 1
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::default_quantities;
use crate::naming::{NameScheme, NamingError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {source}")]
    Duration {
        field: &'static str,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid naming config: {0}")]
    Naming(#[from] NamingError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub cluster: ClusterConfig,
    pub runtime: RuntimeConfig,
    pub stack: StackConfig,
    pub state: StateConfig,
    pub formation: FormationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub delimiter: String,
    /// Role granted to services that sit behind a load balancer.
    pub service_role: Option<String>,
    /// Log driver for task containers. Runtime default when unset.
    pub log_driver: Option<String>,
    /// Wait for services to reach a steady state after scaling them down.
    pub stable_timeout: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            delimiter: crate::naming::DEFAULT_DELIMITER.to_string(),
            service_role: None,
            log_driver: None,
            stable_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Port of the container runtime API on each host.
    pub port: u16,
    /// How long an attached run may sit in a pending state.
    pub pending_timeout: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 2375,
            pending_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub name_prefix: String,
    /// Block submissions until the stack operation completes.
    pub wait: bool,
    pub timeout: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            wait: false,
            timeout: "30m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/berth"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    pub default_quantities: BTreeMap<String, u32>,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            default_quantities: default_quantities(),
        }
    }
}

impl BerthConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BerthConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.name must not be empty".into()));
        }
        self.name_scheme()?;
        self.pending_timeout()?;
        self.stable_timeout()?;
        self.stack_timeout()?;
        if self.runtime.port == 0 {
            return Err(ConfigError::Invalid("runtime.port must be non-zero".into()));
        }
        Ok(())
    }

    pub fn name_scheme(&self) -> Result<NameScheme, ConfigError> {
        Ok(NameScheme::new(self.cluster.delimiter.clone())?)
    }

    pub fn pending_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("runtime.pending_timeout", &self.runtime.pending_timeout)
    }

    pub fn stable_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("cluster.stable_timeout", &self.cluster.stable_timeout)
    }

    pub fn stack_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("stack.timeout", &self.stack.timeout)
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::Duration { field, source })
}

//! Backend settings resolved from [`BerthConfig`].

use std::time::Duration;

use berth_core::config::ConfigError;
use berth_core::{BerthConfig, NameScheme};

#[derive(Debug, Clone)]
pub struct EcsSettings {
    pub cluster: String,
    pub names: NameScheme,
    pub service_role: Option<String>,
    pub log_driver: Option<String>,
    pub stable_timeout: Duration,
    pub pending_timeout: Duration,
    pub stack_prefix: String,
    pub stack_wait: bool,
    pub stack_timeout: Duration,
}

impl Default for EcsSettings {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            names: NameScheme::default(),
            service_role: None,
            log_driver: None,
            stable_timeout: Duration::from_secs(600),
            pending_timeout: Duration::from_secs(600),
            stack_prefix: String::new(),
            stack_wait: false,
            stack_timeout: Duration::from_secs(1800),
        }
    }
}

impl EcsSettings {
    pub fn from_config(config: &BerthConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            cluster: config.cluster.name.clone(),
            names: config.name_scheme()?,
            service_role: config.cluster.service_role.clone(),
            log_driver: config.cluster.log_driver.clone(),
            stable_timeout: config.stable_timeout()?,
            pending_timeout: config.pending_timeout()?,
            stack_prefix: config.stack.name_prefix.clone(),
            stack_wait: config.stack.wait,
            stack_timeout: config.stack_timeout()?,
        })
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_from_config() {
        let config = BerthConfig::from_toml_str(
            r#"
            [cluster]
            name = "prod"
            service_role = "ecsServiceRole"

            [runtime]
            pending_timeout = "2m"

            [stack]
            name_prefix = "berth-"
            "#,
        )
        .unwrap();
        let settings = EcsSettings::from_config(&config).unwrap();
        assert_eq!(settings.cluster, "prod");
        assert_eq!(settings.service_role.as_deref(), Some("ecsServiceRole"));
        assert_eq!(settings.pending_timeout, Duration::from_secs(120));
        assert_eq!(settings.stack_prefix, "berth-");
        assert_eq!(settings.names.delimiter(), "--");
    }
}

//! Naming scheme for cluster services and scheduled jobs.
//!
//! Services owned by an app are named `{app_id}{delimiter}{process_type}`.
//! Ownership is derived from the name alone: a service whose name does not
//! split into an app id and a process type is not ours and is ignored by
//! every listing operation.

use thiserror::Error;

/// Delimiter placed between the app id and the process type.
pub const DEFAULT_DELIMITER: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    #[error("name delimiter must not be empty")]
    EmptyDelimiter,

    #[error("process type must not be empty")]
    EmptyProcessType,

    #[error("process type {process_type:?} contains the name delimiter {delimiter:?}")]
    ContainsDelimiter {
        process_type: String,
        delimiter: String,
    },

    #[error("app id {0:?} contains the name delimiter")]
    AppIdContainsDelimiter(String),
}

/// Builds and parses service names for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameScheme {
    delimiter: String,
}

impl Default for NameScheme {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

impl NameScheme {
    pub fn new(delimiter: impl Into<String>) -> Result<Self, NamingError> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(NamingError::EmptyDelimiter);
        }
        Ok(Self { delimiter })
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// `{app_id}{delimiter}{process_type}`.
    pub fn service_name(&self, app_id: &str, process_type: &str) -> String {
        format!("{app_id}{}{process_type}", self.delimiter)
    }

    /// Split a service name (or service ARN) on the first occurrence of the
    /// delimiter. Returns `None` for names that do not belong to this scheme.
    pub fn split_service_name<'a>(&self, name: &'a str) -> Option<(&'a str, &'a str)> {
        let name = resource_id(name);
        let (app_id, process_type) = name.split_once(self.delimiter.as_str())?;
        if app_id.is_empty() || process_type.is_empty() {
            return None;
        }
        Some((app_id, process_type))
    }

    /// Reject process types that would make the service name ambiguous.
    pub fn validate_process_type(&self, process_type: &str) -> Result<(), NamingError> {
        if process_type.is_empty() {
            return Err(NamingError::EmptyProcessType);
        }
        if process_type.contains(self.delimiter.as_str()) {
            return Err(NamingError::ContainsDelimiter {
                process_type: process_type.to_string(),
                delimiter: self.delimiter.clone(),
            });
        }
        Ok(())
    }

    pub fn validate_app_id(&self, app_id: &str) -> Result<(), NamingError> {
        if app_id.contains(self.delimiter.as_str()) {
            return Err(NamingError::AppIdContainsDelimiter(app_id.to_string()));
        }
        Ok(())
    }
}

/// Name of a scheduled job: `{app_id}.{version}.{process_type}.{instance}`.
pub fn task_name(app_id: &str, version: &str, process_type: &str, instance: u32) -> String {
    format!("{app_id}.{version}.{process_type}.{instance}")
}

/// The trailing resource id of an ARN-style identifier (everything after the
/// last `/`). Plain names are returned unchanged.
pub fn resource_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

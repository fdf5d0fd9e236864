pub mod batch;
pub mod config;
pub mod manifest;
pub mod naming;

pub use batch::{Page, chunked, drain, pages};
pub use config::{BerthConfig, ConfigError};
pub use manifest::*;
pub use naming::{NameScheme, NamingError, resource_id, task_name};

//! berth-state — embedded state store for the Berth control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds the records the control
//! plane owns outright: scheduled jobs and the stack name assigned to each
//! app. Everything else is read back from the cluster on demand.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Job keys
//! are `{app_id}/{version}/{process_type}/{instance:010}`, so a prefix scan
//! returns one app (or one release) in process-type then instance order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

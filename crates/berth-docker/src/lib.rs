//! berth-docker — per-host container runtime client.
//!
//! Talks to the Docker Engine API over one dedicated HTTP/1 connection per
//! session:
//!
//! - `GET /containers/json` lists containers matching a label filter
//! - `POST /containers/{id}/attach` is upgraded to a raw byte stream that
//!   carries the caller's stdin to the container and its output back
//!
//! Containers without a TTY multiplex stdout and stderr on the attached
//! stream; [`stream::demux`] splits them again.

pub mod client;
pub mod error;
pub mod stream;

pub use client::{DEFAULT_PORT, DockerClient, DockerConnector};
pub use error::{DockerError, DockerResult};
pub use stream::{StreamKind, demux};

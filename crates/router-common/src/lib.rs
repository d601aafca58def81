//! Shared, dependency-light types used across the router workspace.
//!
//! This crate intentionally does not depend on `tokio`, `async-trait`, or
//! any provider/transport crate: it is the lowest layer everyone else
//! builds on.

mod config;
mod error;
mod ids;

pub use config::{EngineConfig, EngineConfigPatch, GlobalConfigError};
pub use error::{ErrorKind, ExtraFields, RouterError};
pub use ids::{RequestId, new_request_id};

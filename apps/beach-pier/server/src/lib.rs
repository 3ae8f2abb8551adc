//! Shares one long-lived terminal process read-only with many viewers.
//!
//! The process runs under a [`supervisor::Supervisor`] that mirrors its output
//! into a screen model and fans it out to every attached viewer. Viewers that
//! fall behind are deferred and caught up with a snapshot of the screen.

pub mod config;
pub mod error;
pub mod fanout;
pub mod resync;
pub mod routes;
pub mod screen;
pub mod serializer;
pub mod service;
pub mod supervisor;
pub mod upstream;

pub use config::{Cli, ServerConfig};
pub use error::{ConfigError, ModelError, ScreenError, ServiceError, SpawnError};
pub use service::{PierService, ServiceConfig};

//! Pulse console library exports.
//!
//! A headless operator console: mounts the configured dashboard views on a
//! [`pulse_engine::SyncEngine`] backed by a REST transport and logs every
//! change until interrupted.

pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod rest;

pub use config::{ConsoleConfig, ViewConfig};
pub use console::Console;
pub use error::{ConsoleError, ConsoleResult};
pub use rest::{RestClient, RestFetcher, RestMutator};

//! keel-server: the process controller and configuration server.
//!
//! One listener serves every control session. Each session gets its own
//! parse arena and two pages from the shared pool, and talks to three
//! backends held in a [`ServerContext`]: the versioned configuration
//! store, the node process controller, and the hardware inventory.

pub mod config;
pub mod hardware;
pub mod process;
pub mod server;
mod session;

pub use config::{ConfigError, ServerConfig};
pub use hardware::{HardwareInfo, SystemHardware};
pub use process::{Launch, LocalProcesses, ProcessControl, ProcessError};
pub use server::{run, serve, ServerContext, ServerError};

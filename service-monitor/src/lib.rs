//! Keeps a host controller's system services in their policy-defined state,
//! driving whichever process supervisor manages them — the init system's CLI
//! or the local Pebble supervisor — behind one backend interface.

pub mod backend;
pub mod catalog;
pub mod error;
pub mod monitor;
pub mod service;
pub mod state;
pub mod sweeper;

pub use backend::{backend_from_env, PebbleBackend, ServiceAction, ServiceBackend, SystemdBackend};
pub use catalog::{monitor_from_env, HostServices};
pub use error::{Result, ServiceMonitorError};
pub use monitor::ServiceMonitor;
pub use service::{AlwaysOnService, Service, ToggleableService};
pub use state::{ExpectedState, ObservedState, ServiceState};
pub use sweeper::Sweeper;

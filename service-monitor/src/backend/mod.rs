pub mod pebble;
pub mod protocol;
pub mod systemd;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use pebble::PebbleBackend;
pub use systemd::SystemdBackend;

use crate::error::Result;
use crate::service::Service;
use crate::state::{ObservedState, ServiceState};

/// A control action a backend can perform on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Kill,
    Signal,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Kill => "kill",
            ServiceAction::Signal => "signal",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The abstraction over the process supervisor driving the services.
///
/// One backend is selected when the monitor is constructed and shared by all
/// services; the monitor never branches on which supervisor is in use.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Perform a control action on the service. `extra_opts` are
    /// backend-specific options (a signal name for `Signal`, unit-scoped
    /// flags for the init system).
    async fn perform_action(
        &self,
        service: &dyn Service,
        action: ServiceAction,
        extra_opts: &[&str],
    ) -> Result<()>;

    /// Query the service's current state from the supervisor.
    async fn query_state(&self, service: &dyn Service) -> Result<ServiceState>;

    /// The process token this backend reports alongside `active_state` when
    /// the service is healthy in that state. `None` when any token is fine.
    fn expected_process_state(&self, active_state: ObservedState) -> Option<&'static str>;
}

/// Pick the signal name out of a `Signal` action's extra options. Exactly one
/// `SIG*`-prefixed option must be present.
pub(crate) fn signal_from_opts<'a>(service_name: &str, extra_opts: &[&'a str]) -> Result<&'a str> {
    let mut signals = extra_opts.iter().copied().filter(|opt| opt.starts_with("SIG"));
    match (signals.next(), signals.next()) {
        (Some(signal), None) => Ok(signal),
        _ => Err(crate::error::ServiceMonitorError::ActionFailed(format!(
            "Service '{}' failed to signal: exactly one SIG*-prefixed option is required.",
            service_name
        ))),
    }
}

/// Resolve the process-wide backend from the environment: a non-empty
/// `PEBBLE` selects the local supervisor (socket at `PEBBLE_SOCKET`, default
/// `<PEBBLE>/.pebble.socket`), otherwise the init-system CLI is used.
pub fn backend_from_env() -> Arc<dyn ServiceBackend> {
    match env::var("PEBBLE") {
        Ok(root) if !root.is_empty() => {
            let socket_path = env::var("PEBBLE_SOCKET")
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(root).join(".pebble.socket"));
            Arc::new(PebbleBackend::new(socket_path))
        }
        _ => Arc::new(SystemdBackend::new()),
    }
}

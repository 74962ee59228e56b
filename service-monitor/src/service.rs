use std::sync::Mutex;

use async_trait::async_trait;

use crate::state::ExpectedState;

/// A service the monitor keeps in its policy-defined state.
///
/// Implementations describe one monitored daemon: how it is named in the
/// monitor's registry, what the init system calls it, and what the local
/// supervisor calls it. The expected state may be computed dynamically, so
/// reading it is async.
#[async_trait]
pub trait Service: Send + Sync {
    /// Display name of the service, unique per monitor instance.
    fn name(&self) -> &str;

    /// Name of the unit as understood by the init system.
    fn service_name(&self) -> &str;

    /// Name of the service as understood by the local supervisor.
    fn snap_service_name(&self) -> &str;

    /// The state this service's policy currently calls for, with an optional
    /// human-readable reason used for diagnostics.
    async fn expected_state(&self) -> (ExpectedState, Option<String>);
}

/// A service that is always expected to be running.
#[derive(Debug)]
pub struct AlwaysOnService {
    name: String,
    service_name: String,
    snap_service_name: String,
}

impl AlwaysOnService {
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        snap_service_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_name: service_name.into(),
            snap_service_name: snap_service_name.into(),
        }
    }
}

#[async_trait]
impl Service for AlwaysOnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn snap_service_name(&self) -> &str {
        &self.snap_service_name
    }

    async fn expected_state(&self) -> (ExpectedState, Option<String>) {
        (ExpectedState::On, None)
    }
}

/// A service whose policy is flipped at runtime by collaborators.
///
/// Starts out `Off`; `on()`/`off()` switch the policy and `any(reason)`
/// removes the service from monitoring entirely until it is toggled again.
#[derive(Debug)]
pub struct ToggleableService {
    name: String,
    service_name: String,
    snap_service_name: String,
    expected: Mutex<(ExpectedState, Option<String>)>,
}

impl ToggleableService {
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        snap_service_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_name: service_name.into(),
            snap_service_name: snap_service_name.into(),
            expected: Mutex::new((ExpectedState::Off, None)),
        }
    }

    /// Whether the policy currently calls for the service to be on.
    pub fn is_on(&self) -> bool {
        self.expected
            .lock()
            .map(|guard| guard.0 == ExpectedState::On)
            .unwrap_or(false)
    }

    pub fn on(&self) {
        self.set_expected(ExpectedState::On, None);
    }

    pub fn off(&self) {
        self.set_expected(ExpectedState::Off, None);
    }

    /// Stop monitoring the service, recording why.
    pub fn any(&self, reason: impl Into<String>) {
        self.set_expected(ExpectedState::Any, Some(reason.into()));
    }

    fn set_expected(&self, state: ExpectedState, reason: Option<String>) {
        if let Ok(mut guard) = self.expected.lock() {
            *guard = (state, reason);
        }
    }
}

#[async_trait]
impl Service for ToggleableService {
    fn name(&self) -> &str {
        &self.name
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn snap_service_name(&self) -> &str {
        &self.snap_service_name
    }

    async fn expected_state(&self) -> (ExpectedState, Option<String>) {
        match self.expected.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => (ExpectedState::Off, None),
        }
    }
}

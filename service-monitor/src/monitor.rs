use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, error, info, warn};

use crate::backend::{ServiceAction, ServiceBackend};
use crate::error::{Result, ServiceMonitorError};
use crate::service::Service;
use crate::state::{ExpectedState, ObservedState, ServiceState};

/// Keeps a fixed set of services in their policy-defined state.
///
/// The registry is fixed at construction, as is the backend driving the
/// host's supervisor. Corrective actions on the same service are serialized
/// through a per-service lock; different services are reconciled fully
/// concurrently.
pub struct ServiceMonitor {
    services: HashMap<String, Arc<dyn Service>>,
    service_states: Mutex<HashMap<String, ServiceState>>,
    service_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    backend: Arc<dyn ServiceBackend>,
}

impl ServiceMonitor {
    pub fn new(
        services: impl IntoIterator<Item = Arc<dyn Service>>,
        backend: Arc<dyn ServiceBackend>,
    ) -> Self {
        let services: HashMap<String, Arc<dyn Service>> = services
            .into_iter()
            .map(|service| (service.name().to_string(), service))
            .collect();
        // One lock per registered name, created up front; the set of names
        // never changes afterwards.
        let service_locks = services
            .keys()
            .map(|name| (name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            services,
            service_states: Mutex::new(HashMap::new()),
            service_locks,
            backend,
        }
    }

    /// Look up a registered service by its display name.
    pub fn get_service_by_name(&self, name: &str) -> Result<Arc<dyn Service>> {
        self.services.get(name).cloned().ok_or_else(|| {
            ServiceMonitorError::ServiceUnknown(format!("Service '{}' is not registered.", name))
        })
    }

    /// Get the service's state: the cached value, or a fresh backend query
    /// when `now` is set. Services whose policy is `Any` always report
    /// `Unknown` without touching the backend.
    pub async fn get_service_state(&self, name: &str, now: bool) -> Result<ServiceState> {
        let service = self.get_service_by_name(name)?;
        let (expected_state, _) = service.expected_state().await;
        if expected_state == ExpectedState::Any {
            return Ok(ServiceState::default());
        }
        if now {
            self.query_and_cache(&service).await
        } else {
            Ok(self.cached_state(name))
        }
    }

    /// Reconcile every registered service concurrently. A failure for one
    /// service is logged and degraded to its last-known state; it never
    /// prevents the other services from being reconciled or reported.
    pub async fn ensure_services(&self) -> HashMap<String, ServiceState> {
        let sweeps = self.services.keys().map(|name| {
            let name = name.clone();
            async move {
                match self.ensure_service(&name).await {
                    Ok(state) => (name, state),
                    Err(err) => {
                        // Action failures are already logged where they are
                        // raised.
                        if !matches!(err, ServiceMonitorError::ActionFailed(_)) {
                            error!(
                                "While monitoring service '{}' an error was encountered: {}",
                                name, err
                            );
                        }
                        let state = self.cached_state(&name);
                        (name, state)
                    }
                }
            }
        });
        join_all(sweeps).await.into_iter().collect()
    }

    /// Ensure one service is in its policy-defined state.
    pub async fn ensure_service(&self, name: &str) -> Result<ServiceState> {
        let service = self.get_service_by_name(name)?;
        self.ensure(&service).await
    }

    /// Restart the service. Only services whose policy calls for them to be
    /// on may be restarted; `if_on` turns the policy violation into a silent
    /// no-op (returning `None`) instead of `ServiceNotOn`.
    pub async fn restart_service(&self, name: &str, if_on: bool) -> Result<Option<ServiceState>> {
        let service = self.get_service_by_name(name)?;
        let (expected_state, _) = service.expected_state().await;
        if expected_state != ExpectedState::On {
            if if_on {
                return Ok(None);
            }
            return Err(ServiceMonitorError::ServiceNotOn(format!(
                "Service '{}' is not expected to be on, unable to restart.",
                service.service_name()
            )));
        }
        self.perform_service_action(service.as_ref(), ServiceAction::Restart, &[])
            .await?;

        let state = self.query_and_cache(&service).await?;
        if state.active_state != ObservedState::On {
            let error_msg = format!(
                "Service '{}' failed to restart. Its current state is '{}' and '{}'.",
                service.service_name(),
                state.active_state,
                state.process_state.as_deref().unwrap_or("unknown")
            );
            error!("{}", error_msg);
            return Err(ServiceMonitorError::ActionFailed(error_msg));
        }
        info!(
            "Service '{}' has been restarted. Its current state is '{}' and '{}'.",
            service.service_name(),
            state.active_state,
            state.process_state.as_deref().unwrap_or("unknown")
        );
        Ok(Some(state))
    }

    /// Reload the service's configuration. The service is first brought to
    /// its running state; the reload is only issued once it is actually on.
    pub async fn reload_service(&self, name: &str, if_on: bool) -> Result<()> {
        let service = self.get_service_by_name(name)?;
        let (expected_state, _) = service.expected_state().await;
        if expected_state != ExpectedState::On {
            if if_on {
                return Ok(());
            }
            return Err(ServiceMonitorError::ServiceNotOn(format!(
                "Service '{}' is not expected to be on, unable to reload.",
                service.service_name()
            )));
        }
        let state = self.ensure(&service).await?;
        if state.active_state != ObservedState::On {
            return Err(ServiceMonitorError::ActionFailed(format!(
                "Service '{}' is not running and could not be started to perform the reload. \
                 Its current state is '{}' and '{}'.",
                service.service_name(),
                state.active_state,
                state.process_state.as_deref().unwrap_or("unknown")
            )));
        }
        self.perform_service_action(service.as_ref(), ServiceAction::Reload, &[])
            .await
    }

    /// Hard-kill the service's processes, then re-converge it to its
    /// policy-defined state. The kill itself is best-effort; its failure is
    /// logged and swallowed.
    pub async fn kill_service(&self, name: &str) -> Result<ServiceState> {
        let service = self.get_service_by_name(name)?;
        if let Err(err) = self
            .perform_service_action(service.as_ref(), ServiceAction::Kill, &["-s", "SIGKILL"])
            .await
        {
            warn!(
                "Service '{}' failed to be killed, ensuring state anyway: {}",
                service.service_name(),
                err
            );
        }
        self.ensure(&service).await
    }

    fn cached_state(&self, name: &str) -> ServiceState {
        self.service_states
            .lock()
            .map(|states| states.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Query the backend and overwrite the cached state on success.
    async fn query_and_cache(&self, service: &Arc<dyn Service>) -> Result<ServiceState> {
        let state = self.backend.query_state(service.as_ref()).await?;
        if let Ok(mut states) = self.service_states.lock() {
            states.insert(service.name().to_string(), state.clone());
        }
        Ok(state)
    }

    /// Run the action under the service's lock so conflicting actions on the
    /// same service never overlap.
    async fn perform_service_action(
        &self,
        service: &dyn Service,
        action: ServiceAction,
        extra_opts: &[&str],
    ) -> Result<()> {
        let lock = self
            .service_locks
            .get(service.name())
            .cloned()
            .ok_or_else(|| {
                ServiceMonitorError::ServiceUnknown(format!(
                    "Service '{}' is not registered.",
                    service.name()
                ))
            })?;
        let _guard = lock.lock().await;
        self.backend
            .perform_action(service, action, extra_opts)
            .await
    }

    async fn ensure(&self, service: &Arc<dyn Service>) -> Result<ServiceState> {
        let (expected_state, reason) = service.expected_state().await;
        if expected_state == ExpectedState::Any {
            debug!(
                "Service '{}' is not being monitored{}",
                service.service_name(),
                reason
                    .as_deref()
                    .map(|reason| format!(". Reason: {}", reason))
                    .unwrap_or_else(|| ".".to_string())
            );
            return Ok(ServiceState::default());
        }
        let acceptable_states: &[ObservedState] = match expected_state {
            ExpectedState::On => &[ObservedState::On],
            ExpectedState::Off => &[ObservedState::Off, ObservedState::Dead],
            ExpectedState::Dead => &[ObservedState::Dead],
            ExpectedState::Any => &[],
        };

        let state = self.query_and_cache(service).await?;
        if acceptable_states.contains(&state.active_state) {
            match self.backend.expected_process_state(state.active_state) {
                Some(expected_process)
                    if state.process_state.as_deref() != Some(expected_process) =>
                {
                    warn!(
                        "Service '{}' is {} but not in the expected state of '{}', \
                         its current state is '{}' and '{}'.",
                        service.service_name(),
                        state.active_state,
                        expected_process,
                        state.active_state,
                        state.process_state.as_deref().unwrap_or("unknown")
                    );
                }
                _ => {
                    debug!(
                        "Service '{}' is {} and '{}'.",
                        service.service_name(),
                        state.active_state,
                        state.process_state.as_deref().unwrap_or("unknown")
                    );
                }
            }
            return Ok(state);
        }

        let (action, log_action) = match expected_state {
            ExpectedState::On => (ServiceAction::Start, "started"),
            ExpectedState::Off => (ServiceAction::Stop, "stopped"),
            _ => {
                // There is no action that produces a dead service.
                warn!(
                    "Service '{}' is expected to be {} but is '{}'; \
                     no corrective action is available.",
                    service.service_name(),
                    expected_state,
                    state.active_state
                );
                return Ok(state);
            }
        };
        info!(
            "Service '{}' is not {}, it will be {}.",
            service.service_name(),
            expected_state,
            log_action
        );

        self.perform_service_action(service.as_ref(), action, &[])
            .await?;

        // Check that the service has reached its target state.
        let state = self.query_and_cache(service).await?;
        if !acceptable_states.contains(&state.active_state) {
            let error_msg = format!(
                "Service '{}' failed to {}. Its current state is '{}' and '{}'.",
                service.service_name(),
                action,
                state.active_state,
                state.process_state.as_deref().unwrap_or("unknown")
            );
            error!("{}", error_msg);
            return Err(ServiceMonitorError::ActionFailed(error_msg));
        }
        info!(
            "Service '{}' has been {} and is '{}'.",
            service.service_name(),
            log_action,
            state.process_state.as_deref().unwrap_or("unknown")
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{AlwaysOnService, ToggleableService};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    enum Scripted {
        State(ServiceState),
        Fail(String),
    }

    /// Records every action and serves scripted status-query results,
    /// keyed by the service's display name.
    struct MockBackend {
        actions: Mutex<Vec<(String, String, Vec<String>)>>,
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        queries: Mutex<Vec<String>>,
        fail_actions: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                actions: Mutex::new(Vec::new()),
                scripts: Mutex::new(HashMap::new()),
                queries: Mutex::new(Vec::new()),
                fail_actions: false,
            }
        }

        fn failing_actions() -> Self {
            Self {
                fail_actions: true,
                ..Self::new()
            }
        }

        fn script(&self, name: &str, states: Vec<Scripted>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(name.to_string(), states.into());
        }

        fn script_states(&self, name: &str, states: Vec<ServiceState>) {
            self.script(name, states.into_iter().map(Scripted::State).collect());
        }

        fn actions(&self) -> Vec<(String, String, Vec<String>)> {
            self.actions.lock().unwrap().clone()
        }

        fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ServiceBackend for MockBackend {
        async fn perform_action(
            &self,
            service: &dyn Service,
            action: ServiceAction,
            extra_opts: &[&str],
        ) -> crate::error::Result<()> {
            self.actions.lock().unwrap().push((
                service.name().to_string(),
                action.to_string(),
                extra_opts.iter().map(|opt| opt.to_string()).collect(),
            ));
            if self.fail_actions {
                return Err(ServiceMonitorError::ActionFailed(format!(
                    "Service '{}' failed to {}: injected failure",
                    service.name(),
                    action
                )));
            }
            Ok(())
        }

        async fn query_state(&self, service: &dyn Service) -> crate::error::Result<ServiceState> {
            self.queries
                .lock()
                .unwrap()
                .push(service.name().to_string());
            let mut scripts = self.scripts.lock().unwrap();
            match scripts
                .get_mut(service.name())
                .and_then(|script| script.pop_front())
            {
                Some(Scripted::State(state)) => Ok(state),
                Some(Scripted::Fail(message)) => {
                    Err(ServiceMonitorError::ParsingFailed(message))
                }
                None => Ok(ServiceState::default()),
            }
        }

        fn expected_process_state(&self, active_state: ObservedState) -> Option<&'static str> {
            match active_state {
                ObservedState::On => Some("running"),
                ObservedState::Off => Some("dead"),
                _ => None,
            }
        }
    }

    fn on_state() -> ServiceState {
        ServiceState::new(ObservedState::On, Some("running".into()))
    }

    fn off_state() -> ServiceState {
        ServiceState::new(ObservedState::Off, Some("dead".into()))
    }

    fn dead_state() -> ServiceState {
        ServiceState::new(ObservedState::Dead, Some("Result: exit-code".into()))
    }

    fn monitor_with(
        services: Vec<Arc<dyn Service>>,
        backend: Arc<MockBackend>,
    ) -> ServiceMonitor {
        let _ = env_logger::builder().is_test(true).try_init();
        ServiceMonitor::new(services, backend)
    }

    #[tokio::test]
    async fn unknown_name_is_rejected_everywhere() {
        let backend = Arc::new(MockBackend::new());
        let monitor = monitor_with(vec![], backend.clone());

        assert!(matches!(
            monitor.get_service_by_name("ghost"),
            Err(ServiceMonitorError::ServiceUnknown(_))
        ));
        assert!(matches!(
            monitor.ensure_service("ghost").await,
            Err(ServiceMonitorError::ServiceUnknown(_))
        ));
        assert!(matches!(
            monitor.get_service_state("ghost", true).await,
            Err(ServiceMonitorError::ServiceUnknown(_))
        ));
        assert!(matches!(
            monitor.restart_service("ghost", false).await,
            Err(ServiceMonitorError::ServiceUnknown(_))
        ));
        assert_eq!(backend.query_count(), 0);
    }

    #[tokio::test]
    async fn expected_on_and_running_takes_no_action() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("ntp", vec![on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("ntp", "chrony", "ntp"))],
            backend.clone(),
        );

        let state = monitor.ensure_service("ntp").await.unwrap();
        assert_eq!(state, on_state());
        assert!(backend.actions().is_empty());
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn expected_off_accepts_both_off_and_dead() {
        for observed in [off_state(), dead_state()] {
            let backend = Arc::new(MockBackend::new());
            backend.script_states("dhcpd", vec![observed.clone()]);
            let monitor = monitor_with(
                vec![Arc::new(ToggleableService::new("dhcpd", "dhcpd", "dhcpd"))],
                backend.clone(),
            );

            let state = monitor.ensure_service("dhcpd").await.unwrap();
            assert_eq!(state, observed);
            assert!(backend.actions().is_empty(), "no corrective action expected");
        }
    }

    /// Reconciliation takes corrective action and re-checks.
    ///
    /// A service expected on but observed stopped gets a `start`; the
    /// re-query confirms convergence and the new state is returned.
    #[tokio::test]
    async fn expected_on_but_stopped_gets_started() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dns", vec![off_state(), on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        let state = monitor.ensure_service("dns").await.unwrap();
        assert_eq!(state, on_state());
        assert_eq!(
            backend.actions(),
            vec![("dns".to_string(), "start".to_string(), vec![])]
        );
        assert_eq!(backend.query_count(), 2);
    }

    #[tokio::test]
    async fn failed_convergence_surfaces_action_error() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dns", vec![dead_state(), dead_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        let err = monitor.ensure_service("dns").await.unwrap_err();
        assert!(matches!(err, ServiceMonitorError::ActionFailed(_)));
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn running_service_with_off_policy_gets_stopped() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dhcpd", vec![on_state(), off_state()]);
        let service = Arc::new(ToggleableService::new("dhcpd", "dhcpd", "dhcpd"));
        let monitor = monitor_with(vec![service.clone()], backend.clone());

        let state = monitor.ensure_service("dhcpd").await.unwrap();
        assert_eq!(state, off_state());
        assert_eq!(
            backend.actions(),
            vec![("dhcpd".to_string(), "stop".to_string(), vec![])]
        );
    }

    #[tokio::test]
    async fn any_expectation_short_circuits_to_unknown() {
        let backend = Arc::new(MockBackend::new());
        let service = Arc::new(ToggleableService::new("dhcpd", "dhcpd", "dhcpd"));
        service.any("managed by the region");
        let monitor = monitor_with(vec![service], backend.clone());

        let state = monitor.ensure_service("dhcpd").await.unwrap();
        assert_eq!(state.active_state, ObservedState::Unknown);
        let state = monitor.get_service_state("dhcpd", true).await.unwrap();
        assert_eq!(state.active_state, ObservedState::Unknown);
        assert_eq!(backend.query_count(), 0);
        assert!(backend.actions().is_empty());
    }

    #[tokio::test]
    async fn restart_refused_when_policy_is_off() {
        let backend = Arc::new(MockBackend::new());
        let monitor = monitor_with(
            vec![Arc::new(ToggleableService::new("dhcpd", "dhcpd", "dhcpd"))],
            backend.clone(),
        );

        let err = monitor.restart_service("dhcpd", false).await.unwrap_err();
        assert!(matches!(err, ServiceMonitorError::ServiceNotOn(_)));
        assert!(backend.actions().is_empty());

        // With if_on the refusal becomes a silent no-op.
        let state = monitor.restart_service("dhcpd", true).await.unwrap();
        assert_eq!(state, None);
        assert!(backend.actions().is_empty());
    }

    #[tokio::test]
    async fn restart_requires_post_action_on() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dns", vec![on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        let state = monitor.restart_service("dns", false).await.unwrap();
        assert_eq!(state, Some(on_state()));
        assert_eq!(
            backend.actions(),
            vec![("dns".to_string(), "restart".to_string(), vec![])]
        );

        backend.script_states("dns", vec![dead_state()]);
        let err = monitor.restart_service("dns", false).await.unwrap_err();
        assert!(matches!(err, ServiceMonitorError::ActionFailed(_)));
        assert!(err.to_string().contains("failed to restart"));
    }

    #[tokio::test]
    async fn reload_ensures_running_first() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dns", vec![on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        monitor.reload_service("dns", false).await.unwrap();
        assert_eq!(
            backend.actions(),
            vec![("dns".to_string(), "reload".to_string(), vec![])]
        );
    }

    #[tokio::test]
    async fn reload_fails_when_service_cannot_start() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("dns", vec![off_state(), off_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        let err = monitor.reload_service("dns", false).await.unwrap_err();
        assert!(matches!(err, ServiceMonitorError::ActionFailed(_)));
        // ensure issued the start; the reload itself never went out.
        assert_eq!(
            backend.actions(),
            vec![("dns".to_string(), "start".to_string(), vec![])]
        );
    }

    #[tokio::test]
    async fn kill_failure_is_swallowed_and_state_restored() {
        let backend = Arc::new(MockBackend::failing_actions());
        backend.script_states("dns", vec![on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("dns", "bind9", "dns"))],
            backend.clone(),
        );

        let state = monitor.kill_service("dns").await.unwrap();
        assert_eq!(state, on_state());
        let actions = backend.actions();
        assert_eq!(actions[0].1, "kill");
        assert_eq!(actions[0].2, vec!["-s".to_string(), "SIGKILL".to_string()]);
    }

    /// One failing service never poisons the sweep.
    ///
    /// The sweep fans out over every registered service; the service whose
    /// status query blows up is reported with its last-known (default)
    /// state while the healthy one is reconciled normally.
    #[tokio::test]
    async fn ensure_services_degrades_failures_to_cached_state() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("ntp", vec![on_state()]);
        backend.script(
            "dns",
            vec![Scripted::Fail("unparseable status output".into())],
        );
        let monitor = monitor_with(
            vec![
                Arc::new(AlwaysOnService::new("ntp", "chrony", "ntp")),
                Arc::new(AlwaysOnService::new("dns", "bind9", "dns")),
            ],
            backend.clone(),
        );

        let states = monitor.ensure_services().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states["ntp"], on_state());
        assert_eq!(states["dns"], ServiceState::default());
    }

    #[tokio::test]
    async fn cache_is_lazy_and_only_updated_by_real_queries() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("ntp", vec![on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("ntp", "chrony", "ntp"))],
            backend.clone(),
        );

        // Unobserved: the default state, no backend traffic.
        let state = monitor.get_service_state("ntp", false).await.unwrap();
        assert_eq!(state, ServiceState::default());
        assert_eq!(backend.query_count(), 0);

        // A real query overwrites the cache.
        let state = monitor.get_service_state("ntp", true).await.unwrap();
        assert_eq!(state, on_state());
        assert_eq!(backend.query_count(), 1);

        let state = monitor.get_service_state("ntp", false).await.unwrap();
        assert_eq!(state, on_state());
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn repeated_ensure_is_idempotent_with_one_query_each() {
        let backend = Arc::new(MockBackend::new());
        backend.script_states("ntp", vec![on_state(), on_state()]);
        let monitor = monitor_with(
            vec![Arc::new(AlwaysOnService::new("ntp", "chrony", "ntp"))],
            backend.clone(),
        );

        let first = monitor.ensure_service("ntp").await.unwrap();
        let second = monitor.ensure_service("ntp").await.unwrap();
        assert_eq!(first, second);
        assert!(backend.actions().is_empty());
        assert_eq!(backend.query_count(), 2);
    }
}

//! The fixed set of host-controller services the monitor is deployed with.

use std::sync::Arc;

use crate::backend::backend_from_env;
use crate::monitor::ServiceMonitor;
use crate::service::{AlwaysOnService, Service, ToggleableService};

/// The standard service set.
///
/// The DHCP daemons are toggleable: they stay off until the controller has a
/// configuration for them, and collaborators holding this set flip them as
/// configuration comes and goes. Everything else is expected to run whenever
/// the controller runs. Each entry carries the unit name the init system
/// knows and the name the local supervisor knows.
pub struct HostServices {
    pub dhcpd: Arc<ToggleableService>,
    pub dhcpd6: Arc<ToggleableService>,
    always_on: Vec<Arc<AlwaysOnService>>,
}

impl HostServices {
    pub fn new() -> Self {
        Self {
            dhcpd: Arc::new(ToggleableService::new("dhcpd", "dhcpd", "dhcpd")),
            dhcpd6: Arc::new(ToggleableService::new("dhcpd6", "dhcpd6", "dhcpd6")),
            always_on: vec![
                Arc::new(AlwaysOnService::new("dns", "bind9", "dns")),
                Arc::new(AlwaysOnService::new("ntp", "chrony", "ntp")),
                Arc::new(AlwaysOnService::new("proxy", "squid", "proxy")),
                Arc::new(AlwaysOnService::new("syslog", "rsyslog", "syslog")),
                Arc::new(AlwaysOnService::new("http", "nginx", "http")),
            ],
        }
    }

    /// Every service in the set.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        let mut services: Vec<Arc<dyn Service>> =
            vec![self.dhcpd.clone(), self.dhcpd6.clone()];
        services.extend(
            self.always_on
                .iter()
                .map(|service| service.clone() as Arc<dyn Service>),
        );
        services
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::new()
    }
}

/// Construct the process-wide monitor: the standard service set driven by
/// the backend the environment selects.
pub fn monitor_from_env() -> ServiceMonitor {
    ServiceMonitor::new(HostServices::new().services(), backend_from_env())
}

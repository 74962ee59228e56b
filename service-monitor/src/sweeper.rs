use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::{interval, MissedTickBehavior};

use crate::monitor::ServiceMonitor;

/// Drives the monitor's best-effort sweep on a fixed cadence.
///
/// The embedding daemon spawns `run()` as a task and aborts it on shutdown.
/// Individual service failures degrade inside `ensure_services`, so the loop
/// itself never exits on its own.
pub struct Sweeper {
    monitor: Arc<ServiceMonitor>,
    sweep_interval: Duration,
}

impl Sweeper {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(monitor: Arc<ServiceMonitor>) -> Self {
        Self {
            monitor,
            sweep_interval: Self::DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(monitor: Arc<ServiceMonitor>, sweep_interval: Duration) -> Self {
        Self {
            monitor,
            sweep_interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let states = self.monitor.ensure_services().await;
            debug!("Reconciliation sweep covered {} services.", states.len());
        }
    }
}

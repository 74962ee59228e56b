use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::backend::{ServiceAction, ServiceBackend};
use crate::error::{Result, ServiceMonitorError};
use crate::service::Service;
use crate::state::{ObservedState, ServiceState};

/// Drives services through the init system's CLI.
///
/// Every action becomes a privileged `systemctl` invocation. Attempts are
/// bounded: an invocation that exceeds `action_timeout` is cancelled and
/// retried up to `tries` times before the action fails.
pub struct SystemdBackend {
    action_timeout: Duration,
    tries: u32,
}

impl SystemdBackend {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_TRIES: u32 = 3;

    pub fn new() -> Self {
        Self {
            action_timeout: Self::DEFAULT_TIMEOUT,
            tries: Self::DEFAULT_TRIES,
        }
    }

    pub fn with_limits(action_timeout: Duration, tries: u32) -> Self {
        Self {
            action_timeout,
            tries,
        }
    }

    /// Run `sudo --non-interactive systemctl <verb> [opts] <unit>` and return
    /// `(exit_code, combined_output, stderr)`.
    async fn exec_systemctl(
        &self,
        unit: &str,
        verb: &str,
        opts: &[&str],
        action: &str,
    ) -> Result<(i32, String, String)> {
        for attempt in 1..=self.tries {
            let mut cmd = Command::new("sudo");
            cmd.arg("--non-interactive").arg("systemctl").arg(verb);
            cmd.args(opts);
            cmd.arg(unit);
            // systemctl output gets parsed; force a predictable locale.
            cmd.env("LANG", "C.UTF-8");
            cmd.env("LC_ALL", "C.UTF-8");
            cmd.stdin(Stdio::null());
            cmd.kill_on_drop(true);

            match timeout(self.action_timeout, cmd.output()).await {
                Ok(Ok(output)) => {
                    let code = output.status.code().unwrap_or(-1);
                    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    return Ok((code, stdout, stderr));
                }
                Ok(Err(err)) => {
                    return Err(ServiceMonitorError::ActionFailed(format!(
                        "Service '{}' failed to {}: unable to execute systemctl: {}",
                        unit, action, err
                    )));
                }
                Err(_) => {
                    warn!(
                        "systemctl {} for service '{}' timed out after {:?} (attempt {} of {}).",
                        verb, unit, self.action_timeout, attempt, self.tries
                    );
                }
            }
        }
        Err(ServiceMonitorError::ActionFailed(format!(
            "Service '{}' failed to {}: systemctl timed out after {:?} on each of {} tries.",
            unit, action, self.action_timeout, self.tries
        )))
    }
}

#[async_trait]
impl ServiceBackend for SystemdBackend {
    async fn perform_action(
        &self,
        service: &dyn Service,
        action: ServiceAction,
        extra_opts: &[&str],
    ) -> Result<()> {
        let unit = service.service_name();
        // systemctl has no "signal" verb; a generic signal is a scoped kill.
        let (verb, opts) = match action {
            ServiceAction::Signal => {
                let signal = super::signal_from_opts(unit, extra_opts)?;
                ("kill", vec!["-s", signal])
            }
            other => (other.as_str(), extra_opts.to_vec()),
        };
        let (code, _stdout, stderr) = self
            .exec_systemctl(unit, verb, &opts, action.as_str())
            .await?;
        if code != 0 {
            let error_msg = format!(
                "Service '{}' failed to {}: {}",
                unit,
                action,
                stderr.trim()
            );
            error!("{}", error_msg);
            return Err(ServiceMonitorError::ActionFailed(error_msg));
        }
        Ok(())
    }

    async fn query_state(&self, service: &dyn Service) -> Result<ServiceState> {
        let unit = service.service_name();
        // The exit code is ignored here: systemctl status is non-zero for
        // anything other than an active unit.
        let (_code, stdout, stderr) = self.exec_systemctl(unit, "status", &[], "status").await?;
        let output = format!("{}\n{}", stdout, stderr);
        parse_status_output(unit, &output)
    }

    fn expected_process_state(&self, active_state: ObservedState) -> Option<&'static str> {
        match active_state {
            ObservedState::On => Some("running"),
            ObservedState::Off => Some("dead"),
            _ => None,
        }
    }
}

fn systemd_to_state(token: &str) -> Option<ObservedState> {
    match token {
        "active" => Some(ObservedState::On),
        "inactive" => Some(ObservedState::Off),
        "failed" => Some(ObservedState::Dead),
        "reloading" => Some(ObservedState::Dead),
        "activating" => Some(ObservedState::Dead),
        "deactivating" => Some(ObservedState::Off),
        _ => None,
    }
}

/// Parse `systemctl status` output.
///
/// A running unit reports, among other lines:
///   Loaded: loaded (/lib/systemd/system/chrony.service; enabled; ...)
///   Active: active (running) since Fri 2026-01-16 15:08:26 UTC; 7s ago
/// a stopped one `Active: inactive (dead)`, and a crashed one
/// `Active: failed (Result: exit-code) since ...`. A unit systemd does not
/// know reports `Loaded: not-found (Reason: No such file or directory)`.
fn parse_status_output(unit: &str, output: &str) -> Result<ServiceState> {
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Loaded") {
            let load_state = line.split_whitespace().nth(1).unwrap_or("");
            if load_state != "loaded" {
                return Err(ServiceMonitorError::ServiceUnknown(format!(
                    "Service '{}' is unknown to systemd.",
                    unit
                )));
            }
        }
        if line.starts_with("Active") {
            let mut parts = line.splitn(3, ' ');
            parts.next();
            let active = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("");
            let process_state = rest
                .trim_start_matches('(')
                .split(')')
                .next()
                .unwrap_or("")
                .to_string();
            let Some(active_state) = systemd_to_state(active) else {
                return Err(ServiceMonitorError::ParsingFailed(format!(
                    "Unable to parse the active state from systemd for service '{}', \
                     active state reported as '{}'.",
                    unit, active
                )));
            };
            return Ok(ServiceState::new(active_state, Some(process_state)));
        }
    }
    Err(ServiceMonitorError::ParsingFailed(format!(
        "Unable to parse the output from systemd for service '{}'.",
        unit
    )))
}

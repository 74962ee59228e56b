use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use log::error;
use tokio::time::{sleep, timeout};

use crate::backend::protocol::{
    ChangeResponse, ResponseEnvelope, ServicesRequest, ServicesStatusResponse, SignalsRequest,
};
use crate::backend::{ServiceAction, ServiceBackend};
use crate::error::{Result, ServiceMonitorError};
use crate::service::Service;
use crate::state::{ObservedState, ServiceState};

/// Drives services through the local Pebble supervisor.
///
/// One pooled HTTP client is bound to the supervisor's Unix socket when the
/// backend is constructed and reused for every call. Actions whose response
/// is `"async"` are polled to completion through the changes endpoint, the
/// whole wait bounded by `action_timeout`.
pub struct PebbleBackend {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
    action_timeout: Duration,
    poll_interval: Duration,
}

impl PebbleBackend {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            action_timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Self::POLL_INTERVAL,
        }
    }

    /// Override the async-change wait bound and poll cadence.
    pub fn with_timeouts(
        socket_path: impl Into<PathBuf>,
        action_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            action_timeout,
            poll_interval,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
        service: &str,
        action: &str,
    ) -> Result<(StatusCode, Bytes)> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, endpoint).into();
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|err| {
                ServiceMonitorError::ActionFailed(format!(
                    "Service '{}' failed to {}: could not build supervisor request: {}",
                    service, action, err
                ))
            })?;
        let response = self.client.request(request).await.map_err(|err| {
            ServiceMonitorError::ActionFailed(format!(
                "Service '{}' failed to {}: supervisor request failed: {}",
                service, action, err
            ))
        })?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| {
                ServiceMonitorError::ActionFailed(format!(
                    "Service '{}' failed to {}: reading supervisor response failed: {}",
                    service, action, err
                ))
            })?
            .to_bytes();
        Ok((status, bytes))
    }

    /// Poll `GET /v1/changes/{id}` until the change is ready. The caller
    /// bounds the overall wait.
    async fn wait_on_change(
        &self,
        change_id: &str,
        service: &str,
        action: ServiceAction,
    ) -> Result<()> {
        let endpoint = format!("/v1/changes/{}", change_id);
        loop {
            let (status, body) = self
                .request(Method::GET, &endpoint, None, service, action.as_str())
                .await?;
            if !status.is_success() {
                return Err(ServiceMonitorError::ActionFailed(format!(
                    "Service '{}' failed to {}: supervisor returned HTTP {} while polling change {}.",
                    service,
                    action,
                    status.as_u16(),
                    change_id
                )));
            }
            let response: ChangeResponse = serde_json::from_slice(&body).map_err(|err| {
                ServiceMonitorError::ParsingFailed(format!(
                    "Unable to parse change {} from the supervisor for service '{}': {}",
                    change_id, service, err
                ))
            })?;
            let change = response.result;
            if let Some(err) = change.err.as_deref().filter(|err| !err.is_empty()) {
                return Err(ServiceMonitorError::ActionFailed(format!(
                    "Service '{}' failed to {}: change {} reported: {}",
                    service, action, change_id, err
                )));
            }
            if change.ready {
                return match change.status.as_str() {
                    "Error" | "Hold" | "Undone" => Err(ServiceMonitorError::ActionFailed(format!(
                        "Service '{}' failed to {}: change {} finished with status '{}'.",
                        service, action, change_id, change.status
                    ))),
                    _ => Ok(()),
                };
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ServiceBackend for PebbleBackend {
    async fn perform_action(
        &self,
        service: &dyn Service,
        action: ServiceAction,
        extra_opts: &[&str],
    ) -> Result<()> {
        let name = service.snap_service_name();
        let (endpoint, body) = match action {
            ServiceAction::Start | ServiceAction::Stop | ServiceAction::Restart => (
                "/v1/services",
                serde_json::to_vec(&ServicesRequest {
                    action: action.as_str(),
                    services: vec![name],
                }),
            ),
            // Pebble has no unconditional kill; stop escalates
            // SIGTERM -> SIGKILL on its own.
            ServiceAction::Kill => (
                "/v1/services",
                serde_json::to_vec(&ServicesRequest {
                    action: "stop",
                    services: vec![name],
                }),
            ),
            ServiceAction::Reload => (
                "/v1/signals",
                serde_json::to_vec(&SignalsRequest {
                    signal: "SIGHUP",
                    services: vec![name],
                }),
            ),
            ServiceAction::Signal => {
                let signal = super::signal_from_opts(name, extra_opts)?;
                (
                    "/v1/signals",
                    serde_json::to_vec(&SignalsRequest {
                        signal,
                        services: vec![name],
                    }),
                )
            }
        };
        let body = body.map_err(|err| {
            ServiceMonitorError::ActionFailed(format!(
                "Service '{}' failed to {}: could not encode supervisor request: {}",
                name, action, err
            ))
        })?;

        let (status, response_body) = self
            .request(Method::POST, endpoint, Some(body), name, action.as_str())
            .await?;
        if !status.is_success() {
            let error_msg = format!(
                "Service '{}' failed to {}: supervisor returned HTTP {}: {}",
                name,
                action,
                status.as_u16(),
                String::from_utf8_lossy(&response_body).trim()
            );
            error!("{}", error_msg);
            return Err(ServiceMonitorError::ActionFailed(error_msg));
        }

        let envelope: ResponseEnvelope = serde_json::from_slice(&response_body).map_err(|err| {
            ServiceMonitorError::ParsingFailed(format!(
                "Unable to parse the supervisor response for service '{}': {}",
                name, err
            ))
        })?;
        if envelope.kind == "async" {
            let Some(change_id) = envelope.change else {
                return Err(ServiceMonitorError::ParsingFailed(format!(
                    "Async supervisor response for service '{}' carried no change id.",
                    name
                )));
            };
            match timeout(
                self.action_timeout,
                self.wait_on_change(&change_id, name, action),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ServiceMonitorError::ActionTimedOut {
                        service: name.to_string(),
                        action: action.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn query_state(&self, service: &dyn Service) -> Result<ServiceState> {
        let name = service.snap_service_name();
        let endpoint = format!("/v1/services?names={}", name);
        let (status, body) = self
            .request(Method::GET, &endpoint, None, name, "status")
            .await?;
        if !status.is_success() {
            return Err(ServiceMonitorError::ActionFailed(format!(
                "Service '{}' failed to status: supervisor returned HTTP {}: {}",
                name,
                status.as_u16(),
                String::from_utf8_lossy(&body).trim()
            )));
        }
        let response: ServicesStatusResponse = serde_json::from_slice(&body).map_err(|err| {
            ServiceMonitorError::ParsingFailed(format!(
                "Unable to parse the status response from the supervisor for service '{}': {}",
                name, err
            ))
        })?;
        let [entry] = &response.result[..] else {
            return Err(ServiceMonitorError::ParsingFailed(format!(
                "Expected exactly one status entry for service '{}', supervisor returned {}.",
                name,
                response.result.len()
            )));
        };
        let Some((active_state, process_state)) = pebble_to_state(&entry.current) else {
            return Err(ServiceMonitorError::ParsingFailed(format!(
                "Unable to parse the active state from the supervisor for service '{}', \
                 active state reported as '{}'.",
                name, entry.current
            )));
        };
        Ok(ServiceState::new(
            active_state,
            Some(process_state.to_string()),
        ))
    }

    fn expected_process_state(&self, active_state: ObservedState) -> Option<&'static str> {
        match active_state {
            ObservedState::On => Some("running"),
            ObservedState::Off => Some("dead"),
            _ => None,
        }
    }
}

/// Map the supervisor's `current` token onto an active state and the process
/// token reported alongside it.
fn pebble_to_state(current: &str) -> Option<(ObservedState, &'static str)> {
    match current {
        "active" => Some((ObservedState::On, "running")),
        "inactive" => Some((ObservedState::Off, "dead")),
        "backoff" | "error" => Some((ObservedState::Dead, "Result: exit-code")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_token_mapping() {
        assert_eq!(
            pebble_to_state("active"),
            Some((ObservedState::On, "running"))
        );
        assert_eq!(
            pebble_to_state("inactive"),
            Some((ObservedState::Off, "dead"))
        );
        assert_eq!(
            pebble_to_state("backoff"),
            Some((ObservedState::Dead, "Result: exit-code"))
        );
        assert_eq!(
            pebble_to_state("error"),
            Some((ObservedState::Dead, "Result: exit-code"))
        );
        assert_eq!(pebble_to_state("starting"), None);
    }

    #[test]
    fn signal_validation_requires_exactly_one_signal() {
        assert_eq!(
            crate::backend::signal_from_opts("proxy", &["SIGUSR1"]).unwrap(),
            "SIGUSR1"
        );
        assert!(crate::backend::signal_from_opts("proxy", &[]).is_err());
        assert!(crate::backend::signal_from_opts("proxy", &["SIGUSR1", "SIGUSR2"]).is_err());
        assert!(crate::backend::signal_from_opts("proxy", &["--kill"]).is_err());
    }
}

use thiserror::Error;

/// Error taxonomy for service monitoring operations.
#[derive(Error, Debug)]
pub enum ServiceMonitorError {
    /// The name is not registered, or the backend reports the unit does not
    /// exist. Never retried.
    #[error("{0}")]
    ServiceUnknown(String),

    /// A control action failed to converge the service to an acceptable
    /// state, the executor exhausted its retries, or the backend returned a
    /// non-success status.
    #[error("{0}")]
    ActionFailed(String),

    /// Backend output could not be mapped to a known service state. Treated
    /// as a contract violation, never retried.
    #[error("{0}")]
    ParsingFailed(String),

    /// A restart or reload was requested for a service whose policy does not
    /// currently call for it to be on. No backend call is attempted.
    #[error("{0}")]
    ServiceNotOn(String),

    /// The wait for an action to complete expired. Distinct from
    /// `ActionFailed` so callers running their own retry loops can clear
    /// bookkeeping for an action that may still land.
    #[error("Service '{service}' timed out waiting for the {action} action to complete.")]
    ActionTimedOut { service: String, action: String },
}

/// A specialized Result type for service monitor operations.
pub type Result<T> = std::result::Result<T, ServiceMonitorError>;

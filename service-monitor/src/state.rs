use std::fmt;

use crate::service::Service;

/// The active state a backend can actually observe for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ObservedState {
    On,
    Off,
    Dead,
    #[default]
    Unknown,
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            ObservedState::On => "on",
            ObservedState::Off => "off",
            ObservedState::Dead => "dead",
            ObservedState::Unknown => "unknown",
        };
        write!(f, "{}", word)
    }
}

/// The state a service's policy can ask for. `Any` means the service is not
/// currently monitored: no corrective action is ever taken and state queries
/// short-circuit to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedState {
    On,
    Off,
    Dead,
    Any,
}

impl fmt::Display for ExpectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            ExpectedState::On => "on",
            ExpectedState::Off => "off",
            ExpectedState::Dead => "dead",
            ExpectedState::Any => "any",
        };
        write!(f, "{}", word)
    }
}

/// The last state observed for a service: the coarse active state plus the
/// backend's free-form process token (used for diagnostics only, never for
/// control decisions).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub active_state: ObservedState,
    pub process_state: Option<String>,
}

impl ServiceState {
    pub fn new(active_state: ObservedState, process_state: Option<String>) -> Self {
        Self {
            active_state,
            process_state,
        }
    }

    /// Derive the caller-facing `(status_word, detail)` pair for this state.
    pub async fn status_info(&self, service: &dyn Service) -> (&'static str, String) {
        match self.active_state {
            ObservedState::Unknown => ("unknown", String::new()),
            ObservedState::On => ("running", String::new()),
            _ => {
                let (expected_state, _) = service.expected_state().await;
                if expected_state == ExpectedState::On {
                    if self.active_state == ObservedState::Off {
                        (
                            "dead",
                            format!("{} is currently stopped.", service.name()),
                        )
                    } else {
                        (
                            "dead",
                            format!(
                                "{} failed to start, process result: ({})",
                                service.name(),
                                self.process_state.as_deref().unwrap_or("unknown")
                            ),
                        )
                    }
                } else {
                    ("off", String::new())
                }
            }
        }
    }
}

//! Service state vocabulary shared by the daemon and anything reading its
//! status file.
//!
//! `ServiceState` is deliberately unordered: reconciliation only ever asks
//! whether an observed state satisfies an expectation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Run state of a monitored service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Service is running
    On,
    /// Service is stopped
    Off,
    /// Service was expected on but is stopped, crashed or stuck starting
    Dead,
    /// The backend could not tell us
    Unknown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::On => "on",
            ServiceState::Off => "off",
            ServiceState::Dead => "dead",
            ServiceState::Unknown => "unknown",
        }
    }

    /// Process sub-state the init system reports when a service is cleanly
    /// in this active state.
    pub fn canonical_process(&self) -> Option<&'static str> {
        match self {
            ServiceState::On => Some("running"),
            ServiceState::Off => Some("dead"),
            ServiceState::Dead => Some("Result: exit-code"),
            ServiceState::Unknown => None,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the process backend reported for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Coarse active state
    pub active: ServiceState,
    /// Backend sub-state, e.g. `running`, `dead`, `Result: exit-code`
    pub process: Option<String>,
}

impl ObservedState {
    pub fn new(active: ServiceState, process: Option<String>) -> Self {
        Self { active, process }
    }

    /// Observed state carrying the canonical process sub-state.
    pub fn canonical(active: ServiceState) -> Self {
        Self {
            active,
            process: active.canonical_process().map(str::to_string),
        }
    }

    pub fn unknown() -> Self {
        Self {
            active: ServiceState::Unknown,
            process: None,
        }
    }

    /// True when the process sub-state disagrees with what the active state
    /// normally implies.
    pub fn process_mismatch(&self) -> bool {
        match (self.active.canonical_process(), self.process.as_deref()) {
            (Some(expected), Some(actual)) => expected != actual,
            _ => false,
        }
    }
}

impl Default for ObservedState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Desired state for a service, with the reason monitoring does not expect
/// it running when it is `Off`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedState {
    pub state: ServiceState,
    pub reason: Option<String>,
}

impl ExpectedState {
    pub fn on() -> Self {
        Self {
            state: ServiceState::On,
            reason: None,
        }
    }

    pub fn off(reason: impl Into<String>) -> Self {
        Self {
            state: ServiceState::Off,
            reason: Some(reason.into()),
        }
    }

    /// Whether `observed` satisfies this expectation. A service that should
    /// be off is equally fine stopped or crashed.
    pub fn accepts(&self, observed: ServiceState) -> bool {
        match self.state {
            ServiceState::On => observed == ServiceState::On,
            ServiceState::Off => matches!(observed, ServiceState::Off | ServiceState::Dead),
            ServiceState::Dead | ServiceState::Unknown => false,
        }
    }
}

/// Coarse status shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Running,
    Dead,
    Off,
    Unknown,
}

/// Human-readable status of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: StatusKind,
    pub description: String,
}

impl StatusInfo {
    /// Combine observed and expected state into what an operator should see.
    pub fn derive(observed: &ObservedState, expected: &ExpectedState, service_name: &str) -> Self {
        let reason = expected.reason.clone().unwrap_or_default();
        match observed.active {
            ServiceState::Unknown => Self {
                status: StatusKind::Unknown,
                description: reason,
            },
            ServiceState::On => Self {
                status: StatusKind::Running,
                description: reason,
            },
            ServiceState::Off if expected.state == ServiceState::On => Self {
                status: StatusKind::Dead,
                description: format!("{} is currently stopped.", service_name),
            },
            ServiceState::Dead if expected.state == ServiceState::On => Self {
                status: StatusKind::Dead,
                description: format!(
                    "{} failed to start, process result: ({})",
                    service_name,
                    observed.process.as_deref().unwrap_or("unknown")
                ),
            },
            ServiceState::Off | ServiceState::Dead => Self {
                status: StatusKind::Off,
                description: reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_off_accepts_dead() {
        let expected = ExpectedState::off("disabled");
        assert!(expected.accepts(ServiceState::Off));
        assert!(expected.accepts(ServiceState::Dead));
        assert!(!expected.accepts(ServiceState::On));
        assert!(!expected.accepts(ServiceState::Unknown));
    }

    #[test]
    fn test_expected_on_only_accepts_on() {
        let expected = ExpectedState::on();
        assert!(expected.accepts(ServiceState::On));
        assert!(!expected.accepts(ServiceState::Dead));
        assert!(!expected.accepts(ServiceState::Unknown));
    }

    #[test]
    fn test_process_mismatch() {
        let clean = ObservedState::canonical(ServiceState::On);
        assert!(!clean.process_mismatch());

        let odd = ObservedState::new(ServiceState::On, Some("exited".to_string()));
        assert!(odd.process_mismatch());

        assert!(!ObservedState::unknown().process_mismatch());
    }

    #[test]
    fn test_status_info_dead_when_expected_on() {
        let stopped = ObservedState::canonical(ServiceState::Off);
        let info = StatusInfo::derive(&stopped, &ExpectedState::on(), "maas-http");
        assert_eq!(info.status, StatusKind::Dead);
        assert_eq!(info.description, "maas-http is currently stopped.");

        let crashed = ObservedState::new(ServiceState::Dead, Some("Result: signal".to_string()));
        let info = StatusInfo::derive(&crashed, &ExpectedState::on(), "maas-http");
        assert_eq!(info.status, StatusKind::Dead);
        assert!(info.description.contains("(Result: signal)"));
    }

    #[test]
    fn test_status_info_off_carries_reason() {
        let stopped = ObservedState::canonical(ServiceState::Off);
        let info = StatusInfo::derive(&stopped, &ExpectedState::off("proxy disabled"), "maas-proxy");
        assert_eq!(info.status, StatusKind::Off);
        assert_eq!(info.description, "proxy disabled");
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&ServiceState::Dead).unwrap();
        assert_eq!(json, "\"dead\"");
    }
}

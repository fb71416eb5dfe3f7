//! Per-service monitoring records. Kept in memory only; a restarted daemon
//! starts from scratch.

use chrono::{DateTime, Utc};
use rack_common::ObservedState;
use serde::Serialize;
use std::fmt;

/// Corrective or operator-requested command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Kill,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Kill => "kill",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub action: ServiceAction,
    pub at: DateTime<Utc>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What the reconciler last saw for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorRecord {
    pub state: ObservedState,
    pub checked_at: Option<DateTime<Utc>>,
    pub last_action: Option<ActionRecord>,
    /// Passes in a row where the backend could not answer
    pub consecutive_unknown: u32,
}

impl MonitorRecord {
    /// Record for a service that has not been checked yet
    pub fn new() -> Self {
        Self {
            state: ObservedState::unknown(),
            checked_at: None,
            last_action: None,
            consecutive_unknown: 0,
        }
    }

    pub(crate) fn observed(&mut self, state: ObservedState, at: DateTime<Utc>) {
        self.state = state;
        self.checked_at = Some(at);
        self.consecutive_unknown = 0;
    }

    /// No usable answer from the backend. The last known state stays.
    pub(crate) fn unknown(&mut self, at: DateTime<Utc>) -> u32 {
        self.checked_at = Some(at);
        self.consecutive_unknown = self.consecutive_unknown.saturating_add(1);
        self.consecutive_unknown
    }

    pub(crate) fn acted(&mut self, action: ServiceAction, ok: bool, detail: Option<String>) {
        self.last_action = Some(ActionRecord {
            action,
            at: Utc::now(),
            ok,
            detail,
        });
    }
}

impl Default for MonitorRecord {
    fn default() -> Self {
        Self::new()
    }
}

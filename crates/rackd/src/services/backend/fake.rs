//! In-memory process backend for tests and dry runs

use async_trait::async_trait;
use rack_common::{ObservedState, ServiceState};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{BackendError, ProcessBackend};
use crate::services::descriptor::KillOptions;

#[derive(Default)]
struct FakeState {
    services: HashMap<String, ServiceState>,
    failing_start: HashSet<String>,
    unreachable: HashSet<String>,
    /// Services that accept commands but never change state
    stuck: HashSet<String>,
    calls: Vec<String>,
}

/// Backend whose services are entries in a map. Unknown names read as
/// stopped.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, name: &str, state: ServiceState) -> Self {
        self.set_state(name, state);
        self
    }

    pub fn set_state(&self, name: &str, state: ServiceState) {
        self.lock().services.insert(name.to_string(), state);
    }

    pub fn state_of(&self, name: &str) -> ServiceState {
        self.lock()
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceState::Off)
    }

    /// Make `start` (and `restart`) of `name` fail
    pub fn fail_start(&self, name: &str, failing: bool) {
        toggle(&mut self.lock().failing_start, name, failing);
    }

    /// Make every call for `name` fail as if the backend were down
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        toggle(&mut self.lock().unreachable, name, unreachable);
    }

    /// Commands for `name` succeed but change nothing
    pub fn set_stuck(&self, name: &str, stuck: bool) {
        toggle(&mut self.lock().stuck, name, stuck);
    }

    /// Every command issued, as `"<action> <name>"`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Commands other than `status`
    pub fn actions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("status "))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn command(&self, action: &str, name: &str, to: Option<ServiceState>) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(format!("{} {}", action, name));

        if state.unreachable.contains(name) {
            return Err(BackendError::Unreachable(name.to_string()));
        }
        if matches!(action, "start" | "restart") && state.failing_start.contains(name) {
            state.services.insert(name.to_string(), ServiceState::Dead);
            return Err(BackendError::ActionFailed {
                service: name.to_string(),
                action: action.to_string(),
                stderr: "Job failed. See journal for details.".to_string(),
            });
        }
        if let Some(to) = to {
            if !state.stuck.contains(name) {
                state.services.insert(name.to_string(), to);
            }
        }
        Ok(())
    }
}

fn toggle(set: &mut HashSet<String>, name: &str, on: bool) {
    if on {
        set.insert(name.to_string());
    } else {
        set.remove(name);
    }
}

#[async_trait]
impl ProcessBackend for FakeBackend {
    async fn status(&self, name: &str) -> Result<ObservedState, BackendError> {
        self.command("status", name, None)?;
        Ok(ObservedState::canonical(self.state_of(name)))
    }

    async fn start(&self, name: &str) -> Result<(), BackendError> {
        self.command("start", name, Some(ServiceState::On))
    }

    async fn stop(&self, name: &str, kill: Option<&KillOptions>) -> Result<(), BackendError> {
        let action = if kill.is_some() { "kill" } else { "stop" };
        self.command(action, name, Some(ServiceState::Off))
    }

    async fn restart(&self, name: &str) -> Result<(), BackendError> {
        self.command("restart", name, Some(ServiceState::On))
    }

    async fn reload(&self, name: &str) -> Result<(), BackendError> {
        self.command("reload", name, None)
    }

    async fn kill(&self, name: &str, _options: &KillOptions) -> Result<(), BackendError> {
        self.command("kill", name, Some(ServiceState::Dead))
    }
}

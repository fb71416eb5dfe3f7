//! Service reconciliation: keep every monitored service in the state the
//! cluster configuration asks for.
//!
//! Per service and pass:
//!
//! | expected | observed        | action |
//! |----------|-----------------|--------|
//! | on       | on              | none   |
//! | on       | off / dead      | start  |
//! | off      | on              | stop   |
//! | off      | off / dead      | none   |
//! | any      | unknown         | none, reported |
//!
//! A pass takes the `ServiceMonitor` lock, so scheduled passes and
//! ensure-now calls never interleave their commands.

use chrono::Utc;
use futures::future::join_all;
use rack_common::{ExpectedState, ObservedState, PackagingMode, ServiceState, StatusInfo};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::backend::{BackendError, ProcessBackend};
use super::descriptor::ServiceDescriptor;
use super::record::{MonitorRecord, ServiceAction};
use crate::locks::{LockName, LockRegistry};
use crate::metrics::MaintenanceMetrics;
use crate::store::{ConfigStore, Settings, StoreError};

/// Reconciliation errors
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("service '{0}' is not monitored")]
    UnknownService(String),

    #[error("service '{0}' is registered twice")]
    DuplicateService(String),

    #[error("service '{service}' is not expected to be on, unable to {action}")]
    NotOn {
        service: String,
        action: ServiceAction,
    },

    #[error("service '{service}' failed to {action}: {detail}")]
    ActionFailed {
        service: String,
        action: ServiceAction,
        detail: String,
    },

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("configuration store: {0}")]
    Config(#[from] StoreError),

    #[error("settings read task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything known about one service after a monitor pass
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub backend_name: String,
    pub expected: ExpectedState,
    pub observed: ObservedState,
    pub status: StatusInfo,
    pub record: MonitorRecord,
}

pub struct ServiceReconciler {
    services: Vec<ServiceDescriptor>,
    backend: Arc<dyn ProcessBackend>,
    config_store: Arc<dyn ConfigStore>,
    locks: LockRegistry,
    records: Mutex<HashMap<String, MonitorRecord>>,
    mode: PackagingMode,
    state_dir: PathBuf,
    metrics: Option<MaintenanceMetrics>,
    unknown_warn_threshold: u32,
}

impl ServiceReconciler {
    pub fn new(
        services: Vec<ServiceDescriptor>,
        backend: Arc<dyn ProcessBackend>,
        config_store: Arc<dyn ConfigStore>,
        locks: LockRegistry,
    ) -> Result<Self, ReconcileError> {
        let mut seen = HashSet::new();
        for desc in &services {
            if !seen.insert(desc.name.as_str()) {
                return Err(ReconcileError::DuplicateService(desc.name.clone()));
            }
        }
        let records = services
            .iter()
            .map(|d| (d.name.clone(), MonitorRecord::new()))
            .collect();

        Ok(Self {
            services,
            backend,
            config_store,
            locks,
            records: Mutex::new(records),
            mode: PackagingMode::Native,
            state_dir: PathBuf::from(rack_common::paths::STATE_DIR),
            metrics: None,
            unknown_warn_threshold: 3,
        })
    }

    pub fn with_mode(mut self, mode: PackagingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_metrics(mut self, metrics: MaintenanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_unknown_warn_threshold(mut self, threshold: u32) -> Self {
        self.unknown_warn_threshold = threshold.max(1);
        self
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn mode(&self) -> PackagingMode {
        self.mode
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Reconcile every service. A failing service is logged and reported
    /// with its last known state; only a settings read failure fails the
    /// whole pass.
    pub async fn ensure_services(&self) -> Result<HashMap<String, ObservedState>, ReconcileError> {
        Ok(self
            .monitor_pass()
            .await?
            .into_iter()
            .map(|report| (report.name, report.observed))
            .collect())
    }

    /// [`ensure_services`](Self::ensure_services) with the full per-service
    /// detail.
    pub async fn monitor_pass(&self) -> Result<Vec<ServiceReport>, ReconcileError> {
        let _guard = self.locks.acquire(LockName::ServiceMonitor).await;
        let settings = self.read_settings(self.services.iter()).await?;

        let passes = self.services.iter().map(|desc| {
            let expected = desc.resolve_expected(&settings, &self.state_dir);
            async move {
                let observed = match self.ensure_one(desc, &expected).await {
                    Ok(observed) => observed,
                    Err(e) => {
                        if !matches!(e, ReconcileError::ActionFailed { .. }) {
                            error!(service = %desc.name, "While monitoring service an error was encountered: {}", e);
                        }
                        self.record(&desc.name).state
                    }
                };
                self.report(desc, expected, observed)
            }
        });
        Ok(join_all(passes).await)
    }

    /// Ensure-now for one service
    pub async fn ensure_service(&self, name: &str) -> Result<ObservedState, ReconcileError> {
        let desc = self.descriptor(name)?;
        let _guard = self.locks.acquire(LockName::ServiceMonitor).await;
        let expected = self.expected_for(desc).await?;
        self.ensure_one(desc, &expected).await
    }

    // ========================================================================
    // Imperative operations
    // ========================================================================

    /// Last known state, or a fresh backend read with `now`.
    pub async fn service_state(&self, name: &str, now: bool) -> Result<ObservedState, ReconcileError> {
        let desc = self.descriptor(name)?;
        if !now {
            return Ok(self.record(name).state);
        }
        match self.backend.status(desc.backend_name(self.mode)).await {
            Ok(state) if state.active == ServiceState::Unknown => {
                self.note_unknown(desc, &"backend reported an unknown state");
                Ok(state)
            }
            Ok(state) => {
                self.update(name, |r| r.observed(state.clone(), Utc::now()));
                Ok(state)
            }
            Err(e) => {
                self.note_unknown(desc, &e);
                Err(e.into())
            }
        }
    }

    /// Operator-facing status from the last known state and the current
    /// expectation.
    pub async fn status_info(&self, name: &str) -> Result<StatusInfo, ReconcileError> {
        let desc = self.descriptor(name)?;
        let expected = self.expected_for(desc).await?;
        let observed = self.record(name).state;
        Ok(StatusInfo::derive(&observed, &expected, desc.backend_name(self.mode)))
    }

    /// Restart a service that is expected on. With `if_on` a service that
    /// is expected off is skipped silently and `None` is returned.
    pub async fn restart_service(
        &self,
        name: &str,
        if_on: bool,
    ) -> Result<Option<ObservedState>, ReconcileError> {
        let desc = self.descriptor(name)?;
        let _guard = self.locks.acquire(LockName::ServiceMonitor).await;
        if !self.gate_on(desc, if_on, ServiceAction::Restart).await? {
            return Ok(None);
        }

        let backend_name = desc.backend_name(self.mode);
        if let Err(e) = self.backend.restart(backend_name).await {
            return Err(self.action_failed(desc, ServiceAction::Restart, e.to_string()));
        }

        let state = self.observe(desc).await;
        match state {
            Some(state) if state.active == ServiceState::On => {
                self.acted(desc, ServiceAction::Restart, true, None);
                info!(service = %backend_name, "Service has been restarted, process state '{}'", process_label(&state));
                Ok(Some(state))
            }
            other => Err(self.action_failed(
                desc,
                ServiceAction::Restart,
                after_action_detail(other.as_ref()),
            )),
        }
    }

    /// Reload a service that is expected on, starting it first if needed.
    /// Returns false when skipped because of `if_on`.
    pub async fn reload_service(&self, name: &str, if_on: bool) -> Result<bool, ReconcileError> {
        let desc = self.descriptor(name)?;
        let _guard = self.locks.acquire(LockName::ServiceMonitor).await;
        if !self.gate_on(desc, if_on, ServiceAction::Reload).await? {
            return Ok(false);
        }

        let state = self.ensure_one(desc, &ExpectedState::on()).await?;
        if state.active != ServiceState::On {
            return Err(self.action_failed(
                desc,
                ServiceAction::Reload,
                format!("not running and could not be started, state is {}", state.active),
            ));
        }

        match self.backend.reload(desc.backend_name(self.mode)).await {
            Ok(()) => {
                self.acted(desc, ServiceAction::Reload, true, None);
                Ok(true)
            }
            Err(e) => Err(self.action_failed(desc, ServiceAction::Reload, e.to_string())),
        }
    }

    /// Kill a misbehaving service, then bring it back to its expected
    /// state. The kill itself may fail; the service may already be dead.
    pub async fn kill_service(&self, name: &str) -> Result<ObservedState, ReconcileError> {
        let desc = self.descriptor(name)?;
        let _guard = self.locks.acquire(LockName::ServiceMonitor).await;

        let options = desc.kill_options();
        match self.backend.kill(desc.backend_name(self.mode), &options).await {
            Ok(()) => self.acted(desc, ServiceAction::Kill, true, None),
            Err(e) => {
                debug!(service = %desc.name, "Kill failed, continuing: {}", e);
                self.acted(desc, ServiceAction::Kill, false, Some(e.to_string()));
            }
        }

        let expected = self.expected_for(desc).await?;
        self.ensure_one(desc, &expected).await
    }

    /// Copy of every record, in registration order
    pub fn snapshot(&self) -> Vec<(String, MonitorRecord)> {
        self.services
            .iter()
            .map(|d| (d.name.clone(), self.record(&d.name)))
            .collect()
    }

    // ========================================================================
    // Internals. None of these take the ServiceMonitor lock.
    // ========================================================================

    async fn ensure_one(
        &self,
        desc: &ServiceDescriptor,
        expected: &ExpectedState,
    ) -> Result<ObservedState, ReconcileError> {
        let backend_name = desc.backend_name(self.mode);
        let Some(state) = self.observe(desc).await else {
            return Ok(ObservedState::unknown());
        };
        if state.active == ServiceState::Unknown {
            return Ok(state);
        }

        if expected.accepts(state.active) {
            if state.process_mismatch() {
                warn!(
                    service = %backend_name,
                    "Service is {} but not in the expected process state '{}', its current state is '{}'",
                    state.active,
                    state.active.canonical_process().unwrap_or_default(),
                    process_label(&state)
                );
            } else {
                debug!(service = %backend_name, "Service is {} and '{}'", state.active, process_label(&state));
            }
            return Ok(state);
        }

        let (action, result) = if expected.state == ServiceState::On {
            info!(service = %backend_name, "Service is not on, it will be started");
            (ServiceAction::Start, self.backend.start(backend_name).await)
        } else {
            let kill = desc.kill_signal.as_ref().map(|_| desc.kill_options());
            info!(service = %backend_name, "Service is not off, it will be stopped");
            (ServiceAction::Stop, self.backend.stop(backend_name, kill.as_ref()).await)
        };

        if let Err(e) = result {
            if action == ServiceAction::Start {
                self.update(&desc.name, |r| r.observed(ObservedState::canonical(ServiceState::Dead), Utc::now()));
            }
            return Err(self.action_failed(desc, action, e.to_string()));
        }

        // The command succeeded; check the service actually got there
        match self.observe(desc).await {
            Some(state) if expected.accepts(state.active) => {
                self.acted(desc, action, true, None);
                info!(service = %backend_name, "Service has been {}, process state '{}'", past_tense(action), process_label(&state));
                Ok(state)
            }
            other => {
                let unknown = other.as_ref().map_or(true, |s| s.active == ServiceState::Unknown);
                if action == ServiceAction::Start && !unknown {
                    let dead = match &other {
                        Some(state) if state.active == ServiceState::Dead => state.clone(),
                        _ => ObservedState::canonical(ServiceState::Dead),
                    };
                    self.update(&desc.name, |r| r.observed(dead, Utc::now()));
                }
                Err(self.action_failed(desc, action, after_action_detail(other.as_ref())))
            }
        }
    }

    /// Read the backend state and record it. `None` means the backend could
    /// not answer; the record keeps its last known state.
    async fn observe(&self, desc: &ServiceDescriptor) -> Option<ObservedState> {
        match self.backend.status(desc.backend_name(self.mode)).await {
            Ok(state) if state.active == ServiceState::Unknown => {
                self.note_unknown(desc, &"backend reported an unknown state");
                Some(state)
            }
            Ok(state) => {
                self.update(&desc.name, |r| r.observed(state.clone(), Utc::now()));
                Some(state)
            }
            Err(e) => {
                self.note_unknown(desc, &e);
                None
            }
        }
    }

    fn note_unknown(&self, desc: &ServiceDescriptor, cause: &dyn std::fmt::Display) {
        let count = self.update(&desc.name, |r| r.unknown(Utc::now()));
        if let Some(metrics) = &self.metrics {
            metrics.record_unknown(&desc.name);
        }
        if count >= self.unknown_warn_threshold {
            warn!(
                service = %desc.name,
                consecutive = count,
                "Service state unknown for {} consecutive checks: {}",
                count,
                cause
            );
        } else {
            info!(service = %desc.name, "Service state unknown, no action taken: {}", cause);
        }
    }

    /// Whether the service is expected on. Expected off is an error unless
    /// `if_on`, in which case the caller skips.
    async fn gate_on(
        &self,
        desc: &ServiceDescriptor,
        if_on: bool,
        action: ServiceAction,
    ) -> Result<bool, ReconcileError> {
        let expected = self.expected_for(desc).await?;
        if expected.state == ServiceState::On {
            Ok(true)
        } else if if_on {
            debug!(service = %desc.name, "Not expected on, skipping {}", action);
            Ok(false)
        } else {
            Err(ReconcileError::NotOn {
                service: desc.name.clone(),
                action,
            })
        }
    }

    async fn expected_for(&self, desc: &ServiceDescriptor) -> Result<ExpectedState, ReconcileError> {
        let settings = self.read_settings(std::iter::once(desc)).await?;
        Ok(desc.resolve_expected(&settings, &self.state_dir))
    }

    /// One consistent read of every setting the given services depend on
    async fn read_settings<'a>(
        &self,
        services: impl Iterator<Item = &'a ServiceDescriptor>,
    ) -> Result<Settings, ReconcileError> {
        let mut keys: Vec<String> = services.flat_map(ServiceDescriptor::setting_keys).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Settings::default());
        }

        let store = Arc::clone(&self.config_store);
        let settings = tokio::task::spawn_blocking(move || store.snapshot(&keys)).await??;
        Ok(settings)
    }

    fn action_failed(&self, desc: &ServiceDescriptor, action: ServiceAction, detail: String) -> ReconcileError {
        error!(service = %desc.backend_name(self.mode), "Service failed to {}: {}", action, detail);
        self.acted(desc, action, false, Some(detail.clone()));
        ReconcileError::ActionFailed {
            service: desc.name.clone(),
            action,
            detail,
        }
    }

    fn acted(&self, desc: &ServiceDescriptor, action: ServiceAction, ok: bool, detail: Option<String>) {
        self.update(&desc.name, |r| r.acted(action, ok, detail));
        if let Some(metrics) = &self.metrics {
            metrics.record_service_action(&desc.name, action.as_str(), ok);
        }
    }

    fn report(&self, desc: &ServiceDescriptor, expected: ExpectedState, observed: ObservedState) -> ServiceReport {
        let backend_name = desc.backend_name(self.mode).to_string();
        let record = self.record(&desc.name);
        let status = StatusInfo::derive(&record.state, &expected, &backend_name);
        ServiceReport {
            name: desc.name.clone(),
            backend_name,
            expected,
            observed,
            status,
            record,
        }
    }

    fn descriptor(&self, name: &str) -> Result<&ServiceDescriptor, ReconcileError> {
        self.services
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ReconcileError::UnknownService(name.to_string()))
    }

    fn record(&self, name: &str) -> MonitorRecord {
        self.lock_records().get(name).cloned().unwrap_or_default()
    }

    fn update<T>(&self, name: &str, f: impl FnOnce(&mut MonitorRecord) -> T) -> T {
        let mut records = self.lock_records();
        f(records.entry(name.to_string()).or_default())
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<String, MonitorRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn process_label(state: &ObservedState) -> &str {
    state.process.as_deref().unwrap_or("unknown")
}

fn past_tense(action: ServiceAction) -> &'static str {
    match action {
        ServiceAction::Start => "started",
        ServiceAction::Stop => "stopped",
        ServiceAction::Restart => "restarted",
        ServiceAction::Reload => "reloaded",
        ServiceAction::Kill => "killed",
    }
}

fn after_action_detail(state: Option<&ObservedState>) -> String {
    match state {
        Some(state) => format!("current state is '{}' and '{}'", state.active, process_label(state)),
        None => "state could not be read afterwards".to_string(),
    }
}

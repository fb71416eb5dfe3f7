//! Prometheus metrics for the maintenance loops

use prometheus::{register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder};
use std::path::Path;
use std::sync::Arc;

/// Maintenance metrics, owned by the daemon and shared by clone
#[derive(Clone)]
pub struct MaintenanceMetrics {
    pub task_runs_total: IntCounterVec,
    pub service_actions_total: IntCounterVec,
    pub service_unknown_total: IntCounterVec,
    pub gc_removed_total: IntCounterVec,

    registry: Arc<Registry>,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let task_runs_total = register_int_counter_vec_with_registry!(
            "rackd_task_runs_total",
            "Scheduled task ticks by task and result",
            &["task", "result"],
            registry
        )
        .expect("static metric definition");

        let service_actions_total = register_int_counter_vec_with_registry!(
            "rackd_service_actions_total",
            "Corrective service commands by service, action and result",
            &["service", "action", "result"],
            registry
        )
        .expect("static metric definition");

        let service_unknown_total = register_int_counter_vec_with_registry!(
            "rackd_service_unknown_total",
            "Monitor passes that could not determine a service's state",
            &["service"],
            registry
        )
        .expect("static metric definition");

        let gc_removed_total = register_int_counter_vec_with_registry!(
            "rackd_gc_removed_total",
            "Items reclaimed by the garbage collectors",
            &["kind"],
            registry
        )
        .expect("static metric definition");

        Self {
            task_runs_total,
            service_actions_total,
            service_unknown_total,
            gc_removed_total,
            registry: Arc::new(registry),
        }
    }

    pub fn record_task_run(&self, task: &str, result: &str) {
        self.task_runs_total.with_label_values(&[task, result]).inc();
    }

    pub fn record_service_action(&self, service: &str, action: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.service_actions_total
            .with_label_values(&[service, action, result])
            .inc();
    }

    pub fn record_unknown(&self, service: &str) {
        self.service_unknown_total.with_label_values(&[service]).inc();
    }

    pub fn record_gc_removed(&self, kind: &str, count: usize) {
        self.gc_removed_total
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Write the text export for a node-exporter textfile collector.
    pub fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        rack_common::state_files::atomic_write(path, self.export().as_bytes())
    }
}

impl Default for MaintenanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

//! Top-level composition: every long-lived component of the daemon is
//! built here and handed to the loops that use it.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rack_common::paths::STATUS_FILE;
use rack_common::state_files::write_json;
use rack_common::PackagingMode;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::gc::{GcReport, RowCollector, StorageCollector};
use crate::locks::{LockName, LockRegistry};
use crate::metrics::MaintenanceMetrics;
use crate::scheduler::{Scheduler, ShutdownReport, Task};
use crate::services::backend::{CommandRunner, TokioCommandRunner};
use crate::services::{ProcessBackend, ServiceReconciler, ServiceReport, SupervisorBackend, SystemdBackend};
use crate::store::{ConfigStore, RowStore, SqliteConfigStore, SqliteRowStore, StaticConfigStore};

pub const MONITOR_TASK: &str = "service-monitor";
pub const ROW_GC_TASK: &str = "row-gc";
pub const STORAGE_GC_TASK: &str = "storage-gc";

/// Written to `<state_dir>/service-status.json` after every monitor pass
#[derive(Debug, Serialize)]
pub struct ServiceStatusFile {
    pub generated_at: DateTime<Utc>,
    pub packaging: PackagingMode,
    pub services: Vec<ServiceReport>,
}

pub struct Daemon {
    config: DaemonConfig,
    metrics: MaintenanceMetrics,
    locks: LockRegistry,
    scheduler: Scheduler,
    monitor: MonitorTick,
    row_gc: Option<RowGcTick>,
    storage_gc: Option<StorageGcTick>,
}

impl Daemon {
    /// Build the daemon with the real backends and stores.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let mode = config.packaging.resolve();
        info!("[BOOT] Packaging mode: {}", mode.as_str());

        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new(
            config.command_timeout(),
            config.monitor.command_retries,
        ));
        let backend: Arc<dyn ProcessBackend> = match mode {
            PackagingMode::Native => Arc::new(SystemdBackend::new(runner)),
            PackagingMode::Sandboxed => {
                let root = rack_common::packaging::snap_root()
                    .ok_or_else(|| anyhow!("sandboxed packaging requires ${}", rack_common::packaging::SNAP_ENV))?;
                Arc::new(SupervisorBackend::new(runner, &root))
            }
        };

        let config_store: Arc<dyn ConfigStore> = match &config.config_store.database {
            Some(path) => Arc::new(
                SqliteConfigStore::open(path)
                    .with_context(|| format!("opening config store {}", path.display()))?,
            ),
            None => {
                warn!("No config store database configured, toggleable services use their defaults");
                Arc::new(StaticConfigStore::new())
            }
        };

        let row_store: Option<Arc<dyn RowStore>> = if config.row_gc.enabled {
            let path = &config.row_gc.database;
            let store = SqliteRowStore::open(path)
                .with_context(|| format!("opening row store {}", path.display()))?;
            store
                .ensure_table(&config.row_gc.table, &config.row_gc.timestamp_column)
                .context("preparing row store table")?;
            Some(Arc::new(store))
        } else {
            None
        };

        Self::with_parts(config, mode, backend, config_store, row_store)
    }

    /// Build the daemon around the given backend and stores.
    pub fn with_parts(
        config: DaemonConfig,
        mode: PackagingMode,
        backend: Arc<dyn ProcessBackend>,
        config_store: Arc<dyn ConfigStore>,
        row_store: Option<Arc<dyn RowStore>>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let metrics = MaintenanceMetrics::new();
        let locks = LockRegistry::new();

        let reconciler = ServiceReconciler::new(config.service_catalog(), backend, config_store, locks.clone())
            .context("building service reconciler")?
            .with_mode(mode)
            .with_state_dir(config.state_dir.clone())
            .with_metrics(metrics.clone())
            .with_unknown_warn_threshold(config.monitor.unknown_warn_threshold);

        let monitor = MonitorTick {
            reconciler: Arc::new(reconciler),
            status_path: config.state_dir.join(STATUS_FILE),
            textfile: config.metrics.textfile.clone(),
            metrics: metrics.clone(),
        };

        let row_gc = match (config.row_gc.enabled, row_store) {
            (true, Some(store)) => Some(RowGcTick {
                collector: Arc::new(RowCollector::new(
                    store,
                    &config.row_gc.table,
                    &config.row_gc.timestamp_column,
                    config.row_retention(),
                )),
                locks: locks.clone(),
                metrics: metrics.clone(),
            }),
            (true, None) => return Err(anyhow!("row collection enabled without a row store")),
            (false, _) => None,
        };

        let storage_gc = if config.storage_gc.enabled {
            let collector = StorageCollector::new(config.storage_gc.storage_root.clone());
            collector.check_root().context("storage collector")?;
            Some(StorageGcTick {
                collector: Arc::new(collector),
                locks: locks.clone(),
                metrics: metrics.clone(),
            })
        } else {
            None
        };

        let scheduler = Scheduler::new().with_metrics(metrics.clone());

        Ok(Self {
            config,
            metrics,
            locks,
            scheduler,
            monitor,
            row_gc,
            storage_gc,
        })
    }

    /// Register one loop per enabled task.
    pub fn start(&self) -> Result<()> {
        self.scheduler
            .register(
                MONITOR_TASK,
                self.config.monitor_interval()?,
                self.config.monitor.run_immediately,
                self.monitor.clone(),
            )
            .context("scheduling service monitor")?;

        if let Some(tick) = &self.row_gc {
            self.scheduler
                .register(ROW_GC_TASK, self.config.row_gc_interval()?, false, tick.clone())
                .context("scheduling row collector")?;
        }
        if let Some(tick) = &self.storage_gc {
            self.scheduler
                .register(STORAGE_GC_TASK, self.config.storage_gc_interval()?, false, tick.clone())
                .context("scheduling storage collector")?;
        }

        info!(
            "[READY] rackd operational: {} services monitored, {} loops",
            self.monitor.reconciler.services().len(),
            self.scheduler.handles().len()
        );
        Ok(())
    }

    /// One pass of everything, or ensure-now for a single service.
    pub async fn run_once(&self, service: Option<&str>) -> Result<()> {
        if let Some(name) = service {
            let state = self.monitor.reconciler.ensure_service(name).await?;
            info!(service = name, "Service is {}", state.active);
            return Ok(());
        }

        let mut failed = Vec::new();
        if let Err(e) = self.monitor.pass().await {
            error!("Service monitor pass failed: {:#}", e);
            failed.push(MONITOR_TASK);
        }
        if let Some(tick) = &self.row_gc {
            if let Err(e) = tick.pass().await {
                error!("Row collection failed: {:#}", e);
                failed.push(ROW_GC_TASK);
            }
        }
        if let Some(tick) = &self.storage_gc {
            if let Err(e) = tick.pass().await {
                error!("Storage collection failed: {:#}", e);
                failed.push(STORAGE_GC_TASK);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("maintenance passes failed: {}", failed.join(", ")))
        }
    }

    /// Cancel every loop and wait for in-flight ticks, bounded by the
    /// configured grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("[SHUTDOWN] Stopping maintenance loops");
        let report = self.scheduler.shutdown(self.config.shutdown_grace()).await;
        if !report.aborted.is_empty() {
            warn!("[SHUTDOWN] Aborted after grace period: {}", report.aborted.join(", "));
        }
        // Blocking collector work outlives an aborted tick and keeps its lock
        let held = self.locks.wait_released(self.config.shutdown_grace()).await;
        if !held.is_empty() {
            warn!("[SHUTDOWN] Locks still held: {:?}", held);
        }
        info!("[SHUTDOWN] Complete");
        report
    }

    pub fn reconciler(&self) -> &Arc<ServiceReconciler> {
        &self.monitor.reconciler
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn metrics(&self) -> &MaintenanceMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}

// ============================================================================
// Ticks
// ============================================================================

#[derive(Clone)]
struct MonitorTick {
    reconciler: Arc<ServiceReconciler>,
    status_path: PathBuf,
    textfile: Option<PathBuf>,
    metrics: MaintenanceMetrics,
}

impl MonitorTick {
    async fn pass(&self) -> Result<()> {
        let services = self.reconciler.monitor_pass().await?;

        let status = ServiceStatusFile {
            generated_at: Utc::now(),
            packaging: self.reconciler.mode(),
            services,
        };
        if let Err(e) = write_json(&self.status_path, &status) {
            warn!("Failed to write {}: {}", self.status_path.display(), e);
        }
        if let Some(path) = &self.textfile {
            if let Err(e) = self.metrics.write_textfile(path) {
                warn!("Failed to write metrics to {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

impl Task for MonitorTick {
    fn run(&self) -> BoxFuture<'static, Result<()>> {
        let tick = self.clone();
        async move { tick.pass().await }.boxed()
    }
}

#[derive(Clone)]
struct RowGcTick {
    collector: Arc<RowCollector>,
    locks: LockRegistry,
    metrics: MaintenanceMetrics,
}

impl RowGcTick {
    async fn pass(&self) -> Result<usize> {
        let guard = self.locks.acquire(LockName::DnsPublication).await;
        let collector = Arc::clone(&self.collector);
        let deleted = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            collector.collect(Utc::now())
        })
            .await
            .context("row collector task")??;
        self.metrics.record_gc_removed("rows", deleted);
        Ok(deleted)
    }
}

impl Task for RowGcTick {
    fn run(&self) -> BoxFuture<'static, Result<()>> {
        let tick = self.clone();
        async move { tick.pass().await.map(|_| ()) }.boxed()
    }
}

#[derive(Clone)]
struct StorageGcTick {
    collector: Arc<StorageCollector>,
    locks: LockRegistry,
    metrics: MaintenanceMetrics,
}

impl StorageGcTick {
    async fn pass(&self) -> Result<GcReport> {
        let guard = self.locks.acquire(LockName::ImportImages).await;
        let collector = Arc::clone(&self.collector);
        let report = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            collector.collect()
        })
            .await
            .context("storage collector task")??;

        self.metrics
            .record_gc_removed("snapshots", report.snapshots_removed.len());
        self.metrics
            .record_gc_removed("cache_files", report.cache_files_removed);
        if !report.errors.is_empty() {
            warn!(
                "{} items could not be removed, retrying next pass: {}",
                report.errors.len(),
                report.errors.join("; ")
            );
        }
        Ok(report)
    }
}

impl Task for StorageGcTick {
    fn run(&self) -> BoxFuture<'static, Result<()>> {
        let tick = self.clone();
        async move { tick.pass().await.map(|_| ()) }.boxed()
    }
}

//! Daemon composition tests with fake backend and stores

use chrono::{Duration as ChronoDuration, Utc};
use rack_common::paths::{CACHE_DIR, CURRENT_LINK, STATUS_FILE};
use rack_common::{PackagingMode, ServiceState};
use rackd::config::DaemonConfig;
use rackd::daemon::{MONITOR_TASK, ROW_GC_TASK, STORAGE_GC_TASK};
use rackd::services::{FakeBackend, ServiceDescriptor};
use rackd::store::{RowStore, SqliteRowStore, StaticConfigStore};
use rackd::Daemon;
use std::fs;
use std::os::unix::fs::symlink;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    temp: TempDir,
    backend: Arc<FakeBackend>,
    rows: Arc<SqliteRowStore>,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join("boot-resources");
        fs::create_dir_all(storage.join(CACHE_DIR)).unwrap();
        fs::create_dir_all(storage.join("snapshot-live")).unwrap();
        fs::create_dir_all(storage.join("snapshot-old")).unwrap();
        symlink("snapshot-live", storage.join(CURRENT_LINK)).unwrap();

        let rows = SqliteRowStore::open(&temp.path().join("rows.db")).unwrap();
        rows.ensure_table("dns_publication", "created").unwrap();
        rows.insert("dns_publication", "created", Utc::now() - ChronoDuration::days(10))
            .unwrap();
        rows.insert("dns_publication", "created", Utc::now()).unwrap();

        Self {
            temp,
            backend: Arc::new(FakeBackend::new()),
            rows: Arc::new(rows),
        }
    }

    fn config(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.state_dir = self.temp.path().join("state");
        config.storage_gc.storage_root = self.temp.path().join("boot-resources");
        config.row_gc.database = self.temp.path().join("rows.db");
        config.metrics.textfile = Some(self.temp.path().join("rackd.prom"));
        config.shutdown_grace_secs = 5;
        config.services = Some(vec![ServiceDescriptor::always_on("http", "maas-http", "http")]);
        config
    }

    fn daemon(&self, config: DaemonConfig) -> anyhow::Result<Daemon> {
        let rows: Arc<dyn RowStore> = self.rows.clone();
        Daemon::with_parts(
            config,
            PackagingMode::Native,
            self.backend.clone(),
            Arc::new(StaticConfigStore::new()),
            Some(rows),
        )
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.temp.path().join(rel)
    }
}

#[tokio::test]
async fn run_once_runs_every_task() {
    let fixture = Fixture::new();
    let daemon = fixture.daemon(fixture.config()).unwrap();

    daemon.run_once(None).await.unwrap();

    assert_eq!(fixture.backend.state_of("maas-http"), ServiceState::On);
    assert_eq!(fixture.rows.count("dns_publication").unwrap(), 1);
    assert!(!fixture.path("boot-resources/snapshot-old").exists());
    assert!(fixture.path("boot-resources/snapshot-live").exists());

    let status: serde_json::Value =
        serde_json::from_slice(&fs::read(fixture.path("state").join(STATUS_FILE)).unwrap()).unwrap();
    assert_eq!(status["packaging"], "native");
    assert_eq!(status["services"][0]["name"], "http");
    assert_eq!(status["services"][0]["status"]["status"], "running");

    let prom = fs::read_to_string(fixture.path("rackd.prom")).unwrap();
    assert!(prom.contains("rackd_service_actions_total"));
    assert_eq!(
        daemon.metrics().gc_removed_total.with_label_values(&["rows"]).get(),
        1
    );
}

#[tokio::test]
async fn run_once_single_service() {
    let fixture = Fixture::new();
    let daemon = fixture.daemon(fixture.config()).unwrap();

    daemon.run_once(Some("http")).await.unwrap();
    assert_eq!(fixture.backend.actions(), vec!["start maas-http"]);
    // Collectors untouched
    assert!(fixture.path("boot-resources/snapshot-old").exists());

    assert!(daemon.run_once(Some("nope")).await.is_err());
}

#[tokio::test]
async fn missing_storage_root_fails_startup() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.storage_gc.storage_root = fixture.path("absent");
    assert!(fixture.daemon(config).is_err());

    let mut config = fixture.config();
    config.storage_gc.storage_root = fixture.path("absent");
    config.storage_gc.enabled = false;
    assert!(fixture.daemon(config).is_ok());
}

#[tokio::test]
async fn invalid_interval_fails_startup() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.monitor.interval_min_secs = 10;
    config.monitor.interval_max_secs = 5;
    assert!(fixture.daemon(config).is_err());
}

#[tokio::test(start_paused = true)]
async fn start_and_shutdown() {
    let fixture = Fixture::new();
    let daemon = fixture.daemon(fixture.config()).unwrap();

    daemon.start().unwrap();
    let mut names: Vec<String> = daemon
        .scheduler()
        .handles()
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec![ROW_GC_TASK, MONITOR_TASK, STORAGE_GC_TASK]);

    // The monitor runs immediately
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.backend.state_of("maas-http"), ServiceState::On);

    let report = daemon.shutdown().await;
    assert_eq!(report.finished.len(), 3);
    assert!(report.aborted.is_empty());
    assert!(daemon.locks().held().is_empty());
}

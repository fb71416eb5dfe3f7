//! Garbage collector properties
//!
//! Filesystem fixtures are built in temp dirs with real hard links and
//! symlinks; the row store is an on-disk SQLite database.

use chrono::{Duration, Utc};
use rack_common::paths::{is_snapshot_name, CACHE_DIR, CURRENT_LINK};
use rackd::gc::{link_into_snapshot, DirRemover, RowCollector, StorageCollector};
use rackd::store::SqliteRowStore;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Row collector
// ============================================================================

fn row_store(dir: &Path) -> Arc<SqliteRowStore> {
    let store = SqliteRowStore::open(&dir.join("rows.db")).unwrap();
    store.ensure_table("dns_publication", "created").unwrap();
    Arc::new(store)
}

#[test]
fn rows_older_than_horizon_are_deleted() {
    let temp = TempDir::new().unwrap();
    let store = row_store(temp.path());
    let now = Utc::now();
    store.insert("dns_publication", "created", now - Duration::days(8)).unwrap();
    store.insert("dns_publication", "created", now - Duration::days(6)).unwrap();

    let collector = RowCollector::dns_publications(store.clone());
    assert_eq!(collector.collect(now).unwrap(), 1);
    assert_eq!(store.count("dns_publication").unwrap(), 1);
}

#[test]
fn row_age_equal_to_horizon_is_retained() {
    let temp = TempDir::new().unwrap();
    let store = row_store(temp.path());
    let now = Utc::now();
    let horizon = Duration::days(7);
    store.insert("dns_publication", "created", now - horizon).unwrap();

    let collector = RowCollector::new(store.clone(), "dns_publication", "created", horizon);
    assert_eq!(collector.collect(now).unwrap(), 0);
    assert_eq!(store.count("dns_publication").unwrap(), 1);
}

#[test]
fn row_retention_over_many_ages() {
    let temp = TempDir::new().unwrap();
    let store = row_store(temp.path());
    let now = Utc::now();
    let horizon = Duration::hours(36);

    let ages: Vec<i64> = (0..72).step_by(5).collect();
    for hours in &ages {
        store
            .insert("dns_publication", "created", now - Duration::hours(*hours))
            .unwrap();
    }

    let collector = RowCollector::new(store.clone(), "dns_publication", "created", horizon);
    let deleted = collector.collect(now).unwrap();
    let expected_deleted = ages.iter().filter(|h| Duration::hours(**h) > horizon).count();
    assert_eq!(deleted, expected_deleted);
    assert_eq!(store.count("dns_publication").unwrap(), ages.len() - expected_deleted);
}

// ============================================================================
// Storage collector
// ============================================================================

struct Storage {
    _temp: TempDir,
    root: PathBuf,
}

impl Storage {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("boot-resources");
        fs::create_dir_all(root.join(CACHE_DIR)).unwrap();
        Self { _temp: temp, root }
    }

    fn cache_file(&self, key: &str) -> PathBuf {
        let path = self.root.join(CACHE_DIR).join(key);
        fs::write(&path, key).unwrap();
        path
    }

    fn snapshot(&self, name: &str, files: &[&PathBuf]) -> PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (i, file) in files.iter().enumerate() {
            let logical = PathBuf::from(format!("ubuntu/amd64/file-{}", i));
            link_into_snapshot(file, &dir, &logical).unwrap();
        }
        dir
    }

    fn set_current(&self, name: &str) {
        let link = self.root.join(CURRENT_LINK);
        let _ = fs::remove_file(&link);
        symlink(name, link).unwrap();
    }

    fn snapshots(&self) -> BTreeSet<String> {
        fs::read_dir(&self.root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| is_snapshot_name(n))
            .collect()
    }

    /// Snapshot names plus every path under the root
    fn state(&self) -> (BTreeSet<String>, BTreeSet<PathBuf>) {
        let files = walk(&self.root);
        (self.snapshots(), files)
    }
}

fn walk(root: &Path) -> BTreeSet<PathBuf> {
    let mut out = BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
            let path = entry.path();
            let ft = entry.file_type().unwrap();
            if ft.is_dir() {
                stack.push(path.clone());
            }
            out.insert(path);
        }
    }
    out
}

#[test]
fn only_current_snapshot_survives() {
    let storage = Storage::new();
    for name in ["snapshot-20240101-000000", "snapshot-20240102-000000", "snapshot-20240103-000000"] {
        storage.snapshot(name, &[]);
    }
    // Not snapshot-named: never touched
    fs::create_dir(storage.root.join("staging")).unwrap();
    storage.set_current("snapshot-20240102-000000");

    let report = StorageCollector::new(&storage.root).collect().unwrap();
    assert_eq!(report.snapshots_removed.len(), 2);
    assert!(report.errors.is_empty());
    assert_eq!(
        storage.snapshots(),
        BTreeSet::from(["snapshot-20240102-000000".to_string()])
    );
    assert!(storage.root.join("staging").is_dir());
}

#[test]
fn cache_file_survives_iff_still_linked() {
    let storage = Storage::new();
    let shared = storage.cache_file("shared");
    let old_only = storage.cache_file("old-only");
    let live_only = storage.cache_file("live-only");
    let orphan = storage.cache_file("orphan");

    storage.snapshot("snapshot-old", &[&shared, &old_only]);
    storage.snapshot("snapshot-live", &[&shared, &live_only]);
    storage.set_current("snapshot-live");

    let report = StorageCollector::new(&storage.root).collect().unwrap();
    assert_eq!(report.snapshots_removed, vec!["snapshot-old".to_string()]);
    assert_eq!(report.cache_files_removed, 2);

    assert!(shared.exists());
    assert!(live_only.exists());
    assert!(!old_only.exists());
    assert!(!orphan.exists());
    for survivor in [&shared, &live_only] {
        assert!(fs::metadata(survivor).unwrap().nlink() > 1);
    }
}

#[test]
fn nested_cache_files_are_swept() {
    let storage = Storage::new();
    let nested = storage.root.join(CACHE_DIR).join("ab").join("cd");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("abcd1234"), b"x").unwrap();
    storage.set_current("snapshot-missing");

    let report = StorageCollector::new(&storage.root).collect().unwrap();
    assert_eq!(report.cache_files_removed, 1);
    assert!(!nested.join("abcd1234").exists());
}

#[test]
fn second_pass_changes_nothing() {
    let storage = Storage::new();
    let a = storage.cache_file("a");
    let b = storage.cache_file("b");
    storage.cache_file("c");
    storage.snapshot("snapshot-1", &[&a]);
    storage.snapshot("snapshot-2", &[&a, &b]);
    storage.snapshot("snapshot-3", &[&b]);
    storage.set_current("snapshot-2");

    let collector = StorageCollector::new(&storage.root);
    collector.collect().unwrap();
    let after_first = storage.state();

    let report = collector.collect().unwrap();
    assert!(report.snapshots_removed.is_empty());
    assert_eq!(report.cache_files_removed, 0);
    assert_eq!(storage.state(), after_first);
}

#[test]
fn unremovable_snapshot_does_not_stop_the_sweep() {
    let storage = Storage::new();
    let held = storage.cache_file("held");
    let freed = storage.cache_file("freed");
    let stuck = storage.snapshot("snapshot-a", &[&held]);
    storage.snapshot("snapshot-b", &[&freed]);
    storage.snapshot("snapshot-live", &[]);
    storage.set_current("snapshot-live");

    let remover: DirRemover = Arc::new(|path: &Path| {
        if path.ends_with("snapshot-a") {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        }
        fs::remove_dir_all(path)
    });
    let report = StorageCollector::new(&storage.root)
        .with_dir_remover(remover)
        .collect()
        .unwrap();

    assert_eq!(report.snapshots_removed, vec!["snapshot-b".to_string()]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("snapshot-a"));
    assert!(stuck.is_dir());

    // The cache sweep still runs; the file the stuck snapshot links survives
    assert_eq!(report.cache_files_removed, 1);
    assert!(held.exists());
    assert!(!freed.exists());

    // Retried on the next pass
    let report = StorageCollector::new(&storage.root).collect().unwrap();
    assert_eq!(report.snapshots_removed, vec!["snapshot-a".to_string()]);
    assert!(!held.exists());
}

//! Boot resource storage collector.
//!
//! Layout under the storage root:
//!
//! ```text
//! current -> snapshot-20240101-120000
//! snapshot-20240101-120000/<os>/<release>/<file>   (hard links into cache)
//! cache/<content key>
//! ```
//!
//! A cache file with a single link is referenced by no snapshot. Snapshots
//! are swept first so that the cache sweep sees link counts without the
//! snapshots removed in the same pass.

use chrono::{DateTime, Utc};
use rack_common::paths::{is_snapshot_name, CACHE_DIR, CURRENT_LINK, SNAPSHOT_PREFIX};
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::GcError;

/// Outcome of one storage pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub snapshots_removed: Vec<String>,
    pub cache_files_removed: usize,
    /// Items that could not be removed; retried next pass
    pub errors: Vec<String>,
}

/// Removes one snapshot directory tree
pub type DirRemover = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

pub struct StorageCollector {
    root: PathBuf,
    remove_dir: DirRemover,
}

impl StorageCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remove_dir: Arc::new(|path: &Path| fs::remove_dir_all(path)),
        }
    }

    /// Replace how snapshot trees are removed. Defaults to `remove_dir_all`.
    pub fn with_dir_remover(mut self, remove_dir: DirRemover) -> Self {
        self.remove_dir = remove_dir;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails when the storage root is missing or not a directory.
    pub fn check_root(&self) -> Result<(), GcError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(GcError::StorageRoot {
                path: self.root.clone(),
            }),
        }
    }

    /// Snapshot sweep, then cache sweep.
    pub fn collect(&self) -> Result<GcReport, GcError> {
        self.check_root()?;
        let mut report = GcReport::default();
        self.sweep_snapshots(&mut report)?;
        self.sweep_cache(&mut report);

        if !report.snapshots_removed.is_empty() || report.cache_files_removed > 0 {
            info!(
                root = %self.root.display(),
                "Removed {} snapshots and {} cache files",
                report.snapshots_removed.len(),
                report.cache_files_removed
            );
        }
        Ok(report)
    }

    fn sweep_snapshots(&self, report: &mut GcReport) -> Result<(), GcError> {
        let current = match fs::canonicalize(self.root.join(CURRENT_LINK)) {
            Ok(path) => path,
            Err(e) => {
                warn!(root = %self.root.display(), "No usable '{}' link ({}), skipping snapshot sweep", CURRENT_LINK, e);
                return Ok(());
            }
        };

        let entries = fs::read_dir(&self.root).map_err(|_| GcError::StorageRoot {
            path: self.root.clone(),
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.errors.push(format!("{}: {}", self.root.display(), e));
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_snapshot_name(&name) {
                continue;
            }
            // file_type does not follow symlinks
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => {}
                _ => continue,
            }

            let path = entry.path();
            let is_current = fs::canonicalize(&path)
                .map(|p| p == current)
                .unwrap_or(false);
            if is_current {
                continue;
            }

            match (self.remove_dir)(&path) {
                Ok(()) => {
                    debug!(snapshot = %name, "Removed snapshot");
                    report.snapshots_removed.push(name);
                }
                Err(e) => {
                    warn!(snapshot = %name, "Failed to remove snapshot: {}", e);
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        report.snapshots_removed.sort();
        Ok(())
    }

    fn sweep_cache(&self, report: &mut GcReport) {
        let cache = self.root.join(CACHE_DIR);
        if !cache.is_dir() {
            debug!(cache = %cache.display(), "No cache directory");
            return;
        }

        for entry in WalkDir::new(&cache).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let nlink = match entry.metadata() {
                Ok(meta) => meta.nlink(),
                Err(e) => {
                    report.errors.push(format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            if nlink != 1 {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => report.cache_files_removed += 1,
                Err(e) => {
                    warn!(file = %entry.path().display(), "Failed to remove cache file: {}", e);
                    report.errors.push(format!("{}: {}", entry.path().display(), e));
                }
            }
        }
    }
}

/// Directory name for a snapshot taken at `at`
pub fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, at.format("%Y%m%d-%H%M%S"))
}

/// Reference `cache_file` from a snapshot by hard-linking it in as
/// `logical_name`, creating parent directories as needed.
pub fn link_into_snapshot(cache_file: &Path, snapshot_dir: &Path, logical_name: &Path) -> io::Result<PathBuf> {
    let target = snapshot_dir.join(logical_name);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(cache_file, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn cache_file(root: &Path, key: &str) -> PathBuf {
        let cache = root.join(CACHE_DIR);
        fs::create_dir_all(&cache).unwrap();
        let path = cache.join(key);
        fs::write(&path, key).unwrap();
        path
    }

    #[test]
    fn test_missing_root() {
        let temp = TempDir::new().unwrap();
        let collector = StorageCollector::new(temp.path().join("missing"));
        assert!(matches!(collector.collect(), Err(GcError::StorageRoot { .. })));
    }

    #[test]
    fn test_without_current_only_cache_is_swept() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("snapshot-1")).unwrap();
        cache_file(root, "orphan");

        let report = StorageCollector::new(root).collect().unwrap();
        assert!(report.snapshots_removed.is_empty());
        assert!(root.join("snapshot-1").is_dir());
        assert_eq!(report.cache_files_removed, 1);
    }

    #[test]
    fn test_symlinked_snapshot_name_is_not_followed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let live = root.join("snapshot-live");
        fs::create_dir(&live).unwrap();
        symlink(&live, root.join(CURRENT_LINK)).unwrap();

        let elsewhere = TempDir::new().unwrap();
        symlink(elsewhere.path(), root.join("snapshot-alias")).unwrap();

        let report = StorageCollector::new(root).collect().unwrap();
        assert!(report.snapshots_removed.is_empty());
        assert!(elsewhere.path().is_dir());
    }

    #[test]
    fn test_snapshot_sweep_releases_cache_links() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let file = cache_file(root, "abc123");

        let old = root.join("snapshot-old");
        let live = root.join("snapshot-live");
        link_into_snapshot(&file, &old, Path::new("ubuntu/jammy/boot-kernel")).unwrap();
        fs::create_dir(&live).unwrap();
        symlink("snapshot-live", root.join(CURRENT_LINK)).unwrap();

        let report = StorageCollector::new(root).collect().unwrap();
        assert_eq!(report.snapshots_removed, vec!["snapshot-old".to_string()]);
        // Only the old snapshot referenced the file, so it goes in the same pass
        assert_eq!(report.cache_files_removed, 1);
        assert!(!file.exists());
        assert!(live.is_dir());
    }

    #[test]
    fn test_snapshot_name_format() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(snapshot_name(at), "snapshot-20240305-070809");
        assert!(is_snapshot_name(&snapshot_name(at)));
    }
}

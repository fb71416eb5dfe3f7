//! Well-known paths and filesystem naming conventions.

/// Config file path
pub const CONFIG_PATH: &str = "/etc/rackd/config.toml";

/// Daemon state directory (generated service configs, status file)
pub const STATE_DIR: &str = "/var/lib/rackd";

/// Root of the content-addressed boot resource storage
pub const STORAGE_ROOT: &str = "/var/lib/rackd/boot-resources";

/// Symlink under the storage root naming the live snapshot
pub const CURRENT_LINK: &str = "current";

/// Directory under the storage root holding content-addressed files
pub const CACHE_DIR: &str = "cache";

/// Name prefix of snapshot directories under the storage root
pub const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Service status snapshot written after each monitor pass
pub const STATUS_FILE: &str = "service-status.json";

/// Whether a directory entry name follows the snapshot naming convention.
pub fn is_snapshot_name(name: &str) -> bool {
    name.len() > SNAPSHOT_PREFIX.len() && name.starts_with(SNAPSHOT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_snapshot_name() {
        assert!(is_snapshot_name("snapshot-20240101-120000"));
        assert!(!is_snapshot_name("snapshot-"));
        assert!(!is_snapshot_name("cache"));
        assert!(!is_snapshot_name("current"));
        assert!(!is_snapshot_name("old-snapshot-1"));
    }
}

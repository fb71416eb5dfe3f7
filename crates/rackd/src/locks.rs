//! Named exclusive locks for operations that mutate shared external state.
//!
//! The set of locks is fixed at compile time. Guards release on drop, so a
//! failing or unwinding holder never leaks a lock. Locks are not re-entrant:
//! acquiring a name you already hold waits forever.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Every lock the daemon knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// One service reconciliation at a time (scheduled pass or ensure-now)
    ServiceMonitor,
    /// Boot image import and the storage collector
    ImportImages,
    /// DHCP server reconfiguration
    DhcpConfig,
    /// DNS publication writes and the row collector
    DnsPublication,
}

impl LockName {
    pub const ALL: [LockName; 4] = [
        LockName::ServiceMonitor,
        LockName::ImportImages,
        LockName::DhcpConfig,
        LockName::DnsPublication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::ServiceMonitor => "service-monitor",
            LockName::ImportImages => "import-images",
            LockName::DhcpConfig => "dhcp-config",
            LockName::DnsPublication => "dns-publication",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock '{0}' is held by another operation")]
    Busy(LockName),
}

/// Registry of the daemon's named locks. Clones share the same locks.
#[derive(Clone)]
pub struct LockRegistry {
    locks: Arc<[Arc<Mutex<()>>; 4]>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(std::array::from_fn(|_| Arc::new(Mutex::new(())))),
        }
    }

    /// Wait until `name` is free and take it.
    pub async fn acquire(&self, name: LockName) -> LockGuard {
        let guard = Arc::clone(&self.locks[name.index()]).lock_owned().await;
        debug!(lock = %name, "Lock acquired");
        LockGuard::new(name, guard)
    }

    /// Take `name` only if nobody holds it.
    pub fn try_acquire(&self, name: LockName) -> Result<LockGuard, LockError> {
        let guard = Arc::clone(&self.locks[name.index()])
            .try_lock_owned()
            .map_err(|_| LockError::Busy(name))?;
        debug!(lock = %name, "Lock acquired");
        Ok(LockGuard::new(name, guard))
    }

    pub fn is_locked(&self, name: LockName) -> bool {
        self.locks[name.index()].try_lock().is_err()
    }

    /// Names currently held by someone
    pub fn held(&self) -> Vec<LockName> {
        LockName::ALL
            .into_iter()
            .filter(|name| self.is_locked(*name))
            .collect()
    }

    /// Wait for every lock to be free, at most `timeout` in total. Returns
    /// the names still held when time ran out.
    pub async fn wait_released(&self, timeout: Duration) -> Vec<LockName> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut still_held = Vec::new();
        for name in LockName::ALL {
            let lock = &self.locks[name.index()];
            if tokio::time::timeout_at(deadline, lock.lock()).await.is_err() {
                still_held.push(name);
            }
        }
        still_held
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped hold on a named lock
pub struct LockGuard {
    name: LockName,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    fn new(name: LockName, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            name,
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    pub fn name(&self) -> LockName {
        self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(
            lock = %self.name,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Lock released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_reports_busy() {
        let locks = LockRegistry::new();
        let guard = locks.acquire(LockName::ImportImages).await;

        assert!(locks.is_locked(LockName::ImportImages));
        assert!(matches!(
            locks.try_acquire(LockName::ImportImages),
            Err(LockError::Busy(LockName::ImportImages))
        ));
        // Other names are independent
        assert!(locks.try_acquire(LockName::DhcpConfig).is_ok());

        drop(guard);
        assert!(!locks.is_locked(LockName::ImportImages));
    }

    #[tokio::test]
    async fn test_released_when_holder_fails() {
        let locks = LockRegistry::new();

        async fn failing_op(locks: &LockRegistry) -> Result<(), &'static str> {
            let _guard = locks.acquire(LockName::DhcpConfig).await;
            Err("reconfigure failed")
        }

        assert!(failing_op(&locks).await.is_err());
        assert!(locks.held().is_empty());
    }

    #[tokio::test]
    async fn test_wait_released_waits_for_blocking_holder() {
        let locks = LockRegistry::new();
        let guard = locks.acquire(LockName::ImportImages).await;
        let work = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            std::thread::sleep(Duration::from_millis(200));
        });

        assert!(locks.wait_released(Duration::from_secs(5)).await.is_empty());
        assert!(locks.held().is_empty());
        work.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_released_reports_stuck_holders() {
        let locks = LockRegistry::new();
        let _guard = locks.acquire(LockName::DnsPublication).await;
        assert_eq!(
            locks.wait_released(Duration::from_millis(50)).await,
            vec![LockName::DnsPublication]
        );
    }

    #[tokio::test]
    async fn test_clones_share_locks() {
        let locks = LockRegistry::new();
        let other = locks.clone();
        let _guard = locks.acquire(LockName::ServiceMonitor).await;
        assert!(other.is_locked(LockName::ServiceMonitor));
        assert_eq!(other.held(), vec![LockName::ServiceMonitor]);
    }
}

//! Handle to one registered periodic task

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use super::IntervalRange;

/// State shared between a handle and its loop
pub(super) struct HandleShared {
    pub(super) name: String,
    pub(super) range: IntervalRange,
    pub(super) running: AtomicBool,
    pub(super) cancelled: AtomicBool,
    pub(super) runs: AtomicU64,
    pub(super) failures: AtomicU64,
    /// Wakes a sleeping loop on cancel
    pub(super) wake: Notify,
    pub(super) join: Mutex<Option<JoinHandle<()>>>,
}

impl HandleShared {
    pub(super) fn new(name: String, range: IntervalRange) -> Self {
        Self {
            name,
            range,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            wake: Notify::new(),
            join: Mutex::new(None),
        }
    }

    pub(super) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One registered periodic task.
///
/// Cloning is cheap; all clones refer to the same loop.
#[derive(Clone)]
pub struct ScheduleHandle {
    pub(super) shared: Arc<HandleShared>,
}

impl ScheduleHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn range(&self) -> IntervalRange {
        self.shared.range
    }

    /// True while a tick is executing
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Completed ticks, failed ones included
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Stop future ticks. A tick already in flight runs to completion;
    /// use [`join`](Self::join) to wait for it.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit if the loop is not waiting yet
            self.shared.wake.notify_one();
        }
    }

    /// Wait for the loop to exit, at most `grace`. Returns false when the
    /// loop had to be aborted.
    pub async fn join(&self, grace: Duration) -> bool {
        let handle = match self.shared.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut handle) = handle else {
            return true;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(task = %self.shared.name, "Task did not finish within {:?}, aborting", grace);
                handle.abort();
                // Resolves once the aborted task is dropped along with any guards it held
                let _ = handle.await;
                false
            }
        }
    }
}

impl std::fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("name", &self.shared.name)
            .field("range", &self.shared.range)
            .field("running", &self.is_running())
            .field("cancelled", &self.is_cancelled())
            .field("runs", &self.runs())
            .finish()
    }
}

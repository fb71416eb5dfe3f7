//! Jittered periodic task scheduler
//!
//! Runs each registered task in its own loop:
//! - a tick never overlaps the previous tick of the same task
//! - a failing or panicking tick is logged and counted, never fatal
//! - every re-arm draws a fresh delay from the task's interval range
//! - cancellation wakes a sleeping loop immediately but never interrupts a tick

pub mod handle;
pub mod interval;

pub use handle::ScheduleHandle;
pub use interval::IntervalRange;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info};

use crate::metrics::MaintenanceMetrics;
use handle::HandleShared;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("interval minimum {min:?} exceeds maximum {max:?}")]
    InvalidInterval { min: Duration, max: Duration },

    #[error("task '{0}' is already registered")]
    Duplicate(String),

    #[error("no async runtime available to run task '{0}'")]
    NoRuntime(String),
}

/// A unit of periodic work
pub trait Task: Send + Sync + 'static {
    fn run(&self) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Task for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        self().boxed()
    }
}

/// Called with the task name and the delay chosen at every re-arm
pub type RearmObserver = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Outcome of [`Scheduler::shutdown`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: Vec<String>,
    pub aborted: Vec<String>,
}

/// Owner of all periodic loops in the process
#[derive(Default)]
pub struct Scheduler {
    handles: Mutex<Vec<ScheduleHandle>>,
    metrics: Option<MaintenanceMetrics>,
    rearm_observer: Option<RearmObserver>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: MaintenanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_rearm_observer(mut self, observer: RearmObserver) -> Self {
        self.rearm_observer = Some(observer);
        self
    }

    /// Start a loop for `task`. With `run_immediately` the first tick fires
    /// right away, otherwise after one jittered delay.
    pub fn register<T: Task>(
        &self,
        name: impl Into<String>,
        range: IntervalRange,
        run_immediately: bool,
        task: T,
    ) -> Result<ScheduleHandle, SchedulerError> {
        let name = name.into();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SchedulerError::NoRuntime(name.clone()))?;

        let mut handles = self.lock_handles();
        if handles.iter().any(|h| h.name() == name && !h.is_cancelled()) {
            return Err(SchedulerError::Duplicate(name));
        }

        let shared = Arc::new(HandleShared::new(name.clone(), range));
        let join = runtime.spawn(run_loop(
            Arc::clone(&shared),
            Arc::new(task),
            run_immediately,
            self.metrics.clone(),
            self.rearm_observer.clone(),
        ));
        if let Ok(mut slot) = shared.join.lock() {
            *slot = Some(join);
        }

        info!(
            task = %name,
            "Scheduled every {}-{}s (run_immediately={})",
            range.min().as_secs(),
            range.max().as_secs(),
            run_immediately
        );

        let handle = ScheduleHandle { shared };
        handles.push(handle.clone());
        Ok(handle)
    }

    /// Stop future ticks of `handle`; an in-flight tick completes.
    pub fn cancel(&self, handle: &ScheduleHandle) {
        handle.cancel();
    }

    pub fn handles(&self) -> Vec<ScheduleHandle> {
        self.lock_handles().clone()
    }

    /// Cancel every loop, then wait for in-flight ticks. The whole wait is
    /// bounded by `grace`; loops still busy after that are aborted.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let handles: Vec<ScheduleHandle> = self.lock_handles().drain(..).collect();
        for handle in &handles {
            handle.cancel();
        }

        let deadline = TokioInstant::now() + grace;
        let mut report = ShutdownReport::default();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(TokioInstant::now());
            if handle.join(remaining).await {
                report.finished.push(handle.name().to_string());
            } else {
                report.aborted.push(handle.name().to_string());
            }
        }
        report
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<ScheduleHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_loop(
    shared: Arc<HandleShared>,
    task: Arc<dyn Task>,
    run_immediately: bool,
    metrics: Option<MaintenanceMetrics>,
    observer: Option<RearmObserver>,
) {
    let mut delay = if run_immediately {
        Duration::ZERO
    } else {
        next_delay(&shared, observer.as_ref())
    };

    loop {
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        if shared.is_cancelled() {
            break;
        }

        shared.running.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(task.run()).catch_unwind().await;
        shared.running.store(false, Ordering::SeqCst);
        shared.runs.fetch_add(1, Ordering::SeqCst);

        let result = match outcome {
            Ok(Ok(())) => {
                debug!(task = %shared.name, elapsed_ms = started.elapsed().as_millis() as u64, "Tick complete");
                "ok"
            }
            Ok(Err(e)) => {
                shared.failures.fetch_add(1, Ordering::SeqCst);
                error!(task = %shared.name, "Tick failed: {:#}", e);
                "error"
            }
            Err(_) => {
                shared.failures.fetch_add(1, Ordering::SeqCst);
                error!(task = %shared.name, "Tick panicked");
                "panic"
            }
        };
        if let Some(metrics) = &metrics {
            metrics.record_task_run(&shared.name, result);
        }

        if shared.is_cancelled() {
            break;
        }
        delay = next_delay(&shared, observer.as_ref());
    }

    debug!(task = %shared.name, "Loop stopped");
}

fn next_delay(shared: &HandleShared, observer: Option<&RearmObserver>) -> Duration {
    let delay = shared.range.sample(&mut rand::thread_rng());
    debug!(task = %shared.name, delay_secs = delay.as_secs_f64(), "Re-armed");
    if let Some(observer) = observer {
        observer(&shared.name, delay);
    }
    delay
}

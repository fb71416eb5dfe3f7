//! rackd - rack controller maintenance daemon
//!
//! Periodic control loops that keep locally managed services in the state
//! the cluster configuration asks for, and reclaim expired rows and
//! unreferenced boot resources.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod gc;
pub mod locks;
pub mod metrics;
pub mod scheduler;
pub mod services;
pub mod store;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use locks::{LockGuard, LockName, LockRegistry};
pub use scheduler::{IntervalRange, ScheduleHandle, Scheduler};
pub use services::ServiceReconciler;

//! Monitored OS services: definitions, process backends and the reconciler

pub mod backend;
pub mod descriptor;
pub mod reconciler;
pub mod record;

pub use backend::{BackendError, FakeBackend, ProcessBackend, SupervisorBackend, SystemdBackend};
pub use descriptor::{rack_catalog, Condition, KillOptions, MonitorPolicy, ServiceDescriptor};
pub use reconciler::{ReconcileError, ServiceReconciler, ServiceReport};
pub use record::{ActionRecord, MonitorRecord, ServiceAction};

//! Process backends: whatever actually starts and stops OS services.
//!
//! Native installs talk to systemd, sandboxed installs to the bundled
//! supervisor. Tests use [`FakeBackend`].

pub mod command;
pub mod fake;
pub mod supervisor;
pub mod systemd;

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use fake::FakeBackend;
pub use supervisor::SupervisorBackend;
pub use systemd::SystemdBackend;

use async_trait::async_trait;
use rack_common::ObservedState;

use super::descriptor::KillOptions;

/// Process backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown service '{0}'")]
    UnknownUnit(String),

    #[error("unable to parse status of '{service}': {detail}")]
    Parse { service: String, detail: String },

    #[error("'{command}' timed out after {timeout_secs}s ({retries} attempts)")]
    Timeout {
        command: String,
        timeout_secs: u64,
        retries: u32,
    },

    #[error("{action} of '{service}' failed: {stderr}")]
    ActionFailed {
        service: String,
        action: String,
        stderr: String,
    },

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend unreachable: {0}")]
    Unreachable(String),
}

/// Commands a service manager must support. Every call reports failure
/// explicitly; none of them is a silent no-op.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Current run state of `name`
    async fn status(&self, name: &str) -> Result<ObservedState, BackendError>;

    async fn start(&self, name: &str) -> Result<(), BackendError>;

    /// Stop `name`. With `kill` set the service is signalled instead of
    /// stopped gracefully.
    async fn stop(&self, name: &str, kill: Option<&KillOptions>) -> Result<(), BackendError>;

    async fn restart(&self, name: &str) -> Result<(), BackendError>;

    async fn reload(&self, name: &str) -> Result<(), BackendError>;

    async fn kill(&self, name: &str, options: &KillOptions) -> Result<(), BackendError>;
}

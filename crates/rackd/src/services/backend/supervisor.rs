//! Supervisor backend for sandboxed installs.
//!
//! The bundle ships its own supervisord, reached through
//! `<bundle>/bin/run-supervisorctl`. Supervisor reports no process
//! sub-state, so the canonical one is synthesized from the active state.

use async_trait::async_trait;
use rack_common::{ObservedState, ServiceState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{BackendError, CommandOutput, CommandRunner, ProcessBackend};
use crate::services::descriptor::KillOptions;

pub struct SupervisorBackend {
    runner: Arc<dyn CommandRunner>,
    ctl: PathBuf,
}

impl SupervisorBackend {
    /// `bundle_root` is the sandbox root, e.g. `$SNAP`
    pub fn new(runner: Arc<dyn CommandRunner>, bundle_root: &Path) -> Self {
        Self {
            runner,
            ctl: bundle_root.join("bin").join("run-supervisorctl"),
        }
    }

    async fn supervisorctl(&self, args: &[&str]) -> Result<CommandOutput, BackendError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(&self.ctl.to_string_lossy(), &args).await
    }

    async fn action(&self, action: &str, name: &str) -> Result<(), BackendError> {
        let output = self.supervisorctl(&[action, name]).await?;
        check(name, action, output)
    }
}

fn check(name: &str, action: &str, output: CommandOutput) -> Result<(), BackendError> {
    if output.success() {
        Ok(())
    } else {
        Err(BackendError::ActionFailed {
            service: name.to_string(),
            action: action.to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ProcessBackend for SupervisorBackend {
    async fn status(&self, name: &str) -> Result<ObservedState, BackendError> {
        let output = self.supervisorctl(&["status", name]).await?;
        parse_status(name, &output)
    }

    async fn start(&self, name: &str) -> Result<(), BackendError> {
        self.action("start", name).await
    }

    async fn stop(&self, name: &str, kill: Option<&KillOptions>) -> Result<(), BackendError> {
        match kill {
            Some(options) => self.kill(name, options).await,
            None => self.action("stop", name).await,
        }
    }

    async fn restart(&self, name: &str) -> Result<(), BackendError> {
        self.action("restart", name).await
    }

    async fn reload(&self, name: &str) -> Result<(), BackendError> {
        // supervisorctl has no per-program reload; signal HUP instead
        let output = self.supervisorctl(&["signal", "HUP", name]).await?;
        check(name, "reload", output)
    }

    /// supervisord cannot kill with a chosen signal, so look up the pid and
    /// signal it directly.
    async fn kill(&self, name: &str, options: &KillOptions) -> Result<(), BackendError> {
        let output = self.supervisorctl(&["pid", name]).await?;
        if !output.success() {
            return check(name, "kill", output);
        }

        let pid: u32 = output.stdout.trim().parse().unwrap_or(0);
        if pid == 0 {
            debug!(service = name, "No pid reported, already dead");
            return Ok(());
        }

        let args = vec!["-s".to_string(), options.signal.clone(), pid.to_string()];
        let output = self.runner.run("kill", &args).await?;
        check(name, "kill", output)
    }
}

fn map_status(token: &str) -> Option<ServiceState> {
    match token {
        "STARTING" | "RUNNING" => Some(ServiceState::On),
        "STOPPED" => Some(ServiceState::Off),
        "FATAL" | "EXITED" => Some(ServiceState::Dead),
        _ => None,
    }
}

/// Parse `supervisorctl status <name>` output, e.g.
/// `dhcpd   RUNNING   pid 1234, uptime 0:01:02`.
pub fn parse_status(name: &str, output: &CommandOutput) -> Result<ObservedState, BackendError> {
    // Exit codes up to 3 only distinguish running from not running
    if output.code > 3 {
        return Err(BackendError::Parse {
            service: name.to_string(),
            detail: format!("supervisorctl exited {}: {}", output.code, output.stdout.trim()),
        });
    }

    let mut tokens = output.stdout.split_whitespace();
    let (reported, status) = match (tokens.next(), tokens.next()) {
        (Some(reported), Some(status)) => (reported, status),
        _ => {
            return Err(BackendError::Parse {
                service: name.to_string(),
                detail: "empty supervisorctl output".to_string(),
            })
        }
    };

    if reported != name {
        return Err(BackendError::Parse {
            service: name.to_string(),
            detail: format!("supervisorctl returned status for '{}'", reported),
        });
    }

    let state = map_status(status).ok_or_else(|| BackendError::Parse {
        service: name.to_string(),
        detail: format!("supervisorctl returned status as '{}'", status),
    })?;
    Ok(ObservedState::canonical(state))
}

//! systemd backend for native installs

use async_trait::async_trait;
use rack_common::{ObservedState, ServiceState};
use std::sync::Arc;

use super::{BackendError, CommandOutput, CommandRunner, ProcessBackend, TokioCommandRunner};
use crate::services::descriptor::KillOptions;

/// Drives units through `sudo systemctl`
pub struct SystemdBackend {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn systemctl(
        &self,
        action: &str,
        opts: &[String],
        unit: &str,
    ) -> Result<CommandOutput, BackendError> {
        let mut args = vec![
            "--non-interactive".to_string(),
            "systemctl".to_string(),
            action.to_string(),
        ];
        args.extend(opts.iter().cloned());
        args.push(unit.to_string());
        self.runner.run("sudo", &args).await
    }

    async fn action(&self, action: &str, opts: &[String], unit: &str) -> Result<(), BackendError> {
        let output = self.systemctl(action, opts, unit).await?;
        if output.success() {
            Ok(())
        } else {
            Err(BackendError::ActionFailed {
                service: unit.to_string(),
                action: action.to_string(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

impl Default for SystemdBackend {
    fn default() -> Self {
        Self::new(Arc::new(TokioCommandRunner::default()))
    }
}

#[async_trait]
impl ProcessBackend for SystemdBackend {
    async fn status(&self, name: &str) -> Result<ObservedState, BackendError> {
        // systemctl status exits non-zero for anything not active, so only
        // the output matters.
        let output = self.systemctl("status", &[], name).await?;
        parse_status(name, &output.stdout)
    }

    async fn start(&self, name: &str) -> Result<(), BackendError> {
        self.action("start", &[], name).await
    }

    async fn stop(&self, name: &str, kill: Option<&KillOptions>) -> Result<(), BackendError> {
        match kill {
            Some(options) => self.kill(name, options).await,
            None => self.action("stop", &[], name).await,
        }
    }

    async fn restart(&self, name: &str) -> Result<(), BackendError> {
        self.action("restart", &[], name).await
    }

    async fn reload(&self, name: &str) -> Result<(), BackendError> {
        self.action("reload", &[], name).await
    }

    async fn kill(&self, name: &str, options: &KillOptions) -> Result<(), BackendError> {
        self.action("kill", &["-s".to_string(), options.signal.clone()], name)
            .await
    }
}

fn map_active(token: &str) -> Option<ServiceState> {
    match token {
        "active" => Some(ServiceState::On),
        "reloading" => Some(ServiceState::Dead),
        "inactive" => Some(ServiceState::Off),
        "failed" => Some(ServiceState::Dead),
        "activating" => Some(ServiceState::Dead),
        "deactivating" => Some(ServiceState::Off),
        _ => None,
    }
}

/// Parse `systemctl status` output.
///
/// ```text
/// maas-dhcpd.service - MAAS instance of ISC DHCP server for IPv4
///    Loaded: loaded (/lib/systemd/system/maas-dhcpd.service; enabled)
///    Active: failed (Result: exit-code) since Wed 2016-01-20 10:35:43 EST
/// ```
pub fn parse_status(unit: &str, output: &str) -> Result<ObservedState, BackendError> {
    for line in output.lines().map(str::trim) {
        if line.starts_with("Loaded") {
            let load = line.split_whitespace().nth(1).unwrap_or_default();
            if load != "loaded" {
                return Err(BackendError::UnknownUnit(unit.to_string()));
            }
        }
        if line.starts_with("Active") {
            let mut parts = line.splitn(3, ' ');
            let _label = parts.next();
            let active = parts.next().unwrap_or_default();
            let process = parts
                .next()
                .map(|rest| rest.trim_start_matches('(').split(')').next().unwrap_or_default())
                .map(str::to_string);

            let state = map_active(active).ok_or_else(|| BackendError::Parse {
                service: unit.to_string(),
                detail: format!("active state reported as '{}'", active),
            })?;
            return Ok(ObservedState::new(state, process));
        }
    }

    Err(BackendError::Parse {
        service: unit.to_string(),
        detail: "no Active line in systemctl output".to_string(),
    })
}

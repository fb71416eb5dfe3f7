//! Monitored service definitions and the built-in rack catalog.

use rack_common::{ExpectedState, PackagingMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::Settings;

/// Signal sent when a service must be killed rather than stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillOptions {
    pub signal: String,
}

impl KillOptions {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
        }
    }
}

impl Default for KillOptions {
    fn default() -> Self {
        Self::new("SIGKILL")
    }
}

/// One requirement a toggleable service needs to be expected on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Boolean setting must be true
    SettingTrue {
        key: String,
        #[serde(default)]
        default: bool,
        reason: String,
    },
    /// Boolean setting must be false
    SettingFalse {
        key: String,
        #[serde(default)]
        default: bool,
        reason: String,
    },
    /// String setting must be absent or blank
    SettingEmpty { key: String, reason: String },
    /// File must exist; relative paths are under the daemon state dir
    FileExists { path: PathBuf, reason: String },
}

impl Condition {
    fn setting_key(&self) -> Option<&str> {
        match self {
            Condition::SettingTrue { key, .. }
            | Condition::SettingFalse { key, .. }
            | Condition::SettingEmpty { key, .. } => Some(key),
            Condition::FileExists { .. } => None,
        }
    }

    fn holds(&self, settings: &Settings, state_dir: &Path) -> bool {
        match self {
            Condition::SettingTrue { key, default, .. } => settings.get_bool(key, *default),
            Condition::SettingFalse { key, default, .. } => !settings.get_bool(key, *default),
            Condition::SettingEmpty { key, .. } => settings.is_empty(key),
            Condition::FileExists { path, .. } => state_dir.join(path).exists(),
        }
    }

    fn reason(&self) -> &str {
        match self {
            Condition::SettingTrue { reason, .. }
            | Condition::SettingFalse { reason, .. }
            | Condition::SettingEmpty { reason, .. }
            | Condition::FileExists { reason, .. } => reason,
        }
    }
}

/// How a service's expected state is decided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorPolicy {
    AlwaysOn,
    Toggleable { conditions: Vec<Condition> },
}

/// Static definition of one monitored service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Logical name, unique within the daemon
    pub name: String,
    /// Unit name under native packaging
    pub service_name: String,
    /// Program name under the sandboxed supervisor
    pub sandboxed_name: String,
    pub policy: MonitorPolicy,
    #[serde(default)]
    pub kill_signal: Option<String>,
}

impl ServiceDescriptor {
    pub fn always_on(name: &str, service_name: &str, sandboxed_name: &str) -> Self {
        Self {
            name: name.to_string(),
            service_name: service_name.to_string(),
            sandboxed_name: sandboxed_name.to_string(),
            policy: MonitorPolicy::AlwaysOn,
            kill_signal: None,
        }
    }

    pub fn toggleable(
        name: &str,
        service_name: &str,
        sandboxed_name: &str,
        conditions: Vec<Condition>,
    ) -> Self {
        Self {
            policy: MonitorPolicy::Toggleable { conditions },
            ..Self::always_on(name, service_name, sandboxed_name)
        }
    }

    pub fn with_kill_signal(mut self, signal: &str) -> Self {
        self.kill_signal = Some(signal.to_string());
        self
    }

    /// Name the process backend knows this service by
    pub fn backend_name(&self, mode: PackagingMode) -> &str {
        match mode {
            PackagingMode::Native => &self.service_name,
            PackagingMode::Sandboxed => &self.sandboxed_name,
        }
    }

    pub fn kill_options(&self) -> KillOptions {
        self.kill_signal
            .as_deref()
            .map(KillOptions::new)
            .unwrap_or_default()
    }

    /// Settings this service's policy reads
    pub fn setting_keys(&self) -> Vec<String> {
        match &self.policy {
            MonitorPolicy::AlwaysOn => Vec::new(),
            MonitorPolicy::Toggleable { conditions } => conditions
                .iter()
                .filter_map(Condition::setting_key)
                .map(str::to_string)
                .collect(),
        }
    }

    /// Decide whether the service should be running right now.
    pub fn resolve_expected(&self, settings: &Settings, state_dir: &Path) -> ExpectedState {
        match &self.policy {
            MonitorPolicy::AlwaysOn => ExpectedState::on(),
            MonitorPolicy::Toggleable { conditions } => {
                match conditions.iter().find(|c| !c.holds(settings, state_dir)) {
                    Some(failing) => ExpectedState::off(failing.reason()),
                    None => ExpectedState::on(),
                }
            }
        }
    }
}

/// Services every rack controller monitors
pub fn rack_catalog() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor::always_on("http", "maas-http", "http"),
        ServiceDescriptor::always_on("syslog_rack", "maas-syslog", "syslog"),
        ServiceDescriptor::toggleable(
            "dhcpd",
            "maas-dhcpd",
            "dhcpd",
            vec![Condition::FileExists {
                path: PathBuf::from("dhcpd.conf"),
                reason: "DHCPv4 is not enabled on any VLAN served by this rack.".to_string(),
            }],
        )
        .with_kill_signal("SIGKILL"),
        ServiceDescriptor::toggleable(
            "dhcpd6",
            "maas-dhcpd6",
            "dhcpd6",
            vec![Condition::FileExists {
                path: PathBuf::from("dhcpd6.conf"),
                reason: "DHCPv6 is not enabled on any VLAN served by this rack.".to_string(),
            }],
        )
        .with_kill_signal("SIGKILL"),
        ServiceDescriptor::toggleable(
            "ntp_rack",
            "chrony",
            "ntp",
            vec![Condition::SettingFalse {
                key: "ntp_external_only".to_string(),
                default: false,
                reason: "External NTP servers are used directly; rack NTP is not needed."
                    .to_string(),
            }],
        ),
        ServiceDescriptor::toggleable(
            "dns_rack",
            "bind9",
            "bind9",
            vec![Condition::SettingTrue {
                key: "dns_rack_enabled".to_string(),
                default: true,
                reason: "Rack DNS is disabled.".to_string(),
            }],
        ),
        ServiceDescriptor::toggleable(
            "proxy_rack",
            "maas-proxy",
            "proxy",
            vec![
                Condition::SettingTrue {
                    key: "enable_http_proxy".to_string(),
                    default: true,
                    reason: "Proxy is disabled.".to_string(),
                },
                Condition::SettingEmpty {
                    key: "http_proxy".to_string(),
                    reason: "An external proxy is configured.".to_string(),
                },
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rack_common::ServiceState;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn find(name: &str) -> ServiceDescriptor {
        rack_catalog().into_iter().find(|d| d.name == name).unwrap()
    }

    #[test]
    fn test_catalog_names_unique() {
        let catalog = rack_catalog();
        let mut names: Vec<_> = catalog.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), catalog.len());
    }

    #[test]
    fn test_backend_name_follows_packaging() {
        let http = find("http");
        assert_eq!(http.backend_name(PackagingMode::Native), "maas-http");
        assert_eq!(http.backend_name(PackagingMode::Sandboxed), "http");
    }

    #[test]
    fn test_proxy_needs_enabled_and_no_external_proxy() {
        let proxy = find("proxy_rack");
        let temp = TempDir::new().unwrap();

        let on = proxy.resolve_expected(&settings(&[("enable_http_proxy", "true")]), temp.path());
        assert_eq!(on.state, ServiceState::On);

        let disabled =
            proxy.resolve_expected(&settings(&[("enable_http_proxy", "false")]), temp.path());
        assert_eq!(disabled, ExpectedState::off("Proxy is disabled."));

        let external = proxy.resolve_expected(
            &settings(&[("enable_http_proxy", "true"), ("http_proxy", "http://up:3128")]),
            temp.path(),
        );
        assert_eq!(external, ExpectedState::off("An external proxy is configured."));
    }

    #[test]
    fn test_dhcp_follows_config_file() {
        let dhcpd = find("dhcpd");
        let temp = TempDir::new().unwrap();
        let empty = settings(&[]);

        assert_eq!(dhcpd.resolve_expected(&empty, temp.path()).state, ServiceState::Off);
        std::fs::write(temp.path().join("dhcpd.conf"), "subnet {}").unwrap();
        assert_eq!(dhcpd.resolve_expected(&empty, temp.path()).state, ServiceState::On);
        assert_eq!(dhcpd.kill_options().signal, "SIGKILL");
    }

    #[test]
    fn test_setting_keys_and_default_kill() {
        assert_eq!(
            find("proxy_rack").setting_keys(),
            vec!["enable_http_proxy".to_string(), "http_proxy".to_string()]
        );
        assert!(find("http").setting_keys().is_empty());
        assert_eq!(find("http").kill_options(), KillOptions::default());
    }

    #[test]
    fn test_descriptor_from_toml() {
        let desc: ServiceDescriptor = toml::from_str(
            r#"
            name = "tftp"
            service_name = "tftpd-hpa"
            sandboxed_name = "tftp"
            kill_signal = "SIGTERM"

            [policy]
            kind = "toggleable"

            [[policy.conditions]]
            kind = "setting_true"
            key = "tftp_enabled"
            reason = "TFTP is disabled."
            "#,
        )
        .unwrap();
        assert_eq!(desc.kill_options().signal, "SIGTERM");
        assert_eq!(desc.setting_keys(), vec!["tftp_enabled".to_string()]);
    }
}

//! Packaging mode detection.
//!
//! Under the sandboxed (snap) packaging, services are driven through the
//! bundled supervisor and carry different process names.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable set by the sandbox runtime
pub const SNAP_ENV: &str = "SNAP";

/// How the daemon and its managed services were installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingMode {
    /// Distribution packages managed by systemd
    Native,
    /// Sandboxed bundle managed by its own supervisor
    Sandboxed,
}

impl PackagingMode {
    /// Detect from the process environment
    pub fn detect() -> Self {
        Self::from_snap_env(std::env::var(SNAP_ENV).ok().as_deref())
    }

    pub fn from_snap_env(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => PackagingMode::Sandboxed,
            _ => PackagingMode::Native,
        }
    }

    pub fn is_sandboxed(self) -> bool {
        self == PackagingMode::Sandboxed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackagingMode::Native => "native",
            PackagingMode::Sandboxed => "sandboxed",
        }
    }
}

/// Root of the sandbox bundle, if running inside one
pub fn snap_root() -> Option<PathBuf> {
    std::env::var(SNAP_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Rack controller maintenance daemon
#[derive(Parser, Debug)]
#[command(name = "rackd")]
#[command(about = "Keeps rack services in their configured state and reclaims stale storage", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default /etc/rackd/config.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Run one pass of every maintenance task and exit
    #[arg(long)]
    pub once: bool,

    /// With --once, only ensure this service
    #[arg(long, requires = "once")]
    pub service: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_once_with_service() {
        let cli = Cli::try_parse_from(["rackd", "--once", "--service", "dhcpd"]).unwrap();
        assert!(cli.once);
        assert_eq!(cli.service.as_deref(), Some("dhcpd"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_service_requires_once() {
        assert!(Cli::try_parse_from(["rackd", "--service", "dhcpd"]).is_err());
    }
}

use std::time::Duration;

use clap::Args;
use semver::Version;

/// Tunables for the hibernation controller
#[derive(Debug, Clone, Args)]
pub struct HibernationConfig {
    /// How often to poll machines and nodes while stopping or resuming
    #[arg(
        long,
        env = "HIBERNATION_STATE_CHECK_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub state_check_interval: Duration,

    /// Retry delay when the remote cluster is marked unreachable
    #[arg(
        long,
        env = "HIBERNATION_UNREACHABLE_INTERVAL",
        default_value = "2m",
        value_parser = humantime::parse_duration
    )]
    pub unreachable_interval: Duration,

    /// Oldest cluster version that supports hibernation
    #[arg(
        long,
        env = "HIBERNATION_MINIMUM_VERSION",
        default_value = "4.4.8",
        value_parser = Version::parse
    )]
    pub minimum_version: Version,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            state_check_interval: Duration::from_secs(30),
            unreachable_interval: Duration::from_secs(120),
            minimum_version: Version::new(4, 4, 8),
        }
    }
}

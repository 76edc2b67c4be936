//! Daemon configuration
//!
//! Recognized options and their defaults. The daemon is configured from the
//! command line and compiled defaults; there is no configuration file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// P2P network interface the daemon drives.
    pub interface: String,
    /// Verbose logging.
    pub debug: bool,
    /// Print the version and exit.
    pub print_version: bool,
    /// TCP port the RTSP source binds once a session is connected.
    pub rtsp_port: u16,
    /// Grace period before the externally reported state returns to idle.
    pub idle_timeout_ms: u64,
    /// Time granted to shutdown jobs after the first termination signal.
    pub shutdown_grace_s: u64,
    /// Consecutive supplicant respawn attempts before giving up.
    pub supplicant_respawn_max: u32,
    /// Base delay before respawning a crashed supplicant; doubles per
    /// consecutive failure.
    pub supplicant_respawn_delay_ms: u64,
    /// How long a group client waits for its DHCP lease.
    pub dhcp_assignment_timeout_ms: u64,
    /// How long a peer stays in the failure state before reverting to idle.
    pub peer_failure_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // The P2P interface name used on most Android-derived platforms.
            interface: "p2p0".to_string(),
            debug: false,
            print_version: false,
            rtsp_port: crate::MIRACAST_DEFAULT_RTSP_PORT,
            idle_timeout_ms: 5000,
            shutdown_grace_s: 1,
            supplicant_respawn_max: 10,
            supplicant_respawn_delay_ms: 2000,
            dhcp_assignment_timeout_ms: 5000,
            peer_failure_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Control directory the supplicant creates its per-interface socket in.
    pub fn ctrl_path(&self) -> PathBuf {
        PathBuf::from(format!("/var/run/{}_supplicant", self.interface))
    }

    /// Generated supplicant configuration file.
    pub fn supplicant_conf_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/supplicant-{}.conf", self.interface))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_s)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.supplicant_respawn_delay_ms)
    }

    pub fn dhcp_assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.dhcp_assignment_timeout_ms)
    }

    pub fn peer_failure_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_failure_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.interface, "p2p0");
        assert_eq!(config.rtsp_port, 7236);
        assert_eq!(config.idle_timeout_ms, 5000);
        assert_eq!(config.shutdown_grace_s, 1);
        assert_eq!(config.supplicant_respawn_max, 10);
        assert_eq!(config.supplicant_respawn_delay_ms, 2000);
        assert_eq!(config.dhcp_assignment_timeout_ms, 5000);
        assert_eq!(config.peer_failure_timeout_ms, 5000);
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::default();
        assert_eq!(config.ctrl_path(), PathBuf::from("/var/run/p2p0_supplicant"));
        assert_eq!(
            config.supplicant_conf_path(),
            PathBuf::from("/tmp/supplicant-p2p0.conf")
        );
    }
}

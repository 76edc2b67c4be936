//! Supplicant process supervision
//!
//! The daemon owns its `wpa_supplicant` instance: it generates a minimal
//! configuration, clears stale control sockets, spawns the process with its
//! lifetime bound to ours and watches for exits. Crashes are answered with a
//! bounded number of respawn attempts whose delay doubles per consecutive
//! failure; a successful control-socket connection restores the budget.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::config::Config;
use crate::{MiracastError, Result};

const SUPPLICANT_BIN_PATH: &str = "/sbin/wpa_supplicant";

/// Environment variable that lets the supplicant inherit our stdio.
const SUPPLICANT_DEBUG_ENV: &str = "MIRACAST_SUPPLICANT_DEBUG";

const SUPPLICANT_CONFIG: &str = "# GENERATED - DO NOT EDIT!\nconfig_methods=pbc\nap_scan=1\n";

/// Doubling of the respawn delay is capped at base << 4.
const RESPAWN_BACKOFF_CAP: u32 = 4;

pub struct Supervisor {
    interface: String,
    binary: PathBuf,
    ctrl_path: PathBuf,
    conf_path: PathBuf,
    watch: Option<JoinHandle<()>>,
    epoch: u64,
    respawn_max: u32,
    respawn_budget: u32,
    base_delay: Duration,
    failed_attempts: u32,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            interface: config.interface.clone(),
            binary: PathBuf::from(SUPPLICANT_BIN_PATH),
            ctrl_path: config.ctrl_path(),
            conf_path: config.supplicant_conf_path(),
            watch: None,
            epoch: 0,
            respawn_max: config.supplicant_respawn_max,
            respawn_budget: config.supplicant_respawn_max,
            base_delay: config.respawn_delay(),
            failed_attempts: 0,
        }
    }

    /// Spawn the supplicant and watch for its exit.
    ///
    /// `on_exit` runs once with the watch epoch if the process terminates on
    /// its own; a deliberate [`stop`](Self::stop) aborts the watch without
    /// invoking it. Receivers compare the epoch against
    /// [`current_epoch`](Self::current_epoch) to discard stale reports.
    pub fn start<F>(&mut self, on_exit: F) -> Result<u64>
    where
        F: FnOnce(u64, ExitStatus) + Send + 'static,
    {
        self.write_config()?;
        self.remove_stale_ctrl_dir();

        let mut command = Command::new(&self.binary);
        command
            .arg("-Dnl80211")
            .arg(format!("-i{}", self.interface))
            .arg(format!("-C{}", self.ctrl_path.display()))
            .arg("-ddd")
            .arg("-t")
            .arg("-K")
            .arg(format!("-c{}", self.conf_path.display()))
            .arg("-W")
            .kill_on_drop(true);

        if std::env::var_os(SUPPLICANT_DEBUG_ENV).is_none() {
            command
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
        }

        // Do not outlive the daemon even if the kill-on-drop path is skipped.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|err| {
            MiracastError::Supplicant(format!(
                "failed to spawn {}: {}",
                self.binary.display(),
                err
            ))
        })?;

        debug!(pid = child.id(), interface = %self.interface, "supplicant started");

        self.epoch += 1;
        let epoch = self.epoch;
        self.watch = Some(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => on_exit(epoch, status),
                Err(err) => error!("failed to wait for supplicant: {}", err),
            }
        }));

        Ok(epoch)
    }

    /// Kill the supplicant and discard the watch. Exits caused by this are
    /// never reported through `on_exit`.
    pub fn stop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
            debug!(interface = %self.interface, "supplicant stopped");
        }
        self.epoch += 1;
    }

    pub fn is_running(&self) -> bool {
        self.watch.is_some()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    /// Note that the watched process is gone without us stopping it.
    pub fn note_exited(&mut self) {
        self.watch = None;
    }

    /// The transport connected: restore the respawn budget and backoff.
    pub fn note_connected(&mut self) {
        self.respawn_budget = self.respawn_max;
        self.failed_attempts = 0;
    }

    /// Account one failure and return the delay before the next respawn
    /// attempt, or `None` once the budget is exhausted.
    pub fn next_respawn_delay(&mut self) -> Option<Duration> {
        if self.respawn_budget == 0 {
            warn!(
                "supplicant respawn budget exhausted after {} attempts",
                self.respawn_max
            );
            return None;
        }
        self.respawn_budget -= 1;
        let delay = self.base_delay * (1u32 << self.failed_attempts.min(RESPAWN_BACKOFF_CAP));
        self.failed_attempts += 1;
        Some(delay)
    }

    pub fn respawn_budget(&self) -> u32 {
        self.respawn_budget
    }

    fn write_config(&self) -> Result<()> {
        std::fs::write(&self.conf_path, SUPPLICANT_CONFIG).map_err(|err| {
            MiracastError::Config(format!(
                "failed to write supplicant configuration {}: {}",
                self.conf_path.display(),
                err
            ))
        })
    }

    /// Drop any left-over control directory so the new instance can bind.
    fn remove_stale_ctrl_dir(&self) {
        if self.ctrl_path.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.ctrl_path) {
                warn!(
                    "failed to remove stale control directory {}: {}",
                    self.ctrl_path.display(),
                    err
                );
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

//! DHCP client and server wrappers
//!
//! IP configuration of a formed P2P group is delegated to the external
//! busybox DHCP daemons. As group client we run `udhcpc` on the P2P
//! interface and report the address it obtains; as group owner we put the
//! well-known Wi-Fi Direct address on the interface and run `udhcpd` with a
//! generated configuration. The network manager keeps exactly one of the
//! two active per session.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{MiracastError, Result, RUNTIME_PATH};

const DHCP_CLIENT_BIN: &str = "udhcpc";
const DHCP_SERVER_BIN: &str = "udhcpd";

/// Group-owner address and lease range on the group interface.
const GROUP_OWNER_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 49, 1);
const LEASE_RANGE_START: Ipv4Addr = Ipv4Addr::new(192, 168, 49, 20);
const LEASE_RANGE_END: Ipv4Addr = Ipv4Addr::new(192, 168, 49, 240);

/// Common lifecycle of the two DHCP roles.
pub trait DhcpController: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
    /// Our address on the group interface, once known.
    fn local_address(&self) -> Option<Ipv4Addr>;
}

/// `udhcpc` wrapper for the group-client role.
pub struct DhcpClient {
    interface: String,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    address: Arc<Mutex<Option<Ipv4Addr>>>,
    on_lease: Arc<dyn Fn(Ipv4Addr) + Send + Sync>,
}

impl DhcpClient {
    /// `on_lease` fires from a background task every time the client
    /// obtains an address.
    pub fn new<F>(interface: &str, on_lease: F) -> Self
    where
        F: Fn(Ipv4Addr) + Send + Sync + 'static,
    {
        Self {
            interface: interface.to_string(),
            child: None,
            readers: Vec::new(),
            address: Arc::new(Mutex::new(None)),
            on_lease: Arc::new(on_lease),
        }
    }

    fn watch_output<R>(&mut self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let address = Arc::clone(&self.address);
        let on_lease = Arc::clone(&self.on_lease);
        self.readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "miracastd::dhcp", "{}", line);
                if let Some(lease) = parse_lease_line(&line) {
                    if let Ok(mut slot) = address.lock() {
                        *slot = Some(lease);
                    }
                    (on_lease)(lease);
                }
            }
        }));
    }
}

impl DhcpController for DhcpClient {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut child = Command::new(DHCP_CLIENT_BIN)
            .arg("-f")
            .arg("-i")
            .arg(&self.interface)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                MiracastError::Dhcp(format!("failed to start {}: {}", DHCP_CLIENT_BIN, err))
            })?;

        if let Some(stdout) = child.stdout.take() {
            self.watch_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.watch_output(stderr);
        }

        debug!(interface = %self.interface, "DHCP client started");
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            debug!(interface = %self.interface, "DHCP client stopped");
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        if let Ok(mut slot) = self.address.lock() {
            *slot = None;
        }
    }

    fn is_active(&self) -> bool {
        self.child.is_some()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.address.lock().ok().and_then(|slot| *slot)
    }
}

impl Drop for DhcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `udhcpd` wrapper for the group-owner role.
pub struct DhcpServer {
    interface: String,
    child: Option<Child>,
}

impl DhcpServer {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            child: None,
        }
    }

    fn conf_path(&self) -> PathBuf {
        PathBuf::from(RUNTIME_PATH).join(format!("udhcpd-{}.conf", self.interface))
    }

    fn lease_path(&self) -> PathBuf {
        PathBuf::from(RUNTIME_PATH).join(format!("udhcpd-{}.leases", self.interface))
    }

    fn write_config(&self) -> Result<()> {
        write_server_config(&self.conf_path(), &self.lease_path(), &self.interface)
    }

    /// Put the group-owner address on the interface before leasing from it.
    fn configure_interface(&self) -> Result<()> {
        let cidr = format!("{}/24", GROUP_OWNER_ADDRESS);
        for args in [
            vec!["addr", "flush", "dev", self.interface.as_str()],
            vec!["addr", "add", cidr.as_str(), "dev", self.interface.as_str()],
            vec!["link", "set", self.interface.as_str(), "up"],
        ] {
            let status = std::process::Command::new("ip").args(&args).status().map_err(
                |err| MiracastError::Dhcp(format!("failed to run ip {}: {}", args.join(" "), err)),
            )?;
            if !status.success() {
                return Err(MiracastError::Dhcp(format!(
                    "ip {} exited with {}",
                    args.join(" "),
                    status
                )));
            }
        }
        Ok(())
    }
}

impl DhcpController for DhcpServer {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        self.write_config()?;
        self.configure_interface()?;

        let child = Command::new(DHCP_SERVER_BIN)
            .arg("-f")
            .arg(self.conf_path())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                MiracastError::Dhcp(format!("failed to start {}: {}", DHCP_SERVER_BIN, err))
            })?;

        debug!(interface = %self.interface, "DHCP server started");
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            debug!(interface = %self.interface, "DHCP server stopped");
        }
        let flush = std::process::Command::new("ip")
            .args(["addr", "flush", "dev", self.interface.as_str()])
            .status();
        if let Err(err) = flush {
            warn!(interface = %self.interface, "failed to flush group address: {}", err);
        }
    }

    fn is_active(&self) -> bool {
        self.child.is_some()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.child.as_ref().map(|_| GROUP_OWNER_ADDRESS)
    }
}

impl Drop for DhcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extract the leased address from a `udhcpc` report line, e.g.
/// `udhcpc: lease of 192.168.49.2 obtained from 192.168.49.1`.
fn parse_lease_line(line: &str) -> Option<Ipv4Addr> {
    let rest = line.split("lease of ").nth(1)?;
    let address = rest.split([' ', ',']).next()?;
    address.parse().ok()
}

fn write_server_config(
    conf_path: &std::path::Path,
    lease_path: &std::path::Path,
    interface: &str,
) -> Result<()> {
    if let Some(parent) = conf_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(lease_path, b"")?;
    let config = format!(
        "# GENERATED - DO NOT EDIT!\n\
         interface {iface}\n\
         start {start}\n\
         end {end}\n\
         lease_file {leases}\n\
         option subnet 255.255.255.0\n\
         option lease 3600\n",
        iface = interface,
        start = LEASE_RANGE_START,
        end = LEASE_RANGE_END,
        leases = lease_path.display(),
    );
    std::fs::write(conf_path, config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lease_line() {
        assert_eq!(
            parse_lease_line("udhcpc: lease of 192.168.49.2 obtained from 192.168.49.1, lease time 3600"),
            Some(Ipv4Addr::new(192, 168, 49, 2))
        );
        assert_eq!(
            parse_lease_line("lease of 10.0.0.7 obtained"),
            Some(Ipv4Addr::new(10, 0, 0, 7))
        );
        assert_eq!(parse_lease_line("udhcpc: sending discover"), None);
        assert_eq!(parse_lease_line("lease of nonsense obtained"), None);
    }

    #[test]
    fn test_server_config_contents() {
        let dir = std::env::temp_dir().join(format!("miracastd-dhcp-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let conf = dir.join("udhcpd-test.conf");
        let leases = dir.join("udhcpd-test.leases");

        write_server_config(&conf, &leases, "p2p0").unwrap();

        let contents = std::fs::read_to_string(&conf).unwrap();
        assert!(contents.contains("interface p2p0"));
        assert!(contents.contains("start 192.168.49.20"));
        assert!(contents.contains("end 192.168.49.240"));
        assert!(leases.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_server_local_address_tracks_activity() {
        let server = DhcpServer::new("p2p0");
        assert!(!server.is_active());
        assert!(server.local_address().is_none());
    }
}

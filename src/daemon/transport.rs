//! Supplicant control-socket transport
//!
//! Owns the Unix datagram socket to the supplicant. The local end binds a
//! per-process ephemeral path under `/tmp`, connects to the supplicant's
//! per-interface control socket and is removed again when the last handle
//! goes away. Each datagram is one protocol message; reads are bounded and
//! sends are non-blocking, with a blocked send treated as a transport
//! failure to be escalated by the supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::{MiracastError, Result};

/// Upper bound for a single datagram read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Datagram sink for outgoing protocol messages. The network manager writes
/// through this seam so the wire can be observed in tests.
pub trait WireLink: Send {
    fn send(&self, datagram: &[u8]) -> Result<()>;
}

impl WireLink for SupplicantSocket {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        self.try_send(datagram)
    }
}

struct Inner {
    socket: UnixDatagram,
    local_path: PathBuf,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

/// Cheaply cloneable handle to the connected control socket.
#[derive(Clone)]
pub struct SupplicantSocket {
    inner: Arc<Inner>,
}

impl SupplicantSocket {
    /// Bind the local endpoint and connect to `<ctrl_path>/<interface>`.
    pub fn connect(ctrl_path: &Path, interface: &str) -> Result<Self> {
        let remote = ctrl_path.join(interface);
        let local_path = PathBuf::from(format!("/tmp/{}-{}", interface, std::process::id()));

        if local_path.exists() {
            std::fs::remove_file(&local_path)?;
        }

        let socket = UnixDatagram::bind(&local_path)?;
        socket.connect(&remote)?;

        debug!(socket = %remote.display(), "connected to supplicant control socket");

        Ok(Self {
            inner: Arc::new(Inner { socket, local_path }),
        })
    }

    /// Send one message as a single datagram.
    ///
    /// A short or blocked send leaves the supplicant link in an unknown
    /// state and is reported as an error for the caller to escalate.
    pub fn try_send(&self, datagram: &[u8]) -> Result<()> {
        match self.inner.socket.try_send(datagram) {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => Err(MiracastError::Supplicant(format!(
                "short send to supplicant: {} of {} bytes",
                sent,
                datagram.len()
            ))),
            Err(err) => Err(MiracastError::Supplicant(format!(
                "send to supplicant failed: {}",
                err
            ))),
        }
    }

    /// Receive the next datagram as text.
    pub async fn recv(&self) -> Result<String> {
        let mut buf = BytesMut::zeroed(READ_BUFFER_SIZE);
        let received = self.inner.socket.recv(&mut buf).await?;
        buf.truncate(received);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

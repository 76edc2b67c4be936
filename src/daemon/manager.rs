//! P2P network manager
//!
//! Owns the peer map and the per-peer connection state machine. The manager
//! runs as a single task: every stimulus — user commands, supplicant
//! datagrams, timer expiries, child exits, DHCP leases — arrives through one
//! input channel, so all state is mutated from one place and invariants hold
//! without locks. Timers and watches are spawned helper tasks that post back
//! into the channel carrying an epoch token; cancelling means bumping the
//! epoch and dropping stale expiries on receipt.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::commands::CommandQueue;
use super::config::Config;
use super::dhcp::{DhcpClient, DhcpController, DhcpServer};
use super::firmware::{FirmwareLoader, NoFirmwareLoader};
use super::supervisor::Supervisor;
use super::transport::{SupplicantSocket, WireLink};
use crate::device::{DeviceState, MacAddress, NetworkDevice};
use crate::message::Message;
use crate::wfd::WfdDeviceInfo;
use crate::{MiracastError, Result, WFD_DEVICE_INFO_SUBELEMENT};

const EVENT_DEVICE_FOUND: &str = "P2P-DEVICE-FOUND";
const EVENT_DEVICE_LOST: &str = "P2P-DEVICE-LOST";
const EVENT_GROUP_STARTED: &str = "P2P-GROUP-STARTED";
const EVENT_GROUP_REMOVED: &str = "P2P-GROUP-REMOVED";
const EVENT_GO_NEG_FAILURE: &str = "P2P-GO-NEG-FAILURE";
const EVENT_FIND_STOPPED: &str = "P2P-FIND-STOPPED";
const EVENT_AP_STA_CONNECTED: &str = "AP-STA-CONNECTED";
const EVENT_AP_STA_DISCONNECTED: &str = "AP-STA-DISCONNECTED";
const IGNORED_EVENT_PREFIX: &str = "CTRL-EVENT-";

/// Retry interval while waiting for the supplicant control socket.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Notifications towards the service controller, delivered in emission
/// order.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Scanning flag or other manager-level state changed.
    Changed,
    DeviceFound(NetworkDevice),
    DeviceLost(NetworkDevice),
    DeviceChanged(NetworkDevice),
    DeviceStateChanged(NetworkDevice),
}

pub(crate) enum Input {
    // User commands
    Setup {
        reply: oneshot::Sender<Result<()>>,
    },
    Scan {
        duration: Duration,
    },
    Connect {
        address: MacAddress,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        address: MacAddress,
        reply: oneshot::Sender<bool>,
    },
    Devices {
        reply: oneshot::Sender<Vec<NetworkDevice>>,
    },
    Scanning {
        reply: oneshot::Sender<bool>,
    },
    LocalAddress {
        reply: oneshot::Sender<Option<Ipv4Addr>>,
    },
    Release,
    // Internal stimuli
    Datagram {
        epoch: u64,
        text: String,
    },
    TransportFailed {
        epoch: u64,
    },
    ConnectAttempt {
        epoch: u64,
    },
    SupplicantExited {
        epoch: u64,
        status: ExitStatus,
    },
    RespawnTick {
        epoch: u64,
    },
    DhcpLease(Ipv4Addr),
    DhcpTimeout {
        epoch: u64,
    },
    DeviceRevert {
        address: MacAddress,
        epoch: u64,
    },
}

/// Owning handle to a running manager task. Dropping it tears the manager
/// down: the supplicant is killed, DHCP stopped and the peer map discarded.
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl ManagerHandle {
    pub async fn setup(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Setup { reply });
        rx.await
            .unwrap_or_else(|_| Err(MiracastError::System("network manager gone".to_string())))
    }

    pub fn scan(&self, duration: Duration) {
        self.send(Input::Scan { duration });
    }

    /// Ask the manager to connect. `false` means the request was rejected
    /// because a session is live or the device is unknown.
    pub async fn connect(&self, address: MacAddress) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Connect { address, reply });
        rx.await.unwrap_or(false)
    }

    pub async fn disconnect(&self, address: MacAddress) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Disconnect { address, reply });
        rx.await.unwrap_or(false)
    }

    pub async fn devices(&self) -> Vec<NetworkDevice> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Devices { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn scanning(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Scanning { reply });
        rx.await.unwrap_or(false)
    }

    pub async fn local_address(&self) -> Option<Ipv4Addr> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::LocalAddress { reply });
        rx.await.unwrap_or(None)
    }

    fn send(&self, input: Input) {
        let _ = self.tx.send(input);
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Input::Release);
    }
}

/// Detached handle for driving a scripted manager in controller tests.
#[cfg(test)]
pub(crate) fn test_handle() -> (ManagerHandle, mpsc::UnboundedReceiver<Input>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManagerHandle { tx }, rx)
}

pub struct NetworkManager {
    config: Config,
    input_tx: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    firmware: Box<dyn FirmwareLoader>,
    supervisor: Supervisor,
    transport: Option<Box<dyn WireLink>>,
    transport_epoch: u64,
    reader: Option<JoinHandle<()>>,
    commands: CommandQueue<NetworkManager>,
    devices: HashMap<MacAddress, NetworkDevice>,
    current_peer: Option<MacAddress>,
    is_group_owner: bool,
    scanning: bool,
    dhcp_client: Box<dyn DhcpController>,
    dhcp_server: Box<dyn DhcpController>,
    connect_epoch: u64,
    respawn_epoch: u64,
    dhcp_timer_epoch: u64,
    revert_epochs: HashMap<MacAddress, u64>,
}

impl NetworkManager {
    /// Platform factory: spawn a manager task for the configured interface
    /// and return the owning handle plus its notification stream.
    pub fn spawn(config: Config) -> (ManagerHandle, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let manager = Self::new(config, input_tx.clone(), input_rx, events_tx);
        tokio::spawn(manager.run());
        (ManagerHandle { tx: input_tx }, events_rx)
    }

    fn new(
        config: Config,
        input_tx: mpsc::UnboundedSender<Input>,
        input_rx: mpsc::UnboundedReceiver<Input>,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        let lease_tx = input_tx.clone();
        let dhcp_client = DhcpClient::new(&config.interface, move |address| {
            let _ = lease_tx.send(Input::DhcpLease(address));
        });
        let dhcp_server = DhcpServer::new(&config.interface);
        let supervisor = Supervisor::new(&config);

        Self {
            config,
            input_tx,
            input_rx,
            events,
            firmware: Box::new(NoFirmwareLoader),
            supervisor,
            transport: None,
            transport_epoch: 0,
            reader: None,
            commands: CommandQueue::new(),
            devices: HashMap::new(),
            current_peer: None,
            is_group_owner: false,
            scanning: false,
            dhcp_client: Box::new(dhcp_client),
            dhcp_server: Box::new(dhcp_server),
            connect_epoch: 0,
            respawn_epoch: 0,
            dhcp_timer_epoch: 0,
            revert_epochs: HashMap::new(),
        }
    }

    async fn run(mut self) {
        while let Some(input) = self.input_rx.recv().await {
            if matches!(input, Input::Release) {
                break;
            }
            self.dispatch(input).await;
        }
        self.teardown();
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Setup { reply } => {
                let _ = reply.send(self.setup().await);
            }
            Input::Scan { duration } => self.scan(duration),
            Input::Connect { address, reply } => {
                let _ = reply.send(self.connect(address));
            }
            Input::Disconnect { address, reply } => {
                let _ = reply.send(self.disconnect(address));
            }
            Input::Devices { reply } => {
                let _ = reply.send(self.devices.values().cloned().collect());
            }
            Input::Scanning { reply } => {
                let _ = reply.send(self.scanning);
            }
            Input::LocalAddress { reply } => {
                let _ = reply.send(self.local_address());
            }
            Input::Release => {}
            Input::Datagram { epoch, text } => {
                if epoch == self.transport_epoch {
                    self.handle_datagram(&text);
                }
            }
            Input::TransportFailed { epoch } => {
                if epoch == self.transport_epoch {
                    self.handle_transport_failure();
                }
            }
            Input::ConnectAttempt { epoch } => self.handle_connect_attempt(epoch),
            Input::SupplicantExited { epoch, status } => {
                self.handle_supplicant_exit(epoch, status)
            }
            Input::RespawnTick { epoch } => self.handle_respawn_tick(epoch),
            Input::DhcpLease(address) => self.handle_dhcp_lease(address),
            Input::DhcpTimeout { epoch } => self.handle_dhcp_timeout(epoch),
            Input::DeviceRevert { address, epoch } => self.handle_device_revert(address, epoch),
        }
    }

    fn teardown(&mut self) {
        self.stop_dhcp();
        self.disconnect_supplicant();
        self.supervisor.stop();
    }

    // ---- setup and supplicant lifecycle -------------------------------

    /// Bring the interface up: load firmware if the platform needs it, then
    /// start the supplicant.
    async fn setup(&mut self) -> Result<()> {
        if self.firmware.is_needed() {
            self.firmware.load().await?;
        }
        self.start_supplicant()
    }

    fn start_supplicant(&mut self) -> Result<()> {
        let tx = self.input_tx.clone();
        self.supervisor.start(move |epoch, status| {
            let _ = tx.send(Input::SupplicantExited { epoch, status });
        })?;

        self.connect_epoch += 1;
        self.schedule(
            CONNECT_RETRY_INTERVAL,
            Input::ConnectAttempt {
                epoch: self.connect_epoch,
            },
        );
        Ok(())
    }

    /// Periodic attempt to reach the control socket after a (re)spawn.
    fn handle_connect_attempt(&mut self, epoch: u64) {
        if epoch != self.connect_epoch || self.transport.is_some() {
            return;
        }
        if !self.supervisor.is_running() {
            return;
        }

        match self.connect_supplicant() {
            Ok(()) => self.attach_supplicant(),
            Err(err) => {
                debug!("supplicant control socket not ready: {}", err);
                self.schedule(CONNECT_RETRY_INTERVAL, Input::ConnectAttempt { epoch });
            }
        }
    }

    fn connect_supplicant(&mut self) -> Result<()> {
        let socket = SupplicantSocket::connect(&self.config.ctrl_path(), &self.config.interface)?;

        self.transport_epoch += 1;
        let epoch = self.transport_epoch;
        let tx = self.input_tx.clone();
        let reader_socket = socket.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match reader_socket.recv().await {
                    Ok(text) => {
                        let _ = tx.send(Input::Datagram { epoch, text });
                    }
                    Err(_) => {
                        let _ = tx.send(Input::TransportFailed { epoch });
                        break;
                    }
                }
            }
        }));

        self.commands.clear();
        self.transport = Some(Box::new(socket));
        Ok(())
    }

    /// Subscribe for unsolicited events and announce WFD source support.
    fn attach_supplicant(&mut self) {
        self.request(Message::request("ATTACH"), |_, reply| {
            if reply.is_fail() {
                error!("failed to attach to wpa_supplicant for unsolicited events");
            }
        });
        self.request(
            Message::request("SET").arg("wifi_display").arg(1),
            |_, _| {},
        );
        self.request(
            Message::request("WFD_SUBELEM_SET")
                .arg(0)
                .arg(WFD_DEVICE_INFO_SUBELEMENT),
            |_, _| {},
        );
        self.supervisor.note_connected();
    }

    fn disconnect_supplicant(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.transport = None;
        self.transport_epoch += 1;
        self.commands.clear();
    }

    fn handle_supplicant_exit(&mut self, epoch: u64, status: ExitStatus) {
        if epoch != self.supervisor.current_epoch() {
            return;
        }
        warn!("supplicant process exited with {}", status);
        self.supervisor.note_exited();
        self.disconnect_supplicant();
        self.reset();

        if !status.success() {
            self.schedule_respawn();
        }
    }

    /// A dead control socket means the supplicant is gone or wedged; kill it
    /// and go through the same reset-and-respawn path as a crash.
    fn handle_transport_failure(&mut self) {
        warn!("supplicant control socket failed");
        self.disconnect_supplicant();
        self.supervisor.stop();
        self.reset();
        self.schedule_respawn();
    }

    fn schedule_respawn(&mut self) {
        if let Some(delay) = self.supervisor.next_respawn_delay() {
            self.respawn_epoch += 1;
            self.schedule(
                delay,
                Input::RespawnTick {
                    epoch: self.respawn_epoch,
                },
            );
        }
    }

    fn handle_respawn_tick(&mut self, epoch: u64) {
        if epoch != self.respawn_epoch || self.supervisor.is_running() {
            return;
        }
        if let Err(err) = self.start_supplicant() {
            error!("supplicant respawn failed: {}", err);
            self.schedule_respawn();
        }
    }

    /// Supplicant crash or teardown: report the session dead and forget
    /// every peer.
    fn reset(&mut self) {
        if let Some(address) = self.current_peer.take() {
            self.cancel_dhcp_timer();
            self.stop_dhcp();
            self.advance_device_state(address, DeviceState::Disconnected);
        }

        let lost: Vec<NetworkDevice> = self.devices.drain().map(|(_, device)| device).collect();
        for device in lost {
            self.emit(ManagerEvent::DeviceLost(device));
        }
        self.revert_epochs.clear();
        self.is_group_owner = false;

        if self.scanning {
            self.scanning = false;
            self.emit(ManagerEvent::Changed);
        }
    }

    // ---- operations ---------------------------------------------------

    /// Start a P2P scan. No-op while one is already running; the scanning
    /// flag flips on the supplicant's reply.
    fn scan(&mut self, duration: Duration) {
        if self.scanning {
            return;
        }

        let mut message = Message::request("P2P_FIND");
        if duration > Duration::ZERO {
            message = message.arg(duration.as_secs());
        }

        self.request(message, |manager, reply| {
            let scanning = !reply.is_fail();
            if scanning == manager.scanning {
                return;
            }
            manager.scanning = scanning;
            manager.emit(ManagerEvent::Changed);
        });
    }

    /// Start connecting to a known peer. Accepting the request does not
    /// advance device state; that happens on subsequent group events.
    fn connect(&mut self, address: MacAddress) -> bool {
        if self.current_peer.is_some() {
            return false;
        }
        if !self.devices.contains_key(&address) {
            return false;
        }

        self.current_peer = Some(address);
        debug!(device = %address, "attempting to connect");

        if self.scanning {
            debug!("currently scanning; stopping this first");
            self.request(Message::request("P2P_STOP_FIND"), |_, _| {});
        }

        self.request(
            Message::request("P2P_CONNECT").arg(address).arg("pbc"),
            move |manager, reply| {
                if reply.is_fail() {
                    error!(device = %address, "connect request rejected by supplicant");
                    manager.advance_device_state(address, DeviceState::Failure);
                }
            },
        );
        true
    }

    fn disconnect(&mut self, address: MacAddress) -> bool {
        if self.current_peer != Some(address) {
            return false;
        }

        debug!(device = %address, "disconnecting");

        let state = self
            .devices
            .get(&address)
            .map(NetworkDevice::state)
            .unwrap_or_default();
        let message = if state == DeviceState::Association {
            Message::request("P2P_CANCEL")
        } else {
            Message::request("P2P_GROUP_REMOVE").arg(&self.config.interface)
        };

        self.request(message, |manager, reply| {
            if reply.is_fail() {
                error!(
                    interface = %manager.config.interface,
                    "failed to disconnect connected device"
                );
            }
        });
        true
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        if self.is_group_owner {
            self.dhcp_server.local_address()
        } else {
            self.dhcp_client.local_address()
        }
    }

    // ---- wire handling ------------------------------------------------

    fn request<F>(&mut self, message: Message, handler: F)
    where
        F: FnOnce(&mut Self, &Message) + Send + 'static,
    {
        if let Some(wire) = self.commands.enqueue(message, handler) {
            self.transmit(wire);
        }
    }

    fn transmit(&mut self, wire: String) {
        let Some(transport) = &self.transport else {
            warn!(command = %wire, "dropping command, supplicant not connected");
            return;
        };
        if let Err(err) = transport.send(wire.as_bytes()) {
            warn!("{}", err);
            // Escalate through the input queue so the failure is handled
            // outside of whatever callback triggered this send.
            let _ = self.input_tx.send(Input::TransportFailed {
                epoch: self.transport_epoch,
            });
        }
    }

    fn handle_datagram(&mut self, text: &str) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("unparseable supplicant message: {}", err);
                return;
            }
        };

        if message.is_reply() {
            match self.commands.take_in_flight() {
                Some(pending) => {
                    debug!(
                        command = pending.message.name(),
                        reply = message.name(),
                        "command completed"
                    );
                    (pending.handler)(self, &message);
                    if let Some(wire) = self.commands.pump() {
                        self.transmit(wire);
                    }
                }
                None => {
                    warn!(reply = %text.trim(), "reply without a command in flight");
                }
            }
        } else {
            self.handle_event(message);
        }
    }

    fn handle_event(&mut self, message: Message) {
        if message.name().starts_with(IGNORED_EVENT_PREFIX) {
            return;
        }

        match message.name() {
            EVENT_DEVICE_FOUND => self.on_device_found(&message),
            EVENT_DEVICE_LOST => self.on_device_lost(&message),
            EVENT_GROUP_STARTED => self.on_group_started(&message),
            EVENT_GROUP_REMOVED => self.on_group_removed(&message),
            EVENT_GO_NEG_FAILURE => self.on_go_neg_failure(),
            EVENT_FIND_STOPPED => self.on_find_stopped(),
            // Hook points for the streaming subsystem.
            EVENT_AP_STA_CONNECTED | EVENT_AP_STA_DISCONNECTED => {}
            _ => warn!(event = message.name(), "unhandled supplicant event"),
        }
    }

    // ---- event handlers -----------------------------------------------

    fn on_device_found(&mut self, message: &Message) {
        // P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 p2p_dev_addr=4e:74:03:70:e2:c1
        // pri_dev_type=8-0050F204-2 name='Aquaris M10' config_methods=0x188
        // dev_capab=0x5 group_capab=0x0 wfd_dev_info=0x00111c440032 new=1
        let Some(raw_address) = message.named_str("p2p_dev_addr") else {
            warn!("device-found event without p2p_dev_addr");
            return;
        };
        let address: MacAddress = match raw_address.parse() {
            Ok(address) => address,
            Err(err) => {
                warn!("device-found event with bad address: {}", err);
                return;
            }
        };
        let name = message.named_str("name").unwrap_or("").to_string();

        let info = match message
            .named_str("wfd_dev_info")
            .ok_or_else(|| MiracastError::Parse("missing wfd_dev_info".to_string()))
            .and_then(WfdDeviceInfo::parse)
        {
            Ok(info) => info,
            Err(err) => {
                debug!(device = %address, "ignoring device without WFD info: {}", err);
                return;
            }
        };
        if !info.is_supported() {
            debug!(device = %address, "ignoring unsupported device");
            return;
        }

        let roles = info.supported_roles();
        if let Some(device) = self.devices.get_mut(&address) {
            device.update(name, roles);
        } else {
            let device = NetworkDevice::new(address, name, roles);
            self.devices.insert(address, device.clone());
            self.emit(ManagerEvent::DeviceFound(device));
        }
    }

    fn on_device_lost(&mut self, message: &Message) {
        // P2P-DEVICE-LOST p2p_dev_addr=4e:74:03:70:e2:c1
        // Some supplicant builds spell the key p2p_dev_address.
        let Some(raw_address) = message
            .named_str("p2p_dev_addr")
            .or_else(|| message.named_str("p2p_dev_address"))
        else {
            warn!("device-lost event without device address");
            return;
        };
        let Ok(address) = raw_address.parse::<MacAddress>() else {
            warn!("device-lost event with bad address {:?}", raw_address);
            return;
        };

        if self.current_peer == Some(address) {
            // The session outcome arrives via P2P-GROUP-REMOVED or reset;
            // dropping the entry here would leave a dangling current peer.
            debug!(device = %address, "ignoring device-lost for current peer");
            return;
        }

        self.revert_epochs.remove(&address);
        if let Some(device) = self.devices.remove(&address) {
            self.emit(ManagerEvent::DeviceLost(device));
        }
    }

    fn on_group_started(&mut self, message: &Message) {
        // P2P-GROUP-STARTED p2p0 GO ssid="DIRECT-hB" freq=2412
        // passphrase="HtP0qYon" go_dev_addr=4e:74:03:64:95:a7
        let Some(address) = self.current_peer else {
            return;
        };
        let role = {
            let mut reader = message.reader();
            match reader.skip().string() {
                Ok(role) => role.to_string(),
                Err(err) => {
                    warn!("group-started event without role: {}", err);
                    return;
                }
            }
        };

        self.advance_device_state(address, DeviceState::Configuration);

        // If we are the GO the other side is the client and vice versa.
        if role == "GO" {
            self.is_group_owner = true;

            // As owner we bring up the DHCP server and are connected; there
            // is nothing more to wait for on our side.
            if let Err(err) = self.dhcp_server.start() {
                error!("failed to start DHCP server: {}", err);
                self.advance_device_state(address, DeviceState::Failure);
                return;
            }
            let local = self.dhcp_server.local_address();
            if let Some(device) = self.devices.get_mut(&address) {
                device.set_ipv4(local);
            }
            self.advance_device_state(address, DeviceState::Connected);
        } else {
            self.is_group_owner = false;

            // As client we still have to acquire an address before the
            // upper layers may treat the session as connected.
            if let Err(err) = self.dhcp_client.start() {
                error!("failed to start DHCP client: {}", err);
                self.advance_device_state(address, DeviceState::Failure);
                return;
            }
            self.arm_dhcp_timer();
        }
    }

    fn on_group_removed(&mut self, message: &Message) {
        // P2P-GROUP-REMOVED p2p0 GO reason=PSK_FAILURE
        let Some(address) = self.current_peer.take() else {
            return;
        };

        self.cancel_dhcp_timer();
        self.stop_dhcp();
        self.is_group_owner = false;
        if let Some(device) = self.devices.get_mut(&address) {
            device.set_ipv4(None);
        }

        let reason = message.named_str("reason").unwrap_or("");
        let state = match reason {
            "FORMATION_FAILED" | "PSK_FAILURE" | "FREQ_CONFLICT" => DeviceState::Failure,
            _ => DeviceState::Disconnected,
        };
        self.advance_device_state(address, state);
    }

    fn on_go_neg_failure(&mut self) {
        let Some(address) = self.current_peer.take() else {
            return;
        };
        self.advance_device_state(address, DeviceState::Failure);
    }

    fn on_find_stopped(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        self.emit(ManagerEvent::Changed);
    }

    // ---- DHCP lifecycle -----------------------------------------------

    fn handle_dhcp_lease(&mut self, lease: Ipv4Addr) {
        let Some(address) = self.current_peer else {
            return;
        };
        let state = self
            .devices
            .get(&address)
            .map(NetworkDevice::state)
            .unwrap_or_default();
        if state != DeviceState::Configuration {
            // Renewals while connected need no state change.
            return;
        }

        self.cancel_dhcp_timer();
        if let Some(device) = self.devices.get_mut(&address) {
            device.set_ipv4(Some(lease));
        }
        self.advance_device_state(address, DeviceState::Connected);
    }

    fn handle_dhcp_timeout(&mut self, epoch: u64) {
        if epoch != self.dhcp_timer_epoch {
            return;
        }
        let Some(address) = self.current_peer else {
            return;
        };
        warn!(device = %address, "no DHCP lease within timeout");
        self.advance_device_state(address, DeviceState::Failure);
    }

    fn arm_dhcp_timer(&mut self) {
        self.dhcp_timer_epoch += 1;
        self.schedule(
            self.config.dhcp_assignment_timeout(),
            Input::DhcpTimeout {
                epoch: self.dhcp_timer_epoch,
            },
        );
    }

    fn cancel_dhcp_timer(&mut self) {
        self.dhcp_timer_epoch += 1;
    }

    fn stop_dhcp(&mut self) {
        self.dhcp_client.stop();
        self.dhcp_server.stop();
    }

    // ---- state advance ------------------------------------------------

    fn advance_device_state(&mut self, address: MacAddress, state: DeviceState) {
        let snapshot = match self.devices.get_mut(&address) {
            Some(device) => {
                debug!(device = %address, %state, "new state");
                device.set_state(state);
                device.clone()
            }
            None => return,
        };

        match state {
            DeviceState::Failure => {
                self.arm_device_revert(address, self.config.peer_failure_timeout())
            }
            DeviceState::Disconnected => {
                self.arm_device_revert(address, self.config.idle_timeout())
            }
            _ => {}
        }

        self.emit(ManagerEvent::DeviceStateChanged(snapshot.clone()));
        self.emit(ManagerEvent::DeviceChanged(snapshot));
    }

    /// Failure and Disconnected are transient in the peer map: after a grace
    /// period the entry returns to Idle.
    fn arm_device_revert(&mut self, address: MacAddress, delay: Duration) {
        let epoch = self.revert_epochs.get(&address).copied().unwrap_or(0) + 1;
        self.revert_epochs.insert(address, epoch);
        self.schedule(delay, Input::DeviceRevert { address, epoch });
    }

    fn handle_device_revert(&mut self, address: MacAddress, epoch: u64) {
        if self.revert_epochs.get(&address) != Some(&epoch) {
            return;
        }
        self.revert_epochs.remove(&address);

        let state = self.devices.get(&address).map(NetworkDevice::state);
        if matches!(state, Some(DeviceState::Failure) | Some(DeviceState::Disconnected)) {
            self.advance_device_state(address, DeviceState::Idle);
        }
    }

    // ---- helpers ------------------------------------------------------

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn schedule(&self, delay: Duration, input: Input) {
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(input);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    const SINK: &str = "4e:74:03:70:e2:c1";
    const OTHER: &str = "aa:bb:cc:dd:ee:ff";

    const FOUND_SINK: &str = "<3>P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 \
        p2p_dev_addr=4e:74:03:70:e2:c1 pri_dev_type=8-0050F204-2 name='Aquaris' \
        config_methods=0x188 dev_capab=0x5 group_capab=0x0 \
        wfd_dev_info=000600101C440032 new=1";

    #[derive(Clone)]
    struct RecordingLink {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingLink {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl WireLink for RecordingLink {
        fn send(&self, datagram: &[u8]) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(datagram).into_owned());
            Ok(())
        }
    }

    struct MockDhcp {
        active: Arc<AtomicBool>,
        fail: bool,
        address: Option<Ipv4Addr>,
    }

    impl MockDhcp {
        fn new(address: Option<Ipv4Addr>) -> (Self, Arc<AtomicBool>) {
            let active = Arc::new(AtomicBool::new(false));
            (
                Self {
                    active: Arc::clone(&active),
                    fail: false,
                    address,
                },
                active,
            )
        }
    }

    impl DhcpController for MockDhcp {
        fn start(&mut self) -> Result<()> {
            if self.fail {
                return Err(MiracastError::Dhcp("mock failure".to_string()));
            }
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.active.store(false, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn local_address(&self) -> Option<Ipv4Addr> {
            if self.is_active() {
                self.address
            } else {
                None
            }
        }
    }

    struct Fixture {
        manager: NetworkManager,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
        link: RecordingLink,
        client_active: Arc<AtomicBool>,
        server_active: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut manager =
            NetworkManager::new(Config::default(), input_tx, input_rx, events_tx);

        let link = RecordingLink::new();
        manager.transport = Some(Box::new(link.clone()));

        let (client, client_active) = MockDhcp::new(Some(Ipv4Addr::new(192, 168, 49, 2)));
        let (server, server_active) = MockDhcp::new(Some(Ipv4Addr::new(192, 168, 49, 1)));
        manager.dhcp_client = Box::new(client);
        manager.dhcp_server = Box::new(server);

        Fixture {
            manager,
            events,
            link,
            client_active,
            server_active,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn mac(raw: &str) -> MacAddress {
        raw.parse().unwrap()
    }

    fn inject(manager: &mut NetworkManager, text: &str) {
        manager.handle_datagram(text);
    }

    #[tokio::test]
    async fn test_scan_sets_flag_on_ok_reply() {
        let mut f = fixture();

        f.manager.scan(Duration::from_secs(30));
        assert_eq!(f.link.sent(), vec!["P2P_FIND 30"]);
        assert!(!f.manager.scanning);

        inject(&mut f.manager, "OK");
        assert!(f.manager.scanning);
        assert!(matches!(drain(&mut f.events).as_slice(), [ManagerEvent::Changed]));

        // Already scanning: another scan is a no-op.
        f.manager.scan(Duration::ZERO);
        assert_eq!(f.link.sent().len(), 1);

        inject(&mut f.manager, "<3>P2P-FIND-STOPPED");
        assert!(!f.manager.scanning);
        assert!(matches!(drain(&mut f.events).as_slice(), [ManagerEvent::Changed]));
    }

    #[tokio::test]
    async fn test_scan_fail_reply_leaves_flag_clear() {
        let mut f = fixture();
        f.manager.scan(Duration::ZERO);
        assert_eq!(f.link.sent(), vec!["P2P_FIND"]);
        inject(&mut f.manager, "FAIL");
        assert!(!f.manager.scanning);
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_device_found_upserts_supported_peers() {
        let mut f = fixture();

        inject(&mut f.manager, FOUND_SINK);
        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ManagerEvent::DeviceFound(device) => {
                assert_eq!(device.address(), mac(SINK));
                assert_eq!(device.name(), "Aquaris");
                assert_eq!(device.state(), DeviceState::Idle);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Repeated discovery updates in place, no second notification.
        inject(
            &mut f.manager,
            "<3>P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 p2p_dev_addr=4e:74:03:70:e2:c1 \
             name='Aquaris M10' wfd_dev_info=0x00111c440032",
        );
        assert!(drain(&mut f.events).is_empty());
        assert_eq!(f.manager.devices.len(), 1);
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().name(),
            "Aquaris M10"
        );
    }

    #[tokio::test]
    async fn test_unsupported_device_is_dropped() {
        let mut f = fixture();
        // Secondary sink, not a peer we can cast to.
        inject(
            &mut f.manager,
            "<3>P2P-DEVICE-FOUND aa:bb:cc:dd:ee:ff p2p_dev_addr=aa:bb:cc:dd:ee:ff \
             name='Other' wfd_dev_info=0x00121c440032",
        );
        assert!(f.manager.devices.is_empty());
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_device_lost_accepts_both_key_spellings() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        drain(&mut f.events);

        inject(&mut f.manager, "<3>P2P-DEVICE-LOST p2p_dev_address=4e:74:03:70:e2:c1");
        assert!(f.manager.devices.is_empty());
        let events = drain(&mut f.events);
        assert!(matches!(events.as_slice(), [ManagerEvent::DeviceLost(_)]));
    }

    #[tokio::test]
    async fn test_happy_path_client_session() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        drain(&mut f.events);

        assert!(f.manager.connect(mac(SINK)));
        assert_eq!(
            f.link.sent(),
            vec!["P2P_CONNECT 4e:74:03:70:e2:c1 pbc".to_string()]
        );
        assert_eq!(f.manager.current_peer, Some(mac(SINK)));

        inject(&mut f.manager, "OK");
        // Accepting the reply does not advance state by itself.
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Idle
        );

        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 client ssid=\"DIRECT-X\" freq=2412 \
             passphrase=\"p\" go_dev_addr=4e:74:03:70:e2:c1",
        );
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Configuration
        );
        assert!(f.client_active.load(Ordering::SeqCst));
        assert!(!f.server_active.load(Ordering::SeqCst));
        assert!(!f.manager.is_group_owner);

        f.manager.handle_dhcp_lease(Ipv4Addr::new(192, 168, 49, 2));
        let device = f.manager.devices.get(&mac(SINK)).unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        assert_eq!(device.ipv4(), Some(Ipv4Addr::new(192, 168, 49, 2)));

        // Configuration then Connected, each as state-changed + changed.
        let events = drain(&mut f.events);
        let states: Vec<DeviceState> = events
            .iter()
            .filter_map(|event| match event {
                ManagerEvent::DeviceStateChanged(device) => Some(device.state()),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![DeviceState::Configuration, DeviceState::Connected]);
    }

    #[tokio::test]
    async fn test_group_owner_path_connects_without_dhcp_client() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");
        drain(&mut f.events);

        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 GO ssid=\"DIRECT-hB\" freq=2412 \
             passphrase=\"HtP0qYon\" go_dev_addr=4e:74:03:64:95:a7",
        );

        assert!(f.manager.is_group_owner);
        assert!(f.server_active.load(Ordering::SeqCst));
        assert!(!f.client_active.load(Ordering::SeqCst));
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Connected
        );
        assert_eq!(
            f.manager.local_address(),
            Some(Ipv4Addr::new(192, 168, 49, 1))
        );
    }

    #[tokio::test]
    async fn test_connect_rejected_while_busy() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        inject(
            &mut f.manager,
            "<3>P2P-DEVICE-FOUND aa:bb:cc:dd:ee:ff p2p_dev_addr=aa:bb:cc:dd:ee:ff \
             name='Other' wfd_dev_info=0x00111c440032",
        );
        assert!(f.manager.connect(mac(SINK)));
        let sent_before = f.link.sent().len();

        assert!(!f.manager.connect(mac(OTHER)));
        assert_eq!(f.link.sent().len(), sent_before);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_device() {
        let mut f = fixture();
        assert!(!f.manager.connect(mac(OTHER)));
        assert!(f.link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_connect_fail_reply_advances_to_failure() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        drain(&mut f.events);

        inject(&mut f.manager, "FAIL");
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Failure
        );
        // The failed attempt still occupies the current-peer slot, matching
        // the supplicant's view until the group is torn down.
        assert_eq!(f.manager.current_peer, Some(mac(SINK)));
    }

    #[tokio::test]
    async fn test_connect_while_scanning_stops_find_first() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        f.manager.scan(Duration::from_secs(30));
        inject(&mut f.manager, "OK");
        assert!(f.manager.scanning);

        assert!(f.manager.connect(mac(SINK)));
        // P2P_FIND was completed; STOP_FIND goes out next, CONNECT queues.
        assert_eq!(f.link.sent(), vec!["P2P_FIND 30", "P2P_STOP_FIND"]);

        inject(&mut f.manager, "OK");
        assert_eq!(
            f.link.sent(),
            vec!["P2P_FIND 30", "P2P_STOP_FIND", "P2P_CONNECT 4e:74:03:70:e2:c1 pbc"]
        );
    }

    #[tokio::test]
    async fn test_group_removed_reason_mapping() {
        for (reason, expected) in [
            ("reason=PSK_FAILURE", DeviceState::Failure),
            ("reason=FORMATION_FAILED", DeviceState::Failure),
            ("reason=FREQ_CONFLICT", DeviceState::Failure),
            ("reason=REQUESTED", DeviceState::Disconnected),
            ("", DeviceState::Disconnected),
        ] {
            let mut f = fixture();
            inject(&mut f.manager, FOUND_SINK);
            assert!(f.manager.connect(mac(SINK)));
            inject(&mut f.manager, "OK");
            inject(
                &mut f.manager,
                "<3>P2P-GROUP-STARTED p2p0 GO ssid=\"DIRECT-hB\" freq=2412 \
                 go_dev_addr=4e:74:03:64:95:a7",
            );
            assert!(f.server_active.load(Ordering::SeqCst));
            drain(&mut f.events);

            inject(
                &mut f.manager,
                &format!("<3>P2P-GROUP-REMOVED p2p0 GO {}", reason),
            );
            assert_eq!(
                f.manager.devices.get(&mac(SINK)).unwrap().state(),
                expected,
                "reason {:?}",
                reason
            );
            assert!(f.manager.current_peer.is_none());
            assert!(!f.server_active.load(Ordering::SeqCst));
            assert!(!f.manager.is_group_owner);
        }
    }

    #[tokio::test]
    async fn test_go_neg_failure_clears_current_peer() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        drain(&mut f.events);

        inject(&mut f.manager, "<3>P2P-GO-NEG-FAILURE status=5");
        assert!(f.manager.current_peer.is_none());
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Failure
        );
    }

    #[tokio::test]
    async fn test_dhcp_timeout_fails_then_reverts_to_idle() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");
        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 client ssid=\"DIRECT-X\" freq=2412 \
             go_dev_addr=4e:74:03:70:e2:c1",
        );
        drain(&mut f.events);

        let epoch = f.manager.dhcp_timer_epoch;
        f.manager.handle_dhcp_timeout(epoch);
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Failure
        );

        let revert = *f.manager.revert_epochs.get(&mac(SINK)).unwrap();
        f.manager.handle_device_revert(mac(SINK), revert);
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Idle
        );
    }

    #[tokio::test]
    async fn test_stale_dhcp_timeout_is_ignored() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");
        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 client go_dev_addr=4e:74:03:70:e2:c1",
        );

        let stale = f.manager.dhcp_timer_epoch;
        f.manager.handle_dhcp_lease(Ipv4Addr::new(192, 168, 49, 2));
        f.manager.handle_dhcp_timeout(stale);
        assert_eq!(
            f.manager.devices.get(&mac(SINK)).unwrap().state(),
            DeviceState::Connected
        );
    }

    #[tokio::test]
    async fn test_supplicant_crash_resets_and_budgets_respawn() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        inject(
            &mut f.manager,
            "<3>P2P-DEVICE-FOUND aa:bb:cc:dd:ee:ff p2p_dev_addr=aa:bb:cc:dd:ee:ff \
             name='Other' wfd_dev_info=0x00111c440032",
        );
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");
        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 client go_dev_addr=4e:74:03:70:e2:c1",
        );
        f.manager.handle_dhcp_lease(Ipv4Addr::new(192, 168, 49, 2));
        drain(&mut f.events);

        let budget_before = f.manager.supervisor.respawn_budget();
        let epoch = f.manager.supervisor.current_epoch();
        f.manager
            .handle_supplicant_exit(epoch, ExitStatus::from_raw(139));

        assert!(f.manager.devices.is_empty());
        assert!(f.manager.current_peer.is_none());
        assert!(!f.manager.is_group_owner);
        assert!(!f.client_active.load(Ordering::SeqCst));
        assert_eq!(f.manager.supervisor.respawn_budget(), budget_before - 1);

        let events = drain(&mut f.events);
        let disconnected = events.iter().any(|event| {
            matches!(event, ManagerEvent::DeviceStateChanged(device)
                if device.state() == DeviceState::Disconnected)
        });
        let lost = events
            .iter()
            .filter(|event| matches!(event, ManagerEvent::DeviceLost(_)))
            .count();
        assert!(disconnected);
        assert_eq!(lost, 2);
    }

    #[tokio::test]
    async fn test_stale_supplicant_exit_is_ignored() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        let epoch = f.manager.supervisor.current_epoch();
        f.manager
            .handle_supplicant_exit(epoch + 1, ExitStatus::from_raw(139));
        assert_eq!(f.manager.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_without_command_in_flight_is_dropped() {
        let mut f = fixture();
        inject(&mut f.manager, "OK");
        inject(&mut f.manager, "FAIL");
        assert!(f.manager.commands.is_empty());
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_uses_cancel_during_association() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");

        f.manager
            .devices
            .get_mut(&mac(SINK))
            .unwrap()
            .set_state(DeviceState::Association);
        assert!(f.manager.disconnect(mac(SINK)));
        assert_eq!(f.link.sent().last().unwrap(), "P2P_CANCEL");
    }

    #[tokio::test]
    async fn test_disconnect_removes_group_otherwise() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        inject(&mut f.manager, "OK");
        inject(
            &mut f.manager,
            "<3>P2P-GROUP-STARTED p2p0 GO go_dev_addr=4e:74:03:64:95:a7",
        );

        assert!(f.manager.disconnect(mac(SINK)));
        assert_eq!(f.link.sent().last().unwrap(), "P2P_GROUP_REMOVE p2p0");

        // Not the current peer: rejected.
        assert!(!f.manager.disconnect(mac(OTHER)));
    }

    #[tokio::test]
    async fn test_ctrl_events_are_ignored() {
        let mut f = fixture();
        inject(&mut f.manager, "<3>CTRL-EVENT-SCAN-STARTED");
        inject(&mut f.manager, "<3>CTRL-EVENT-SCAN-RESULTS");
        inject(&mut f.manager, "<3>AP-STA-CONNECTED 02:11:22:33:44:55");
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_device_lost_for_current_peer_keeps_entry() {
        let mut f = fixture();
        inject(&mut f.manager, FOUND_SINK);
        assert!(f.manager.connect(mac(SINK)));
        drain(&mut f.events);

        inject(&mut f.manager, "<3>P2P-DEVICE-LOST p2p_dev_addr=4e:74:03:70:e2:c1");
        assert!(f.manager.devices.contains_key(&mac(SINK)));
        assert!(drain(&mut f.events).is_empty());
    }
}

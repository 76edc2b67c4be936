//! Miracast service controller
//!
//! The top-level state machine the system bus talks to. It owns the network
//! manager while enabled, serializes at most one active session, gates every
//! operation by service state and publishes change notifications to
//! observers. Once a session reaches `Connected` the controller resolves the
//! local address and publishes the RTSP endpoint for the streaming
//! subsystem; when it ends the display-state lock is dropped and an idle
//! timer returns the externally reported state to `Idle`.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::config::Config;
use super::manager::{ManagerEvent, ManagerHandle, NetworkManager};
use super::system::{DisplayState, SystemController};
use crate::device::{DeviceRole, DeviceState, MacAddress, NetworkDevice};

/// Scan duration used when the caller does not pass one. The supplicant
/// stops the find on its own after this long.
const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(30);

/// Error taxonomy surfaced to bus clients. A successful operation reports
/// no error at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("operation failed")]
    Failed,
    #[error("service is not ready")]
    NotReady,
    #[error("another session is already active")]
    Already,
    #[error("invalid parameter")]
    ParamInvalid,
    #[error("invalid state")]
    InvalidState,
}

/// Notifications towards bus observers.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Changed,
    DeviceFound(NetworkDevice),
    DeviceLost(NetworkDevice),
    DeviceChanged(NetworkDevice),
    StateChanged(DeviceState),
    /// A session is connected; the RTSP source should bind here.
    SourceReady(SocketAddr),
    /// The connected session ended; the RTSP source must be torn down.
    SourceClosed,
}

enum Command {
    SetEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    Scan {
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    Connect {
        address: Option<MacAddress>,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    Disconnect {
        address: Option<MacAddress>,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    DisconnectAll {
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },
    State {
        reply: oneshot::Sender<DeviceState>,
    },
    Scanning {
        reply: oneshot::Sender<bool>,
    },
    Enabled {
        reply: oneshot::Sender<bool>,
    },
    Capabilities {
        reply: oneshot::Sender<Vec<DeviceRole>>,
    },
    Devices {
        reply: oneshot::Sender<Vec<NetworkDevice>>,
    },
    /// The streaming side lost its client; tear the session down.
    ClientDisconnected,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    IdleTimeout {
        epoch: u64,
    },
}

/// Cloneable handle the bus skeleton drives the controller through.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ServiceError> {
        self.roundtrip(|reply| Command::SetEnabled { enabled, reply })
            .await
    }

    pub async fn scan(&self) -> Result<(), ServiceError> {
        self.roundtrip(|reply| Command::Scan { reply }).await
    }

    /// Start a session with the given peer. Resolves once the session is
    /// connected, or with the first failure after acceptance.
    pub async fn connect(&self, address: Option<MacAddress>) -> Result<(), ServiceError> {
        self.roundtrip(|reply| Command::Connect { address, reply })
            .await
    }

    pub async fn disconnect(&self, address: Option<MacAddress>) -> Result<(), ServiceError> {
        self.roundtrip(|reply| Command::Disconnect { address, reply })
            .await
    }

    pub async fn disconnect_all(&self) -> Result<(), ServiceError> {
        self.roundtrip(|reply| Command::DisconnectAll { reply })
            .await
    }

    pub async fn state(&self) -> DeviceState {
        self.query(|reply| Command::State { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn scanning(&self) -> bool {
        self.query(|reply| Command::Scanning { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn enabled(&self) -> bool {
        self.query(|reply| Command::Enabled { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn capabilities(&self) -> Vec<DeviceRole> {
        self.query(|reply| Command::Capabilities { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn devices(&self) -> Vec<NetworkDevice> {
        self.query(|reply| Command::Devices { reply })
            .await
            .unwrap_or_default()
    }

    /// Hook for the streaming subsystem: its client went away.
    pub fn notify_client_disconnected(&self) {
        let _ = self.tx.send(Command::ClientDisconnected);
    }

    /// Disable the service and wait until teardown finished.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn roundtrip<F>(&self, command: F) -> Result<(), ServiceError>
    where
        F: FnOnce(oneshot::Sender<Result<(), ServiceError>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(command(reply)).is_err() {
            return Err(ServiceError::NotReady);
        }
        rx.await.unwrap_or(Err(ServiceError::Failed))
    }

    async fn query<T, F>(&self, command: F) -> Option<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).ok()?;
        rx.await.ok()
    }
}

pub struct MiracastService {
    config: Config,
    input_tx: mpsc::UnboundedSender<Command>,
    input_rx: mpsc::UnboundedReceiver<Command>,
    observers: mpsc::UnboundedSender<ServiceEvent>,
    system: SystemController,
    enabled: bool,
    manager: Option<ManagerHandle>,
    manager_events: Option<mpsc::UnboundedReceiver<ManagerEvent>>,
    capabilities: Vec<DeviceRole>,
    current_device: Option<MacAddress>,
    state: DeviceState,
    connect_reply: Option<oneshot::Sender<Result<(), ServiceError>>>,
    source: Option<SocketAddr>,
    lock_held: bool,
    idle_epoch: u64,
}

enum Stimulus {
    Command(Option<Command>),
    Manager(Option<ManagerEvent>),
}

impl MiracastService {
    /// Spawn the controller task and return the handle bus skeletons drive
    /// plus the observer notification stream.
    pub fn spawn(config: Config) -> (ControllerHandle, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (observer_tx, observer_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let service = Self {
            config,
            input_tx: input_tx.clone(),
            input_rx,
            observers: observer_tx,
            system: SystemController::platform_default(),
            enabled: false,
            manager: None,
            manager_events: None,
            capabilities: Vec::new(),
            current_device: None,
            state: DeviceState::Idle,
            connect_reply: None,
            source: None,
            lock_held: false,
            idle_epoch: 0,
        };
        tokio::spawn(service.run());
        (ControllerHandle { tx: input_tx }, observer_rx)
    }

    async fn run(mut self) {
        loop {
            let stimulus = match self.manager_events.as_mut() {
                Some(events) => {
                    // Commands gate on current state, so they must not be
                    // overtaken by notifications that arrived later.
                    tokio::select! {
                        biased;
                        command = self.input_rx.recv() => Stimulus::Command(command),
                        event = events.recv() => Stimulus::Manager(event),
                    }
                }
                None => Stimulus::Command(self.input_rx.recv().await),
            };

            match stimulus {
                Stimulus::Command(None) => break,
                Stimulus::Command(Some(command)) => self.handle_command(command).await,
                Stimulus::Manager(Some(event)) => self.on_manager_event(event).await,
                Stimulus::Manager(None) => self.manager_events = None,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetEnabled { enabled, reply } => {
                let _ = reply.send(self.set_enabled(enabled).await);
            }
            Command::Scan { reply } => {
                let _ = reply.send(self.scan());
            }
            Command::Connect { address, reply } => self.start_connect(address, reply).await,
            Command::Disconnect { address, reply } => {
                let _ = reply.send(self.disconnect(address).await);
            }
            Command::DisconnectAll { reply } => {
                let current = self.current_device;
                let _ = reply.send(self.disconnect(current).await);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::Scanning { reply } => {
                let scanning = match &self.manager {
                    Some(manager) if self.enabled => manager.scanning().await,
                    _ => false,
                };
                let _ = reply.send(scanning);
            }
            Command::Enabled { reply } => {
                let _ = reply.send(self.enabled);
            }
            Command::Capabilities { reply } => {
                let capabilities = if self.enabled {
                    self.capabilities.clone()
                } else {
                    Vec::new()
                };
                let _ = reply.send(capabilities);
            }
            Command::Devices { reply } => {
                let devices = match &self.manager {
                    Some(manager) => manager.devices().await,
                    None => Vec::new(),
                };
                let _ = reply.send(devices);
            }
            Command::ClientDisconnected => {
                let current = self.current_device;
                if current.is_some() {
                    let _ = self.disconnect(current).await;
                }
            }
            Command::Shutdown { reply } => {
                let _ = self.set_enabled(false).await;
                let _ = reply.send(());
            }
            Command::IdleTimeout { epoch } => {
                if epoch == self.idle_epoch {
                    self.advance_state(DeviceState::Idle).await;
                }
            }
        }
    }

    async fn set_enabled(&mut self, enabled: bool) -> Result<(), ServiceError> {
        if self.enabled == enabled {
            return Err(ServiceError::InvalidState);
        }

        if enabled {
            let (manager, events) = NetworkManager::spawn(self.config.clone());
            if let Err(err) = manager.setup().await {
                error!("failed to set up network manager: {}", err);
                return Err(ServiceError::Failed);
            }
            self.capabilities = vec![DeviceRole::Source];
            self.manager = Some(manager);
            self.manager_events = Some(events);
        } else {
            if let (Some(address), Some(manager)) = (self.current_device, &self.manager) {
                manager.disconnect(address).await;
            }
            self.finish_connect(Err(ServiceError::Failed));
            self.drop_source();
            self.release_display_lock();
            self.current_device = None;
            self.capabilities.clear();
            self.manager = None;
            self.manager_events = None;
            if self.state != DeviceState::Idle {
                self.state = DeviceState::Idle;
                self.emit(ServiceEvent::StateChanged(DeviceState::Idle));
            }
        }

        self.enabled = enabled;
        self.emit(ServiceEvent::Changed);
        Ok(())
    }

    fn scan(&mut self) -> Result<(), ServiceError> {
        if !self.enabled {
            return Err(ServiceError::NotReady);
        }
        if self.current_device.is_some() {
            return Err(ServiceError::NotReady);
        }
        let Some(manager) = &self.manager else {
            return Err(ServiceError::NotReady);
        };
        manager.scan(DEFAULT_SCAN_DURATION);
        Ok(())
    }

    /// Gate and forward a connect request. The reply is kept and fires
    /// exactly once: with success on the first `Connected`, or with
    /// `Failed` on the first `Failure` after acceptance.
    async fn start_connect(
        &mut self,
        address: Option<MacAddress>,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    ) {
        if !self.enabled {
            debug!("connect rejected, not ready");
            let _ = reply.send(Err(ServiceError::NotReady));
            return;
        }
        if self.current_device.is_some() {
            debug!("connect rejected, session already active");
            let _ = reply.send(Err(ServiceError::Already));
            return;
        }
        let Some(address) = address else {
            let _ = reply.send(Err(ServiceError::ParamInvalid));
            return;
        };
        let Some(manager) = &self.manager else {
            let _ = reply.send(Err(ServiceError::NotReady));
            return;
        };

        debug!(device = %address, "connecting");
        if !manager.connect(address).await {
            debug!(device = %address, "manager rejected connect");
            let _ = reply.send(Err(ServiceError::Failed));
            return;
        }

        self.system.display_lock().acquire(DisplayState::On);
        self.lock_held = true;
        self.current_device = Some(address);
        self.connect_reply = Some(reply);
    }

    async fn disconnect(&mut self, address: Option<MacAddress>) -> Result<(), ServiceError> {
        if !self.enabled {
            return Err(ServiceError::NotReady);
        }
        if self.current_device.is_none() {
            return Err(ServiceError::ParamInvalid);
        }
        let Some(address) = address else {
            return Err(ServiceError::ParamInvalid);
        };
        let Some(manager) = &self.manager else {
            return Err(ServiceError::NotReady);
        };

        if !manager.disconnect(address).await {
            return Err(ServiceError::Failed);
        }
        Ok(())
    }

    async fn on_manager_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Changed => self.emit(ServiceEvent::Changed),
            ManagerEvent::DeviceFound(device) => self.emit(ServiceEvent::DeviceFound(device)),
            ManagerEvent::DeviceLost(device) => self.emit(ServiceEvent::DeviceLost(device)),
            ManagerEvent::DeviceChanged(device) => {
                self.emit(ServiceEvent::DeviceChanged(device))
            }
            ManagerEvent::DeviceStateChanged(device) => {
                debug!(
                    device = %device.address(),
                    state = %device.state(),
                    "device state changed"
                );
                if Some(device.address()) != self.current_device {
                    return;
                }
                self.advance_state(device.state()).await;
                self.emit(ServiceEvent::DeviceChanged(device));
            }
        }
    }

    async fn advance_state(&mut self, new_state: DeviceState) {
        debug!(current = %self.state, new = %new_state, "advancing service state");

        match new_state {
            DeviceState::Connected => {
                self.publish_source().await;
                self.finish_connect(Ok(()));
            }
            DeviceState::Failure => {
                self.finish_connect(Err(ServiceError::Failed));
                // Failure ends the session the same way a disconnect does.
                self.session_ended();
            }
            DeviceState::Disconnected => self.session_ended(),
            DeviceState::Idle | DeviceState::Association | DeviceState::Configuration => {}
        }

        self.state = new_state;
        self.emit(ServiceEvent::StateChanged(new_state));
    }

    /// Resolve the local address and hand the RTSP endpoint to observers.
    async fn publish_source(&mut self) {
        let Some(manager) = &self.manager else {
            return;
        };
        match manager.local_address().await {
            Some(address) => {
                let endpoint = SocketAddr::from((address, self.config.rtsp_port));
                self.source = Some(endpoint);
                self.emit(ServiceEvent::SourceReady(endpoint));
            }
            None => warn!("connected without a local address, no RTSP endpoint"),
        }
    }

    fn session_ended(&mut self) {
        self.drop_source();
        self.current_device = None;
        self.release_display_lock();
        self.start_idle_timer();
    }

    fn drop_source(&mut self) {
        if self.source.take().is_some() {
            self.emit(ServiceEvent::SourceClosed);
        }
    }

    fn release_display_lock(&mut self) {
        if self.lock_held {
            self.system.display_lock().release(DisplayState::On);
            self.lock_held = false;
        }
    }

    fn start_idle_timer(&mut self) {
        self.idle_epoch += 1;
        let epoch = self.idle_epoch;
        let tx = self.input_tx.clone();
        let delay = self.config.idle_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::IdleTimeout { epoch });
        });
    }

    fn finish_connect(&mut self, result: Result<(), ServiceError>) {
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(result);
        }
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.observers.send(event);
    }
}

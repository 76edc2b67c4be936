//! # Miracast source daemon
//!
//! This crate implements the Wi-Fi Direct (P2P) control plane of a Miracast
//! source: it supervises a dedicated `wpa_supplicant` instance, speaks its
//! control-socket protocol, forms a P2P group with a sink display, brings IP
//! connectivity up on the group interface and hands the resulting socket
//! address off to the RTSP/streaming subsystem.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `message`: supplicant control protocol parsing and serialization
//! - `wfd`: WFD device-information subelement codec
//! - `device`: remote peer model and per-peer connection state
//! - `daemon`: transport, command queue, supplicant supervisor, DHCP
//!   wrappers, the network manager and the service controller

pub mod device;
pub mod message;
pub mod wfd;

// Daemon modules
pub mod daemon;

// Re-export commonly used types
pub use crate::{
    device::{DeviceRole, DeviceState, MacAddress, NetworkDevice},
    message::{Message, MessageType},
    wfd::WfdDeviceInfo,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MiracastError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Supplicant error: {0}")]
    Supplicant(String),

    #[error("DHCP error: {0}")]
    Dhcp(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, MiracastError>;

// Constants
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;

/// Default RTSP control port for Miracast sessions.
pub const MIRACAST_DEFAULT_RTSP_PORT: u16 = 7236;

/// WFD subelement registered with the supplicant at index 0: device
/// information announcing us as a WFD source with session availability set
/// and the default RTSP control port.
pub const WFD_DEVICE_INFO_SUBELEMENT: &str = "000600101C440032";

/// Directory for runtime artifacts, wiped and recreated on startup.
pub const RUNTIME_PATH: &str = "/run/miracastd";

//! Daemon modules
//!
//! Everything that makes the control plane run: the supplicant transport
//! and command queue, the process supervisor, the DHCP wrappers, the
//! network manager and the service controller on top.

pub mod commands;
pub mod config;
pub mod dhcp;
pub mod firmware;
pub mod manager;
pub mod service;
pub mod supervisor;
pub mod system;
pub mod transport;

// Re-export main types
pub use config::Config;
pub use manager::{ManagerEvent, ManagerHandle, NetworkManager};
pub use service::{ControllerHandle, MiracastService, ServiceError, ServiceEvent};

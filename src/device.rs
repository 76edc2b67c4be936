//! Remote peer model
//!
//! This module contains the data model for remote P2P peers: the canonical
//! MAC address used as identity key, the per-peer connection state and the
//! device entry kept in the network manager's peer map.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MiracastError, Result};

/// Canonical MAC address, formatted `xx:xx:xx:xx:xx:xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = MiracastError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| MiracastError::Parse(format!("short MAC address {:?}", s)))?;
            if part.len() != 2 {
                return Err(MiracastError::Parse(format!("malformed MAC address {:?}", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MiracastError::Parse(format!("malformed MAC address {:?}", s)))?;
        }
        if parts.next().is_some() {
            return Err(MiracastError::Parse(format!("long MAC address {:?}", s)));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Per-peer connection state.
///
/// `Disconnected` is terminal for a session and reverts to `Idle` after a
/// grace period; `Failure` is transient and reverts after the peer-failure
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceState {
    #[default]
    Idle,
    Association,
    Configuration,
    Connected,
    Failure,
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Association => "association",
            Self::Configuration => "configuration",
            Self::Connected => "connected",
            Self::Failure => "failure",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Role a peer can take in a WFD session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Source,
    Sink,
}

/// One entry of the peer map.
///
/// Created when a peer is first observed during discovery and destroyed when
/// the supplicant loses it or the manager resets. The address never changes
/// for the lifetime of the entry; the state is mutated only by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDevice {
    address: MacAddress,
    name: String,
    roles: Vec<DeviceRole>,
    state: DeviceState,
    ipv4: Option<Ipv4Addr>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl NetworkDevice {
    pub fn new(address: MacAddress, name: String, roles: Vec<DeviceRole>) -> Self {
        let now = Utc::now();
        Self {
            address,
            name,
            roles,
            state: DeviceState::Idle,
            ipv4: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &[DeviceRole] {
        &self.roles
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// IPv4 endpoint of the established session, if any.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Refresh name and roles from a repeated discovery report.
    pub(crate) fn update(&mut self, name: String, roles: Vec<DeviceRole>) {
        self.name = name;
        self.roles = roles;
        self.last_seen = Utc::now();
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    pub(crate) fn set_ipv4(&mut self, ipv4: Option<Ipv4Addr>) {
        self.ipv4 = ipv4;
    }
}

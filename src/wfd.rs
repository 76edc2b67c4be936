//! WFD device-information subelement codec
//!
//! This module decodes the `wfd_dev_info` value announced by remote peers
//! during P2P discovery. The payload is six bytes carrying three big-endian
//! 16-bit fields: a device-information bitmap, the RTSP control port and the
//! maximum average throughput. The supplicant reports either the bare
//! six-byte field (`0x00111c440032`) or the full subelement including its
//! one-byte ID and two-byte length header (`000600101C440032`).

use serde::{Deserialize, Serialize};

use crate::device::DeviceRole;
use crate::{MiracastError, Result};

/// Device-type field of the device-information bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WfdDeviceType {
    Source = 0,
    PrimarySink = 1,
    SecondarySink = 2,
    DualRole = 3,
}

impl From<u16> for WfdDeviceType {
    fn from(bits: u16) -> Self {
        match bits & DEVICE_TYPE_MASK {
            0 => Self::Source,
            1 => Self::PrimarySink,
            2 => Self::SecondarySink,
            _ => Self::DualRole,
        }
    }
}

const DEVICE_TYPE_MASK: u16 = 0x0003;
const SESSION_AVAILABILITY_MASK: u16 = 0x0030;
const SESSION_AVAILABLE: u16 = 0x0010;
const CONTENT_PROTECTION: u16 = 0x0100;

/// Decoded WFD device information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WfdDeviceInfo {
    device_info: u16,
    control_port: u16,
    max_throughput: u16,
}

impl WfdDeviceInfo {
    /// Parse the ASCII-hex representation reported by the supplicant.
    ///
    /// Accepts the 12-character six-byte field, optionally `0x`-prefixed, or
    /// the 16-character subelement form whose length header must announce a
    /// six-byte body. Everything else is rejected.
    pub fn parse(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")).unwrap_or(hex);

        let body = match hex.len() {
            12 => hex,
            16 => {
                let header = decode_hex(&hex[..4])?;
                let length = u16::from_be_bytes([header[0], header[1]]);
                // Subelement header: ID byte folded into the 16-bit length
                // read; only ID 0 with a six-byte body is ours.
                if length != 0x0006 {
                    return Err(MiracastError::Parse(format!(
                        "unexpected wfd_dev_info subelement header {:04x}",
                        length
                    )));
                }
                &hex[4..]
            }
            _ => {
                return Err(MiracastError::Parse(format!(
                    "wfd_dev_info must be 6 bytes, got {:?}",
                    hex
                )))
            }
        };

        let bytes = decode_hex(body)?;
        Ok(Self {
            device_info: u16::from_be_bytes([bytes[0], bytes[1]]),
            control_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            max_throughput: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Encode back to the bare 12-character hex field.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(12);
        for byte in self
            .device_info
            .to_be_bytes()
            .into_iter()
            .chain(self.control_port.to_be_bytes())
            .chain(self.max_throughput.to_be_bytes())
        {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    pub fn device_type(&self) -> WfdDeviceType {
        WfdDeviceType::from(self.device_info)
    }

    pub fn session_available(&self) -> bool {
        self.device_info & SESSION_AVAILABILITY_MASK == SESSION_AVAILABLE
    }

    pub fn content_protected(&self) -> bool {
        self.device_info & CONTENT_PROTECTION != 0
    }

    /// RTSP control port the peer listens on.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn max_throughput(&self) -> u16 {
        self.max_throughput
    }

    pub fn is_supported_source(&self) -> bool {
        matches!(
            self.device_type(),
            WfdDeviceType::Source | WfdDeviceType::DualRole
        )
    }

    pub fn is_supported_sink(&self) -> bool {
        matches!(
            self.device_type(),
            WfdDeviceType::PrimarySink | WfdDeviceType::SecondarySink | WfdDeviceType::DualRole
        )
    }

    /// A peer we can hold a session with: source, primary sink or dual-role.
    pub fn is_supported(&self) -> bool {
        matches!(
            self.device_type(),
            WfdDeviceType::Source | WfdDeviceType::PrimarySink | WfdDeviceType::DualRole
        )
    }

    /// Roles the peer can take in a session.
    pub fn supported_roles(&self) -> Vec<DeviceRole> {
        let mut roles = Vec::new();
        if self.is_supported_source() {
            roles.push(DeviceRole::Source);
        }
        if self.is_supported_sink() {
            roles.push(DeviceRole::Sink);
        }
        roles
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(MiracastError::Parse(format!("odd-length hex {:?}", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| MiracastError::Parse(format!("invalid hex {:?}", hex)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_field() {
        let info = WfdDeviceInfo::parse("0x00111c440032").unwrap();
        assert_eq!(info.device_type(), WfdDeviceType::PrimarySink);
        assert!(info.session_available());
        assert!(!info.content_protected());
        assert_eq!(info.control_port(), 7236);
        assert_eq!(info.max_throughput(), 50);
        assert!(info.is_supported());
        assert_eq!(info.supported_roles(), vec![DeviceRole::Sink]);
    }

    #[test]
    fn test_parse_subelement_form() {
        let info = WfdDeviceInfo::parse("000600101C440032").unwrap();
        assert_eq!(info.device_type(), WfdDeviceType::Source);
        assert!(info.session_available());
        assert_eq!(info.control_port(), 7236);
        assert!(info.is_supported());
    }

    #[test]
    fn test_secondary_sink_is_unsupported() {
        let info = WfdDeviceInfo::parse("00121c440032").unwrap();
        assert_eq!(info.device_type(), WfdDeviceType::SecondarySink);
        assert!(!info.is_supported());
        assert!(info.is_supported_sink());
    }

    #[test]
    fn test_dual_role_maps_to_both_roles() {
        let info = WfdDeviceInfo::parse("00131c440032").unwrap();
        assert_eq!(info.device_type(), WfdDeviceType::DualRole);
        assert_eq!(
            info.supported_roles(),
            vec![DeviceRole::Source, DeviceRole::Sink]
        );
    }

    #[test]
    fn test_encode_round_trip() {
        for hex in ["00101c440032", "00111c440032", "0013075e0064"] {
            let info = WfdDeviceInfo::parse(hex).unwrap();
            assert!(info.is_supported());
            assert_eq!(WfdDeviceInfo::parse(&info.encode()).unwrap(), info);
            assert_eq!(info.encode(), hex);
        }
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(WfdDeviceInfo::parse("").is_err());
        assert!(WfdDeviceInfo::parse("001122").is_err());
        assert!(WfdDeviceInfo::parse("00111c44003").is_err());
        assert!(WfdDeviceInfo::parse("zz111c440032").is_err());
        // Subelement header announcing the wrong body length.
        assert!(WfdDeviceInfo::parse("00FF00101C440032").is_err());
    }

    #[test]
    fn test_content_protection_bit() {
        let info = WfdDeviceInfo::parse("01111c440032").unwrap();
        assert!(info.content_protected());
    }
}

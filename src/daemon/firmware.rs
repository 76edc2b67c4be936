//! Firmware loader seam
//!
//! Some platforms ship separate Wi-Fi firmware images for P2P operation and
//! need a blob switched in before the interface can be driven. The network
//! manager consults this seam during setup and defers starting the
//! supplicant until loading finished.

use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait FirmwareLoader: Send {
    /// Whether the interface needs a firmware switch before use.
    fn is_needed(&self) -> bool;

    /// Load the P2P firmware. Only called when [`is_needed`](Self::is_needed)
    /// reported true.
    async fn load(&self) -> Result<()>;
}

/// Platform default: the interface is usable as-is.
pub struct NoFirmwareLoader;

#[async_trait]
impl FirmwareLoader for NoFirmwareLoader {
    fn is_needed(&self) -> bool {
        false
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }
}

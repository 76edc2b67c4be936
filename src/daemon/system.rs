//! Platform system controller
//!
//! Hosts the display-state lock: while a cast session is live the screen
//! must not blank, so the service acquires the lock when a connect attempt
//! is accepted and releases it when the session ends. Acquisitions are
//! counted so nested holds are safe.

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    On,
    Off,
}

/// Counted lock on the requested display state.
#[derive(Debug, Default)]
pub struct DisplayStateLock {
    holds: u32,
}

impl DisplayStateLock {
    pub fn acquire(&mut self, state: DisplayState) {
        self.holds += 1;
        if self.holds == 1 {
            debug!(?state, "display state lock acquired");
            // Platform integration point: request the display state from
            // the session's power manager.
        }
    }

    pub fn release(&mut self, state: DisplayState) {
        if self.holds == 0 {
            warn!(?state, "display state lock released without holder");
            return;
        }
        self.holds -= 1;
        if self.holds == 0 {
            debug!(?state, "display state lock released");
        }
    }

    pub fn held(&self) -> bool {
        self.holds > 0
    }
}

/// Platform services the controller depends on.
#[derive(Debug, Default)]
pub struct SystemController {
    display_lock: DisplayStateLock,
}

impl SystemController {
    pub fn platform_default() -> Self {
        Self::default()
    }

    pub fn display_lock(&mut self) -> &mut DisplayStateLock {
        &mut self.display_lock
    }
}

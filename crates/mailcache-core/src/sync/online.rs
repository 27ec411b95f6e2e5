//! Shared connectivity flag.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Whether the remote provider is believed reachable.
///
/// Shared between the sync scheduler and request handlers; starts online.
#[derive(Debug)]
pub struct OnlineStatus {
    online: AtomicBool,
}

impl Default for OnlineStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl OnlineStatus {
    /// Creates a flag with the given initial state.
    #[must_use]
    pub const fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Set the state. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.swap(online, Ordering::AcqRel) != online;
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }
}

//! Session-scoped packet-identifier allocation.

use std::sync::atomic::{AtomicU16, Ordering};

/// Monotonic 16-bit identifier generator.
///
/// The first identifier issued in a session is 1; on wrap past 0xFFFF the
/// zero value is skipped, since zero is never a valid MQTT packet
/// identifier. Safe under concurrent callers.
#[derive(Debug, Default)]
pub(crate) struct PacketIdAllocator {
    latest: AtomicU16,
}

impl PacketIdAllocator {
    pub fn next_id(&self) -> u16 {
        loop {
            let id = self.latest.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Restart at 1 for a fresh connect episode.
    pub fn reset(&self) {
        self.latest.store(0, Ordering::Relaxed);
    }
}

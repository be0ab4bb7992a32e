//! Registered memory region modeled as an owned, fixed-capacity buffer with
//! a registration handle. Ownership transitions (free-list -> in-flight ->
//! stable-map -> persistence -> free-list) are moves of the `MessageBuffer`
//! value itself, never address-level aliasing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Registration handle counter; one per registered region in the process.
static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// A payload buffer backed by a registered region.
#[derive(Debug)]
pub(crate) struct MessageBuffer {
    /// Registration handle of the backing region.
    region_id: u64,

    /// The region itself, sized to `max_msg_size` at registration.
    bytes: Vec<u8>,
}

impl MessageBuffer {
    /// Registers a new region of the given capacity.
    pub(crate) fn new(capacity: usize) -> MessageBuffer {
        MessageBuffer {
            region_id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            bytes: vec![0u8; capacity],
        }
    }

    /// Registration handle of this buffer's region.
    pub(crate) fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Capacity of the region.
    pub(crate) fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Read access to the first `len` bytes.
    pub(crate) fn as_slice(&self, len: usize) -> &[u8] {
        &self.bytes[..len]
    }

    /// Write access to the first `len` bytes.
    pub(crate) fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        &mut self.bytes[..len]
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;

    #[test]
    fn distinct_region_ids() {
        let a = MessageBuffer::new(64);
        let b = MessageBuffer::new(64);
        assert_ne!(a.region_id(), b.region_id());
        assert_eq!(a.capacity(), 64);
    }

    #[test]
    fn slice_access() {
        let mut buf = MessageBuffer::new(16);
        buf.as_mut_slice(4).copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(buf.as_slice(4), &[9, 8, 7, 6]);
    }
}

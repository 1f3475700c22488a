/// Maximum datagram payload carried by a single buffer. One datagram is one
/// application message; anything longer is truncated by the socket.
pub const PACKET_CAPACITY: usize = 500;

/// A fixed-capacity buffer holding one datagram payload. Buffers are pooled:
/// a network worker leases one per receive, ownership transfers through the
/// ingress accumulator to the per-tick input callback, and the lease drop
/// returns the storage to the pool.
pub struct PacketBuffer {
    data: [u8; PACKET_CAPACITY],
    size: u16,
}

impl Default for PacketBuffer {
    #[inline]
    fn default() -> PacketBuffer {
        PacketBuffer {
            data: [0; PACKET_CAPACITY],
            size: 0,
        }
    }
}

impl PacketBuffer {
    /// The received payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Number of payload bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// The full backing storage, handed to the socket receive call.
    #[inline]
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record the number of bytes the socket wrote into the storage.
    #[inline]
    pub fn set_size(&mut self, size: usize) {
        if size > PACKET_CAPACITY {
            panic!("Datagram size {} exceeds buffer capacity", size);
        }
        self.size = size as u16;
    }

    /// Copy a payload in, for tests and loopback paths.
    #[inline]
    pub fn fill(&mut self, payload: &[u8]) {
        self.data[..payload.len()].copy_from_slice(payload);
        self.set_size(payload.len());
    }
}

//! Buffer set for state machine operations.

/// Buffers owned by one connection's packet channel.
pub struct BufferSet {
    /// Reassembled payload of the last logical packet read
    pub read_buffer: Vec<u8>,
    /// Payload of the outgoing command (without packet headers)
    pub write_buffer: Vec<u8>,
    /// Framed wire bytes waiting to be flushed
    pub packet_buffer: Vec<u8>,
    /// Decompressed inbound bytes not yet consumed by the packet reader
    pub inflated: Vec<u8>,
    /// Read offset into `inflated`
    pub inflated_pos: usize,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            packet_buffer: Vec::with_capacity(8192),
            inflated: Vec::new(),
            inflated_pos: 0,
        }
    }

    /// Clear every buffer, keeping capacity.
    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.packet_buffer.clear();
        self.inflated.clear();
        self.inflated_pos = 0;
    }
}

impl std::fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSet")
            .field("read_buffer", &self.read_buffer.len())
            .field("write_buffer", &self.write_buffer.len())
            .field("packet_buffer", &self.packet_buffer.len())
            .finish_non_exhaustive()
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}

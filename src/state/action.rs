//! Action types for state machine I/O requests.

/// Action requested by the handshake state machine.
///
/// The caller performs the requested I/O and then calls `step()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write `buffer_set.write_buffer` as one packet, then run the TLS handshake.
    ///
    /// Used for the SSLRequest. `step()` is called again without reading.
    WriteAndUpgradeTls,

    /// Read one packet into `buffer_set.read_buffer`.
    ReadPacket,

    /// Write `buffer_set.write_buffer` as one packet, then read one packet.
    WriteAndReadPacket,

    /// The state machine has finished successfully.
    Finished,
}

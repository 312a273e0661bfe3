//! Packet framing: `[length: u24 LE][sequence id: u8][payload]`.
//!
//! A logical payload of `MAX_PACKET_PAYLOAD` bytes or more is split into
//! continuation packets; a packet shorter than the maximum ends the message,
//! so an exact multiple is terminated by an empty packet.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_PACKET_PAYLOAD;
use crate::error::{Error, Result};

/// Framed bytes are flushed to the socket once the pending buffer grows past this.
pub const FLUSH_THRESHOLD: usize = MAX_PACKET_PAYLOAD;

/// Packet header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Payload length (little-endian u24)
    pub length: [u8; 3],
    /// Sequence id
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    pub fn new(payload_len: usize, sequence_id: u8) -> Self {
        let len = (payload_len as u32).to_le_bytes();
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(bytes).map_err(|e| Error::Protocol(format!("PacketHeader: {e:?}")))
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.length[0])
            | (usize::from(self.length[1]) << 8)
            | (usize::from(self.length[2]) << 16)
    }
}

/// Wrapping packet sequence counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sequence(u8);

impl Sequence {
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn current(&self) -> u8 {
        self.0
    }

    /// Take the current id for an outgoing packet.
    pub fn advance(&mut self) -> u8 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }

    /// Validate the id of an incoming packet and advance past it.
    pub fn check(&mut self, received: u8) -> Result<()> {
        if received != self.0 {
            return Err(Error::Protocol(format!(
                "Packets out of order: expected sequence {}, got {}",
                self.0, received
            )));
        }
        self.0 = self.0.wrapping_add(1);
        Ok(())
    }
}

/// Frame `payload` into wire packets appended to `out`.
///
/// `max_allowed` is the server's max_allowed_packet. A command whose first
/// packet already crosses it fails before anything is written; crossing it on
/// a continuation packet leaves a partial command on the wire.
/// `flush` is called whenever `out` exceeds [`FLUSH_THRESHOLD`].
pub fn write_packets<F>(
    out: &mut Vec<u8>,
    payload: &[u8],
    seq: &mut Sequence,
    max_allowed: Option<usize>,
    flush: F,
) -> Result<()>
where
    F: FnMut(&mut Vec<u8>) -> Result<()>,
{
    write_packets_with_chunk(out, payload, seq, max_allowed, MAX_PACKET_PAYLOAD, flush)
}

fn write_packets_with_chunk<F>(
    out: &mut Vec<u8>,
    payload: &[u8],
    seq: &mut Sequence,
    max_allowed: Option<usize>,
    chunk_size: usize,
    mut flush: F,
) -> Result<()>
where
    F: FnMut(&mut Vec<u8>) -> Result<()>,
{
    let mut offset = 0;
    let mut first = true;
    loop {
        let len = chunk_size.min(payload.len() - offset);

        if let Some(max) = max_allowed
            && offset + len >= max
        {
            return Err(Error::PacketTooLarge {
                size: payload.len(),
                max,
                must_reconnect: !first,
            });
        }

        out.extend_from_slice(PacketHeader::new(len, seq.advance()).as_bytes());
        out.extend_from_slice(&payload[offset..offset + len]);
        offset += len;
        first = false;

        if out.len() >= FLUSH_THRESHOLD {
            flush(out)?;
        }
        if len < chunk_size {
            return Ok(());
        }
    }
}

/// Read one logical payload into `out` (which is cleared first).
pub fn read_packets<F>(out: &mut Vec<u8>, seq: &mut Sequence, read_exact: F) -> Result<()>
where
    F: FnMut(&mut [u8]) -> std::io::Result<()>,
{
    read_packets_with_chunk(out, seq, MAX_PACKET_PAYLOAD, read_exact)
}

fn read_packets_with_chunk<F>(
    out: &mut Vec<u8>,
    seq: &mut Sequence,
    chunk_size: usize,
    mut read_exact: F,
) -> Result<()>
where
    F: FnMut(&mut [u8]) -> std::io::Result<()>,
{
    out.clear();
    loop {
        let mut header_bytes = [0_u8; PacketHeader::SIZE];
        read_exact(&mut header_bytes)?;
        let header = PacketHeader::parse(&header_bytes)?;
        seq.check(header.sequence_id)?;

        let len = header.payload_len();
        let start = out.len();
        out.resize(start + len, 0);
        read_exact(&mut out[start..])?;

        if len < chunk_size {
            return Ok(());
        }
    }
}

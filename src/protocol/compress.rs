//! Compressed protocol frames.
//!
//! Each frame is `[compressed length: u24][sequence id: u8][uncompressed length: u24]`
//! followed by a zlib body. An uncompressed length of 0 means the body is stored
//! as-is. Frames carry their own sequence counter, independent of the packets
//! they wrap.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_PACKET_PAYLOAD;
use crate::error::{Error, Result};
use crate::protocol::packet::Sequence;

/// Payloads shorter than this are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 1536;

/// Compressed frame header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct CompressedHeader {
    pub compressed_length: [u8; 3],
    pub sequence_id: u8,
    pub uncompressed_length: [u8; 3],
}

fn u24(len: usize) -> [u8; 3] {
    let bytes = (len as u32).to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

fn from_u24(bytes: [u8; 3]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}

impl CompressedHeader {
    pub const SIZE: usize = 7;

    pub fn new(compressed_len: usize, sequence_id: u8, uncompressed_len: usize) -> Self {
        Self {
            compressed_length: u24(compressed_len),
            sequence_id,
            uncompressed_length: u24(uncompressed_len),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(bytes)
            .map_err(|e| Error::Protocol(format!("CompressedHeader: {e:?}")))
    }

    pub fn compressed_len(&self) -> usize {
        from_u24(self.compressed_length)
    }

    pub fn uncompressed_len(&self) -> usize {
        from_u24(self.uncompressed_length)
    }
}

/// Wrap already-framed packet bytes into compressed frames appended to `out`.
pub fn write_frames(out: &mut Vec<u8>, data: &[u8], seq: &mut Sequence) -> Result<()> {
    for chunk in data.chunks(MAX_PACKET_PAYLOAD) {
        write_frame(out, chunk, seq)?;
    }
    Ok(())
}

fn write_frame(out: &mut Vec<u8>, chunk: &[u8], seq: &mut Sequence) -> Result<()> {
    if chunk.len() >= MIN_COMPRESS_LENGTH {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(chunk.len()), Compression::default());
        encoder.write_all(chunk)?;
        let compressed = encoder.finish()?;
        if compressed.len() < chunk.len() {
            out.extend_from_slice(
                CompressedHeader::new(compressed.len(), seq.advance(), chunk.len()).as_bytes(),
            );
            out.extend_from_slice(&compressed);
            return Ok(());
        }
    }
    out.extend_from_slice(CompressedHeader::new(chunk.len(), seq.advance(), 0).as_bytes());
    out.extend_from_slice(chunk);
    Ok(())
}

/// Append the decoded body of one frame to `out`.
pub fn decode_frame(header: &CompressedHeader, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let expected = header.uncompressed_len();
    if expected == 0 {
        out.extend_from_slice(body);
        return Ok(());
    }

    let start = out.len();
    out.reserve(expected);
    ZlibDecoder::new(body)
        .read_to_end(out)
        .map_err(|e| Error::Protocol(format!("zlib decompression failed: {e}")))?;
    if out.len() - start != expected {
        return Err(Error::Protocol(format!(
            "compressed frame inflated to {} bytes, header says {}",
            out.len() - start,
            expected
        )));
    }
    Ok(())
}

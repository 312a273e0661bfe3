//! Packet I/O over a [`Stream`]: framing, sequence checks, optional
//! compression and the max_allowed_packet guard.

use crate::buffer_pool::{GLOBAL_BUFFER_POOL, PooledBufferSet};
use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::compress::{CompressedHeader, decode_frame, write_frames};
use crate::protocol::packet::{Sequence, read_packets, write_packets};

use super::stream::{SocketKiller, Stream};

/// Sequence counters right after a command was written. The response to
/// that command continues from here, even when other commands were written
/// in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMark {
    seq: Sequence,
    compress_seq: Sequence,
}

/// One connection's packet channel.
#[derive(Debug)]
pub struct Channel {
    stream: Stream,
    buffers: PooledBufferSet,
    seq: Sequence,
    compress_seq: Sequence,
    compress: bool,
}

impl Channel {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buffers: GLOBAL_BUFFER_POOL.checkout(),
            seq: Sequence::default(),
            compress_seq: Sequence::default(),
            compress: false,
        }
    }

    pub fn buffers(&mut self) -> &mut BufferSet {
        &mut self.buffers
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Wrap every following packet in compressed frames.
    pub fn enable_compression(&mut self) {
        self.compress = true;
    }

    /// Start a new command: both sequence counters restart at 0.
    pub fn reset_sequence(&mut self) {
        self.seq.reset();
        self.compress_seq.reset();
    }

    pub fn mark(&self) -> SequenceMark {
        SequenceMark {
            seq: self.seq,
            compress_seq: self.compress_seq,
        }
    }

    /// Continue reading the response of the command that produced `mark`.
    pub fn restore(&mut self, mark: SequenceMark) {
        self.seq = mark.seq;
        self.compress_seq = mark.compress_seq;
    }

    /// Send `buffers.write_buffer` as one logical packet.
    pub fn write_packet(&mut self, max_allowed: Option<usize>) -> Result<()> {
        let Self {
            stream,
            buffers,
            seq,
            compress_seq,
            compress,
        } = self;
        let buffers: &mut BufferSet = buffers;
        let mut compress_seq = compress.then_some(compress_seq);

        buffers.packet_buffer.clear();
        write_packets(
            &mut buffers.packet_buffer,
            &buffers.write_buffer,
            seq,
            max_allowed,
            |pending| flush_pending(stream, pending, compress_seq.as_deref_mut()),
        )?;
        flush_pending(stream, &mut buffers.packet_buffer, compress_seq.as_deref_mut())?;
        stream.flush()?;
        Ok(())
    }

    /// Read one logical packet into `buffers.read_buffer`.
    pub fn read_packet(&mut self) -> Result<()> {
        let Self {
            stream,
            buffers,
            seq,
            compress_seq,
            compress,
        } = self;
        let BufferSet {
            read_buffer,
            inflated,
            inflated_pos,
            ..
        } = &mut **buffers;

        if *compress {
            read_packets(read_buffer, seq, |buf| {
                read_inflated(stream, compress_seq, inflated, inflated_pos, buf)
            })
        } else {
            read_packets(read_buffer, seq, |buf| stream.read_exact(buf))
        }
    }

    /// Run the TLS handshake on the underlying socket.
    pub fn upgrade_to_tls(&mut self, opts: &Opts) -> Result<()> {
        let stream = std::mem::replace(&mut self.stream, Stream::Closed);
        self.stream = stream.upgrade_to_tls(opts)?;
        Ok(())
    }

    pub fn set_timeouts(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.stream.set_timeouts(timeout)
    }

    pub fn killer(&self) -> Option<SocketKiller> {
        self.stream.killer()
    }

    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

fn flush_pending(
    stream: &mut Stream,
    pending: &mut Vec<u8>,
    compress_seq: Option<&mut Sequence>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    match compress_seq {
        Some(seq) => {
            let mut frames = Vec::with_capacity(pending.len() + CompressedHeader::SIZE);
            write_frames(&mut frames, pending, seq)?;
            stream.write_all(&frames)?;
        }
        None => stream.write_all(pending)?,
    }
    pending.clear();
    Ok(())
}

/// Fill `buf` from decompressed frames, reading new frames as needed.
fn read_inflated(
    stream: &mut Stream,
    seq: &mut Sequence,
    inflated: &mut Vec<u8>,
    pos: &mut usize,
    buf: &mut [u8],
) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if *pos == inflated.len() {
            inflated.clear();
            *pos = 0;
            read_frame(stream, seq, inflated).map_err(into_io)?;
            continue;
        }
        let n = (inflated.len() - *pos).min(buf.len() - filled);
        buf[filled..filled + n].copy_from_slice(&inflated[*pos..*pos + n]);
        *pos += n;
        filled += n;
    }
    Ok(())
}

fn read_frame(stream: &mut Stream, seq: &mut Sequence, out: &mut Vec<u8>) -> Result<()> {
    let mut header_bytes = [0_u8; CompressedHeader::SIZE];
    stream.read_exact(&mut header_bytes)?;
    let header = *CompressedHeader::parse(&header_bytes)?;
    seq.check(header.sequence_id)?;
    let mut body = vec![0_u8; header.compressed_len()];
    stream.read_exact(&mut body)?;
    decode_frame(&header, &body, out)
}

fn into_io(error: Error) -> std::io::Error {
    match error {
        Error::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Channel, Channel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Channel::new(Stream::tcp(client)),
            Channel::new(Stream::tcp(server)),
        )
    }

    #[test]
    fn plain_round_trip() {
        let (mut client, mut server) = pair();
        client.buffers().write_buffer = b"\x03SELECT 1".to_vec();
        client.write_packet(None).unwrap();
        server.read_packet().unwrap();
        assert_eq!(server.buffers().read_buffer, b"\x03SELECT 1");
    }

    #[test]
    fn compressed_round_trip() {
        let (mut client, mut server) = pair();
        client.enable_compression();
        server.enable_compression();

        let big: Vec<u8> = (0..10_000_u32).map(|i| (i % 7) as u8).collect();
        client.buffers().write_buffer = big.clone();
        client.write_packet(None).unwrap();
        client.buffers().write_buffer = b"small".to_vec();
        client.write_packet(None).unwrap();

        server.read_packet().unwrap();
        assert_eq!(server.buffers().read_buffer, big);
        server.read_packet().unwrap();
        assert_eq!(server.buffers().read_buffer, b"small");
    }

    #[test]
    fn out_of_order_sequence() {
        let (mut client, mut server) = pair();
        client.buffers().write_buffer = b"a".to_vec();
        client.write_packet(None).unwrap();
        server.read_packet().unwrap();

        // the server expects sequence 1 next; a fresh command starts at 0
        client.reset_sequence();
        client.write_packet(None).unwrap();
        assert!(matches!(server.read_packet(), Err(Error::Protocol(_))));
    }

    #[test]
    fn pipelined_responses_resume_from_their_mark() {
        let (mut client, mut server) = pair();
        client.reset_sequence();
        client.buffers().write_buffer = b"\x03SELECT 1".to_vec();
        client.write_packet(None).unwrap();
        let first = client.mark();
        client.reset_sequence();
        client.buffers().write_buffer = b"\x03SELECT 2".to_vec();
        client.write_packet(None).unwrap();

        for _ in 0..2 {
            server.reset_sequence();
            server.read_packet().unwrap();
            server.buffers().write_buffer = b"\x00\x00\x00\x02\x00\x00\x00".to_vec();
            server.write_packet(None).unwrap();
        }

        client.restore(first);
        client.read_packet().unwrap();
        client.restore(first);
        client.read_packet().unwrap();
        assert_eq!(client.buffers().read_buffer[0], 0x00);
    }

    #[test]
    fn too_large_before_send_is_recoverable() {
        let (mut client, _server) = pair();
        client.buffers().write_buffer = vec![0; 100];
        match client.write_packet(Some(50)) {
            Err(Error::PacketTooLarge { must_reconnect, .. }) => assert!(!must_reconnect),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!client.is_closed());
    }
}

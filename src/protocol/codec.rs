//! Wire protocol encoding and decoding primitives.
//!
//! All fixed-width integers are little-endian. Variable-length values use the
//! length-encoded integer format (`0xfb` = NULL, `0xfc`/`0xfd`/`0xfe` prefixes).

use zerocopy::FromBytes;
use zerocopy::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

use crate::error::{Error, Result};

/// Marker byte for a NULL length-encoded value.
pub const LENENC_NULL: u8 = 0xfb;

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((first, rest)) => Ok((*first, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte little-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "read_u16: buffer too short: {} < 2",
            data.len()
        )));
    }
    let value = U16LE::ref_from_bytes(&data[..2])
        .map_err(|e| Error::Protocol(format!("read_u16: {e:?}")))?
        .get();
    Ok((value, &data[2..]))
}

/// Read 3-byte little-endian unsigned integer.
#[inline]
pub fn read_u24(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 3 {
        return Err(Error::Protocol(format!(
            "read_u24: buffer too short: {} < 3",
            data.len()
        )));
    }
    let value = u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16);
    Ok((value, &data[3..]))
}

/// Read 4-byte little-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "read_u32: buffer too short: {} < 4",
            data.len()
        )));
    }
    let value = U32LE::ref_from_bytes(&data[..4])
        .map_err(|e| Error::Protocol(format!("read_u32: {e:?}")))?
        .get();
    Ok((value, &data[4..]))
}

/// Read 8-byte little-endian unsigned integer.
#[inline]
pub fn read_u64(data: &[u8]) -> Result<(u64, &[u8])> {
    if data.len() < 8 {
        return Err(Error::Protocol(format!(
            "read_u64: buffer too short: {} < 8",
            data.len()
        )));
    }
    let value = U64LE::ref_from_bytes(&data[..8])
        .map_err(|e| Error::Protocol(format!("read_u64: {e:?}")))?
        .get();
    Ok((value, &data[8..]))
}

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        )));
    }
    Ok((&data[..len], &data[len..]))
}

/// Read a length-encoded integer. `None` is the NULL marker.
pub fn read_lenenc_int(data: &[u8]) -> Result<(Option<u64>, &[u8])> {
    let (first, rest) = read_u8(data)?;
    match first {
        LENENC_NULL => Ok((None, rest)),
        0xfc => {
            let (v, rest) = read_u16(rest)?;
            Ok((Some(u64::from(v)), rest))
        }
        0xfd => {
            let (v, rest) = read_u24(rest)?;
            Ok((Some(u64::from(v)), rest))
        }
        0xfe => {
            let (v, rest) = read_u64(rest)?;
            Ok((Some(v), rest))
        }
        0xff => Err(Error::Protocol(
            "read_lenenc_int: 0xff is not a valid prefix".into(),
        )),
        v => Ok((Some(u64::from(v)), rest)),
    }
}

/// Read a length-encoded integer that must not be NULL.
pub fn read_lenenc_u64(data: &[u8]) -> Result<(u64, &[u8])> {
    match read_lenenc_int(data)? {
        (Some(v), rest) => Ok((v, rest)),
        (None, _) => Err(Error::Protocol("read_lenenc_u64: unexpected NULL".into())),
    }
}

/// Read a length-encoded byte string. `None` is SQL NULL.
pub fn read_lenenc_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    match read_lenenc_int(data)? {
        (None, rest) => Ok((None, rest)),
        (Some(len), rest) => {
            let len = usize::try_from(len)
                .map_err(|_| Error::Protocol(format!("length-encoded string too long: {len}")))?;
            let (bytes, rest) = read_bytes(rest, len)?;
            Ok((Some(bytes), rest))
        }
    }
}

/// Read a length-encoded string as `&str` (NULL reads as empty).
pub fn read_lenenc_str(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_lenenc_bytes(data)?;
    let s = simdutf8::compat::from_utf8(bytes.unwrap_or_default())
        .map_err(|e| Error::Protocol(format!("read_lenenc_str: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Read null-terminated string.
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Write 1-byte unsigned integer.
#[inline]
pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian unsigned integer.
#[inline]
pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 3-byte little-endian unsigned integer.
#[inline]
pub fn write_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write 4-byte little-endian unsigned integer.
#[inline]
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 8-byte little-endian unsigned integer.
#[inline]
pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write raw bytes.
#[inline]
pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
}

/// Write null-terminated string.
#[inline]
pub fn write_cstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

/// Write null-terminated string from &str.
#[inline]
pub fn write_cstr(out: &mut Vec<u8>, s: &str) {
    write_cstring(out, s.as_bytes());
}

/// Write a length-encoded integer.
pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    if value < 0xfb {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfc);
        write_u16(out, value as u16);
    } else if value <= 0xff_ffff {
        out.push(0xfd);
        write_u24(out, value as u32);
    } else {
        out.push(0xfe);
        write_u64(out, value);
    }
}

/// Write a length-encoded byte string.
pub fn write_lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_lenenc_int(out, data.len() as u64);
    out.extend_from_slice(data);
}

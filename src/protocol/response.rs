//! Server response packets: OK, ERR, EOF, column definitions, rows and
//! prepare results.

use zerocopy::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::constant::{CapabilityFlags, ColumnType, MAX_PACKET_PAYLOAD, StatusFlags};
use crate::error::{Error, Result, ServerError};
use crate::protocol::codec::{
    read_bytes, read_lenenc_bytes, read_lenenc_str, read_lenenc_u64, read_u8, read_u16,
};

/// First payload byte of server responses.
pub mod header {
    pub const OK: u8 = 0x00;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const LOCAL_INFILE: u8 = 0xfb;
    pub const EOF: u8 = 0xfe;
    pub const ERR: u8 = 0xff;
}

/// OK packet (also used as the result-set terminator with CLIENT_DEPRECATE_EOF).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::OK && head != header::EOF {
            return Err(Error::Protocol(format!(
                "OkPacket: unexpected header 0x{head:02x}"
            )));
        }
        let (affected_rows, data) = read_lenenc_u64(data)?;
        let (last_insert_id, data) = read_lenenc_u64(data)?;
        let (status, data) = read_u16(data)?;
        let (warnings, data) = read_u16(data)?;
        let info = match read_lenenc_str(data) {
            Ok((info, _)) => info.to_owned(),
            Err(_) => String::from_utf8_lossy(data).into_owned(),
        };
        Ok(Self {
            affected_rows,
            last_insert_id,
            status: StatusFlags::new(status),
            warnings,
            info,
        })
    }
}

/// Classic EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: StatusFlags,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::EOF {
            return Err(Error::Protocol(format!(
                "EofPacket: unexpected header 0x{head:02x}"
            )));
        }
        let (warnings, data) = read_u16(data)?;
        let (status, _) = read_u16(data)?;
        Ok(Self {
            warnings,
            status: StatusFlags::new(status),
        })
    }
}

/// Whether `payload` terminates a result set (EOF, or OK-as-EOF when
/// CLIENT_DEPRECATE_EOF is negotiated). Rows may also start with 0xfe, so
/// the length disambiguates.
pub fn is_result_end(payload: &[u8], deprecate_eof: bool) -> bool {
    payload.first() == Some(&header::EOF)
        && if deprecate_eof {
            payload.len() < MAX_PACKET_PAYLOAD
        } else {
            payload.len() < 9
        }
}

/// Parse an ERR packet.
pub fn parse_error(payload: &[u8]) -> Result<ServerError> {
    let (head, data) = read_u8(payload)?;
    if head != header::ERR {
        return Err(Error::Protocol(format!(
            "ErrPacket: unexpected header 0x{head:02x}"
        )));
    }
    let (code, data) = read_u16(data)?;
    let (sql_state, message) = match data.split_first() {
        Some((b'#', rest)) if rest.len() >= 5 => {
            (String::from_utf8_lossy(&rest[..5]).into_owned(), &rest[5..])
        }
        _ => ("HY000".to_owned(), data),
    };
    Ok(ServerError {
        code,
        sql_state,
        message: String::from_utf8_lossy(message).into_owned(),
    })
}

/// Column definition (Protocol::ColumnDefinition41).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (_catalog, data) = read_lenenc_str(payload)?;
        let (schema, data) = read_lenenc_str(data)?;
        let (table, data) = read_lenenc_str(data)?;
        let (org_table, data) = read_lenenc_str(data)?;
        let (name, data) = read_lenenc_str(data)?;
        let (org_name, data) = read_lenenc_str(data)?;
        // length of fixed fields, always 0x0c
        let (_fixed_len, data) = read_lenenc_u64(data)?;
        let (fixed, _) = read_bytes(data, 10)?;
        Ok(Self {
            schema: schema.to_owned(),
            table: table.to_owned(),
            org_table: org_table.to_owned(),
            name: name.to_owned(),
            org_name: org_name.to_owned(),
            charset: u16::from_le_bytes([fixed[0], fixed[1]]),
            column_length: u32::from_le_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]),
            column_type: fixed[6],
            flags: u16::from_le_bytes([fixed[7], fixed[8]]),
            decimals: fixed[9],
        })
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        ColumnType::from_u8(self.column_type)
    }
}

/// COM_STMT_PREPARE OK body (after the 0x00 status byte).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct PrepareOk {
    pub statement_id: U32LE,
    pub num_columns: U16LE,
    pub num_params: U16LE,
    pub reserved: u8,
    pub warnings: U16LE,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::OK {
            return Err(Error::Protocol(format!(
                "PrepareOk: unexpected header 0x{head:02x}"
            )));
        }
        let body = data
            .get(..size_of::<Self>())
            .ok_or_else(|| Error::Protocol(format!("PrepareOk: short packet ({} bytes)", payload.len())))?;
        Self::ref_from_bytes(body).map_err(|e| Error::Protocol(format!("PrepareOk: {e:?}")))
    }
}

/// Most columns a result set may carry. Column counts in COM_STMT_PREPARE
/// responses are two bytes wide.
pub const MAX_COLUMN_COUNT: u64 = u16::MAX as u64;

/// Decode the column count packet of a result set.
pub fn parse_column_count(payload: &[u8]) -> Result<usize> {
    let (count, _) = read_lenenc_u64(payload)?;
    if count > MAX_COLUMN_COUNT {
        return Err(Error::Protocol(format!("column count too large: {count}")));
    }
    usize::try_from(count).map_err(|_| Error::Protocol(format!("column count too large: {count}")))
}

/// A raw row, text or binary encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub data: Vec<u8>,
    pub binary: bool,
}

impl Row {
    /// Split the row into cells, `None` for SQL NULL.
    pub fn cells<'a>(&'a self, columns: &[ColumnDefinition]) -> Result<Vec<Option<&'a [u8]>>> {
        if self.binary {
            binary_cells(&self.data, columns)
        } else {
            text_cells(&self.data, columns.len())
        }
    }
}

fn text_cells(mut data: &[u8], count: usize) -> Result<Vec<Option<&[u8]>>> {
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let (cell, rest) = read_lenenc_bytes(data)?;
        cells.push(cell);
        data = rest;
    }
    Ok(cells)
}

fn binary_cells<'a>(data: &'a [u8], columns: &[ColumnDefinition]) -> Result<Vec<Option<&'a [u8]>>> {
    let (head, data) = read_u8(data)?;
    if head != header::OK {
        return Err(Error::Protocol(format!(
            "binary row: unexpected header 0x{head:02x}"
        )));
    }
    // null bitmap has a 2-bit offset in result rows
    let (bitmap, mut data) = read_bytes(data, (columns.len() + 7 + 2) / 8)?;
    let mut cells = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            cells.push(None);
            continue;
        }
        let (cell, rest) = match binary_width(column.column_type) {
            BinaryWidth::Fixed(n) => read_bytes(data, n)?,
            BinaryWidth::LengthPrefixed => {
                let (len, rest) = read_u8(data)?;
                read_bytes(rest, usize::from(len))?
            }
            BinaryWidth::LengthEncoded => {
                let (cell, rest) = read_lenenc_bytes(data)?;
                (cell.unwrap_or_default(), rest)
            }
        };
        cells.push(Some(cell));
        data = rest;
    }
    Ok(cells)
}

enum BinaryWidth {
    Fixed(usize),
    LengthPrefixed,
    LengthEncoded,
}

fn binary_width(column_type: u8) -> BinaryWidth {
    use ColumnType::*;
    match ColumnType::from_u8(column_type) {
        Some(MYSQL_TYPE_TINY) => BinaryWidth::Fixed(1),
        Some(MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR) => BinaryWidth::Fixed(2),
        Some(MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 | MYSQL_TYPE_FLOAT) => BinaryWidth::Fixed(4),
        Some(MYSQL_TYPE_LONGLONG | MYSQL_TYPE_DOUBLE) => BinaryWidth::Fixed(8),
        Some(MYSQL_TYPE_NULL) => BinaryWidth::Fixed(0),
        Some(
            MYSQL_TYPE_DATE | MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIME,
        ) => BinaryWidth::LengthPrefixed,
        _ => BinaryWidth::LengthEncoded,
    }
}

/// Whether the negotiated capabilities use OK packets instead of EOF.
pub fn deprecate_eof(capabilities: CapabilityFlags) -> bool {
    capabilities.has(CapabilityFlags::CLIENT_DEPRECATE_EOF)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::codec::{write_lenenc_bytes, write_lenenc_int};

    /// Column definition payload for table `db.t`.
    pub(crate) fn column(name: &str, column_type: ColumnType) -> Vec<u8> {
        let mut out = Vec::new();
        for s in ["def", "db", "t", "t", name, name] {
            write_lenenc_bytes(&mut out, s.as_bytes());
        }
        write_lenenc_int(&mut out, 0x0c);
        out.extend_from_slice(&45_u16.to_le_bytes());
        out.extend_from_slice(&11_u32.to_le_bytes());
        out.push(column_type as u8);
        out.extend_from_slice(&0_u16.to_le_bytes());
        out.push(0);
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn ok_packet() {
        let ok = OkPacket::parse(&[0x00, 0x03, 0xfc, 0x00, 0x01, 0x02, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 256);
        assert!(ok.status.autocommit());
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn error_packet() {
        let mut payload = vec![0xff, 0x26, 0x04, b'#'];
        payload.extend_from_slice(b"23000Duplicate entry '1' for key 'PRIMARY'");
        let err = parse_error(&payload).unwrap();
        assert_eq!(err.code, 1062);
        assert_eq!(err.sql_state, "23000");
        assert_eq!(err.message, "Duplicate entry '1' for key 'PRIMARY'");

        let err = parse_error(&[0xff, 0x15, 0x04, b'n', b'o']).unwrap();
        assert_eq!(err.sql_state, "HY000");
        assert_eq!(err.message, "no");
    }

    #[test]
    fn column_count_is_bounded() {
        assert_eq!(parse_column_count(&[0x03]).unwrap(), 3);
        assert_eq!(parse_column_count(&[0xfc, 0xff, 0xff]).unwrap(), 65535);
        assert!(matches!(
            parse_column_count(&[0xfd, 0x00, 0x00, 0x01]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            parse_column_count(&[0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn result_end_detection() {
        assert!(is_result_end(&[0xfe, 0, 0, 2, 0], false));
        assert!(!is_result_end(&[0xfe, 1, 2, 3, 4, 5, 6, 7, 8, 9], false));
        assert!(is_result_end(&[0xfe, 0, 0, 2, 0, 0, 0, 0, 0, 0], true));
        assert!(!is_result_end(&[0x01, b'a'], true));
    }

    #[test]
    fn column_definition() {
        let col = ColumnDefinition::parse(&column("id", ColumnType::MYSQL_TYPE_LONG)).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.schema, "db");
        assert_eq!(col.charset, 45);
        assert_eq!(col.column_type(), Some(ColumnType::MYSQL_TYPE_LONG));
    }

    #[test]
    fn prepare_ok() {
        let payload = [0x00, 7, 0, 0, 0, 2, 0, 3, 0, 0, 0, 0];
        let ok = PrepareOk::parse(&payload).unwrap();
        assert_eq!(ok.statement_id.get(), 7);
        assert_eq!(ok.num_columns.get(), 2);
        assert_eq!(ok.num_params.get(), 3);
        assert!(PrepareOk::parse(&payload[..6]).is_err());
    }

    #[test]
    fn row_cells() {
        let columns = vec![
            ColumnDefinition::parse(&column("a", ColumnType::MYSQL_TYPE_LONG)).unwrap(),
            ColumnDefinition::parse(&column("b", ColumnType::MYSQL_TYPE_VAR_STRING)).unwrap(),
        ];

        let text = Row {
            data: vec![1, b'5', 0xfb],
            binary: false,
        };
        assert_eq!(text.cells(&columns).unwrap(), vec![Some(&b"5"[..]), None]);

        // bitmap: column 1 (bit 3) is NULL
        let binary = Row {
            data: vec![0x00, 0b0000_1000, 5, 0, 0, 0],
            binary: true,
        };
        assert_eq!(
            binary.cells(&columns).unwrap(),
            vec![Some(&[5_u8, 0, 0, 0][..]), None]
        );
    }
}

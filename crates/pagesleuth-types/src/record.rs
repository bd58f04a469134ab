//! Record decoding.
//!
//! A record is a varint header size, a run of serial-type varints, and a
//! data area. The decoder here is deliberately tolerant: it is routinely
//! handed the *local prefix* of a payload whose tail lives on overflow
//! pages, so running out of data mid-column is an expected outcome (flagged
//! via [`DecodedRecord::complete`]), not an error. Only a header that
//! cannot be believed at all stops the decode.

use std::fmt;

use crate::serial_type::{
    SerialTypeClass, classify_serial_type, read_varint, serial_type_len,
};
use crate::value::ColumnValue;

/// Upper bound on a plausible record header. Anything larger is treated as
/// a misread varint or corruption.
pub const MAX_RECORD_HEADER_SIZE: usize = 10_000;

/// A decoded record: the serial-type schema plus the values that could be
/// recovered from the available bytes.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DecodedRecord {
    /// Header size in bytes, including the header-size varint itself.
    pub header_size: usize,
    /// One serial type per column, in declaration order.
    pub serial_types: Vec<u64>,
    /// Decoded values; may be shorter than `serial_types` when the data
    /// area was truncated.
    pub values: Vec<ColumnValue>,
    /// False when the data ran out before every column decoded.
    pub complete: bool,
}

/// Errors that stop a record decode outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The header-size varint or a serial-type varint was cut off.
    TruncatedHeaderVarint { offset: usize },
    /// The declared header size exceeds the record itself.
    HeaderOverrunsRecord {
        header_size: usize,
        record_size: usize,
    },
    /// The declared header size exceeds any plausible schema.
    HeaderTooLarge { header_size: usize },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeaderVarint { offset } => {
                write!(f, "truncated varint in record header at offset {offset}")
            }
            Self::HeaderOverrunsRecord {
                header_size,
                record_size,
            } => write!(
                f,
                "record header size {header_size} exceeds record size {record_size}"
            ),
            Self::HeaderTooLarge { header_size } => write!(
                f,
                "record header size {header_size} exceeds limit {MAX_RECORD_HEADER_SIZE}"
            ),
        }
    }
}

impl std::error::Error for RecordError {}

/// Decode a record from `data` (header + as much of the data area as is
/// available).
#[allow(clippy::cast_possible_truncation)]
pub fn decode_record(data: &[u8]) -> Result<DecodedRecord, RecordError> {
    let (header_size_raw, hdr_varint_len) =
        read_varint(data).ok_or(RecordError::TruncatedHeaderVarint { offset: 0 })?;
    let header_size = usize::try_from(header_size_raw)
        .map_err(|_| RecordError::HeaderTooLarge {
            header_size: usize::MAX,
        })?;

    if header_size > MAX_RECORD_HEADER_SIZE {
        return Err(RecordError::HeaderTooLarge { header_size });
    }
    if header_size > data.len() || header_size < hdr_varint_len {
        return Err(RecordError::HeaderOverrunsRecord {
            header_size,
            record_size: data.len(),
        });
    }

    // Walk the serial-type varints filling out the column schema.
    let mut serial_types = Vec::new();
    let mut offset = hdr_varint_len;
    while offset < header_size {
        let (serial_type, consumed) = read_varint(&data[offset..header_size])
            .ok_or(RecordError::TruncatedHeaderVarint { offset })?;
        serial_types.push(serial_type);
        offset += consumed;
    }

    // Decode the data area column by column until it runs dry.
    let mut values = Vec::with_capacity(serial_types.len());
    let mut complete = true;
    let mut body_offset = header_size;
    for &st in &serial_types {
        let Some(value_len) = serial_type_len(st) else {
            // Reserved serial type: the data area can no longer be paced.
            complete = false;
            break;
        };
        let value_len = value_len as usize;
        if body_offset + value_len > data.len() {
            complete = false;
            break;
        }
        values.push(decode_value(st, &data[body_offset..body_offset + value_len]));
        body_offset += value_len;
    }

    Ok(DecodedRecord {
        header_size,
        serial_types,
        values,
        complete,
    })
}

/// Decode one value from its serial type and exactly-sized byte slice.
fn decode_value(serial_type: u64, bytes: &[u8]) -> ColumnValue {
    match classify_serial_type(serial_type) {
        SerialTypeClass::Null | SerialTypeClass::Reserved => ColumnValue::Null,
        SerialTypeClass::Zero => ColumnValue::Integer(0),
        SerialTypeClass::One => ColumnValue::Integer(1),
        SerialTypeClass::Integer => ColumnValue::Integer(decode_big_endian_signed(bytes)),
        SerialTypeClass::Float => {
            let bits = bytes
                .try_into()
                .map(u64::from_be_bytes)
                .unwrap_or_default();
            ColumnValue::Float(f64::from_bits(bits))
        }
        SerialTypeClass::Text => {
            ColumnValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        SerialTypeClass::Blob => ColumnValue::Blob(bytes.to_vec()),
    }
}

/// Decode a big-endian signed integer of 1-8 bytes, sign-extending from the
/// leading byte.
#[allow(clippy::cast_possible_wrap)]
fn decode_big_endian_signed(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut value: u64 = if negative { u64::MAX } else { 0 };
    for &b in bytes {
        value = (value << 8) | u64::from(b);
    }
    value as i64
}

//! Row payload codec.
//!
//! A record is a header followed by a body. The header starts with its own
//! length as a varint, then holds one serial type per column; the body
//! holds the column contents back to back.
//!
//! | Serial type | Body bytes | Meaning                  |
//! |-------------|------------|--------------------------|
//! | 0           | 0          | NULL                     |
//! | 1..=4       | 1..=4      | big-endian signed int    |
//! | 5           | 6          | 48-bit signed int        |
//! | 6           | 8          | 64-bit signed int        |
//! | 7           | 8          | IEEE 754 double          |
//! | 8, 9        | 0          | constants 0 and 1        |
//! | 10, 11      | -          | reserved                 |
//! | even >= 12  | (N-12)/2   | blob                     |
//! | odd >= 13   | (N-13)/2   | text                     |

use qvm_error::{Result, VdbeError};

use crate::value::Value;

/// Largest varint is 9 bytes.
pub const MAX_VARINT_LEN: usize = 9;

/// Decode a varint, returning `(value, bytes_consumed)`.
///
/// The first eight bytes carry seven bits each with a continuation flag;
/// a ninth byte, if reached, carries a full eight bits.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(8) {
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let last = *buf.get(8)?;
    Some(((value << 8) | u64::from(last), 9))
}

/// Number of bytes [`write_varint`] emits for `value`.
pub const fn varint_len(value: u64) -> usize {
    if value > 0x00ff_ffff_ffff_ffff {
        return 9;
    }
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Append `value` as a varint.
#[allow(clippy::cast_possible_truncation)]
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value > 0x00ff_ffff_ffff_ffff {
        let high = value >> 8;
        for shift in (0..8).rev() {
            out.push(((high >> (shift * 7)) as u8 & 0x7f) | 0x80);
        }
        out.push(value as u8);
        return;
    }
    let len = varint_len(value);
    for i in (0..len).rev() {
        let group = (value >> (i * 7)) as u8 & 0x7f;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
}

/// Body length of a serial type; `None` for the reserved types.
pub const fn serial_type_len(serial_type: u64) -> Option<u64> {
    match serial_type {
        0 | 8 | 9 => Some(0),
        1..=4 => Some(serial_type),
        5 => Some(6),
        6 | 7 => Some(8),
        10 | 11 => None,
        n if n % 2 == 0 => Some((n - 12) / 2),
        n => Some((n - 13) / 2),
    }
}

/// Smallest serial type holding `value`.
#[allow(clippy::cast_sign_loss)]
pub const fn serial_type_for_integer(value: i64) -> u64 {
    if value == 0 {
        return 8;
    }
    if value == 1 {
        return 9;
    }
    // Magnitude in the same bit-space as the two's-complement value.
    let u = if value < 0 { !(value as u64) } else { value as u64 };
    if u <= 0x7f {
        1
    } else if u <= 0x7fff {
        2
    } else if u <= 0x7f_ffff {
        3
    } else if u <= 0x7fff_ffff {
        4
    } else if u <= 0x7fff_ffff_ffff {
        5
    } else {
        6
    }
}

/// Serial type describing `value`. NaN is stored as NULL.
#[allow(clippy::cast_possible_truncation)]
pub fn serial_type_for_value(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Integer(i) => serial_type_for_integer(*i),
        Value::Real(f) if f.is_nan() => 0,
        Value::Real(_) => 7,
        Value::Text(s) => s.len() as u64 * 2 + 13,
        Value::Blob(b) => b.len() as u64 * 2 + 12,
    }
}

/// Encode values as a record.
#[allow(clippy::cast_possible_truncation)]
pub fn serialize_record(values: &[Value]) -> Vec<u8> {
    let types: Vec<u64> = values.iter().map(serial_type_for_value).collect();
    let types_len: usize = types.iter().map(|&t| varint_len(t)).sum();

    // The header length counts its own varint, which may grow the header.
    let mut header_len = types_len + 1;
    while varint_len(header_len as u64) + types_len > header_len {
        header_len = varint_len(header_len as u64) + types_len;
    }

    let body_len: u64 = types.iter().filter_map(|&t| serial_type_len(t)).sum();
    let mut out = Vec::with_capacity(header_len + body_len as usize);
    write_varint(&mut out, header_len as u64);
    for &t in &types {
        write_varint(&mut out, t);
    }
    for (value, &t) in values.iter().zip(&types) {
        encode_body(value, t, &mut out);
    }
    out
}

fn encode_body(value: &Value, serial_type: u64, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            if let Some(len) = serial_type_len(serial_type) {
                #[allow(clippy::cast_possible_truncation)]
                let len = len as usize;
                out.extend_from_slice(&i.to_be_bytes()[8 - len..]);
            }
        }
        Value::Real(f) if serial_type == 7 => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        Value::Blob(b) => out.extend_from_slice(b),
        Value::Null | Value::Real(_) => {}
    }
}

/// Decode a complete record.
pub fn parse_record(buf: &[u8]) -> Result<Vec<Value>> {
    let header = RecordHeader::parse(buf)?;
    (0..header.len()).map(|i| header.column(buf, i)).collect()
}

/// Decode only column `idx` of a record; `None` if the record is shorter.
pub fn record_column(buf: &[u8], idx: usize) -> Result<Option<Value>> {
    let header = RecordHeader::parse(buf)?;
    if idx >= header.len() {
        return Ok(None);
    }
    header.column(buf, idx).map(Some)
}

/// Parsed header: serial types with body offsets.
struct RecordHeader {
    columns: Vec<(u64, usize)>,
}

impl RecordHeader {
    #[allow(clippy::cast_possible_truncation)]
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self {
                columns: Vec::new(),
            });
        }
        let (header_len, mut pos) =
            read_varint(buf).ok_or_else(|| VdbeError::corrupt("truncated record header"))?;
        let header_len = header_len as usize;
        if header_len > buf.len() || header_len < pos {
            return Err(VdbeError::corrupt(format!(
                "record header length {header_len} exceeds payload of {} bytes",
                buf.len()
            )));
        }
        let mut columns = Vec::new();
        let mut body = header_len;
        while pos < header_len {
            let (serial_type, n) = read_varint(&buf[pos..header_len])
                .ok_or_else(|| VdbeError::corrupt("truncated serial type"))?;
            pos += n;
            let len = serial_type_len(serial_type).ok_or_else(|| {
                VdbeError::corrupt(format!("reserved serial type {serial_type}"))
            })? as usize;
            columns.push((serial_type, body));
            body += len;
        }
        if body > buf.len() {
            return Err(VdbeError::corrupt(format!(
                "record body needs {body} bytes, payload has {}",
                buf.len()
            )));
        }
        Ok(Self { columns })
    }

    fn len(&self) -> usize {
        self.columns.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn column(&self, buf: &[u8], idx: usize) -> Result<Value> {
        let (serial_type, offset) = self.columns[idx];
        let len = serial_type_len(serial_type).unwrap_or(0) as usize;
        let bytes = &buf[offset..offset + len];
        decode_body(serial_type, bytes)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn decode_body(serial_type: u64, bytes: &[u8]) -> Result<Value> {
    Ok(match serial_type {
        0 => Value::Null,
        8 => Value::Integer(0),
        9 => Value::Integer(1),
        1..=6 => {
            let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
            let mut v: u64 = if negative { u64::MAX } else { 0 };
            for &b in bytes {
                v = (v << 8) | u64::from(b);
            }
            Value::Integer(v as i64)
        }
        7 => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| VdbeError::corrupt("short real in record"))?;
            Value::from_real_result(f64::from_bits(u64::from_be_bytes(arr)))
        }
        n if n % 2 == 0 => Value::Blob(bytes.to_vec()),
        _ => Value::Text(
            std::str::from_utf8(bytes)
                .map_err(|_| VdbeError::corrupt("record text is not UTF-8"))?
                .to_owned(),
        ),
    })
}

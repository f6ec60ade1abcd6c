//! Conversions applied when a cell is read as a type other than the one it
//! holds.
//!
//! These follow the engine's documented rules (`sqlite3VdbeIntValue`,
//! `sqlite3VdbeRealValue`, `sqlite3AtoF`, `sqlite3Atoi64`) rather than
//! Rust's own parsing: text is scanned for its longest numeric prefix, never
//! rejected outright.

use std::borrow::Cow;

use crate::value::{Value, format_real};

/// A numeric view of a value, as used by arithmetic opcodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Real(f64),
}

impl Numeric {
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Real(r) => r,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Int(i) => Value::Integer(i),
            Self::Real(r) => Value::from_real_result(r),
        }
    }
}

/// Column affinity codes used by `Cast` (`'A'..='E'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    Blob,
    Text,
    Numeric,
    Integer,
    Real,
}

impl Affinity {
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'A' => Some(Self::Blob),
            b'B' => Some(Self::Text),
            b'C' => Some(Self::Numeric),
            b'D' => Some(Self::Integer),
            b'E' => Some(Self::Real),
            _ => None,
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Blob => b'A',
            Self::Text => b'B',
            Self::Numeric => b'C',
            Self::Integer => b'D',
            Self::Real => b'E',
        }
    }
}

/// Read a value as a 64-bit integer.
///
/// - NULL reads as 0.
/// - Reals truncate toward zero, saturating at the `i64` bounds; NaN is 0.
/// - Text and blobs parse their leading integer prefix (`"3.7"` is 3,
///   `"abc"` is 0), saturating on overflow.
#[allow(clippy::cast_possible_truncation)]
pub fn int_value(v: &Value) -> i64 {
    match v {
        Value::Null => 0,
        Value::Integer(i) => *i,
        Value::Real(r) => *r as i64,
        Value::Text(s) => atoi64(s.as_bytes()),
        Value::Blob(b) => atoi64(b),
    }
}

/// Read a value as a double. Text and blobs parse their leading numeric
/// prefix; anything unparseable is 0.0.
#[allow(clippy::cast_precision_loss)]
pub fn real_value(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Integer(i) => *i as f64,
        Value::Real(r) => *r,
        Value::Text(s) => scan_number(s.as_bytes()).as_f64(),
        Value::Blob(b) => scan_number(b).as_f64(),
    }
}

/// Numeric view used by arithmetic. Integer-looking text becomes an
/// integer, anything with a fraction or exponent becomes a real, and
/// non-numeric text is integer 0. NULL is reported as integer 0; callers
/// that propagate NULL must check first.
pub fn numeric_value(v: &Value) -> Numeric {
    match v {
        Value::Null => Numeric::Int(0),
        Value::Integer(i) => Numeric::Int(*i),
        Value::Real(r) => Numeric::Real(*r),
        Value::Text(s) => scan_number(s.as_bytes()),
        Value::Blob(b) => scan_number(b),
    }
}

/// Numeric affinity without forcing: numbers as they are, text only when
/// the whole string is a number. NULL, blobs and other text are `None`.
pub fn exact_numeric(v: &Value) -> Option<Numeric> {
    match v {
        Value::Integer(i) => Some(Numeric::Int(*i)),
        Value::Real(r) => Some(Numeric::Real(*r)),
        Value::Text(s) => full_number(s.as_bytes()),
        Value::Null | Value::Blob(_) => None,
    }
}

/// Text rendering of a value; NULL has none.
pub fn text_value(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::Null => None,
        Value::Integer(i) => Some(Cow::Owned(i.to_string())),
        Value::Real(r) => Some(Cow::Owned(format_real(*r))),
        Value::Text(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Blob(b) => Some(String::from_utf8_lossy(b)),
    }
}

/// Byte rendering of a value; NULL has none.
pub fn blob_value(v: &Value) -> Option<Cow<'_, [u8]>> {
    match v {
        Value::Null => None,
        Value::Blob(b) => Some(Cow::Borrowed(b.as_slice())),
        Value::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
        Value::Integer(_) | Value::Real(_) => {
            text_value(v).map(|t| Cow::Owned(t.into_owned().into_bytes()))
        }
    }
}

/// Boolean interpretation used by `If`, `IfNot`, `Not`, `And`, `Or` and
/// `IsTrue`. NULL is unknown.
pub fn truthy(v: &Value) -> Option<bool> {
    match v {
        Value::Null => None,
        Value::Integer(i) => Some(*i != 0),
        _ => Some(real_value(v) != 0.0),
    }
}

/// The value as an integer only if it represents one exactly: an integer,
/// a real with no fractional part inside `i64`, or text that is entirely a
/// number with that property.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::float_cmp)]
pub fn exact_integer(v: &Value) -> Option<i64> {
    let real_to_int = |r: f64| {
        if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&r) {
            let i = r as i64;
            (i as f64 == r).then_some(i)
        } else {
            None
        }
    };
    match v {
        Value::Integer(i) => Some(*i),
        Value::Real(r) => real_to_int(*r),
        Value::Text(s) => match full_number(s.as_bytes())? {
            Numeric::Int(i) => Some(i),
            Numeric::Real(r) => real_to_int(r),
        },
        Value::Null | Value::Blob(_) => None,
    }
}

/// Convert a value in place to the given affinity, as `Cast` does. NULL is
/// never converted.
#[must_use]
pub fn apply_affinity(v: Value, affinity: Affinity) -> Value {
    if v.is_null() {
        return v;
    }
    match affinity {
        Affinity::Blob => match v {
            Value::Blob(_) => v,
            Value::Text(s) => Value::Blob(s.into_bytes()),
            other => Value::Blob(blob_value(&other).map(Cow::into_owned).unwrap_or_default()),
        },
        Affinity::Text => match v {
            Value::Text(_) => v,
            other => Value::Text(text_value(&other).map(Cow::into_owned).unwrap_or_default()),
        },
        Affinity::Numeric => match numeric_value(&v) {
            Numeric::Int(i) => Value::Integer(i),
            Numeric::Real(r) => exact_integer(&Value::Real(r))
                .map_or_else(|| Value::from_real_result(r), Value::Integer),
        },
        Affinity::Integer => Value::Integer(int_value(&v)),
        Affinity::Real => Value::Real(real_value(&v)),
    }
}

const fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

/// Leading-integer parse: whitespace, optional sign, digits. Stops at the
/// first non-digit and saturates on overflow.
fn atoi64(bytes: &[u8]) -> i64 {
    let mut i = 0;
    while i < bytes.len() && is_space(bytes[i]) {
        i += 1;
    }
    let negative = match bytes.get(i) {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };
    let mut acc: i64 = 0;
    while let Some(&d) = bytes.get(i) {
        if !d.is_ascii_digit() {
            break;
        }
        let digit = i64::from(d - b'0');
        acc = match acc.checked_mul(10).and_then(|a| {
            if negative {
                a.checked_sub(digit)
            } else {
                a.checked_add(digit)
            }
        }) {
            Some(next) => next,
            None => return if negative { i64::MIN } else { i64::MAX },
        };
        i += 1;
    }
    acc
}

/// Result of scanning for a numeric prefix.
struct Scan<'a> {
    text: &'a str,
    is_integer: bool,
    consumed: usize,
}

/// Find the longest prefix of the form
/// `ws* [+-]? digits* ('.' digits*)? ([eE] [+-]? digits+)?`.
fn scan_prefix(bytes: &[u8]) -> Option<Scan<'_>> {
    let mut i = 0;
    while i < bytes.len() && is_space(bytes[i]) {
        i += 1;
    }
    let start = i;
    if matches!(bytes.get(i), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_digits_start = i;
    while bytes.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let mut digits = i - int_digits_start;
    let mut is_integer = true;
    if bytes.get(i) == Some(&b'.') {
        let frac_start = i + 1;
        let mut j = frac_start;
        while bytes.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if digits > 0 || j > frac_start {
            digits += j - frac_start;
            is_integer = false;
            i = j;
        }
    }
    if digits == 0 {
        return None;
    }
    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_start = j;
        while bytes.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if j > exp_start {
            is_integer = false;
            i = j;
        }
    }
    let text = std::str::from_utf8(&bytes[start..i]).ok()?;
    Some(Scan {
        text,
        is_integer,
        consumed: i,
    })
}

fn scan_to_numeric(scan: &Scan<'_>) -> Numeric {
    if scan.is_integer {
        if let Ok(i) = scan.text.parse::<i64>() {
            return Numeric::Int(i);
        }
    }
    Numeric::Real(scan.text.parse::<f64>().unwrap_or(0.0))
}

/// Numeric value of the leading prefix; non-numeric input is integer 0.
fn scan_number(bytes: &[u8]) -> Numeric {
    scan_prefix(bytes).map_or(Numeric::Int(0), |scan| scan_to_numeric(&scan))
}

/// Numeric value only when the whole input (ignoring surrounding
/// whitespace) is a number.
fn full_number(bytes: &[u8]) -> Option<Numeric> {
    let scan = scan_prefix(bytes)?;
    if bytes[scan.consumed..].iter().all(|&b| is_space(b)) {
        Some(scan_to_numeric(&scan))
    } else {
        None
    }
}

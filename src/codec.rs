//! Typed scalar encoding for the TF protocol wire format.
//!
//! Every scalar travels as fixed-width big-endian bytes. Integers without an
//! explicit width take the smallest of {1,2,4,8} bytes that covers the value;
//! text and byte strings go out raw (their length is carried by the
//! surrounding frame header). Encoding is pure and reversible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("negative value {0} requires the signed encoding")]
    NegativeUnsigned(i64),
    #[error("value {value} does not fit in {width} byte(s)")]
    ValueTooWide { value: i64, width: usize },
    #[error("integer field must be 1, 2, 4 or 8 bytes, got {0}")]
    BadWidth(usize),
    #[error("payload is not valid UTF-8")]
    BadText(#[from] std::string::FromUtf8Error),
}

/// Legal fixed widths for integer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B1,
    B2,
    B4,
    B8,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::B1 => 1,
            Width::B2 => 2,
            Width::B4 => 4,
            Width::B8 => 8,
        }
    }

    pub fn from_bytes(n: usize) -> Result<Self, CodecError> {
        match n {
            1 => Ok(Width::B1),
            2 => Ok(Width::B2),
            4 => Ok(Width::B4),
            8 => Ok(Width::B8),
            other => Err(CodecError::BadWidth(other)),
        }
    }
}

/// One encodable argument. Consumed by [`encode_value`]; call sites pick the
/// variant statically instead of relying on runtime overload resolution.
#[derive(Debug, Clone)]
pub enum Value<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
    UInt(u64),
    Int(i64),
    Bool(bool),
    /// Explicit absent marker; encodes to nothing.
    Absent,
}

fn fits_unsigned(value: u64, width: Width) -> bool {
    match width {
        Width::B1 => value <= u8::MAX as u64,
        Width::B2 => value <= u16::MAX as u64,
        Width::B4 => value <= u32::MAX as u64,
        Width::B8 => true,
    }
}

fn fits_signed(value: i64, width: Width) -> bool {
    match width {
        Width::B1 => (i8::MIN as i64..=i8::MAX as i64).contains(&value),
        Width::B2 => (i16::MIN as i64..=i16::MAX as i64).contains(&value),
        Width::B4 => (i32::MIN as i64..=i32::MAX as i64).contains(&value),
        Width::B8 => true,
    }
}

fn smallest_width(value: i64, signed: bool) -> Width {
    for w in [Width::B1, Width::B2, Width::B4, Width::B8] {
        let ok = if signed {
            fits_signed(value, w)
        } else {
            fits_unsigned(value as u64, w)
        };
        if ok {
            return w;
        }
    }
    Width::B8
}

/// Encode an integer as big-endian bytes.
///
/// A negative value is rejected unless `signed` is set; a requested width too
/// small for the value is rejected. Without a width the smallest covering
/// width is chosen.
pub fn encode_integer(
    value: i64,
    width: Option<Width>,
    signed: bool,
) -> Result<Vec<u8>, CodecError> {
    if value < 0 && !signed {
        return Err(CodecError::NegativeUnsigned(value));
    }
    let width = match width {
        Some(w) => {
            let ok = if signed {
                fits_signed(value, w)
            } else {
                fits_unsigned(value as u64, w)
            };
            if !ok {
                return Err(CodecError::ValueTooWide {
                    value,
                    width: w.bytes(),
                });
            }
            w
        }
        None => smallest_width(value, signed),
    };
    let be = value.to_be_bytes();
    Ok(be[8 - width.bytes()..].to_vec())
}

/// Decode a big-endian integer of 1..=8 bytes, sign-extending when `signed`.
pub fn decode_integer(bytes: &[u8], signed: bool) -> Result<i64, CodecError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(CodecError::BadWidth(bytes.len()));
    }
    let mut acc: u64 = 0;
    for &b in bytes {
        acc = (acc << 8) | b as u64;
    }
    if signed {
        let bits = bytes.len() * 8;
        if bits < 64 && (acc >> (bits - 1)) & 1 == 1 {
            acc |= u64::MAX << bits;
        }
    }
    Ok(acc as i64)
}

pub fn encode_text(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

pub fn decode_text(bytes: &[u8]) -> Result<String, CodecError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

/// Encode a [`Value`] using the default rules of each kind.
pub fn encode_value(value: &Value<'_>) -> Result<Vec<u8>, CodecError> {
    match value {
        Value::Text(s) => Ok(encode_text(s)),
        Value::Bytes(b) => Ok(b.to_vec()),
        Value::UInt(v) => {
            if *v > i64::MAX as u64 {
                // Top-bit u64s only fit the 8-byte signed representation.
                return Ok(v.to_be_bytes().to_vec());
            }
            encode_integer(*v as i64, None, false)
        }
        Value::Int(v) => encode_integer(*v, None, true),
        Value::Bool(b) => Ok(encode_bool(*b)),
        Value::Absent => Ok(Vec::new()),
    }
}

//! Characteristic value encoding.
//!
//! GATT characteristic values are little-endian. Integer formats occupy 1, 2
//! or 4 bytes; the IEEE-11073 float formats pack a signed mantissa and a
//! signed base-10 exponent (`SFLOAT`: 12-bit mantissa, 4-bit exponent;
//! `FLOAT`: 24-bit mantissa, 8-bit exponent).
//!
//! All encoders place the value at `offset`, leaving the leading bytes zero.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ParseError, ParseResult};

/// Integer characteristic formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntFormat {
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit.
    U16,
    /// Unsigned 32-bit.
    U32,
    /// Signed 8-bit.
    I8,
    /// Signed 16-bit.
    I16,
    /// Signed 32-bit.
    I32,
}

impl IntFormat {
    /// Encoded length in bytes.
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            IntFormat::U8 | IntFormat::I8 => 1,
            IntFormat::U16 | IntFormat::I16 => 2,
            IntFormat::U32 | IntFormat::I32 => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            IntFormat::U8 => "uint8",
            IntFormat::U16 => "uint16",
            IntFormat::U32 => "uint32",
            IntFormat::I8 => "sint8",
            IntFormat::I16 => "sint16",
            IntFormat::I32 => "sint32",
        }
    }

    fn range(self) -> (i64, i64) {
        match self {
            IntFormat::U8 => (0, u8::MAX as i64),
            IntFormat::U16 => (0, u16::MAX as i64),
            IntFormat::U32 => (0, u32::MAX as i64),
            IntFormat::I8 => (i8::MIN as i64, i8::MAX as i64),
            IntFormat::I16 => (i16::MIN as i64, i16::MAX as i64),
            IntFormat::I32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }

    fn is_signed(self) -> bool {
        matches!(self, IntFormat::I8 | IntFormat::I16 | IntFormat::I32)
    }
}

/// IEEE-11073 float formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatFormat {
    /// 16-bit: 12-bit mantissa, 4-bit exponent.
    SFloat,
    /// 32-bit: 24-bit mantissa, 8-bit exponent.
    Float,
}

impl FloatFormat {
    /// Encoded length in bytes.
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            FloatFormat::SFloat => 2,
            FloatFormat::Float => 4,
        }
    }

    fn bits(self) -> (u32, u32) {
        match self {
            FloatFormat::SFloat => (12, 4),
            FloatFormat::Float => (24, 8),
        }
    }
}

fn check_signed_bits(value: i64, bits: u32, format: &'static str) -> ParseResult<u32> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(ParseError::ValueOutOfRange { value, format });
    }
    Ok((value as u32) & ((1u32 << bits) - 1))
}

/// Encode an integer in `format` at `offset`.
///
/// ```
/// use gattkit_types::value::{encode_int, IntFormat};
///
/// let bytes = encode_int(-2, IntFormat::I16, 1).unwrap();
/// assert_eq!(&bytes[..], &[0x00, 0xFE, 0xFF]);
/// ```
pub fn encode_int(value: i64, format: IntFormat, offset: usize) -> ParseResult<Bytes> {
    let (min, max) = format.range();
    if value < min || value > max {
        return Err(ParseError::ValueOutOfRange {
            value,
            format: format.name(),
        });
    }

    let mut buf = BytesMut::with_capacity(offset + format.len());
    buf.put_bytes(0, offset);
    match format.len() {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16_le(value as u16),
        _ => buf.put_u32_le(value as u32),
    }
    Ok(buf.freeze())
}

/// Decode an integer in `format` at `offset`.
pub fn decode_int(data: &[u8], format: IntFormat, offset: usize) -> ParseResult<i64> {
    let end = offset + format.len();
    let bytes = data.get(offset..end).ok_or_else(|| {
        ParseError::InvalidData(format!(
            "{} at offset {} requires {} bytes, got {}",
            format.name(),
            offset,
            end,
            data.len()
        ))
    })?;

    let value = match (format.len(), format.is_signed()) {
        (1, false) => bytes[0] as i64,
        (1, true) => bytes[0] as i8 as i64,
        (2, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        (2, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        (_, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        (_, true) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    };
    Ok(value)
}

/// Encode a mantissa/exponent pair in `format` at `offset`.
///
/// ```
/// use gattkit_types::value::{encode_float, FloatFormat};
///
/// // 36.4 = 364 * 10^-1
/// let bytes = encode_float(364, -1, FloatFormat::SFloat, 0).unwrap();
/// assert_eq!(&bytes[..], &[0x6C, 0xF1]);
/// ```
pub fn encode_float(
    mantissa: i32,
    exponent: i32,
    format: FloatFormat,
    offset: usize,
) -> ParseResult<Bytes> {
    let (mantissa_bits, exponent_bits) = format.bits();
    let name = match format {
        FloatFormat::SFloat => "sfloat",
        FloatFormat::Float => "float",
    };
    let m = check_signed_bits(mantissa as i64, mantissa_bits, name)?;
    let e = check_signed_bits(exponent as i64, exponent_bits, name)?;

    let mut buf = BytesMut::with_capacity(offset + format.len());
    buf.put_bytes(0, offset);
    match format {
        FloatFormat::SFloat => buf.put_u16_le(((e << 12) | m) as u16),
        FloatFormat::Float => buf.put_u32_le((e << 24) | m),
    }
    Ok(buf.freeze())
}

/// Decode an IEEE-11073 float at `offset` into an `f64`.
pub fn decode_float(data: &[u8], format: FloatFormat, offset: usize) -> ParseResult<f64> {
    let (mantissa_bits, exponent_bits) = format.bits();
    let raw = match format {
        FloatFormat::SFloat => decode_int(data, IntFormat::U16, offset)? as u32,
        FloatFormat::Float => decode_int(data, IntFormat::U32, offset)? as u32,
    };

    let sign_extend = |v: u32, bits: u32| -> i32 {
        let shift = 32 - bits;
        ((v << shift) as i32) >> shift
    };
    let mantissa = sign_extend(raw & ((1 << mantissa_bits) - 1), mantissa_bits);
    let exponent = sign_extend(raw >> mantissa_bits, exponent_bits);
    Ok(mantissa as f64 * 10f64.powi(exponent))
}

/// Encode a string value as UTF-8.
pub fn encode_str(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

//! Scalar and string/bytes encoding for a record's value bytes.
//!
//! A record's value bytes are opaque to the record codec; this module
//! is what `get_bool`/`set_i32`/`get_string`/... use to interpret them.
//! Scalars encode directly to their varint or little-endian fixed form.
//! Strings and byte vectors encode as a nested `<varint len><bytes>`
//! pair *inside* the value bytes — producers wrap, consumers unwrap.

use bytes::Bytes;
use duramap_types::Value;

use crate::error::CodecError;
use crate::varint::{
    read_fixed32, read_fixed64, read_varint32, read_varint64, write_fixed32, write_fixed64,
    write_signed_varint32, write_varint32, write_varint64,
};

/// Encodes a scalar or string/bytes value to the bytes that would be
/// stored as a record's value.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::I32(v) => {
            // Negative i32 values sign-extend to the 64-bit varint form
            // (always 10 bytes); non-negative values stay in the compact
            // 32-bit form. See spec.md §4.1.
            if *v < 0 {
                write_signed_varint32(*v, &mut out);
            } else {
                write_varint32(*v as u32, &mut out);
            }
        }
        Value::U32(v) => {
            write_varint32(*v, &mut out);
        }
        Value::I64(v) => {
            write_varint64(*v as u64, &mut out);
        }
        Value::U64(v) => {
            write_varint64(*v, &mut out);
        }
        Value::F32(v) => write_fixed32(v.to_bits(), &mut out),
        Value::F64(v) => write_fixed64(v.to_bits(), &mut out),
        Value::String(s) => {
            write_varint32(s.len() as u32, &mut out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            write_varint32(b.len() as u32, &mut out);
            out.extend_from_slice(b);
        }
    }
    out
}

pub fn decode_bool(buf: &[u8]) -> Result<bool, CodecError> {
    let byte = *buf.first().ok_or(CodecError::Truncated)?;
    Ok(byte != 0)
}

pub fn decode_i32(buf: &[u8]) -> Result<i32, CodecError> {
    // May be either the compact 32-bit form (non-negative) or the
    // sign-extended 10-byte 64-bit form (negative); read_varint64
    // handles both, and truncating to i32 recovers the original value
    // either way.
    Ok(read_varint64(buf)?.0 as i32)
}

pub fn decode_u32(buf: &[u8]) -> Result<u32, CodecError> {
    Ok(read_varint32(buf)?.0)
}

pub fn decode_i64(buf: &[u8]) -> Result<i64, CodecError> {
    Ok(read_varint64(buf)?.0 as i64)
}

pub fn decode_u64(buf: &[u8]) -> Result<u64, CodecError> {
    Ok(read_varint64(buf)?.0)
}

pub fn decode_f32(buf: &[u8]) -> Result<f32, CodecError> {
    Ok(f32::from_bits(read_fixed32(buf)?))
}

pub fn decode_f64(buf: &[u8]) -> Result<f64, CodecError> {
    Ok(f64::from_bits(read_fixed64(buf)?))
}

pub fn decode_string(buf: &[u8]) -> Result<String, CodecError> {
    let (len, prefix) = read_varint32(buf)?;
    let len = len as usize;
    let bytes = buf
        .get(prefix..prefix + len)
        .ok_or(CodecError::Truncated)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::Malformed {
            reason: "string value is not valid UTF-8",
        })
}

pub fn decode_bytes(buf: &[u8]) -> Result<Bytes, CodecError> {
    let (len, prefix) = read_varint32(buf)?;
    let len = len as usize;
    let bytes = buf
        .get(prefix..prefix + len)
        .ok_or(CodecError::Truncated)?;
    Ok(Bytes::copy_from_slice(bytes))
}

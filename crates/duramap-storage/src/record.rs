//! The mini-pb record codec: `<varint keyLen><key><varint valLen><val>`.
//!
//! A removal is the same shape with `valLen == 0`. Encoding a whole
//! in-memory map is just the concatenation of every non-empty-key
//! record; decoders tolerate any order and treat later duplicates for
//! the same key as overrides — the order records were appended in *is*
//! the precedence, which is exactly what a straight left-to-right scan
//! followed by "last write wins" on insertion into a `HashMap` gives.

use bytes::Bytes;

use crate::error::CodecError;
use crate::varint::{read_varint32, varint32_size, write_varint32};

/// The 4-byte placeholder varint written at the start of the record
/// stream immediately after a compaction (`0x00ffffff`, which happens to
/// need exactly 4 bytes to encode). It reserves a known-size prefix for
/// in-place memmove tricks during a later compaction; decoders must
/// skip it rather than try to interpret it as a key length.
pub const ITEM_SIZE_HOLDER: u32 = 0x00ff_ffff;

/// Encodes the placeholder record prefix, returning the bytes written.
pub fn encode_item_size_holder(out: &mut Vec<u8>) -> usize {
    write_varint32(ITEM_SIZE_HOLDER, out)
}

/// Appends one `<keyLen><key><valLen><val>` record to `out`.
pub fn encode_record(key: &[u8], value: &[u8], out: &mut Vec<u8>) {
    write_varint32(key.len() as u32, out);
    out.extend_from_slice(key);
    write_varint32(value.len() as u32, out);
    out.extend_from_slice(value);
}

/// Exact encoded size of a `key`/`value` record, without encoding it —
/// used to decide whether an append fits in the remaining scratch space.
pub fn record_size(key_len: usize, value_len: usize) -> usize {
    varint32_size(key_len as u32) + key_len + varint32_size(value_len as u32) + value_len
}

/// Decodes one record from the front of `buf`.
///
/// Returns the key slice, value slice, and total bytes consumed.
pub fn decode_record(buf: &[u8]) -> Result<(&[u8], &[u8], usize), CodecError> {
    let (key_len, key_len_bytes) = read_varint32(buf)?;
    let key_len = key_len as usize;
    let after_key_len = key_len_bytes;
    let key_end = after_key_len
        .checked_add(key_len)
        .ok_or(CodecError::Malformed {
            reason: "key length overflows buffer",
        })?;
    let key = buf
        .get(after_key_len..key_end)
        .ok_or(CodecError::Truncated)?;

    let rest = &buf[key_end..];
    let (val_len, val_len_bytes) = read_varint32(rest)?;
    let val_len = val_len as usize;
    let val_start = key_end + val_len_bytes;
    let val_end = val_start.checked_add(val_len).ok_or(CodecError::Malformed {
        reason: "value length overflows buffer",
    })?;
    let value = buf.get(val_start..val_end).ok_or(CodecError::Truncated)?;

    Ok((key, value, val_end))
}

/// Encodes every non-empty-key entry of `entries` as a concatenation of
/// records. Order is caller-determined and not required to be stable.
pub fn encode_map<'a>(entries: impl Iterator<Item = (&'a [u8], &'a [u8])>, out: &mut Vec<u8>) {
    for (key, value) in entries {
        if key.is_empty() {
            continue;
        }
        encode_record(key, value, out);
    }
}

/// Decodes as many records as possible from `buf`, returning the
/// partial result up to (not including) the first decode error. Used
/// during crash recovery, where a trailing partially-written record is
/// expected and should not discard everything before it.
///
/// An empty key, which `encode_map` never writes, stops decoding the
/// same as a truncation error would: it is what an all-zero tail —
/// page padding beyond the last real write — decodes as, and treating
/// it as a legitimate record would greedily consume the rest of the
/// buffer as phantom empty entries.
pub fn decode_map_greedy(buf: &[u8]) -> Vec<(Bytes, Bytes)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_record(&buf[offset..]) {
            Ok((key, value, _consumed)) if key.is_empty() => {
                let _ = value;
                break;
            }
            Ok((key, value, consumed)) => {
                out.push((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)));
                offset += consumed;
            }
            Err(_) => break,
        }
    }
    out
}

/// Decodes `buf` as a map, returning an empty result if *any* record
/// fails to decode or decodes to an empty key (see `decode_map_greedy`).
/// Used during normal (CRC-verified) load, where such a thing indicates
/// a format bug rather than a crash-truncated tail, and partial data is
/// not trustworthy.
pub fn decode_map_strict(buf: &[u8]) -> Vec<(Bytes, Bytes)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_record(&buf[offset..]) {
            Ok((key, _value, _consumed)) if key.is_empty() => return Vec::new(),
            Ok((key, value, consumed)) => {
                out.push((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)));
                offset += consumed;
            }
            Err(_) => return Vec::new(),
        }
    }
    out
}

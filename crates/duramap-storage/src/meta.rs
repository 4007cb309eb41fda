//! The `<data>.crc` meta-file sidecar: a fixed-layout, page-rounded
//! struct carrying the data file's CRC digest, a monotonic sequence
//! counter, the active IV, and a last-known-good checkpoint for
//! recovery.
//!
//! The struct is packed and little-endian; every field keeps the same
//! byte offset across versions so an old reader can still trust
//! `crcDigest`, `actualSize`, and `iv` even if it doesn't understand a
//! newer `version`'s extra semantics.

use duramap_io::mmap_file::round_up_to_page;

/// Meta file size before page rounding.
pub const META_FILE_SIZE: usize = 4096;

/// Byte length of the packed record (everything up to and including
/// `flags`).
pub const META_RECORD_LEN: usize =
    4 + 4 + 4 + 16 + 4 + 4 + 4 + (16 * 4) + 8;

/// Schema identifier carried in `version`. Each variant's offsets are
/// frozen; a reader encountering a higher version it doesn't recognize
/// still reads `crcDigest`/`actualSize`/`iv` correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MetaVersion {
    /// Only the legacy 4-byte data-file header carried `actualSize`.
    Legacy = 0,
    /// `sequence` is meaningful.
    SequenceBearing = 1,
    /// `iv` is populated from a real per-generation random value.
    RandomIv = 2,
    /// `actualSize` in the meta file, not the legacy header, is
    /// authoritative.
    ActualSizeAuthoritative = 3,
    /// `flags` is meaningful.
    Flags = 4,
}

impl MetaVersion {
    pub const CURRENT: MetaVersion = MetaVersion::Flags;

    fn from_u32(value: u32) -> MetaVersion {
        match value {
            0 => MetaVersion::Legacy,
            1 => MetaVersion::SequenceBearing,
            2 => MetaVersion::RandomIv,
            3 => MetaVersion::ActualSizeAuthoritative,
            _ => MetaVersion::Flags,
        }
    }
}

/// The decoded meta-file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaInfo {
    pub crc_digest: u32,
    pub version: u32,
    pub sequence: u32,
    pub iv: [u8; 16],
    pub actual_size: u32,
    pub last_actual_size: u32,
    pub last_crc_digest: u32,
    pub flags: u64,
}

impl Default for MetaInfo {
    fn default() -> Self {
        MetaInfo {
            crc_digest: 0,
            version: MetaVersion::CURRENT as u32,
            sequence: 0,
            iv: [0u8; 16],
            actual_size: 0,
            last_actual_size: 0,
            last_crc_digest: 0,
            flags: 0,
        }
    }
}

impl MetaInfo {
    pub fn version(&self) -> MetaVersion {
        MetaVersion::from_u32(self.version)
    }

    /// Size in bytes of the meta file on disk, page-rounded.
    pub fn file_size(page_size: usize) -> usize {
        round_up_to_page(META_FILE_SIZE, page_size)
    }

    /// Decodes a `MetaInfo` from the front of `buf`. A short or
    /// all-zero buffer (a freshly created, never-written meta file)
    /// decodes to `MetaInfo::default()`.
    pub fn read(buf: &[u8]) -> MetaInfo {
        if buf.len() < META_RECORD_LEN {
            return MetaInfo::default();
        }
        let crc_digest = u32_at(buf, 0);
        let version = u32_at(buf, 4);
        let sequence = u32_at(buf, 8);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[12..28]);
        let actual_size = u32_at(buf, 28);
        let last_actual_size = u32_at(buf, 32);
        let last_crc_digest = u32_at(buf, 36);
        // reserved[16] u32 occupies 40..104
        let flags = u64_at(buf, 104);
        MetaInfo {
            crc_digest,
            version,
            sequence,
            iv,
            actual_size,
            last_actual_size,
            last_crc_digest,
            flags,
        }
    }

    /// Full write: every field, used when `version`, `iv`, `flags`, or
    /// `sequence` changes (i.e. on every full rewrite).
    pub fn write_full(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= META_RECORD_LEN);
        put_u32(buf, 0, self.crc_digest);
        put_u32(buf, 4, self.version);
        put_u32(buf, 8, self.sequence);
        buf[12..28].copy_from_slice(&self.iv);
        put_u32(buf, 28, self.actual_size);
        put_u32(buf, 32, self.last_actual_size);
        put_u32(buf, 36, self.last_crc_digest);
        for i in 0..16 {
            put_u32(buf, 40 + i * 4, 0);
        }
        put_u64(buf, 104, self.flags);
    }

    /// CRC+size-only write: overwrites only `crcDigest` and
    /// `actualSize`, used on every append so the common-case write
    /// touches the fewest bytes (and dirties the fewest meta-file
    /// pages).
    pub fn write_crc_and_size_only(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= META_RECORD_LEN);
        put_u32(buf, 0, self.crc_digest);
        put_u32(buf, 28, self.actual_size);
    }
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

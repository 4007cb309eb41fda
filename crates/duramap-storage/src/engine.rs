//! The storage engine: the state machine that orchestrates load,
//! append, compaction, and cross-process reconciliation over a mmap'd
//! data file and its meta-file sidecar.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use bytes::Bytes;
use duramap_crypto::aes_cfb::{self, Crypter};
use duramap_crypto::crc32::Crc32;
use duramap_io::file_lock::{FileLock, LockKind};
use duramap_io::mmap_file::{MmapFile, SyncFlag as IoSyncFlag};
use duramap_types::{ErrorKind, Mode, RecoverStrategy, SyncFlag};

use crate::error::EngineError;
use crate::meta::MetaInfo;
use crate::record::{self, ITEM_SIZE_HOLDER};
use crate::varint::write_varint32;

/// Values larger than this are, in encrypted instances, stored by
/// offset into the mapped region rather than as owned bytes.
pub const OFFSET_VALUE_THRESHOLD: usize = 256;

/// Legacy 4-byte little-endian `actualSize` header at the start of the
/// data file, duplicated by (and secondary to) the meta file's
/// `actualSize`.
const LEGACY_HEADER_LEN: usize = 4;

/// A recursive, single-process mutex: acquiring it from the thread
/// already holding it just bumps a counter instead of deadlocking.
/// `std::sync::Mutex` isn't reentrant, and the engine's call structure
/// needs a thread to re-enter (e.g. `set` re-validating state through
/// `check_load_data`, which a compaction may itself trigger again).
pub struct ThreadLock {
    state: Mutex<Option<(ThreadId, u32)>>,
    released: Condvar,
}

impl ThreadLock {
    pub fn new() -> Self {
        ThreadLock {
            state: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self) -> ThreadLockGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                Some((owner, count)) if owner == me => {
                    *state = Some((owner, count + 1));
                    break;
                }
                None => {
                    *state = Some((me, 1));
                    break;
                }
                Some(_) => {
                    state = self.released.wait(state).unwrap();
                }
            }
        }
        ThreadLockGuard { lock: self }
    }

    fn unlock(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        match *state {
            Some((owner, count)) if owner == me => {
                if count > 1 {
                    *state = Some((owner, count - 1));
                } else {
                    *state = None;
                    self.released.notify_one();
                }
            }
            _ => debug_assert!(false, "unlock called without holding the thread lock"),
        }
    }
}

impl Default for ThreadLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ThreadLockGuard<'a> {
    lock: &'a ThreadLock,
}

impl Drop for ThreadLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// In-memory representation of one key's value.
#[derive(Debug, Clone)]
pub enum ValueSlot {
    /// A plaintext copy, or a small (≤ 256 byte) encrypted value kept
    /// decrypted in memory.
    Owned(Bytes),
    /// A large encrypted value, kept as ciphertext in the mapped region
    /// plus the crypter state needed to decrypt just that span.
    Offset {
        value_offset: u32,
        value_size: u32,
        snapshot: aes_cfb::Snapshot,
    },
}

struct OpenFiles {
    data: MmapFile,
    meta: MmapFile,
    /// Kept open only so `lock`'s raw descriptor stays valid; `FileLock`
    /// borrows the descriptor rather than owning the `File`.
    lock_file: std::fs::File,
    lock: FileLock,
}

/// The core storage engine for one `(id, root)`.
pub struct Engine {
    id: String,
    mode: Mode,
    files: OpenFiles,
    cached_meta: MetaInfo,
    map: HashMap<Bytes, ValueSlot>,
    actual_size: u32,
    crc_digest: u32,
    crypter: Option<Crypter>,
    key: Option<Vec<u8>>,
    needs_load: bool,
    thread_lock: ThreadLock,
}

/// An installed error handler's decision for a recoverable load
/// failure.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, id: &str, kind: ErrorKind) -> RecoverStrategy;
}

/// A no-op handler that always discards — the default when no handler
/// is installed.
pub struct DiscardOnError;
impl ErrorHandler for DiscardOnError {
    fn on_error(&self, _id: &str, _kind: ErrorKind) -> RecoverStrategy {
        RecoverStrategy::Discard
    }
}

impl Engine {
    /// Opens (creating if absent) the data and meta files for `id` and
    /// loads them per the load protocol.
    pub fn open(
        id: &str,
        data_path: PathBuf,
        meta_path: PathBuf,
        mode: Mode,
        key: Option<&[u8]>,
        on_error: &dyn ErrorHandler,
    ) -> Result<Engine, EngineError> {
        let data = MmapFile::open_or_create(&data_path)?;
        let meta = MmapFile::open_or_create(&meta_path)?;
        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)?;
        let lock = FileLock::new(&lock_file);

        let mut engine = Engine {
            id: id.to_string(),
            mode,
            files: OpenFiles {
                data,
                meta,
                lock_file,
                lock,
            },
            cached_meta: MetaInfo::default(),
            map: HashMap::new(),
            actual_size: 0,
            crc_digest: 0,
            crypter: None,
            key: key.map(|k| k.to_vec()),
            needs_load: true,
            thread_lock: ThreadLock::new(),
        };
        engine.load(on_error)?;
        Ok(engine)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn exclusive_guard(&mut self) -> Option<()> {
        if self.mode.is_multi_process() {
            self.files.lock.lock(LockKind::Exclusive).ok()
        } else {
            Some(())
        }
    }

    fn release_exclusive(&mut self) {
        if self.mode.is_multi_process() {
            let _ = self.files.lock.unlock(LockKind::Exclusive);
        }
    }

    fn shared_guard(&mut self) -> Option<()> {
        if self.mode.is_multi_process() {
            self.files.lock.lock(LockKind::Shared).ok()
        } else {
            Some(())
        }
    }

    fn release_shared(&mut self) {
        if self.mode.is_multi_process() {
            let _ = self.files.lock.unlock(LockKind::Shared);
        }
    }

    // ---- 4.8.2 load protocol -------------------------------------------------

    fn load(&mut self, on_error: &dyn ErrorHandler) -> Result<(), EngineError> {
        self.cached_meta = MetaInfo::read(self.files.meta.as_slice());

        if let Some(key) = self.key.clone() {
            self.crypter = Some(Crypter::new(&key, self.cached_meta.iv));
        }

        let file_size = self.files.data.size();
        let (load_from_file, need_full_writeback, actual_size) =
            self.check_data_valid(file_size, on_error);

        self.actual_size = actual_size;
        self.map.clear();

        if load_from_file {
            let strict = !need_full_writeback;
            self.decode_into_map(strict);
            self.crc_digest = crc32_over_record_stream(self.files.data.as_slice(), self.actual_size);
        } else {
            self.crc_digest = Crc32::new().finalize();
        }

        self.needs_load = false;

        if need_full_writeback {
            tracing::warn!(id = %self.id, "normalizing data file with a full rewrite after recovery");
            self.full_rewrite()?;
        }

        Ok(())
    }

    /// `check_data_valid` (spec §4.8.2 step 4): decides whether the
    /// current data file contents can be trusted, and whether a full
    /// rewrite is needed to normalize things afterward.
    fn check_data_valid(
        &self,
        file_size: usize,
        on_error: &dyn ErrorHandler,
    ) -> (bool, bool, u32) {
        let meta = &self.cached_meta;
        let actual_size = meta.actual_size;

        if (actual_size as usize) + LEGACY_HEADER_LEN <= file_size {
            let region = &self.files.data.as_slice()
                [LEGACY_HEADER_LEN..LEGACY_HEADER_LEN + actual_size as usize];
            if crc32_matches(region, meta.crc_digest) {
                return (true, false, actual_size);
            }
        }

        // Try the last-known-good checkpoint.
        if (meta.last_actual_size as usize) + LEGACY_HEADER_LEN <= file_size {
            let region = &self.files.data.as_slice()
                [LEGACY_HEADER_LEN..LEGACY_HEADER_LEN + meta.last_actual_size as usize];
            if crc32_matches(region, meta.last_crc_digest) {
                return (true, false, meta.last_actual_size);
            }
        }

        let error_kind = if (actual_size as usize) + LEGACY_HEADER_LEN > file_size {
            ErrorKind::FileLengthError
        } else {
            ErrorKind::CrcFail
        };
        match on_error.on_error(&self.id, error_kind) {
            RecoverStrategy::Recover => {
                let clipped = file_size.saturating_sub(LEGACY_HEADER_LEN) as u32;
                (true, true, clipped.min(actual_size.max(clipped)))
            }
            RecoverStrategy::Discard => (false, false, 0),
        }
    }

    fn decode_into_map(&mut self, strict: bool) {
        let region = self.record_stream_plaintext(strict);
        // Every full rewrite (including the implicit one on the very
        // first `set`, since it starts from an empty map) opens the
        // record stream with the 4-byte item-size-holder placeholder;
        // skip it rather than feed it to the record decoder as a key
        // length.
        let records_region = region.get(4..).unwrap_or(&[]);
        let records = if strict {
            record::decode_map_strict(records_region)
        } else {
            record::decode_map_greedy(records_region)
        };
        for (key, value) in records {
            self.insert_owned(key, value);
        }
    }

    /// Returns the record stream, decrypted into an owned buffer if the
    /// instance is encrypted. Plaintext instances borrow directly; this
    /// always returns owned bytes for simplicity of the decode path
    /// (only used at load, not on the hot append path).
    fn record_stream_plaintext(&mut self, _strict: bool) -> Vec<u8> {
        let start = LEGACY_HEADER_LEN;
        let end = start + self.actual_size as usize;
        let raw = &self.files.data.as_slice()[start..end];
        if let Some(key) = self.key.clone() {
            let mut dec = Crypter::new(&key, self.cached_meta.iv);
            let mut out = vec![0u8; raw.len()];
            dec.decrypt(raw, &mut out);
            out
        } else {
            raw.to_vec()
        }
    }

    /// A record with an empty value is the on-disk encoding of a
    /// removal (spec.md §4.3/§6); reconstructing the map from the
    /// record stream must drop the key rather than store an empty
    /// slot for it.
    fn insert_owned(&mut self, key: Bytes, value: Bytes) {
        if value.is_empty() {
            self.map.remove(&key);
        } else {
            self.map.insert(key, ValueSlot::Owned(value));
        }
    }

    // ---- 4.8.5 cross-process reconciliation ----------------------------------

    /// Must be called before trusting `self.map` on every public
    /// operation.
    fn check_load_data(&mut self, on_error: &dyn ErrorHandler) -> Result<(), EngineError> {
        if self.needs_load {
            return self.load(on_error);
        }
        if !self.mode.is_multi_process() {
            return Ok(());
        }

        self.shared_guard();
        let fresh_meta = MetaInfo::read(self.files.meta.as_slice());
        self.release_shared();

        if fresh_meta.sequence != self.cached_meta.sequence {
            tracing::info!(id = %self.id, "sequence changed, reloading after a peer's full rewrite");
            self.needs_load = true;
            return self.load(on_error);
        }

        if fresh_meta.crc_digest != self.cached_meta.crc_digest {
            let cached_size = self.files.data.size();
            self.files.data.remap()?;
            if self.files.data.size() != cached_size {
                self.needs_load = true;
                return self.load(on_error);
            }
            self.incremental_reload(fresh_meta, on_error)?;
        }
        Ok(())
    }

    fn incremental_reload(
        &mut self,
        fresh_meta: MetaInfo,
        on_error: &dyn ErrorHandler,
    ) -> Result<(), EngineError> {
        let old_actual_size = self.actual_size as usize;
        let new_actual_size = fresh_meta.actual_size as usize;
        if new_actual_size < old_actual_size {
            self.needs_load = true;
            return self.load(on_error);
        }

        let tail_start = LEGACY_HEADER_LEN + old_actual_size;
        let tail_end = LEGACY_HEADER_LEN + new_actual_size;
        if tail_end > self.files.data.size() {
            self.needs_load = true;
            return self.load(on_error);
        }
        let tail = &self.files.data.as_slice()[tail_start..tail_end];

        let mut hasher = Crc32::resume(self.cached_meta.crc_digest);
        hasher.update(tail);
        if hasher.finalize() != fresh_meta.crc_digest {
            tracing::warn!(id = %self.id, "incremental tail CRC mismatch, falling back to full reload");
            self.needs_load = true;
            return self.load(on_error);
        }

        let tail_plaintext: Vec<u8> = if let Some(key) = self.key.clone() {
            let mut dec = self
                .crypter
                .clone()
                .unwrap_or_else(|| Crypter::new(&key, self.cached_meta.iv));
            let mut out = vec![0u8; tail.len()];
            dec.decrypt(tail, &mut out);
            self.crypter = Some(dec);
            out
        } else {
            tail.to_vec()
        };

        for (key, value) in record::decode_map_greedy(&tail_plaintext) {
            self.insert_owned(key, value);
        }

        self.actual_size = fresh_meta.actual_size;
        self.crc_digest = fresh_meta.crc_digest;
        self.cached_meta = fresh_meta;
        Ok(())
    }

    // ---- 4.8.3 append protocol -------------------------------------------------

    pub fn set(&mut self, key: &[u8], value: Bytes, on_error: &dyn ErrorHandler) -> Result<bool, EngineError> {
        if key.is_empty() {
            tracing::debug!(id = %self.id, error = %EngineError::EmptyKey, "rejecting set with an empty key");
            return Ok(false);
        }
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();
        let result = self.set_locked(key, value, on_error);
        self.release_exclusive();
        result
    }

    fn set_locked(&mut self, key: &[u8], value: Bytes, on_error: &dyn ErrorHandler) -> Result<bool, EngineError> {
        self.check_load_data(on_error)?;

        let record_len = record::record_size(key.len(), value.len());
        let scratch_left = self.files.data.size() - LEGACY_HEADER_LEN - self.actual_size as usize;
        if self.map.is_empty() || record_len > scratch_left {
            // Bootstrapping a fresh store (map still empty) has nothing
            // to compact; only bump the sequence when this rewrite is
            // actually compacting existing live data.
            let bump_sequence = !self.map.is_empty();
            self.full_rewrite_with_pending(Some((key, &value)), bump_sequence)?;
        }

        self.append_record(key, &value)?;
        Ok(true)
    }

    fn append_record(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let mut plain = Vec::with_capacity(record::record_size(key.len(), value.len()));
        write_varint32(key.len() as u32, &mut plain);
        plain.extend_from_slice(key);
        write_varint32(value.len() as u32, &mut plain);
        let value_start_in_record = plain.len();
        plain.extend_from_slice(value);

        let write_at = LEGACY_HEADER_LEN + self.actual_size as usize;
        let slot_bytes = self.maybe_encrypt_and_write(write_at, &plain, value_start_in_record, value.len());

        self.crc_digest = {
            let mut hasher = Crc32::resume(self.crc_digest);
            hasher.update(&self.files.data.as_slice()[write_at..write_at + plain.len()]);
            hasher.finalize()
        };
        self.actual_size += plain.len() as u32;
        self.write_legacy_header();
        self.write_meta_crc_and_size();

        if value.is_empty() {
            self.map.remove(key);
        } else {
            self.map.insert(Bytes::copy_from_slice(key), slot_bytes);
        }
        Ok(())
    }

    /// Writes `plain` into the mapped region at `write_at`, encrypting
    /// in place if this is an encrypted instance, and returns the
    /// `ValueSlot` that should represent the value just written.
    fn maybe_encrypt_and_write(
        &mut self,
        write_at: usize,
        plain: &[u8],
        value_start_in_record: usize,
        value_len: usize,
    ) -> ValueSlot {
        let dest = &mut self.files.data.as_mut_slice()[write_at..write_at + plain.len()];
        if let Some(crypter) = self.crypter.as_mut() {
            let prefix = &plain[..value_start_in_record];
            let (prefix_dest, value_dest) = dest.split_at_mut(value_start_in_record);
            crypter.encrypt(prefix, prefix_dest);
            let snapshot = crypter.snapshot();
            crypter.encrypt(&plain[value_start_in_record..], value_dest);

            if value_len > OFFSET_VALUE_THRESHOLD {
                return ValueSlot::Offset {
                    value_offset: (write_at + value_start_in_record) as u32,
                    value_size: value_len as u32,
                    snapshot,
                };
            }
            ValueSlot::Owned(Bytes::copy_from_slice(&plain[value_start_in_record..]))
        } else {
            dest.copy_from_slice(plain);
            ValueSlot::Owned(Bytes::copy_from_slice(&plain[value_start_in_record..]))
        }
    }

    fn write_legacy_header(&mut self) {
        self.files.data.as_mut_slice()[0..4].copy_from_slice(&self.actual_size.to_le_bytes());
    }

    fn write_meta_crc_and_size(&mut self) {
        self.cached_meta.crc_digest = self.crc_digest;
        self.cached_meta.actual_size = self.actual_size;
        self.cached_meta
            .write_crc_and_size_only(self.files.meta.as_mut_slice());
        let _ = self.files.meta.msync(IoSyncFlag::Async);
    }

    // ---- 4.8.4 compaction / full rewrite ---------------------------------------

    fn full_rewrite(&mut self) -> Result<(), EngineError> {
        self.full_rewrite_with_pending(None, true)
    }

    /// Re-serializes the in-memory map over the file from offset 4. If
    /// `pending` is given, its record is accounted for in the capacity
    /// computation (but not written here — the caller inserts it into
    /// `self.map` and appends separately once there is room).
    ///
    /// `bump_sequence` should be false only for the degenerate bootstrap
    /// rewrite of a fresh, empty store: there is no existing data being
    /// compacted, so spec.md §8 S1 requires `sequence` to stay put.
    /// Every other caller (overflow compaction, `remove_many`, `rekey`,
    /// post-recovery normalization) compacts live data and must bump it.
    fn full_rewrite_with_pending(
        &mut self,
        pending: Option<(&[u8], &[u8])>,
        bump_sequence: bool,
    ) -> Result<(), EngineError> {
        let mut serialized = Vec::new();
        let owned_entries: Vec<(Bytes, Bytes)> = self
            .map
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect();
        record::encode_map(
            owned_entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref())),
            &mut serialized,
        );

        let pending_size = pending
            .map(|(k, v)| record::record_size(k.len(), v.len()))
            .unwrap_or(0);
        let needed = serialized.len() + LEGACY_HEADER_LEN + pending_size;

        let map_len = owned_entries.len().max(1);
        let avg = needed / map_len.max(1);
        let future = avg * (8.max((owned_entries.len() + 1) / 2));
        let mut target_size = self.files.data.size();
        while needed + future >= target_size {
            target_size *= 2;
        }
        self.files.data.truncate(target_size)?;

        let new_iv = self.crypter.as_ref().map(|_| {
            let mut iv = [0u8; 16];
            aes_cfb::fill_random_iv(&mut iv);
            iv
        });
        if let (Some(key), Some(iv)) = (&self.key, new_iv) {
            self.crypter = Some(Crypter::new(key, iv));
        }

        let mut write_at = LEGACY_HEADER_LEN;
        let mut placeholder = Vec::new();
        write_varint32(ITEM_SIZE_HOLDER, &mut placeholder);
        self.write_plain_region(write_at, &placeholder);
        write_at += placeholder.len();
        self.write_plain_region(write_at, &serialized);

        let total_written = placeholder.len() + serialized.len();
        self.actual_size = total_written as u32;
        self.crc_digest = crc32_over_record_stream(self.files.data.as_slice(), self.actual_size);
        self.write_legacy_header();

        self.cached_meta.crc_digest = self.crc_digest;
        self.cached_meta.actual_size = self.actual_size;
        self.cached_meta.last_actual_size = self.actual_size;
        self.cached_meta.last_crc_digest = self.crc_digest;
        if bump_sequence {
            self.cached_meta.sequence = self.cached_meta.sequence.wrapping_add(1);
        }
        self.cached_meta.version = MetaInfo::default().version;
        if let Some(iv) = new_iv {
            self.cached_meta.iv = iv;
        }
        self.cached_meta
            .write_full(self.files.meta.as_mut_slice());
        let _ = self.files.meta.msync(IoSyncFlag::Sync);

        // Re-derive ValueSlots against the freshly written region
        // (offsets shift on every compaction).
        self.rebase_value_slots(&owned_entries);

        Ok(())
    }

    /// Writes `bytes` into the mapped region at `write_at`, encrypting
    /// in place with the (possibly just-reset) crypter if this is an
    /// encrypted instance.
    fn write_plain_region(&mut self, write_at: usize, bytes: &[u8]) {
        let dest = &mut self.files.data.as_mut_slice()[write_at..write_at + bytes.len()];
        if let Some(crypter) = self.crypter.as_mut() {
            crypter.encrypt(bytes, dest);
        } else {
            dest.copy_from_slice(bytes);
        }
    }

    /// After a full rewrite, every value's bytes moved; re-point large
    /// encrypted values at their new offsets instead of keeping owned
    /// copies, preserving the value-by-offset optimization across
    /// compactions.
    fn rebase_value_slots(&mut self, owned_entries: &[(Bytes, Bytes)]) {
        if self.crypter.is_none() {
            return;
        }
        // Re-walk the freshly written plaintext stream to recover each
        // key's value offset within the mapped (ciphertext) region.
        let mut plain = Vec::new();
        record::encode_map(
            owned_entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref())),
            &mut plain,
        );
        let mut offset_in_plain = 0usize;
        let base = LEGACY_HEADER_LEN + 4; // past the item-size-holder placeholder
        let mut new_map = HashMap::with_capacity(self.map.len());
        while offset_in_plain < plain.len() {
            let Ok((key, value, consumed)) = record::decode_record(&plain[offset_in_plain..]) else {
                break;
            };
            let value_start = offset_in_plain + (consumed - value.len());
            if value.len() > OFFSET_VALUE_THRESHOLD {
                let absolute_value_offset = base + value_start;
                let snapshot = if value_start >= aes_cfb::BLOCK_LEN {
                    let ciphertext_ahead = &self.files.data.as_slice()[base..absolute_value_offset];
                    let plaintext_ahead = &plain[..value_start];
                    Crypter::status_before_decrypt(ciphertext_ahead, plaintext_ahead, 0)
                } else {
                    self.crypter_snapshot_at(base, absolute_value_offset)
                };
                new_map.insert(
                    Bytes::copy_from_slice(key),
                    ValueSlot::Offset {
                        value_offset: absolute_value_offset as u32,
                        value_size: value.len() as u32,
                        snapshot,
                    },
                );
            } else {
                new_map.insert(Bytes::copy_from_slice(key), ValueSlot::Owned(Bytes::copy_from_slice(value)));
            }
            offset_in_plain += consumed;
        }
        self.map = new_map;
    }

    /// Replays the crypter from the start of the freshly written record
    /// stream up to `absolute_value_offset` to recover the snapshot at
    /// that point. Fallback for `rebase_value_slots` when the value
    /// starts inside the stream's first keystream block, where
    /// `status_before_decrypt` has no preceding block to read the
    /// register from; only used right after a full rewrite, over data
    /// this process just encrypted, so the replay cost is bounded by
    /// one keystream block.
    fn crypter_snapshot_at(&self, base: usize, absolute_value_offset: usize) -> aes_cfb::Snapshot {
        let Some(key) = &self.key else {
            return aes_cfb::Snapshot { pos: 0, register: self.cached_meta.iv };
        };
        let mut replay = Crypter::new(key, self.cached_meta.iv);
        let ciphertext = &self.files.data.as_slice()[base..absolute_value_offset];
        let mut scratch = vec![0u8; ciphertext.len()];
        replay.decrypt(ciphertext, &mut scratch);
        replay.snapshot()
    }

    fn resolve_value(&self, slot: &ValueSlot) -> Bytes {
        match slot {
            ValueSlot::Owned(b) => b.clone(),
            ValueSlot::Offset {
                value_offset,
                value_size,
                snapshot,
            } => {
                let crypter = self.crypter.as_ref().expect("offset slot requires a crypter");
                let mut dec = crypter.clone_with(*snapshot);
                let start = *value_offset as usize;
                let end = start + *value_size as usize;
                let ciphertext = &self.files.data.as_slice()[start..end];
                let mut out = vec![0u8; ciphertext.len()];
                dec.decrypt(ciphertext, &mut out);
                Bytes::from(out)
            }
        }
    }

    // ---- public read operations -------------------------------------------------

    pub fn get(&mut self, key: &[u8], on_error: &dyn ErrorHandler) -> Result<Option<Bytes>, EngineError> {
        let _thread = self.thread_lock.lock();
        self.shared_guard();
        self.check_load_data(on_error)?;
        let result = self.map.get(key).map(|slot| self.resolve_value(slot));
        self.release_shared();
        Ok(result)
    }

    pub fn contains_key(&mut self, key: &[u8], on_error: &dyn ErrorHandler) -> Result<bool, EngineError> {
        Ok(self.get(key, on_error)?.is_some())
    }

    pub fn count(&mut self, on_error: &dyn ErrorHandler) -> Result<usize, EngineError> {
        let _thread = self.thread_lock.lock();
        self.shared_guard();
        self.check_load_data(on_error)?;
        let result = self.map.len();
        self.release_shared();
        Ok(result)
    }

    pub fn all_keys(&mut self, on_error: &dyn ErrorHandler) -> Result<Vec<Bytes>, EngineError> {
        let _thread = self.thread_lock.lock();
        self.shared_guard();
        self.check_load_data(on_error)?;
        let result = self.map.keys().cloned().collect();
        self.release_shared();
        Ok(result)
    }

    pub fn actual_size_bytes(&mut self, on_error: &dyn ErrorHandler) -> Result<u32, EngineError> {
        let _thread = self.thread_lock.lock();
        self.shared_guard();
        self.check_load_data(on_error)?;
        let result = self.actual_size;
        self.release_shared();
        Ok(result)
    }

    pub fn total_size_bytes(&mut self, on_error: &dyn ErrorHandler) -> Result<usize, EngineError> {
        let _thread = self.thread_lock.lock();
        self.shared_guard();
        self.check_load_data(on_error)?;
        let result = self.files.data.size();
        self.release_shared();
        Ok(result)
    }

    // ---- public mutating operations ---------------------------------------------

    pub fn remove(&mut self, key: &[u8], on_error: &dyn ErrorHandler) -> Result<bool, EngineError> {
        if key.is_empty() {
            tracing::debug!(id = %self.id, error = %EngineError::EmptyKey, "rejecting remove of an empty key");
            return Ok(false);
        }
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();
        self.check_load_data(on_error)?;
        let existed = self.map.contains_key(key);
        let result = if existed {
            self.set_locked(key, Bytes::new(), on_error)
        } else {
            Ok(false)
        };
        self.release_exclusive();
        result
    }

    pub fn remove_many(&mut self, keys: &[&[u8]], on_error: &dyn ErrorHandler) -> Result<(), EngineError> {
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();
        self.check_load_data(on_error)?;
        for key in keys {
            self.map.remove(*key);
        }
        let result = self.full_rewrite();
        self.release_exclusive();
        result
    }

    pub fn trim(&mut self, on_error: &dyn ErrorHandler) -> Result<(), EngineError> {
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();
        self.check_load_data(on_error)?;
        let needed = LEGACY_HEADER_LEN + self.actual_size as usize;
        let page = self.files.data.page_size();
        if self.files.data.size() > 2 * needed {
            let mut target = page;
            while target < needed {
                target *= 2;
            }
            let _ = self.files.data.truncate(target);
        }
        self.release_exclusive();
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<(), EngineError> {
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();

        let page = self.files.data.page_size();
        self.files.data.truncate(page)?;
        self.files.data.as_mut_slice().fill(0);

        let mut iv = [0u8; 16];
        if self.key.is_some() {
            aes_cfb::fill_random_iv(&mut iv);
            if let Some(key) = &self.key {
                self.crypter = Some(Crypter::new(key, iv));
            }
        }

        self.cached_meta.crc_digest = Crc32::new().finalize();
        self.cached_meta.actual_size = 0;
        self.cached_meta.last_actual_size = 0;
        self.cached_meta.last_crc_digest = Crc32::new().finalize();
        self.cached_meta.iv = iv;
        self.cached_meta.sequence = self.cached_meta.sequence.wrapping_add(1);
        self.cached_meta
            .write_full(self.files.meta.as_mut_slice());
        let _ = self.files.meta.msync(IoSyncFlag::Sync);

        self.map.clear();
        self.actual_size = 0;
        self.crc_digest = Crc32::new().finalize();
        self.needs_load = false;

        self.release_exclusive();
        Ok(())
    }

    pub fn sync(&mut self, flag: SyncFlag) -> Result<(), EngineError> {
        let io_flag = match flag {
            SyncFlag::Sync => IoSyncFlag::Sync,
            SyncFlag::Async => IoSyncFlag::Async,
        };
        self.files.data.msync(io_flag)?;
        self.files.meta.msync(io_flag)?;
        Ok(())
    }

    /// Installs `new_key` (or `None` to decrypt to plaintext), then does
    /// a full rewrite under the new key/IV.
    pub fn rekey(&mut self, new_key: Option<&[u8]>) -> Result<(), EngineError> {
        let _thread = self.thread_lock.lock();
        self.exclusive_guard();

        // Resolve every value under the current crypter before it's
        // replaced below: an offset-stored value's snapshot only decrypts
        // correctly under the key it was written with, and `full_rewrite`
        // resolves values against `self.crypter` as it finds it.
        let resolved: Vec<(Bytes, Bytes)> = self
            .map
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect();
        for (k, v) in resolved {
            self.map.insert(k, ValueSlot::Owned(v));
        }

        self.key = new_key.map(<[u8]>::to_vec);
        if let Some(key) = &self.key {
            let mut iv = [0u8; 16];
            aes_cfb::fill_random_iv(&mut iv);
            self.crypter = Some(Crypter::new(key, iv));
        } else {
            self.crypter = None;
        }
        let result = self.full_rewrite();
        self.release_exclusive();
        result
    }

    pub fn sequence(&self) -> u32 {
        self.cached_meta.sequence
    }
}

fn crc32_matches(region: &[u8], expected: u32) -> bool {
    duramap_crypto::crc32::crc32(region) == expected
}

fn crc32_over_record_stream(data: &[u8], actual_size: u32) -> u32 {
    let end = LEGACY_HEADER_LEN + actual_size as usize;
    duramap_crypto::crc32::crc32(&data[LEGACY_HEADER_LEN..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct AlwaysRecover;
    impl ErrorHandler for AlwaysRecover {
        fn on_error(&self, _id: &str, _kind: ErrorKind) -> RecoverStrategy {
            RecoverStrategy::Recover
        }
    }

    fn open(dir: &std::path::Path, id: &str, key: Option<&[u8]>) -> Engine {
        let data_path = dir.join(id);
        let meta_path = dir.join(format!("{id}.crc"));
        Engine::open(
            id,
            data_path,
            meta_path,
            Mode::SingleProcess,
            key,
            &DiscardOnError,
        )
        .unwrap()
    }

    #[test]
    fn set_and_get_roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut e = open(dir.path(), "s1", None);
            assert!(e.set(b"k1", Bytes::from_static(b"v1"), &DiscardOnError).unwrap());
            assert!(e.set(b"k2", Bytes::from_static(b"v2"), &DiscardOnError).unwrap());
            assert_eq!(e.sequence(), 0, "two small appends must not trigger a rewrite");
        }
        let mut e = open(dir.path(), "s1", None);
        assert_eq!(
            e.get(b"k1", &DiscardOnError).unwrap().as_deref(),
            Some(b"v1".as_slice())
        );
        assert_eq!(
            e.get(b"k2", &DiscardOnError).unwrap().as_deref(),
            Some(b"v2".as_slice())
        );
        assert_eq!(e.count(&DiscardOnError).unwrap(), 2);
    }

    #[test]
    fn remove_drops_key_without_bumping_sequence() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s2", None);
        e.set(b"k1", Bytes::from_static(b"v1"), &DiscardOnError).unwrap();
        let seq_before = e.sequence();
        assert!(e.remove(b"k1", &DiscardOnError).unwrap());
        assert!(!e.contains_key(b"k1", &DiscardOnError).unwrap());
        assert_eq!(e.sequence(), seq_before);
    }

    #[test]
    fn crc_digest_matches_record_stream_after_every_mutation() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s3", None);
        for i in 0..20 {
            let k = format!("key{i:03}");
            let v = format!("val{i:03}");
            e.set(k.as_bytes(), Bytes::from(v.into_bytes()), &DiscardOnError).unwrap();
            let expected = crc32_over_record_stream(e.files.data.as_slice(), e.actual_size);
            assert_eq!(e.crc_digest, expected);
            assert_eq!(e.cached_meta.crc_digest, expected);
        }
    }

    #[test]
    fn compaction_persists_the_record_that_triggered_it() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s4", None);
        let seq_before = e.sequence();
        // Enough small records to overflow the initial one-page file and
        // force at least one full rewrite.
        for i in 0..400 {
            let k = format!("key{i:05}");
            let v = format!("val{i:05}");
            assert!(e.set(k.as_bytes(), Bytes::from(v.into_bytes()), &DiscardOnError).unwrap());
        }
        assert!(e.sequence() > seq_before, "expected at least one compaction");

        // Every single key, including the one whose append triggered the
        // rewrite, must survive an independent reload from disk.
        drop(e);
        let mut reopened = open(dir.path(), "s4", None);
        for i in 0..400 {
            let k = format!("key{i:05}");
            let expected = format!("val{i:05}");
            assert_eq!(
                reopened.get(k.as_bytes(), &DiscardOnError).unwrap().as_deref(),
                Some(expected.as_bytes())
            );
        }
        assert_eq!(reopened.count(&DiscardOnError).unwrap(), 400);
    }

    #[test]
    fn sequence_strictly_increases_on_clear_all() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s5", Some(b"TheAESKey"));
        e.set(b"a", Bytes::from_static(b"1"), &DiscardOnError).unwrap();
        e.set(b"b", Bytes::from_static(b"2"), &DiscardOnError).unwrap();
        let seq_before = e.sequence();
        let iv_before = e.cached_meta.iv;

        e.clear_all().unwrap();

        assert_eq!(e.sequence(), seq_before + 1);
        assert_eq!(e.count(&DiscardOnError).unwrap(), 0);
        assert_ne!(e.cached_meta.iv, iv_before);
        assert_eq!(e.files.data.size(), e.files.data.page_size());
    }

    /// Flips the meta file's `crcDigest` and `lastCrcDigest` so neither
    /// the primary nor the last-known-good check can validate the data
    /// file on the next open, without touching the data file itself.
    fn corrupt_meta_digests(meta_path: &std::path::Path) {
        let bytes = std::fs::read(meta_path).unwrap();
        let mut meta = MetaInfo::read(&bytes);
        meta.crc_digest ^= 0xFFFF_FFFF;
        meta.last_crc_digest ^= 0xFFFF_FFFF;
        let mut buf = bytes;
        meta.write_full(&mut buf);
        std::fs::write(meta_path, &buf).unwrap();
    }

    #[test]
    fn recover_strategy_reconstructs_intact_data_after_meta_corruption() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("s6");
        let meta_path = dir.path().join("s6.crc");

        {
            let mut e = Engine::open(
                "s6",
                data_path.clone(),
                meta_path.clone(),
                Mode::SingleProcess,
                None,
                &DiscardOnError,
            )
            .unwrap();
            for i in 0..10 {
                let k = format!("k{i}");
                let v = format!("v{i}");
                e.set(k.as_bytes(), Bytes::from(v.into_bytes()), &DiscardOnError).unwrap();
            }
        }

        corrupt_meta_digests(&meta_path);

        let mut recovered = Engine::open(
            "s6",
            data_path,
            meta_path,
            Mode::SingleProcess,
            None,
            &AlwaysRecover,
        )
        .unwrap();

        assert_eq!(recovered.count(&DiscardOnError).unwrap(), 10);
        for i in 0..10 {
            let k = format!("k{i}");
            let expected = format!("v{i}");
            assert_eq!(
                recovered.get(k.as_bytes(), &DiscardOnError).unwrap().as_deref(),
                Some(expected.as_bytes())
            );
        }
    }

    #[test]
    fn discard_strategy_drops_everything_on_the_same_corruption() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("s6b");
        let meta_path = dir.path().join("s6b.crc");

        {
            let mut e = Engine::open(
                "s6b",
                data_path.clone(),
                meta_path.clone(),
                Mode::SingleProcess,
                None,
                &DiscardOnError,
            )
            .unwrap();
            e.set(b"k", Bytes::from_static(b"v"), &DiscardOnError).unwrap();
        }

        corrupt_meta_digests(&meta_path);

        let mut discarded = Engine::open(
            "s6b",
            data_path,
            meta_path,
            Mode::SingleProcess,
            None,
            &DiscardOnError,
        )
        .unwrap();

        assert_eq!(discarded.count(&DiscardOnError).unwrap(), 0);
    }

    #[test]
    fn encrypted_and_plaintext_instances_agree_on_reads_but_not_on_disk_bytes() {
        let plain_dir = tempdir().unwrap();
        let enc_dir = tempdir().unwrap();
        let key = b"TheAESKey";

        let mut plain = open(plain_dir.path(), "s7", None);
        let mut enc = open(enc_dir.path(), "s7", Some(key));

        for i in 0..5 {
            let k = format!("k{i}");
            let v = format!("value number {i}");
            plain.set(k.as_bytes(), Bytes::from(v.clone().into_bytes()), &DiscardOnError).unwrap();
            enc.set(k.as_bytes(), Bytes::from(v.into_bytes()), &DiscardOnError).unwrap();
        }

        for i in 0..5 {
            let k = format!("k{i}");
            assert_eq!(
                plain.get(k.as_bytes(), &DiscardOnError).unwrap(),
                enc.get(k.as_bytes(), &DiscardOnError).unwrap()
            );
        }

        let plain_bytes = plain.files.data.as_slice().to_vec();
        let enc_bytes = enc.files.data.as_slice().to_vec();
        assert_ne!(plain_bytes, enc_bytes);
    }

    #[test]
    fn large_encrypted_value_round_trips_via_offset_storage() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s8", Some(b"TheAESKey"));
        let big_value: Vec<u8> = (0..(OFFSET_VALUE_THRESHOLD + 100))
            .map(|i| (i % 251) as u8)
            .collect();
        e.set(b"big", Bytes::from(big_value.clone()), &DiscardOnError).unwrap();

        match e.map.get(b"big".as_slice()).unwrap() {
            ValueSlot::Offset { .. } => {}
            ValueSlot::Owned(_) => panic!("expected a value above the threshold to be offset-stored"),
        }
        assert_eq!(
            e.get(b"big", &DiscardOnError).unwrap().as_deref(),
            Some(big_value.as_slice())
        );
    }

    #[test]
    fn trim_shrinks_an_oversized_file_without_losing_data() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s9", None);
        for i in 0..200 {
            let k = format!("key{i:04}");
            let v = format!("val{i:04}");
            e.set(k.as_bytes(), Bytes::from(v.into_bytes()), &DiscardOnError).unwrap();
        }
        let before: std::collections::HashMap<Bytes, Bytes> = e
            .map
            .iter()
            .map(|(k, v)| (k.clone(), e.resolve_value(v)))
            .collect();

        let big_size = e.files.data.size();
        e.trim(&DiscardOnError).unwrap();
        assert!(e.files.data.size() <= big_size);

        let after: std::collections::HashMap<Bytes, Bytes> = e
            .map
            .iter()
            .map(|(k, v)| (k.clone(), e.resolve_value(v)))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn empty_key_operations_are_rejected() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s10", None);
        assert!(!e.set(b"", Bytes::from_static(b"x"), &DiscardOnError).unwrap());
        assert!(!e.remove(b"", &DiscardOnError).unwrap());
    }

    #[test]
    fn rekey_reencrypts_existing_values_under_a_fresh_iv() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s11", Some(b"first-key-012345"));
        e.set(b"k", Bytes::from_static(b"secret value"), &DiscardOnError).unwrap();
        let iv_before = e.cached_meta.iv;

        e.rekey(Some(b"second-key-01234")).unwrap();

        assert_ne!(e.cached_meta.iv, iv_before);
        assert_eq!(
            e.get(b"k", &DiscardOnError).unwrap().as_deref(),
            Some(b"secret value".as_slice())
        );
    }

    #[test]
    fn rekey_preserves_large_offset_stored_values() {
        let dir = tempdir().unwrap();
        let mut e = open(dir.path(), "s12", Some(b"first-key-012345"));
        let big_value: Vec<u8> = (0..(OFFSET_VALUE_THRESHOLD + 200))
            .map(|i| (i % 241) as u8)
            .collect();
        e.set(b"big", Bytes::from(big_value.clone()), &DiscardOnError).unwrap();
        assert!(matches!(
            e.map.get(b"big".as_slice()).unwrap(),
            ValueSlot::Offset { .. }
        ));

        e.rekey(Some(b"second-key-01234")).unwrap();

        assert_eq!(
            e.get(b"big", &DiscardOnError).unwrap().as_deref(),
            Some(big_value.as_slice())
        );
    }
}

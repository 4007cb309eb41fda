//! # duramap-types: shared types for duramap
//!
//! This crate contains the small value-level types shared across the
//! `duramap` workspace so that `duramap-crypto`, `duramap-io`, and
//! `duramap-storage` can agree on vocabulary without depending on each
//! other's internals:
//! - Stored values ([`Value`])
//! - Process-sharing mode ([`Mode`])
//! - Sync granularity ([`SyncFlag`])
//! - Recoverable load failures and how callers resolve them ([`ErrorKind`], [`RecoverStrategy`])
//! - Log severity ([`LogLevel`])

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A value that can be stored under a key.
///
/// Mirrors the scalar set a record's value bytes can decode to: booleans
/// and numeric scalars encode to their varint/fixed forms directly;
/// strings and byte vectors encode as a nested `<varint len><bytes>` pair
/// inside the record's value bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Bytes),
}

impl Value {
    /// Returns a short, stable name for the value's kind — used in log
    /// lines and error messages, never in the on-disk format.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

/// Whether an instance expects to share its data file with other
/// processes.
///
/// `MultiProcess` pays for every public operation to reconcile against
/// the meta file and to take the process-level file lock; `SingleProcess`
/// skips both, relying only on the in-process thread lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    SingleProcess,
    MultiProcess,
}

impl Mode {
    pub fn is_multi_process(self) -> bool {
        matches!(self, Mode::MultiProcess)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::SingleProcess => write!(f, "single-process"),
            Mode::MultiProcess => write!(f, "multi-process"),
        }
    }
}

/// Requested durability for [`msync`](https://man7.org/linux/man-pages/man2/msync.2.html)-style flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFlag {
    /// Block until the OS confirms the pages are on stable storage.
    Sync,
    /// Schedule the flush and return immediately.
    Async,
}

/// The two recoverable failure conditions the load protocol can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `CRC32(data[4..4+actualSize])` didn't match the meta file's digest.
    CrcFail,
    /// `actualSize` is inconsistent with the data file's length.
    FileLengthError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::CrcFail => write!(f, "CRC mismatch"),
            ErrorKind::FileLengthError => write!(f, "file length error"),
        }
    }
}

/// A caller's resolution for a recoverable load failure, returned from an
/// installed error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverStrategy {
    /// Clip `actualSize` to what the file actually holds and load as
    /// much as can be recovered.
    Recover,
    /// Treat the file as empty; its prior contents are discarded on the
    /// next write.
    Discard,
}

/// Log severity passed to an installed [log handler](https://docs.rs/tracing).
///
/// Mirrors `tracing`'s own level set so a caller-installed handler can be
/// driven from the same `tracing::Subscriber` machinery the rest of the
/// crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

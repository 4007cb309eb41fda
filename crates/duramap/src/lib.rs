//! # duramap
//!
//! An embedded, single-file key-value store for small configuration and
//! user-preference data, backed by a memory-mapped file. Optimized for
//! frequent writes of small values from one or more concurrent
//! processes, with crash safety and optional AES-128-CFB encryption.
//!
//! The store behaves as an ordered append-only log of mutations on disk
//! while presenting an unordered map in memory: the latest write for a
//! key wins. A full-rewrite compaction keeps the file bounded as old
//! records become dead, and every mutation refreshes a small `.crc`
//! sidecar file that other processes use to detect changes without
//! re-reading the whole data file.
//!
//! # Quick start
//!
//! ```
//! use duramap::{Config, Instance};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = Config::new(dir.path());
//! let store = Instance::open(&config, "preferences").unwrap();
//!
//! store.set_string("username", "ada");
//! store.set_i32("retry_count", 3);
//!
//! assert_eq!(store.get_string("username").as_deref(), Some("ada"));
//! assert_eq!(store.get_i32("retry_count", 0), 3);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       duramap (facade)                        │
//! │   Instance, Config, callback traits, get_*/set_* surface       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  duramap-storage         │  duramap-io        │ duramap-crypto │
//! │  varint/mini-pb codec,   │  growable mmap'd   │  CRC32,        │
//! │  meta-file sidecar,      │  data file,        │  AES-128-CFB   │
//! │  registry, engine        │  recursive lock    │  crypter       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        duramap-types                         │
//! │         Value, Mode, SyncFlag, ErrorKind, LogLevel            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`Instance`] / [`Config`] — the main API: open a store, read and
//!   write scalar, string, and byte values.
//! - `handlers` — process-global logging, error-recovery, and
//!   content-change callback hooks layered on top of `tracing`.

mod config;
mod handlers;
mod instance;

pub use config::Config;
pub use duramap_storage::EngineError;
pub use duramap_types::{ErrorKind, LogLevel, Mode, RecoverStrategy, SyncFlag, Value};
pub use handlers::{
    ContentChangeHandler, ErrorHandler, LogHandler, clear_content_change_handler,
    clear_error_handler, clear_log_handler, set_content_change_handler, set_error_handler,
    set_log_handler,
};
pub use instance::{Instance, initialize_default_root};

//! # duramap-storage: the append-only record format and engine
//!
//! Everything needed to turn a mapped file and its meta sidecar into a
//! key/value store:
//!
//! - [`varint`] / [`record`] / [`value_codec`] — the on-disk wire format.
//! - [`meta`] — the `<data>.crc` sidecar layout.
//! - [`registry`] — path-safety rules and the process-wide instance map.
//! - [`engine`] — the state machine tying it all together: load,
//!   append, compaction, and cross-process reconciliation.

mod error;
pub mod engine;
pub mod meta;
pub mod record;
pub mod registry;
pub mod value_codec;
pub mod varint;

pub use engine::{DiscardOnError, Engine, ErrorHandler, ValueSlot, OFFSET_VALUE_THRESHOLD};
pub use error::{CodecError, EngineError};
pub use meta::{MetaInfo, MetaVersion};
pub use registry::Registry;

//! Error types for the record codec and the storage engine.

/// Failures decoding a varint, fixed-width field, or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The input ended before a field could be fully read.
    #[error("truncated input")]
    Truncated,
    /// A varint exceeded 10 bytes, or a length prefix was nonsensical
    /// (e.g. larger than the remaining buffer).
    #[error("malformed encoding: {reason}")]
    Malformed { reason: &'static str },
}

/// Failures from the storage engine's public operations.
///
/// Data-file corruption (CRC mismatch, `actualSize` past the file's
/// length) is not represented here: it is reported through the
/// `ErrorHandler`/`ErrorKind`/`RecoverStrategy` callback (spec.md
/// §4.8.2 step 4), which always leaves the engine in a valid state
/// (recovered or discarded) rather than failing the call outright.
/// Record/value decode failures are likewise not surfaced here — the
/// core decodes only its own previously-written bytes during
/// compaction (a decode failure there means self-corruption, not a
/// reportable error) and the facade's typed getters discard decode
/// failures in favor of returning the caller's default value.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error")]
    Io(#[from] duramap_io::IoError),

    #[error("empty key is not a valid record key")]
    EmptyKey,
}

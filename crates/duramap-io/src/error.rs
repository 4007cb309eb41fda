//! I/O error types.

/// Errors from the memory-mapped file and file-lock layer.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Underlying OS I/O error (open, ftruncate, mmap, msync, flock, ...).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

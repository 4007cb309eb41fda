//! Process-global callback hooks layered on top of `tracing`.
//!
//! None of these are required — every `Instance` works with no handler
//! installed, falling back to `tracing` alone for logging and
//! [`duramap_storage::DiscardOnError`] for recovery decisions. Installing
//! one replaces the global hook for every `Instance` in the process, same
//! as the source's process-wide callback registration.

use std::sync::{Arc, RwLock};

use duramap_storage::engine::{DiscardOnError, ErrorHandler as EngineErrorHandler};
use duramap_types::{ErrorKind, LogLevel, RecoverStrategy};

/// A process-installed sink for engine log events, layered on top of
/// (not replacing) the crate's own `tracing` instrumentation.
pub trait LogHandler: Send + Sync {
    fn on_log(&self, level: LogLevel, file: &str, line: u32, message: &str);
}

/// A process-installed policy for recoverable load failures. Mirrors
/// [`duramap_storage::ErrorHandler`] at the public API boundary.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, id: &str, kind: ErrorKind) -> RecoverStrategy;
}

/// A process-installed hook fired after another process's write becomes
/// visible to this one via cross-process reconciliation.
pub trait ContentChangeHandler: Send + Sync {
    fn on_content_changed(&self, id: &str);
}

static LOG_HANDLER: RwLock<Option<Arc<dyn LogHandler>>> = RwLock::new(None);
static ERROR_HANDLER: RwLock<Option<Arc<dyn ErrorHandler>>> = RwLock::new(None);
static CONTENT_CHANGE_HANDLER: RwLock<Option<Arc<dyn ContentChangeHandler>>> = RwLock::new(None);

pub fn set_log_handler(handler: impl LogHandler + 'static) {
    *LOG_HANDLER.write().unwrap() = Some(Arc::new(handler));
}

pub fn clear_log_handler() {
    *LOG_HANDLER.write().unwrap() = None;
}

pub fn set_error_handler(handler: impl ErrorHandler + 'static) {
    *ERROR_HANDLER.write().unwrap() = Some(Arc::new(handler));
}

pub fn clear_error_handler() {
    *ERROR_HANDLER.write().unwrap() = None;
}

pub fn set_content_change_handler(handler: impl ContentChangeHandler + 'static) {
    *CONTENT_CHANGE_HANDLER.write().unwrap() = Some(Arc::new(handler));
}

pub fn clear_content_change_handler() {
    *CONTENT_CHANGE_HANDLER.write().unwrap() = None;
}

pub(crate) fn emit_log(level: LogLevel, file: &str, line: u32, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(file, line, "{message}"),
        LogLevel::Info => tracing::info!(file, line, "{message}"),
        LogLevel::Warn => tracing::warn!(file, line, "{message}"),
        LogLevel::Error => tracing::error!(file, line, "{message}"),
    }
    if let Some(handler) = LOG_HANDLER.read().unwrap().as_ref() {
        handler.on_log(level, file, line, message);
    }
}

pub(crate) fn notify_content_changed(id: &str) {
    if let Some(handler) = CONTENT_CHANGE_HANDLER.read().unwrap().as_ref() {
        handler.on_content_changed(id);
    }
}

/// Adapts the process-installed [`ErrorHandler`] to the engine's own
/// error-handler trait, falling back to
/// [`duramap_storage::DiscardOnError`] when none is installed.
pub(crate) struct GlobalErrorHandlerAdapter;

impl EngineErrorHandler for GlobalErrorHandlerAdapter {
    fn on_error(&self, id: &str, kind: ErrorKind) -> RecoverStrategy {
        match ERROR_HANDLER.read().unwrap().as_ref() {
            Some(handler) => handler.on_error(id, kind),
            None => DiscardOnError.on_error(id, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingErrorHandler {
        seen: Mutex<Vec<(String, ErrorKind)>>,
    }

    impl ErrorHandler for RecordingErrorHandler {
        fn on_error(&self, id: &str, kind: ErrorKind) -> RecoverStrategy {
            self.seen.lock().unwrap().push((id.to_string(), kind));
            RecoverStrategy::Recover
        }
    }

    #[test]
    fn adapter_dispatches_to_installed_handler() {
        let handler = Arc::new(RecordingErrorHandler {
            seen: Mutex::new(Vec::new()),
        });
        *ERROR_HANDLER.write().unwrap() = Some(handler.clone());

        let adapter = GlobalErrorHandlerAdapter;
        let strategy = adapter.on_error("my-id", ErrorKind::FileLengthError);
        assert_eq!(strategy, RecoverStrategy::Recover);
        assert_eq!(
            handler.seen.lock().unwrap().as_slice(),
            &[("my-id".to_string(), ErrorKind::FileLengthError)]
        );
        clear_error_handler();
    }

    #[test]
    fn adapter_falls_back_to_discard_with_no_handler_installed() {
        clear_error_handler();
        let adapter = GlobalErrorHandlerAdapter;
        assert_eq!(
            adapter.on_error("some-id", ErrorKind::CrcFail),
            RecoverStrategy::Discard
        );
    }

    #[test]
    fn content_change_handler_fires_when_installed() {
        static FIRED: AtomicBool = AtomicBool::new(false);
        struct Flag;
        impl ContentChangeHandler for Flag {
            fn on_content_changed(&self, _id: &str) {
                FIRED.store(true, Ordering::SeqCst);
            }
        }
        set_content_change_handler(Flag);
        notify_content_changed("id");
        assert!(FIRED.load(Ordering::SeqCst));
        clear_content_change_handler();
    }
}

//! Instance configuration.

use std::path::{Path, PathBuf};

use duramap_types::Mode;
use serde::{Deserialize, Serialize};

/// Configuration for one [`crate::Instance::open`] call.
///
/// Construction is programmatic rather than file-loaded — there is no
/// CLI or cluster configuration surface in scope here — but the struct
/// is still `serde`-round-trippable for embedders that want to persist
/// a chosen root/mode alongside their own application config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub(crate) root: PathBuf,
    pub(crate) mode: Mode,
    pub(crate) read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) encryption_key: Option<Vec<u8>>,
}

impl Config {
    /// A config rooted at `root`, single-process, unencrypted.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Config {
            root: root.as_ref().to_path_buf(),
            mode: Mode::SingleProcess,
            read_only: false,
            encryption_key: None,
        }
    }

    #[must_use]
    pub fn multi_process(mut self) -> Self {
        self.mode = Mode::MultiProcess;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn encrypted(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_single_process_unencrypted() {
        let config = Config::new("/tmp/duramap-test");
        assert_eq!(config.mode(), Mode::SingleProcess);
        assert!(!config.is_read_only());
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn builder_methods_compose() {
        let config = Config::new("/tmp/duramap-test")
            .multi_process()
            .read_only()
            .encrypted(b"0123456789abcdef".to_vec());
        assert_eq!(config.mode(), Mode::MultiProcess);
        assert!(config.is_read_only());
        assert_eq!(config.encryption_key.as_deref(), Some(b"0123456789abcdef".as_slice()));
    }
}

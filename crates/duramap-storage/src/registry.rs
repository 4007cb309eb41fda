//! Process-wide interned mapping from `(id, root)` to a single live
//! instance, plus the filesystem-path-safety rules for instance ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

/// Characters that cannot appear verbatim in a filename on at least one
/// of the platforms this store targets.
const UNSAFE_CHARACTERS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Returns `true` if `id` contains any filesystem-unsafe character.
pub fn has_unsafe_characters(id: &str) -> bool {
    id.chars().any(|c| UNSAFE_CHARACTERS.contains(&c))
}

/// Hex-encoded MD5 of `input`, used both for the registry key of a
/// non-default root and for turning an unsafe id into a safe filename.
pub fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Resolves the on-disk data-file path for `(id, root)`.
///
/// Ids containing unsafe characters are hashed into a
/// `specialCharacter/<md5>` subdirectory of `root` instead of being used
/// as a literal filename.
pub fn data_file_path(root: &Path, id: &str) -> PathBuf {
    if has_unsafe_characters(id) {
        root.join("specialCharacter").join(md5_hex(id))
    } else {
        root.join(id)
    }
}

/// Derives the `<data>.crc` meta-file path from a data-file path.
pub fn meta_file_path(data_path: &Path) -> PathBuf {
    let mut os_string = data_path.as_os_str().to_owned();
    os_string.push(".crc");
    PathBuf::from(os_string)
}

/// The key under which an instance is interned in the process-wide
/// registry: the bare id for the default root, else an MD5 of
/// `<root>/<id>` so two different roots never collide.
fn registry_key(id: &str, root: &Path, is_default_root: bool) -> String {
    if is_default_root {
        id.to_string()
    } else {
        md5_hex(&format!("{}/{}", root.display(), id))
    }
}

/// A process-wide registry of live instances, generic over the instance
/// type `T` so `duramap-storage`'s tests can exercise it without
/// depending on the facade crate's `Instance`.
pub struct Registry<T> {
    instances: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the already-open instance for `(id, root)`, if any.
    pub fn get(&self, id: &str, root: &Path, is_default_root: bool) -> Option<Arc<T>> {
        let key = registry_key(id, root, is_default_root);
        self.instances.lock().unwrap().get(&key).cloned()
    }

    /// Inserts a freshly opened instance, returning the winner if
    /// another thread raced to open the same `(id, root)` first — the
    /// registry never holds two live instances for the same key.
    pub fn get_or_insert_with(
        &self,
        id: &str,
        root: &Path,
        is_default_root: bool,
        make: impl FnOnce() -> Arc<T>,
    ) -> Arc<T> {
        let key = registry_key(id, root, is_default_root);
        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.get(&key) {
            return Arc::clone(existing);
        }
        let instance = make();
        instances.insert(key, Arc::clone(&instance));
        instance
    }

    /// Removes `(id, root)` from the registry, e.g. on `close()`.
    pub fn remove(&self, id: &str, root: &Path, is_default_root: bool) {
        let key = registry_key(id, root, is_default_root);
        self.instances.lock().unwrap().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_root_key_is_bare_id() {
        let root = Path::new("/default/root");
        assert_eq!(registry_key("my-store", root, true), "my-store");
    }

    #[test]
    fn non_default_root_key_is_hashed() {
        let root = Path::new("/other/root");
        let key = registry_key("my-store", root, false);
        assert_ne!(key, "my-store");
        assert_eq!(key.len(), 32); // md5 hex digest length
    }

    #[test]
    fn unsafe_characters_are_detected() {
        assert!(has_unsafe_characters("weird:id"));
        assert!(has_unsafe_characters("a/b"));
        assert!(!has_unsafe_characters("plain-id_123"));
    }

    #[test]
    fn unsafe_id_maps_to_special_character_subdir() {
        let root = Path::new("/root");
        let path = data_file_path(root, "weird:id");
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "specialCharacter");
    }

    #[test]
    fn safe_id_maps_directly_under_root() {
        let root = Path::new("/root");
        let path = data_file_path(root, "plain-id");
        assert_eq!(path, root.join("plain-id"));
    }

    #[test]
    fn meta_path_appends_crc_suffix() {
        let data_path = Path::new("/root/plain-id");
        assert_eq!(meta_file_path(data_path), PathBuf::from("/root/plain-id.crc"));
    }

    #[test]
    fn registry_prevents_duplicate_live_instances() {
        let registry: Registry<u32> = Registry::new();
        let root = Path::new("/root");
        let first = registry.get_or_insert_with("id", root, true, || Arc::new(1));
        let second = registry.get_or_insert_with("id", root, true, || Arc::new(2));
        assert_eq!(*first, 1);
        assert_eq!(*second, 1);
        assert_eq!(registry.len(), 1);

        registry.remove("id", root, true);
        assert!(registry.is_empty());
    }
}

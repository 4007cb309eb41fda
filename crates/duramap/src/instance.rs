//! The public handle to one open key/value store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use duramap_storage::engine::Engine;
use duramap_storage::registry::{self, Registry};
use duramap_storage::EngineError;
use duramap_types::{LogLevel, SyncFlag, Value};

use crate::config::Config;
use crate::handlers::{self, GlobalErrorHandlerAdapter};

static REGISTRY: OnceLock<Registry<Mutex<Engine>>> = OnceLock::new();
static DEFAULT_ROOT: OnceLock<PathBuf> = OnceLock::new();

fn registry() -> &'static Registry<Mutex<Engine>> {
    REGISTRY.get_or_init(Registry::default)
}

/// Installs the process-wide default root used by [`Instance::open_default`].
/// Analogous to the source's process-startup `initialize` call.
pub fn initialize_default_root(root: impl Into<PathBuf>) {
    let _ = DEFAULT_ROOT.set(root.into());
}

/// An opened, interned handle to a single `(id, root)` store.
///
/// Cloning an `Instance` is cheap and shares the same underlying engine —
/// every clone sees the same data, the same as re-opening the same id
/// from the registry would.
#[derive(Clone)]
pub struct Instance {
    id: String,
    engine: Arc<Mutex<Engine>>,
    last_known_sequence: Arc<AtomicU32>,
    read_only: bool,
}

impl Instance {
    /// Opens (or returns the already-open, interned) instance for `id`
    /// under `config.root()`.
    pub fn open(config: &Config, id: &str) -> Result<Instance, EngineError> {
        let is_default_root = DEFAULT_ROOT.get().map(|r| r.as_path()) == Some(config.root());
        Self::open_at(config, id, config.root().to_path_buf(), is_default_root)
    }

    /// Opens `id` under the process-wide default root installed via
    /// [`initialize_default_root`].
    pub fn open_default(mode: duramap_types::Mode, id: &str) -> Result<Instance, EngineError> {
        let root = DEFAULT_ROOT
            .get()
            .cloned()
            .expect("initialize_default_root must be called before Instance::open_default");
        let config = Config::new(&root);
        let config = if mode.is_multi_process() {
            config.multi_process()
        } else {
            config
        };
        Self::open_at(&config, id, root, true)
    }

    fn open_at(
        config: &Config,
        id: &str,
        root: PathBuf,
        is_default_root: bool,
    ) -> Result<Instance, EngineError> {
        let engine_id = id.to_string();
        let mode = config.mode();
        let key = config.encryption_key.clone();

        let engine = registry().get_or_insert_with(id, &root, is_default_root, || {
            let data_path = registry::data_file_path(&root, id);
            if let Some(parent) = data_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let meta_path = registry::meta_file_path(&data_path);
            let opened = Engine::open(
                &engine_id,
                data_path,
                meta_path,
                mode,
                key.as_deref(),
                &GlobalErrorHandlerAdapter,
            );
            Arc::new(Mutex::new(
                opened.expect("duramap instance failed to open"),
            ))
        });

        let sequence = engine.lock().unwrap().sequence();
        Ok(Instance {
            id: id.to_string(),
            engine,
            last_known_sequence: Arc::new(AtomicU32::new(sequence)),
            read_only: config.is_read_only(),
        })
    }

    /// Read-only instances reject every mutating call with `false`/no-op
    /// instead of touching the engine, matching the `read_only` mode
    /// flag from the data model (spec.md §3).
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn check_content_changed(&self) {
        let current = self.engine.lock().unwrap().sequence();
        let previous = self.last_known_sequence.swap(current, Ordering::SeqCst);
        if previous != current {
            handlers::notify_content_changed(&self.id);
        }
    }

    fn log_engine_error(&self, op: &str, err: &EngineError) {
        handlers::emit_log(
            LogLevel::Error,
            file!(),
            line!(),
            &format!("{op} failed for instance \"{}\": {err}", self.id),
        );
    }

    fn set_raw(&self, key: &str, value: Bytes) -> bool {
        if key.is_empty() || self.read_only {
            return false;
        }
        let mut engine = self.engine.lock().unwrap();
        let result = engine.set(key.as_bytes(), value, &GlobalErrorHandlerAdapter);
        drop(engine);
        self.check_content_changed();
        match result {
            Ok(ok) => ok,
            Err(err) => {
                self.log_engine_error("set", &err);
                false
            }
        }
    }

    fn get_raw(&self, key: &str) -> Option<Bytes> {
        let mut engine = self.engine.lock().unwrap();
        let result = engine.get(key.as_bytes(), &GlobalErrorHandlerAdapter);
        drop(engine);
        self.check_content_changed();
        match result {
            Ok(value) => value,
            Err(err) => {
                self.log_engine_error("get", &err);
                None
            }
        }
    }

    fn set_value(&self, key: &str, value: Value) -> bool {
        self.set_raw(key, Bytes::from(duramap_storage::value_codec::encode_value(&value)))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> bool {
        self.set_value(key, Value::Bool(value))
    }
    pub fn set_i32(&self, key: &str, value: i32) -> bool {
        self.set_value(key, Value::I32(value))
    }
    pub fn set_u32(&self, key: &str, value: u32) -> bool {
        self.set_value(key, Value::U32(value))
    }
    pub fn set_i64(&self, key: &str, value: i64) -> bool {
        self.set_value(key, Value::I64(value))
    }
    pub fn set_u64(&self, key: &str, value: u64) -> bool {
        self.set_value(key, Value::U64(value))
    }
    pub fn set_f32(&self, key: &str, value: f32) -> bool {
        self.set_value(key, Value::F32(value))
    }
    pub fn set_f64(&self, key: &str, value: f64) -> bool {
        self.set_value(key, Value::F64(value))
    }
    pub fn set_string(&self, key: &str, value: impl Into<String>) -> bool {
        self.set_value(key, Value::String(value.into()))
    }
    pub fn set_bytes(&self, key: &str, value: impl Into<Bytes>) -> bool {
        self.set_value(key, Value::Bytes(value.into()))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_bool(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_i32(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_u32(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_i64(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_u64(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_f32(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_f64(&v).ok())
            .unwrap_or(default)
    }
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_string(&v).ok())
    }
    pub fn get_bytes(&self, key: &str) -> Option<Bytes> {
        self.get_raw(key)
            .and_then(|v| duramap_storage::value_codec::decode_bytes(&v).ok())
    }

    pub fn remove(&self, key: &str) -> bool {
        if self.read_only {
            return false;
        }
        let mut engine = self.engine.lock().unwrap();
        let result = engine.remove(key.as_bytes(), &GlobalErrorHandlerAdapter);
        drop(engine);
        self.check_content_changed();
        match result {
            Ok(removed) => removed,
            Err(err) => {
                self.log_engine_error("remove", &err);
                false
            }
        }
    }

    pub fn remove_many(&self, keys: &[&str]) -> bool {
        if self.read_only {
            return false;
        }
        let raw_keys: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        let mut engine = self.engine.lock().unwrap();
        let result = engine.remove_many(&raw_keys, &GlobalErrorHandlerAdapter);
        drop(engine);
        self.check_content_changed();
        match result {
            Ok(()) => true,
            Err(err) => {
                self.log_engine_error("remove_many", &err);
                false
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut engine = self.engine.lock().unwrap();
        engine
            .contains_key(key.as_bytes(), &GlobalErrorHandlerAdapter)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        let mut engine = self.engine.lock().unwrap();
        engine.count(&GlobalErrorHandlerAdapter).unwrap_or(0)
    }

    pub fn total_size(&self) -> usize {
        let mut engine = self.engine.lock().unwrap();
        engine.total_size_bytes(&GlobalErrorHandlerAdapter).unwrap_or(0)
    }

    pub fn actual_size(&self) -> u32 {
        let mut engine = self.engine.lock().unwrap();
        engine.actual_size_bytes(&GlobalErrorHandlerAdapter).unwrap_or(0)
    }

    pub fn all_keys(&self) -> Vec<String> {
        let mut engine = self.engine.lock().unwrap();
        engine
            .all_keys(&GlobalErrorHandlerAdapter)
            .unwrap_or_default()
            .into_iter()
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }

    pub fn clear_all(&self) -> bool {
        if self.read_only {
            return false;
        }
        let mut engine = self.engine.lock().unwrap();
        let result = engine.clear_all();
        drop(engine);
        self.check_content_changed();
        result.is_ok()
    }

    pub fn trim(&self) -> bool {
        if self.read_only {
            return false;
        }
        let mut engine = self.engine.lock().unwrap();
        engine.trim(&GlobalErrorHandlerAdapter).is_ok()
    }

    pub fn sync(&self, flag: SyncFlag) -> bool {
        let mut engine = self.engine.lock().unwrap();
        engine.sync(flag).is_ok()
    }

    /// Re-encrypts (or decrypts, with `new_key: None`) every value under a
    /// fresh IV via a full rewrite.
    pub fn rekey(&self, new_key: Option<&[u8]>) -> bool {
        if self.read_only {
            return false;
        }
        let mut engine = self.engine.lock().unwrap();
        engine.rekey(new_key).is_ok()
    }

    /// Drops this instance from the process-wide registry; any other
    /// `Instance` clones sharing the same engine keep working, but a
    /// later `open` for the same id opens a fresh engine from disk.
    pub fn close(self, root: &std::path::Path, is_default_root: bool) {
        registry().remove(&self.id, root, is_default_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(root: &std::path::Path, id: &str) -> Instance {
        let config = Config::new(root);
        Instance::open(&config, id).unwrap()
    }

    #[test]
    fn set_and_get_scalars_roundtrip() {
        let dir = tempdir().unwrap();
        let inst = open(dir.path(), "scalars");
        assert!(inst.set_i32("count", -7));
        assert_eq!(inst.get_i32("count", 0), -7);
        assert!(inst.set_bool("flag", true));
        assert!(inst.get_bool("flag", false));
        assert!(inst.set_string("name", "duramap"));
        assert_eq!(inst.get_string("name").as_deref(), Some("duramap"));
    }

    #[test]
    fn missing_key_returns_default() {
        let dir = tempdir().unwrap();
        let inst = open(dir.path(), "missing");
        assert_eq!(inst.get_i32("nope", 42), 42);
        assert!(inst.get_string("nope").is_none());
    }

    #[test]
    fn remove_drops_a_key() {
        let dir = tempdir().unwrap();
        let inst = open(dir.path(), "remove");
        inst.set_i32("k", 1);
        assert!(inst.contains_key("k"));
        assert!(inst.remove("k"));
        assert!(!inst.contains_key("k"));
    }

    #[test]
    fn reopening_the_same_id_returns_the_interned_instance() {
        let dir = tempdir().unwrap();
        let first = open(dir.path(), "shared");
        first.set_i32("x", 10);
        let second = open(dir.path(), "shared");
        assert_eq!(second.get_i32("x", -1), 10);
    }

    #[test]
    fn clear_all_empties_the_store() {
        let dir = tempdir().unwrap();
        let inst = open(dir.path(), "clear");
        inst.set_i32("a", 1);
        inst.set_i32("b", 2);
        assert!(inst.clear_all());
        assert_eq!(inst.count(), 0);
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempdir().unwrap();
        let inst = open(dir.path(), "emptykey");
        assert!(!inst.set_string("", "value"));
    }

    #[test]
    fn read_only_instance_rejects_every_mutation() {
        let dir = tempdir().unwrap();
        {
            let writer = open(dir.path(), "ro");
            writer.set_i32("k", 1);
            writer.close(dir.path(), false);
        }
        let config = Config::new(dir.path()).read_only();
        let reader = Instance::open(&config, "ro").unwrap();
        assert!(reader.is_read_only());
        assert_eq!(reader.get_i32("k", -1), 1);

        assert!(!reader.set_i32("k", 2));
        assert!(!reader.remove("k"));
        assert!(!reader.remove_many(&["k"]));
        assert!(!reader.clear_all());
        assert!(!reader.trim());
        assert!(!reader.rekey(Some(b"newkey")));

        assert_eq!(reader.get_i32("k", -1), 1, "read-only rejection must not mutate state");
    }
}

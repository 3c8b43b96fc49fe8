//! Small persisted state: unlock counter, last peripheral, relay session token.
//!
//! Components never touch files directly; they are handed a [`KeyValueStore`].

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const UNLOCK_COUNT_KEY: &str = "streaming.unlock_count";
pub const ENABLE_TIME_KEY: &str = "streaming.enable_time";
pub const PERIPHERAL_ID_KEY: &str = "link.peripheral_id";
pub const RELAY_TOKEN_KEY: &str = "relay.token";

/// String-keyed, string-valued persistent store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Volatile store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON object, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(StoreError::from)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StoreError::from(err).into()),
        };
        debug!(path = %path.display(), entries = values.len(), "opened store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(values).map_err(StoreError::from)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(StoreError::from)?;
        std::fs::rename(&tmp, &self.path).map_err(StoreError::from)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

fn parse_u32(key: &str, value: Option<String>) -> Result<Option<u32>> {
    value
        .map(|v| {
            v.parse::<u32>().map_err(|_| {
                StoreError::InvalidValue {
                    key: key.to_string(),
                    value: v.clone(),
                }
                .into()
            })
        })
        .transpose()
}

/// Persisted, monotonically increasing streaming unlock counter.
///
/// Clones share one lock, so `next` is an atomic read-increment-write for
/// every holder of the same counter.
#[derive(Clone)]
pub struct UnlockCounter {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl UnlockCounter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn current(&self) -> Result<u32> {
        Ok(parse_u32(UNLOCK_COUNT_KEY, self.store.get(UNLOCK_COUNT_KEY)?)?.unwrap_or(0))
    }

    /// Increment, persist, and return the new value.
    pub fn next(&self) -> Result<u32> {
        let _guard = self.lock.lock();
        let value = self
            .current()?
            .checked_add(1)
            .ok_or_else(|| StoreError::CounterExhausted(UNLOCK_COUNT_KEY.to_string()))?;
        self.store.set(UNLOCK_COUNT_KEY, &value.to_string())?;
        Ok(value)
    }
}

impl std::fmt::Debug for UnlockCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockCounter").finish_non_exhaustive()
    }
}

/// Typed accessors for the remaining persisted fields.
pub fn load_enable_time(store: &dyn KeyValueStore) -> Result<Option<u32>> {
    parse_u32(ENABLE_TIME_KEY, store.get(ENABLE_TIME_KEY)?)
}

pub fn save_enable_time(store: &dyn KeyValueStore, enable_time: u32) -> Result<()> {
    store.set(ENABLE_TIME_KEY, &enable_time.to_string())
}

//! Persistent key/value storage for sessions.
//!
//! [`KeyValueStore`] is the minimal contract a backend has to satisfy.
//! [`SessionStorage`] layers the session record format on top of it: one
//! record per session under a namespaced key, each carrying its own absolute
//! expiry. Expired or unreadable records are deleted when encountered.

use crate::clock::Clock;
use crate::errors::MonitorError;
use crate::session::Session;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Prefix for every session record key.
pub const SESSION_KEY_PREFIX: &str = "network_test_session_";

/// Default retention, 30 days.
pub const DEFAULT_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

pub trait KeyValueStore: Send + Sync {
    fn set_item(&self, key: &str, value: &str) -> Result<(), MonitorError>;

    fn get_item(&self, key: &str) -> Result<Option<String>, MonitorError>;

    fn keys(&self) -> Result<Vec<String>, MonitorError>;

    fn remove_item(&self, key: &str) -> Result<(), MonitorError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn set_item(&self, key: &str, value: &str) -> Result<(), MonitorError> {
        (**self).set_item(key, value)
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, MonitorError> {
        (**self).get_item(key)
    }

    fn keys(&self) -> Result<Vec<String>, MonitorError> {
        (**self).keys()
    }

    fn remove_item(&self, key: &str) -> Result<(), MonitorError> {
        (**self).remove_item(key)
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, MonitorError>
    {
        self.items
            .lock()
            .map_err(|_| MonitorError::storage("memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn set_item(&self, key: &str, value: &str) -> Result<(), MonitorError> {
        self.items()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, MonitorError> {
        Ok(self.items()?.get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<String>, MonitorError> {
        Ok(self.items()?.keys().cloned().collect())
    }

    fn remove_item(&self, key: &str) -> Result<(), MonitorError> {
        self.items()?.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

const FILE_EXTENSION: &str = "json";

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, MonitorError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(MonitorError::storage(format!(
                "invalid storage key: {:?}",
                key
            )));
        }

        Ok(self.dir.join(format!("{}.{}", key, FILE_EXTENSION)))
    }
}

impl KeyValueStore for FileStore {
    fn set_item(&self, key: &str, value: &str) -> Result<(), MonitorError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, MonitorError> {
        let path = self.path_for(key)?;

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, MonitorError> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }

        Ok(keys)
    }

    fn remove_item(&self, key: &str) -> Result<(), MonitorError> {
        let path = self.path_for(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Envelope written for every session.
#[derive(Debug, Serialize, Deserialize)]
struct StoredItem<T> {
    data: T,
    timestamp: i64,
    #[serde(rename = "expiryTime")]
    expiry_time: i64,
}

/// Session persistence with expiry on top of a [`KeyValueStore`].
pub struct SessionStorage<K> {
    store: K,
    clock: Arc<dyn Clock>,
    retention_ms: i64,
}

impl<K: KeyValueStore> SessionStorage<K> {
    pub fn new(store: K, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, retention_ms: DEFAULT_RETENTION_MS }
    }

    pub fn with_retention(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    fn key_for(id: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, id)
    }

    pub fn save_session(&self, session: &Session) -> Result<(), MonitorError> {
        let now = self.clock.now_ms();
        let item = StoredItem {
            data: session,
            timestamp: now,
            expiry_time: now + self.retention_ms,
        };

        let json = serde_json::to_string(&item)?;
        self.store.set_item(&Self::key_for(session.id()), &json)
    }

    /// Load a session. Expired or unreadable records are deleted and
    /// reported as absent.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>, MonitorError> {
        let key = Self::key_for(id);
        let Some(raw) = self.store.get_item(&key)? else {
            return Ok(None);
        };

        match self.decode(&raw) {
            Some(session) => Ok(Some(session)),
            None => {
                self.store.remove_item(&key)?;
                Ok(None)
            }
        }
    }

    fn decode(&self, raw: &str) -> Option<Session> {
        let item: StoredItem<serde_json::Value> = match serde_json::from_str(raw)
        {
            Ok(item) => item,
            Err(e) => {
                warn!("Dropping unreadable session record: {}", e);
                return None;
            }
        };

        if self.clock.now_ms() > item.expiry_time {
            debug!("Dropping session record expired at {}", item.expiry_time);
            return None;
        }

        match serde_json::from_value::<Session>(item.data) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Dropping corrupt session record: {}", e);
                None
            }
        }
    }

    fn session_keys(&self) -> Result<Vec<String>, MonitorError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(SESSION_KEY_PREFIX))
            .collect())
    }

    /// All live sessions, newest start first.
    pub fn list_sessions(&self) -> Result<Vec<Session>, MonitorError> {
        let mut sessions = Vec::new();

        for key in self.session_keys()? {
            let id = &key[SESSION_KEY_PREFIX.len()..];
            if let Some(session) = self.get_session(id)? {
                sessions.push(session);
            }
        }

        sessions.sort_by_key(|s| std::cmp::Reverse(s.start_time()));
        Ok(sessions)
    }

    pub fn contains(&self, id: &str) -> Result<bool, MonitorError> {
        Ok(self.store.get_item(&Self::key_for(id))?.is_some())
    }

    pub fn remove_session(&self, id: &str) -> Result<(), MonitorError> {
        self.store.remove_item(&Self::key_for(id))
    }

    /// Delete every session record. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, MonitorError> {
        let keys = self.session_keys()?;
        for key in &keys {
            self.store.remove_item(key)?;
        }
        Ok(keys.len())
    }

    /// Pretty JSON array of sessions: the given ids, or every live session.
    pub fn export_json(
        &self,
        ids: Option<&[String]>,
    ) -> Result<String, MonitorError> {
        let sessions = match ids {
            Some(ids) => {
                let mut sessions = Vec::new();
                for id in ids {
                    if let Some(session) = self.get_session(id)? {
                        sessions.push(session);
                    }
                }
                sessions
            }
            None => self.list_sessions()?,
        };

        Ok(serde_json::to_string_pretty(&sessions)?)
    }

    /// Save every session in a JSON array produced by [`export_json`].
    ///
    /// [`export_json`]: SessionStorage::export_json
    pub fn import_json(&self, json: &str) -> Result<usize, MonitorError> {
        let sessions: Vec<Session> = serde_json::from_str(json).map_err(|e| {
            MonitorError::config(format!("Failed to import sessions: {}", e))
                .with_source(e)
        })?;

        for session in &sessions {
            self.save_session(session)?;
        }

        Ok(sessions.len())
    }
}

//! Configuration store: the cluster settings that decide whether toggleable
//! services should run.

use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::StoreError;

/// Point-in-time view of a set of settings, read in one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Boolean setting; absent or unparsable values fall back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match parse_bool(raw) {
            Some(value) => value,
            None => {
                warn!(key, value = raw, "Unparsable boolean setting, using default {}", default);
                default
            }
        }
    }

    /// True when the setting is absent or blank
    pub fn is_empty(&self, key: &str) -> bool {
        self.get(key).map(|v| v.trim().is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read access to the cluster settings
pub trait ConfigStore: Send + Sync {
    /// Read `keys` inside a single transaction. Keys without a stored value
    /// are simply absent from the result.
    fn snapshot(&self, keys: &[String]) -> Result<Settings, StoreError>;
}

/// Settings table in SQLite
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS config (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        debug!(path = %path.display(), "Config store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("config store connection poisoned".to_string()))
    }
}

impl ConfigStore for SqliteConfigStore {
    fn snapshot(&self, keys: &[String]) -> Result<Settings, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut values = HashMap::new();
        {
            let mut stmt = tx.prepare_cached("SELECT value FROM config WHERE name = ?1")?;
            for key in keys {
                let value: Option<String> = stmt.query_row([key], |row| row.get(0)).optional()?;
                if let Some(value) = value {
                    values.insert(key.clone(), value);
                }
            }
        }
        tx.commit()?;
        Ok(Settings::new(values))
    }
}

/// In-memory settings, for tests and for daemons without a settings database
#[derive(Default)]
pub struct StaticConfigStore {
    values: RwLock<HashMap<String, String>>,
    unavailable: RwLock<Option<String>>,
}

impl StaticConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }

    /// Make every read fail with `reason` until cleared with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        if let Ok(mut slot) = self.unavailable.write() {
            *slot = reason.map(str::to_string);
        }
    }
}

impl ConfigStore for StaticConfigStore {
    fn snapshot(&self, keys: &[String]) -> Result<Settings, StoreError> {
        if let Ok(slot) = self.unavailable.read() {
            if let Some(reason) = slot.as_ref() {
                return Err(StoreError::Unavailable(reason.clone()));
            }
        }
        let values = self
            .values
            .read()
            .map_err(|_| StoreError::Unavailable("settings lock poisoned".to_string()))?;
        Ok(Settings::new(
            keys.iter()
                .filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        ))
    }
}

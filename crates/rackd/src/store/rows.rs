//! Row store for expiring records such as DNS publications.
//!
//! Timestamps are RFC 3339 UTC text with a fixed precision, so they sort
//! lexicographically in time order and a plain `<` in SQL is a time
//! comparison.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::StoreError;

/// Canonical text form of a row timestamp
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Relational rows that expire
pub trait RowStore: Send + Sync {
    /// Delete every row of `table` whose `column` is strictly before
    /// `cutoff`, atomically. Returns the number of rows deleted.
    fn delete_older_than(
        &self,
        table: &str,
        column: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

pub struct SqliteRowStore {
    conn: Mutex<Connection>,
}

impl SqliteRowStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Row store opened");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Create `table` with an integer key and a timestamp column if missing.
    pub fn ensure_table(&self, table: &str, column: &str) -> Result<(), StoreError> {
        validate_identifier(table)?;
        validate_identifier(column)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    {column} TEXT NOT NULL
                )"
            ),
            [],
        )?;
        Ok(())
    }

    pub fn insert(&self, table: &str, column: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        validate_identifier(table)?;
        validate_identifier(column)?;
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO {table} ({column}) VALUES (?1)"),
            [format_timestamp(ts)],
        )?;
        Ok(())
    }

    pub fn count(&self, table: &str) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        let conn = self.lock()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("row store connection poisoned".to_string()))
    }
}

impl RowStore for SqliteRowStore {
    fn delete_older_than(
        &self,
        table: &str,
        column: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            &format!("DELETE FROM {table} WHERE {column} < ?1"),
            [format_timestamp(cutoff)],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are allowed.
fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteRowStore {
        let store = SqliteRowStore::from_connection(Connection::open_in_memory().unwrap());
        store.ensure_table("dns_publication", "created").unwrap();
        store
    }

    #[test]
    fn test_delete_is_strictly_before_cutoff() {
        let store = store();
        let cutoff = Utc::now();
        store.insert("dns_publication", "created", cutoff - Duration::seconds(1)).unwrap();
        store.insert("dns_publication", "created", cutoff).unwrap();
        store.insert("dns_publication", "created", cutoff + Duration::seconds(1)).unwrap();

        let deleted = store.delete_older_than("dns_publication", "created", cutoff).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("dns_publication").unwrap(), 2);
    }

    #[test]
    fn test_rejects_injected_identifiers() {
        let store = store();
        let err = store
            .delete_older_than("dns_publication; DROP TABLE x", "created", Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
        assert!(validate_identifier("_ok9").is_ok());
        assert!(validate_identifier("9bad").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_timestamps_sort_in_time_order() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(1500);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert!(format_timestamp(early).ends_with('Z'));
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let store = SqliteRowStore::from_connection(Connection::open_in_memory().unwrap());
        assert!(matches!(
            store.delete_older_than("nope", "created", Utc::now()),
            Err(StoreError::Sqlite(_))
        ));
    }
}

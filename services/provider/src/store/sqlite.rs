//! SQLite-backed record store.
//!
//! One row per record; the field map is stored as a JSON object so the
//! schema does not change when record types gain fields.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{Fields, RecordStore, StoreError};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("Record store schema initialized");
        Ok(())
    }

    fn read(conn: &Connection, key: &str) -> Result<Option<Fields>, StoreError> {
        let raw: Option<String> = conn
            .query_row("SELECT fields FROM records WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    fn write(conn: &Connection, key: &str, fields: &Fields) -> Result<(), StoreError> {
        let json = serde_json::to_string(fields)?;
        conn.execute(
            r#"
            INSERT INTO records (key, fields, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                fields = excluded.fields,
                updated_at = excluded.updated_at
            "#,
            params![key, json, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::read(&conn, key)
    }

    fn upsert(&self, key: &str, fields: &Fields) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::write(&conn, key, fields)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let removed = conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare("SELECT key, fields FROM records WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map(params![prefix, prefix.chars().count() as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&Fields>, new: &Fields) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        if Self::read(&tx, key)?.as_ref() != expected {
            return Ok(false);
        }
        Self::write(&tx, key, new)?;
        tx.commit()?;
        Ok(true)
    }
}

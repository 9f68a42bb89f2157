use crate::errors::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Record values live under `record:<id>`; the index lives under its own key,
/// outside the record namespace, so an id can never collide with it.
const RECORD_KEY_PREFIX: &str = "record:";
const INDEX_KEY: &str = "record-index";

const SCHEMA_SQL: &str =
    "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

/// Durable key-value storage for serialized records plus the ordered id index.
/// Values are opaque JSON text; typing happens one layer up in the repository.
#[derive(Debug)]
pub struct RecordStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl RecordStore {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Idempotent: seeds an empty index if none exists yet. Must run before
    /// any other operation is trusted.
    pub fn initialize(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
            params![INDEX_KEY, "[]"],
        )?;
        tracing::debug!(path = %self.db_path.display(), "record store initialized");
        Ok(())
    }

    pub fn get(&self, id: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![record_key(id)],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Writes the value and, for a first save, appends the id to the index.
    /// Both happen in one transaction so the index never references a value
    /// the same commit did not write.
    pub fn put(&self, id: &str, value: &str) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(AppError::from)?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![record_key(id), value],
        )?;

        let mut ids = read_index(&tx)?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            write_index(&tx, &ids)?;
        }

        tx.commit().map_err(AppError::from)?;
        Ok(())
    }

    /// Removes the value and the id's index slot. Absence is not an error.
    pub fn delete(&self, id: &str) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(AppError::from)?;
        tx.execute("DELETE FROM kv WHERE key = ?1", params![record_key(id)])?;

        let mut ids = read_index(&tx)?;
        let before = ids.len();
        ids.retain(|existing| existing != id);
        if ids.len() != before {
            write_index(&tx, &ids)?;
        }

        tx.commit().map_err(AppError::from)?;
        Ok(())
    }

    /// The ordered id index. Insertion order, never reordered.
    pub fn list_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![INDEX_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Deletes every record value and the index itself.
    pub fn clear(&self) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(AppError::from)?;
        tx.execute(
            "DELETE FROM kv WHERE key LIKE ?1",
            params![format!("{}%", RECORD_KEY_PREFIX)],
        )?;
        tx.execute("DELETE FROM kv WHERE key = ?1", params![INDEX_KEY])?;
        tx.commit().map_err(AppError::from)?;
        tracing::debug!(path = %self.db_path.display(), "record store cleared");
        Ok(())
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("store mutex poisoned".to_string()))
    }
}

fn record_key(id: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{id}")
}

fn read_index(tx: &Transaction<'_>) -> AppResult<Vec<String>> {
    let raw = tx
        .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![INDEX_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn write_index(tx: &Transaction<'_>, ids: &[String]) -> AppResult<()> {
    let json = serde_json::to_string(ids)?;
    tx.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![INDEX_KEY, json],
    )?;
    Ok(())
}

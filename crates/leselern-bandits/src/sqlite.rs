//! SQLite-Backend: eine Zeile pro (Identität, Arm), Upsert per `ON CONFLICT`.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::error::Result;
use crate::store::ModelBackend;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS bandit_model (
  identity TEXT NOT NULL,
  arm_id TEXT NOT NULL,
  model_json TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (identity, arm_id)
);
";

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Öffnet (oder erzeugt) die Datenbank und legt das Schema an.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| crate::BanditError::Persistence(e.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModelBackend for SqliteBackend {
    fn get(&self, identity: &str, arm_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT model_json FROM bandit_model WHERE identity=?1 AND arm_id=?2",
                params![identity, arm_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, identity: &str, arm_id: &str, record: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn().execute(
            "INSERT INTO bandit_model(identity, arm_id, model_json, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity, arm_id) DO UPDATE SET model_json=excluded.model_json, updated_at=excluded.updated_at",
            params![identity, arm_id, record, now],
        )?;
        Ok(())
    }

    fn arms_for(&self, identity: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT arm_id FROM bandit_model WHERE identity=?1 ORDER BY arm_id")?;
        let arms = stmt
            .query_map(params![identity], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(arms)
    }

    fn delete(&self, identity: &str, arm_id: Option<&str>) -> Result<usize> {
        let conn = self.conn();
        let removed = match arm_id {
            Some(arm) => conn.execute(
                "DELETE FROM bandit_model WHERE identity=?1 AND arm_id=?2",
                params![identity, arm],
            )?,
            None => conn.execute(
                "DELETE FROM bandit_model WHERE identity=?1",
                params![identity],
            )?,
        };
        Ok(removed)
    }
}

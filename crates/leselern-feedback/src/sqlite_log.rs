//! SQLite-backed [`SignalLog`].
//!
//! Each record is stored as JSON next to the columns needed for lookups.
//! Range queries pre-filter on millisecond columns and re-check exact bounds
//! after decoding.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::error::{FeedbackError, Result};
use crate::log::SignalLog;
use crate::signals::{Action, Impression};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS impression (
  id TEXT PRIMARY KEY,
  identity TEXT NOT NULL,
  book_id TEXT NOT NULL,
  shown_ms INTEGER NOT NULL,
  record_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS impression_lookup ON impression(identity, book_id, shown_ms);
CREATE TABLE IF NOT EXISTS action (
  id TEXT PRIMARY KEY,
  identity TEXT NOT NULL,
  book_id TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  record_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS action_ts ON action(ts_ms);
";

pub struct SqliteSignalLog {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteSignalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSignalLog").finish_non_exhaustive()
    }
}

fn millis(t: OffsetDateTime) -> i64 {
    i64::try_from(t.unix_timestamp_nanos().div_euclid(1_000_000)).unwrap_or(i64::MAX)
}

impl SqliteSignalLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| FeedbackError::Log(e.to_string()))?;
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

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads, changes and writes back one impression in a transaction.
    fn rewrite_impression(&self, id: &str, change: impl FnOnce(&mut Impression)) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT record_json FROM impression WHERE id=?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| FeedbackError::UnknownImpression(id.to_string()))?;
        let mut imp: Impression = serde_json::from_str(&json)?;
        change(&mut imp);
        tx.execute(
            "UPDATE impression SET record_json=?2 WHERE id=?1",
            params![id, serde_json::to_string(&imp)?],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl SignalLog for SqliteSignalLog {
    fn append_impression(&self, impression: &Impression) -> Result<()> {
        let json = serde_json::to_string(impression)?;
        self.conn().execute(
            "INSERT INTO impression(id, identity, book_id, shown_ms, record_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                impression.id,
                impression.identity,
                impression.book_id,
                millis(impression.shown_at),
                json
            ],
        )?;
        Ok(())
    }

    fn append_action(&self, action: &Action) -> Result<()> {
        let json = serde_json::to_string(action)?;
        self.conn().execute(
            "INSERT INTO action(id, identity, book_id, ts_ms, record_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                action.id,
                action.identity,
                action.book_id,
                millis(action.timestamp),
                json
            ],
        )?;
        Ok(())
    }

    fn impression(&self, id: &str) -> Result<Option<Impression>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record_json FROM impression WHERE id=?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(FeedbackError::from))
            .transpose()
    }

    fn impressions_for(
        &self,
        identity: &str,
        book_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Impression>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record_json FROM impression
             WHERE identity=?1 AND book_id=?2 AND shown_ms BETWEEN ?3 AND ?4
             ORDER BY shown_ms",
        )?;
        let rows = stmt
            .query_map(params![identity, book_id, millis(from), millis(to)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut found = Vec::with_capacity(rows.len());
        for json in rows {
            let imp: Impression = serde_json::from_str(&json)?;
            if imp.shown_at >= from && imp.shown_at <= to {
                found.push(imp);
            }
        }
        found.sort_by_key(|i| i.shown_at);
        Ok(found)
    }

    fn set_reward(&self, impression_id: &str, reward: f64, at: OffsetDateTime) -> Result<()> {
        self.rewrite_impression(impression_id, |imp| {
            imp.reward = Some(reward);
            imp.attributed_at = Some(at);
        })
    }

    fn clear_reward(&self, impression_id: &str) -> Result<()> {
        self.rewrite_impression(impression_id, |imp| {
            imp.reward = None;
            imp.attributed_at = None;
        })
    }

    fn actions_between(&self, from: OffsetDateTime, to: OffsetDateTime) -> Result<Vec<Action>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record_json FROM action WHERE ts_ms BETWEEN ?1 AND ?2 ORDER BY ts_ms",
        )?;
        let rows = stmt
            .query_map(params![millis(from), millis(to)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut found = Vec::with_capacity(rows.len());
        for json in rows {
            let action: Action = serde_json::from_str(&json)?;
            if action.timestamp >= from && action.timestamp <= to {
                found.push(action);
            }
        }
        found.sort_by_key(|a| a.timestamp);
        Ok(found)
    }

    fn rename_identity(&self, from: &str, to: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut moved = 0;
        for table in ["impression", "action"] {
            let mut stmt =
                tx.prepare(&format!("SELECT id, record_json FROM {table} WHERE identity=?1"))?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![from], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, json) in rows {
                let mut value: serde_json::Value = serde_json::from_str(&json)?;
                if let Some(record) = value.as_object_mut() {
                    record.insert("identity".into(), serde_json::Value::String(to.to_string()));
                }
                tx.execute(
                    &format!("UPDATE {table} SET identity=?2, record_json=?3 WHERE id=?1"),
                    params![id, to, value.to_string()],
                )?;
                moved += 1;
            }
        }
        tx.commit()?;
        Ok(moved)
    }
}

//! shellbox-history: persisted record of executions
//!
//! One row per request: the session it belongs to, the request as received
//! and the result as returned. Written by callers after they have a result;
//! the execution core never touches it.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// One recorded execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub request: JsonValue,
    pub response: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// SQLite history store (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct HistoryDb {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("History mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl HistoryDb {
    /// Open (creating if needed) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open history database")?;
        info!("Initializing history database at {:?}", path);

        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("History journal mode: {}", mode);
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT NOT NULL,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_session ON history(session_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record one execution, returning its row id
    pub async fn save(
        &self,
        session_id: &str,
        request: &JsonValue,
        response: &JsonValue,
    ) -> Result<i64> {
        let conn = Arc::clone(&self.conn);
        let session_id = session_id.to_string();
        let request = serde_json::to_string(request)?;
        let response = serde_json::to_string(response)?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO history (session_id, request, response) VALUES (?1, ?2, ?3)",
                params![&session_id, &request, &response],
            )?;
            let id = conn.last_insert_rowid();
            debug!("Saved history entry {} for session {}", id, session_id);
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Most recent entries first, optionally capped
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        self.query(None, limit).await
    }

    /// Entries of one session, most recent first
    pub async fn list_session(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        self.query(Some(session_id.to_string()), limit).await
    }

    async fn query(&self, session_id: Option<String>, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let conn = Arc::clone(&self.conn);
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let entries = match session_id {
                Some(session) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, session_id, request, response, timestamp FROM history
                         WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![session, limit], row_to_entry)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, session_id, request, response, timestamp FROM history
                         ORDER BY id DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit], row_to_entry)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(entries)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let json = |idx: usize| -> rusqlite::Result<JsonValue> {
        let raw: String = row.get(idx)?;
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    let timestamp: String = row.get(4)?;

    Ok(HistoryEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        request: json(2)?,
        response: json(3)?,
        timestamp: NaiveDateTime::parse_from_str(&timestamp, "%Y-%m-%d %H:%M:%S")
            .map(|t| t.and_utc())
            .unwrap_or_else(|_| Utc::now()),
    })
}

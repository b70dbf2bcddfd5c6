//! Append-only extraction history backed by SQLite.
//!
//! One row per completed document. The store is shared by every job the
//! process runs, so writes from concurrent jobs go through one connection
//! behind a [`Mutex`]. All methods block; async callers use
//! `spawn_blocking`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create history directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("history connection poisoned")]
    Poisoned,
}

/// A completed document, as written by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub contributor: String,
    pub document_name: String,
    pub row_count: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub username: String,
    pub document_name: String,
    pub total_rows: usize,
    pub total_time: f64,
    pub avg_time_per_row: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_users: usize,
    pub total_documents_processed: usize,
    pub total_rows_processed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributorStats {
    pub username: String,
    pub total_documents: usize,
    pub total_rows: usize,
    pub avg_time_per_row: f64,
}

/// Which contributors a history query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryFilter {
    All,
    Contributor(String),
}

impl HistoryFilter {
    /// Admins may ask for anyone (or everyone, with no target or
    /// `"All Users"`); everyone else only ever sees their own rows.
    pub fn for_principal(principal: &crate::Principal, target: Option<&str>) -> Self {
        if !principal.admin {
            return HistoryFilter::Contributor(principal.username.clone());
        }
        match target.map(str::trim) {
            None | Some("") | Some("All Users") => HistoryFilter::All,
            Some(name) => HistoryFilter::Contributor(name.to_string()),
        }
    }
}

/// Destination for per-document history records.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: &HistoryEntry) -> Result<(), HistoryError>;
}

pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS extraction_history (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 username      TEXT NOT NULL,
                 document_name TEXT NOT NULL,
                 total_rows    INTEGER NOT NULL,
                 total_time    REAL NOT NULL,
                 timestamp     DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             CREATE INDEX IF NOT EXISTS idx_history_username
                 ON extraction_history (username);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, HistoryError> {
        self.conn.lock().map_err(|_| HistoryError::Poisoned)
    }

    /// Distinct contributor names, sorted.
    pub fn contributors(&self) -> Result<Vec<String>, HistoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT username FROM extraction_history ORDER BY username",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// History rows, newest first.
    pub fn summaries(&self, filter: &HistoryFilter) -> Result<Vec<HistorySummary>, HistoryError> {
        let conn = self.conn()?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<HistorySummary> {
            let total_rows = row.get::<_, i64>(2)?.max(0) as usize;
            let total_time: f64 = row.get(3)?;
            Ok(HistorySummary {
                username: row.get(0)?,
                document_name: row.get(1)?,
                total_rows,
                total_time,
                avg_time_per_row: crate::per_row(total_time, total_rows),
                timestamp: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        };

        let rows = match filter {
            HistoryFilter::All => {
                let mut stmt = conn.prepare_cached(
                    "SELECT username, document_name, total_rows, total_time, timestamp
                     FROM extraction_history ORDER BY timestamp DESC, id DESC",
                )?;
                stmt.query_map([], map_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            HistoryFilter::Contributor(name) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT username, document_name, total_rows, total_time, timestamp
                     FROM extraction_history WHERE username = ?1
                     ORDER BY timestamp DESC, id DESC",
                )?;
                stmt.query_map(params![name], map_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(DISTINCT username), COUNT(DISTINCT document_name),
                    COALESCE(SUM(total_rows), 0)
             FROM extraction_history",
            [],
            |row| {
                Ok(HistoryStats {
                    total_users: row.get::<_, i64>(0)? as usize,
                    total_documents_processed: row.get::<_, i64>(1)? as usize,
                    total_rows_processed: row.get::<_, i64>(2)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    /// Per-contributor totals, sorted by username.
    pub fn contributor_stats(&self) -> Result<Vec<ContributorStats>, HistoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT username, COUNT(DISTINCT document_name),
                    COALESCE(SUM(total_rows), 0), COALESCE(SUM(total_time), 0.0)
             FROM extraction_history GROUP BY username ORDER BY username",
        )?;
        let stats = stmt
            .query_map([], stats_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Totals for one contributor; zeros if they have no history.
    pub fn contributor_stat(&self, username: &str) -> Result<ContributorStats, HistoryError> {
        let conn = self.conn()?;
        let stat = conn.query_row(
            "SELECT ?1, COUNT(DISTINCT document_name),
                    COALESCE(SUM(total_rows), 0), COALESCE(SUM(total_time), 0.0)
             FROM extraction_history WHERE username = ?1",
            params![username],
            stats_row,
        )?;
        Ok(stat)
    }
}

fn stats_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContributorStats> {
    let total_rows = row.get::<_, i64>(2)?.max(0) as usize;
    let total_time: f64 = row.get(3)?;
    Ok(ContributorStats {
        username: row.get(0)?,
        total_documents: row.get::<_, i64>(1)? as usize,
        total_rows,
        avg_time_per_row: crate::per_row(total_time, total_rows),
    })
}

impl HistorySink for SqliteHistory {
    fn record(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO extraction_history (username, document_name, total_rows, total_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.contributor,
                entry.document_name,
                entry.row_count as i64,
                entry.elapsed_seconds
            ],
        )?;
        Ok(())
    }
}

//! Persistent SQLite ledger of users and downloads.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("ledger connection lock poisoned")]
    Poisoned,
}

/// Aggregate usage numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub total_downloads: i64,
    pub total_users: i64,
    /// Rounded to two decimals.
    pub total_size_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub user_id: i64,
    pub source_url: String,
    pub title: Option<String>,
    pub size_mb: f64,
    pub status: String,
    pub file_path: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// A successful fetch about to be recorded.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub user_id: i64,
    pub source_url: String,
    pub title: Option<String>,
    pub size_mb: f64,
    pub file_path: Option<String>,
}

fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Usage ledger. Cheap to clone; all clones share one connection.
///
/// Every call runs on the blocking pool so SQLite never stalls the runtime.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Create a new in-memory ledger.
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) a ledger at the given path.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self::from_connection(Connection::open(path)?)?;
        info!("📒 Opened ledger at {:?}", path);
        Ok(ledger)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                source_url TEXT NOT NULL,
                title TEXT,
                size_mb REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'completed',
                file_path TEXT,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_user_id ON downloads(user_id);
            CREATE INDEX IF NOT EXISTS idx_downloads_file_path ON downloads(file_path);
        "#)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| LedgerError::Poisoned)?;
            f(&conn).map_err(LedgerError::from)
        })
        .await?
    }

    /// Idempotent: returns the existing id when the user is already known.
    pub async fn get_or_create_user(&self, external_id: &str) -> Result<i64, LedgerError> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (external_id, created_at) VALUES (?1, ?2)",
                params![external_id, now_timestamp()],
            )?;
            conn.query_row(
                "SELECT id FROM users WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn record_download(&self, download: NewDownload) -> Result<i64, LedgerError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO downloads (user_id, source_url, title, size_mb, status, file_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'completed', ?5, ?6)",
                params![
                    download.user_id,
                    download.source_url,
                    download.title,
                    download.size_mb.max(0.0),
                    download.file_path,
                    now_timestamp(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!("Recorded download {} for user {}", id, download.user_id);
            Ok(id)
        })
        .await
    }

    pub async fn stats(&self) -> Result<Stats, LedgerError> {
        self.run(|conn| {
            let (total_downloads, total_size): (i64, f64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_mb), 0.0) FROM downloads",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let total_users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(Stats {
                total_downloads,
                total_users,
                total_size_mb: (total_size * 100.0).round() / 100.0,
            })
        })
        .await
    }

    /// Most recent downloads for a user, newest first.
    pub async fn recent_downloads(&self, user_id: i64, limit: usize) -> Result<Vec<DownloadRecord>, LedgerError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, source_url, title, size_mb, status, file_path, created_at, deleted_at
                 FROM downloads WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(DownloadRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    source_url: row.get(2)?,
                    title: row.get(3)?,
                    size_mb: row.get(4)?,
                    status: row.get(5)?,
                    file_path: row.get(6)?,
                    created_at: row.get(7)?,
                    deleted_at: row.get(8)?,
                })
            })?;
            let records = rows.collect::<Result<Vec<_>, _>>();
            records
        })
        .await
    }

    /// Stamp `deleted_at` once the local artifact is gone. Already-stamped rows keep their time.
    pub async fn mark_deleted(&self, download_id: i64) -> Result<(), LedgerError> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE downloads SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![now_timestamp(), download_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Like `mark_deleted`, keyed by the artifact path. Returns the number of rows stamped.
    pub async fn mark_deleted_by_path(&self, file_path: &str) -> Result<usize, LedgerError> {
        let file_path = file_path.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE downloads SET deleted_at = ?1 WHERE file_path = ?2 AND deleted_at IS NULL",
                params![now_timestamp(), file_path],
            )
        })
        .await
    }

    /// Look up a user id without creating one.
    pub async fn find_user(&self, external_id: &str) -> Result<Option<i64>, LedgerError> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id FROM users WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(user_id: i64, size_mb: f64) -> NewDownload {
        NewDownload {
            user_id,
            source_url: "https://youtu.be/abc".to_string(),
            title: Some("A video".to_string()),
            size_mb,
            file_path: Some(format!("/tmp/original_{size_mb}.mp4")),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_user_idempotent() {
        let ledger = Ledger::in_memory().unwrap();
        let first = ledger.get_or_create_user("15551234567@c.us").await.unwrap();
        let second = ledger.get_or_create_user("15551234567@c.us").await.unwrap();
        assert_eq!(first, second);
        let other = ledger.get_or_create_user("15557654321@c.us").await.unwrap();
        assert_ne!(first, other);
        assert_eq!(ledger.stats().await.unwrap().total_users, 2);
    }

    #[tokio::test]
    async fn test_record_download_reflected_in_stats() {
        let ledger = Ledger::in_memory().unwrap();
        let user = ledger.get_or_create_user("u1").await.unwrap();
        ledger.record_download(download(user, 5.5)).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total_downloads, 1);
        assert_eq!(stats.total_users, 1);
        assert!((stats.total_size_mb - 5.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stats_rounds_total_size() {
        let ledger = Ledger::in_memory().unwrap();
        let user = ledger.get_or_create_user("u1").await.unwrap();
        ledger.record_download(download(user, 1.111)).await.unwrap();
        ledger.record_download(download(user, 2.222)).await.unwrap();
        assert_eq!(ledger.stats().await.unwrap().total_size_mb, 3.33);
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let ledger = Ledger::in_memory().unwrap();
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats, Stats { total_downloads: 0, total_users: 0, total_size_mb: 0.0 });
    }

    #[tokio::test]
    async fn test_recent_downloads_newest_first() {
        let ledger = Ledger::in_memory().unwrap();
        let user = ledger.get_or_create_user("u1").await.unwrap();
        for size in [1.0, 2.0, 3.0] {
            ledger.record_download(download(user, size)).await.unwrap();
        }
        let recent = ledger.recent_downloads(user, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].size_mb, 3.0);
        assert_eq!(recent[1].size_mb, 2.0);
        assert_eq!(recent[0].status, "completed");
        assert!(recent[0].deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_deleted() {
        let ledger = Ledger::in_memory().unwrap();
        let user = ledger.get_or_create_user("u1").await.unwrap();
        let id = ledger.record_download(download(user, 1.0)).await.unwrap();
        ledger.mark_deleted(id).await.unwrap();
        let recent = ledger.recent_downloads(user, 10).await.unwrap();
        assert!(recent[0].deleted_at.is_some());
        // Soft delete keeps the record counted.
        assert_eq!(ledger.stats().await.unwrap().total_downloads, 1);
    }

    #[tokio::test]
    async fn test_mark_deleted_by_path() {
        let ledger = Ledger::in_memory().unwrap();
        let user = ledger.get_or_create_user("u1").await.unwrap();
        ledger.record_download(download(user, 1.0)).await.unwrap();
        ledger.record_download(download(user, 2.0)).await.unwrap();

        assert_eq!(ledger.mark_deleted_by_path("/tmp/original_1.mp4").await.unwrap(), 1);
        assert_eq!(ledger.mark_deleted_by_path("/tmp/original_1.mp4").await.unwrap(), 0);
        assert_eq!(ledger.mark_deleted_by_path("/tmp/missing.mp4").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_user() {
        let ledger = Ledger::in_memory().unwrap();
        assert_eq!(ledger.find_user("nobody").await.unwrap(), None);
        let id = ledger.get_or_create_user("somebody").await.unwrap();
        assert_eq!(ledger.find_user("somebody").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let ledger = Ledger::open(&path).unwrap();
            let user = ledger.get_or_create_user("u1").await.unwrap();
            ledger.record_download(download(user, 4.0)).await.unwrap();
        }
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.stats().await.unwrap().total_downloads, 1);
    }
}

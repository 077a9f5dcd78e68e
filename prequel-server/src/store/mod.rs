//! SQLite persistence for webhook activity.
//!
//! The store is split into three components sharing one [`Database`]:
//!
//! - [`UpsertStore`] applies normalized webhook events, one transaction per
//!   event.
//! - [`StalenessEngine`] recomputes the `is_stale` flag on pull requests.
//! - [`AnalyticsAggregator`] answers the read-only dashboard queries.
//!
//! [`PrequelRepository`] composes the three for callers that need all of them.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`.
//!
//! # Timestamps
//!
//! All timestamps are stored as INTEGER unix seconds (UTC) so that activity
//! comparisons and the staleness cutoff are plain integer range checks.

mod analytics;
mod staleness;
mod upsert;

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

pub use analytics::{
    AnalyticsAggregator, Contributor, PrMetrics, RecentPullRequest, RepositorySummary, StalePr,
};
pub use staleness::{StalenessEngine, StalenessReport};
pub use upsert::UpsertStore;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Read-only connections opened next to the writer for file databases.
const READ_CONNECTIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not complete an operation. The enclosing
    /// transaction, if any, has been rolled back.
    Storage { operation: String, message: String },
    /// A stored value could not be interpreted.
    Corruption { what: String },
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        StoreError::Corruption { what: what.into() }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Storage { operation, message } => {
                write!(f, "storage error during {}: {}", operation, message)
            }
            StoreError::Corruption { what } => write!(f, "corrupt stored data: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

/// Shared SQLite connections.
///
/// rusqlite is synchronous, so every operation runs on the blocking pool via
/// [`Database::run`] or [`Database::run_read`]. Writes go through a single
/// connection. File databases also get a few `query_only` connections that
/// read WAL snapshots without waiting for the writer. Each mutex is held for
/// exactly one operation.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    readers: Arc<[Mutex<Connection>]>,
    next_reader: Arc<AtomicUsize>,
}

impl Database {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL` so readers do not block the webhook writer
    /// - `synchronous = FULL` so acknowledged webhooks survive power loss
    /// - `busy_timeout = 5000ms` to wait out other processes holding the lock
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support; in-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        // A private in-memory database cannot be shared, so reads use the writer.
        let readers = if is_in_memory {
            Vec::new()
        } else {
            (0..READ_CONNECTIONS)
                .map(|_| Self::open_reader(path_ref).map(Mutex::new))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers: readers.into(),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn open_reader(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::storage("open read connection", e.to_string()))?;
        conn.execute_batch(
            r#"
            PRAGMA query_only = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure read connection", e.to_string()))?;
        Ok(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1: the five activity tables.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_id INTEGER NOT NULL DEFAULT 0,
                    name TEXT NOT NULL,
                    full_name TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_id INTEGER NOT NULL DEFAULT 0,
                    username TEXT NOT NULL UNIQUE,
                    avatar_url TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pull_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_id INTEGER NOT NULL DEFAULT 0,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id),
                    author_id INTEGER NOT NULL REFERENCES users(id),
                    title TEXT NOT NULL,
                    number INTEGER NOT NULL,
                    html_url TEXT NOT NULL,
                    state TEXT NOT NULL CHECK (state IN ('open', 'closed', 'merged')),
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    closed_at INTEGER,
                    merged_at INTEGER,
                    is_stale INTEGER NOT NULL DEFAULT 0,
                    last_activity_at INTEGER NOT NULL,
                    UNIQUE (repository_id, number)
                );

                CREATE INDEX IF NOT EXISTS idx_pull_requests_activity
                    ON pull_requests(state, last_activity_at);
                CREATE INDEX IF NOT EXISTS idx_pull_requests_stale
                    ON pull_requests(is_stale) WHERE is_stale = 1;
                CREATE INDEX IF NOT EXISTS idx_pull_requests_author
                    ON pull_requests(author_id);
                CREATE INDEX IF NOT EXISTS idx_pull_requests_created
                    ON pull_requests(created_at DESC);

                CREATE TABLE IF NOT EXISTS reviews (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_id INTEGER NOT NULL UNIQUE,
                    pull_request_id INTEGER NOT NULL REFERENCES pull_requests(id),
                    reviewer_id INTEGER NOT NULL REFERENCES users(id),
                    state TEXT NOT NULL
                        CHECK (state IN ('approved', 'changes_requested', 'commented', 'dismissed')),
                    html_url TEXT NOT NULL,
                    submitted_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_reviews_pull_request
                    ON reviews(pull_request_id);
                CREATE INDEX IF NOT EXISTS idx_reviews_reviewer
                    ON reviews(reviewer_id);

                CREATE TABLE IF NOT EXISTS review_comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    github_id INTEGER NOT NULL UNIQUE,
                    pull_request_id INTEGER NOT NULL REFERENCES pull_requests(id),
                    author_id INTEGER NOT NULL REFERENCES users(id),
                    body TEXT NOT NULL,
                    html_url TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_review_comments_pull_request
                    ON review_comments(pull_request_id);
                CREATE INDEX IF NOT EXISTS idx_review_comments_author
                    ON review_comments(author_id);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::storage(operation, format!("blocking task failed: {}", e)))?
    }

    /// Run a read-only `f` on the blocking pool.
    ///
    /// Uses the next read connection in turn, or the writer when there are none.
    pub(crate) async fn run_read<T, F>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        if self.readers.is_empty() {
            return self.run(operation, f).await;
        }

        let readers = self.readers.clone();
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let mut guard = readers[index]
                .lock()
                .map_err(|_| StoreError::storage(operation, "read connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::storage(operation, format!("blocking task failed: {}", e)))?
    }

    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let guard = self.conn.lock().expect("connection mutex should not be poisoned");
        f(&guard)
    }
}

/// Composes the write, staleness and read components over one database.
#[derive(Clone)]
pub struct PrequelRepository {
    pub upserts: UpsertStore,
    pub staleness: StalenessEngine,
    pub analytics: AnalyticsAggregator,
}

impl PrequelRepository {
    pub fn new(db: Database) -> Self {
        Self {
            upserts: UpsertStore::new(db.clone()),
            staleness: StalenessEngine::new(db.clone()),
            analytics: AnalyticsAggregator::new(db),
        }
    }
}

pub(crate) fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_epoch(column: &str, secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::corruption(format!("{} out of range: {}", column, secs)))
}

/// Convert a GitHub numeric id to SQLite's signed integer.
pub(crate) fn github_id_to_i64(what: &str, id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| {
        StoreError::storage(
            "convert github id",
            format!("{} id {} exceeds i64::MAX", what, id),
        )
    })
}

/// Read back a non-negative count or id.
pub(crate) fn i64_to_u64(what: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| {
        warn!("Negative {} in database: {}", what, value);
        StoreError::corruption(format!("negative {}: {}", what, value))
    })
}

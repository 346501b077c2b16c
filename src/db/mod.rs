//! Index store: SQLite with an FTS5 table for BM25 ranking.
//!
//! All writes go through one writer lock and a single transaction per call,
//! so concurrent readers only ever see whole files.
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Transaction;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub mod files;
pub mod models;
pub mod relations;
pub mod search;

pub use models::*;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL,
    language TEXT NOT NULL,
    line_count INTEGER NOT NULL,
    modified_at DATETIME NOT NULL,
    indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT,
    signature TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    content TEXT NOT NULL,
    docstring TEXT,
    scope_path TEXT NOT NULL DEFAULT '',
    calls TEXT NOT NULL DEFAULT '[]',
    types TEXT NOT NULL DEFAULT '[]',
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);
CREATE INDEX IF NOT EXISTS idx_chunks_name ON chunks(name);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    name,
    signature,
    docstring,
    body,
    tokenize = 'unicode61'
);

CREATE TABLE IF NOT EXISTS call_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    caller_chunk_id INTEGER NOT NULL,
    callee_name TEXT NOT NULL,
    UNIQUE(caller_chunk_id, callee_name),
    FOREIGN KEY (caller_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_call_callee ON call_edges(callee_name);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    module TEXT NOT NULL,
    UNIQUE(file_id, module),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_imports_module ON imports(module);
"#;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;";
const FILE_POOL_SIZE: u32 = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to one index database. Cheap to share behind an `Arc`.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (or create) a database file and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing index store: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(FILE_POOL_SIZE)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            conn.execute_batch(SCHEMA_SQL)?;
        }

        info!("Index store ready");
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory database, mostly for tests. Every pooled connection to
    /// `:memory:` would be a separate database, so the pool holds exactly one
    /// connection that is never recycled.
    pub fn open_in_memory() -> Result<Self> {
        let manager =
            SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;

        pool.get()?.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // A panicked writer rolled its transaction back on drop.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` inside one write transaction, committed when `f` succeeds.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.lock_writer();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ABOUTME: SQLite connection setup and schema for the durable queue, ledger, and scheduler tables.
// ABOUTME: One shared connection guarded by a mutex; every store borrows it through Database::connection.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queue (
        id TEXT PRIMARY KEY,
        direction TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        available_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        claimed_at INTEGER,
        processed_at INTEGER,
        dead_lettered_at INTEGER,
        last_error TEXT,
        previous_error TEXT,
        replay_count INTEGER NOT NULL DEFAULT 0,
        replayed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_queue_due
        ON queue(direction, status, available_at, created_at);

    CREATE INDEX IF NOT EXISTS idx_queue_processing
        ON queue(status, claimed_at);

    CREATE TABLE IF NOT EXISTS queue_dedupe (
        direction TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        queue_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (direction, idempotency_key)
    );

    CREATE TABLE IF NOT EXISTS execution_ledger (
        channel TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        inbound_id TEXT NOT NULL,
        status TEXT NOT NULL,
        cached_result TEXT,
        started_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER,
        UNIQUE (channel, chat_id, inbound_id)
    );

    CREATE TABLE IF NOT EXISTS chats (
        channel TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_message_at INTEGER NOT NULL,
        PRIMARY KEY (channel, chat_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        channel TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        role TEXT NOT NULL,
        sender TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (channel, chat_id, message_id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_chat_created
        ON messages(channel, chat_id, created_at);

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        owner_key TEXT NOT NULL,
        channel TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        schedule_value TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        next_run_at INTEGER,
        last_run_at INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_due
        ON tasks(status, next_run_at);

    CREATE TABLE IF NOT EXISTS task_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        inbound_id TEXT NOT NULL UNIQUE,
        ran_at INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        preview TEXT,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_task_runs_task
        ON task_runs(task_id, ran_at);
";

/// Owner of the shared SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) `spool.db` inside the given workspace directory
    pub fn open_in_dir<P: AsRef<Path>>(workspace_path: P) -> Result<Self> {
        let workspace_path = workspace_path.as_ref();
        std::fs::create_dir_all(workspace_path).with_context(|| {
            format!(
                "Failed to create workspace directory: {}",
                workspace_path.display()
            )
        })?;
        Self::open(workspace_path.join("spool.db"))
    }

    /// Open (or create) a database file at an explicit path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open SQLite database {}", db_path.display()))?;

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal mode")?;
        tracing::debug!(journal_mode = %mode, "SQLite journal mode set");
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self::from_connection(conn, Some(db_path.clone()))?;
        tracing::info!(db = %db_path.display(), "Database initialized");
        Ok(db)
    }

    /// In-memory database, used by tests and one-shot tooling
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory database")?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Shared connection handle for the individual stores
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Lock the shared connection, turning a poisoned mutex into an error
pub(crate) fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
}

/// Parse a TEXT column through `FromStr`, reporting failures as a column conversion error
pub(crate) fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

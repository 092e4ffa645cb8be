//! # SQLite persistence
//!
//! Single-file store shared by the job queue and the project registry.
//! A `Mutex<Connection>` keeps access serialized; statements are short
//! enough that contention is not a concern at this scale.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct PipelineDb {
    conn: Arc<Mutex<Connection>>,
}

impl PipelineDb {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating db directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow::anyhow!("db lock poisoned"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
            [],
        )?;
        let current: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        let current = match current {
            Some(v) => v,
            None => {
                conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
                0
            }
        };

        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id                TEXT PRIMARY KEY,
                    queue             TEXT NOT NULL,
                    payload           TEXT NOT NULL,
                    state             TEXT NOT NULL,
                    priority          INTEGER NOT NULL DEFAULT 0,
                    attempts_made     INTEGER NOT NULL DEFAULT 0,
                    max_attempts      INTEGER NOT NULL,
                    progress          TEXT,
                    result            TEXT,
                    failed_reason     TEXT,
                    failed_module     TEXT,
                    cancel_requested  INTEGER NOT NULL DEFAULT 0,
                    available_at      TEXT NOT NULL,
                    lease_expires_at  TEXT,
                    created_at        TEXT NOT NULL,
                    updated_at        TEXT NOT NULL,
                    finished_at       TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_pickup
                    ON jobs (queue, state, priority, created_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_finished
                    ON jobs (state, finished_at);

                CREATE TABLE IF NOT EXISTS projects (
                    id               TEXT PRIMARY KEY,
                    session_id       TEXT NOT NULL,
                    company_name     TEXT NOT NULL,
                    status           TEXT NOT NULL,
                    intake           TEXT NOT NULL,
                    research         TEXT,
                    plan             TEXT,
                    approval_summary TEXT,
                    generated_site   TEXT,
                    deployment       TEXT,
                    documents        TEXT,
                    client_approved  INTEGER NOT NULL DEFAULT 0,
                    failed_module    TEXT,
                    last_error       TEXT,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL,
                    approved_at      TEXT,
                    completed_at     TEXT
                );",
            )?;
        }

        conn.execute(
            "UPDATE schema_version SET version = ?1",
            [SCHEMA_VERSION],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = PipelineDb::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn open_at_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("propgen-db-{}", std::process::id()));
        let path = dir.join("nested").join("pipeline.db");
        let _db = PipelineDb::open_at(&path).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

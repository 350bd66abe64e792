//! Storage layer: connection pool, schema, and health check.
//!
//! Single SQLite database holding the queue, the versioned result store,
//! the memoization cache, exceptions, and what-if staging. All mutations
//! run as transactions on one writer connection, so the claim and
//! activation-flip critical sections are strictly serialized.

pub mod exceptions;
pub mod memo;
pub mod queue;
pub mod results;
pub mod whatif;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::Result;
use crate::events::{AuditSink, TracingAuditSink};

/// Database handle. Owns the connection pool and the audit-event sink.
pub struct Db {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
}

impl Db {
    /// Open (or create) a database at the given URL, e.g.
    /// `sqlite://auditq.db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        Self::with_options(options).await
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        // One writer connection: SQLite serializes writers anyway, and a
        // single connection keeps every claim and activation flip in a
        // strict total order. The connection must never be reaped: an
        // in-memory database lives and dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            audit: Arc::new(TracingAuditSink),
        };
        db.init().await?;
        Ok(db)
    }

    /// Replace the audit-event sink (tests use `MemoryAuditSink`).
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queue (
        id            TEXT PRIMARY KEY,
        student_id    TEXT NOT NULL,
        area_code     TEXT NOT NULL,
        catalog       TEXT NOT NULL,
        run           INTEGER NOT NULL DEFAULT 0,
        priority      INTEGER NOT NULL DEFAULT 100,
        input_data    TEXT NOT NULL DEFAULT 'null',
        link_only     INTEGER NOT NULL DEFAULT 0,
        speculative   INTEGER NOT NULL DEFAULT 0,
        state         TEXT NOT NULL DEFAULT 'pending',
        attempts      INTEGER NOT NULL DEFAULT 0,
        max_attempts  INTEGER,
        last_error    TEXT,
        claimed_by    TEXT,
        submitted_at  TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        expires_at    TEXT,
        not_before    TEXT
    );

    -- at most one pending job per (student, area); enqueue coalesces
    CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_pending_pair
        ON queue(student_id, area_code) WHERE state = 'pending';
    CREATE INDEX IF NOT EXISTS idx_queue_claim
        ON queue(priority ASC, submitted_at ASC) WHERE state = 'pending';

    CREATE TABLE IF NOT EXISTS queue_blocks (
        student_id TEXT NOT NULL,
        area_code  TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (student_id, area_code)
    );

    CREATE TABLE IF NOT EXISTS results (
        id              TEXT PRIMARY KEY,
        student_id      TEXT NOT NULL,
        area_code       TEXT NOT NULL,
        catalog         TEXT NOT NULL,
        run             INTEGER NOT NULL DEFAULT 0,
        revision        INTEGER,
        is_active       INTEGER NOT NULL DEFAULT 0,
        status          TEXT NOT NULL DEFAULT 'pending',
        speculative     INTEGER NOT NULL DEFAULT 0,
        rank            REAL NOT NULL DEFAULT 0,
        max_rank        REAL NOT NULL DEFAULT 0,
        gpa             REAL NOT NULL DEFAULT 0,
        claimed_courses TEXT NOT NULL DEFAULT '{}',
        result_tree     TEXT,
        error           TEXT,
        link_to         TEXT REFERENCES results(id),
        duration_ms     INTEGER,
        created_at      TEXT NOT NULL,
        finished_at     TEXT,
        expires_at      TEXT
    );

    -- the single-active invariant, enforced structurally
    CREATE UNIQUE INDEX IF NOT EXISTS idx_results_active
        ON results(student_id, area_code) WHERE is_active = 1;
    -- revisions are never reused within a lineage
    CREATE UNIQUE INDEX IF NOT EXISTS idx_results_revision
        ON results(student_id, area_code, revision) WHERE revision IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_results_lineage
        ON results(student_id, area_code);

    CREATE TABLE IF NOT EXISTS memo (
        result_id        TEXT NOT NULL REFERENCES results(id) ON DELETE CASCADE,
        clause_hash      TEXT NOT NULL,
        clause_canonical TEXT NOT NULL,
        candidates       TEXT NOT NULL,
        created_at       TEXT NOT NULL,
        PRIMARY KEY (result_id, clause_hash)
    );

    CREATE TABLE IF NOT EXISTS exceptions (
        id               TEXT PRIMARY KEY,
        student_id       TEXT NOT NULL,
        area_code        TEXT NOT NULL,
        path             TEXT NOT NULL,
        kind             TEXT NOT NULL,
        clbid            TEXT,
        forced_pass      INTEGER NOT NULL DEFAULT 0,
        override_credits REAL,
        override_subject TEXT,
        is_enabled       INTEGER NOT NULL DEFAULT 1,
        author           TEXT NOT NULL,
        notes            TEXT NOT NULL DEFAULT '',
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_exceptions_pair
        ON exceptions(student_id, area_code);

    CREATE TABLE IF NOT EXISTS whatif_stages (
        student_id TEXT NOT NULL,
        area_code  TEXT NOT NULL,
        kind       TEXT NOT NULL,
        value      TEXT NOT NULL,
        staged_at  TEXT NOT NULL,
        PRIMARY KEY (student_id, area_code, kind)
    );

    CREATE TABLE IF NOT EXISTS templates (
        id         TEXT PRIMARY KEY,
        student_id TEXT NOT NULL,
        name       TEXT NOT NULL,
        revision   INTEGER NOT NULL,
        courses    TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (student_id, name, revision)
    );
";

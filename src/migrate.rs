//! Database schema migrations.
//!
//! Creates all required tables for the local storage backend (sessions,
//! log_entries, chunks, chunks_fts, session_checkpoints, processed_sessions,
//! background_sync, audit_events). Every table carries explicit
//! `tenant_id`/`project_id` columns so a single database file can back
//! several scopes at once; idempotent, safe to run on every `recall init`.
//!
//! FTS5 is kept in sync with explicit inserts/deletes from `storage.rs`
//! rather than `AFTER INSERT`/`AFTER UPDATE` triggers, matching this crate's
//! existing migration style.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            task TEXT NOT NULL,
            summary TEXT,
            entry_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_entries (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            session_id TEXT REFERENCES sessions(id),
            source TEXT NOT NULL,
            source_session_id TEXT,
            timestamp TEXT NOT NULL,
            content TEXT NOT NULL,
            label TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 1.0,
            curation_status TEXT NOT NULL DEFAULT 'approved',
            metadata TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            source TEXT NOT NULL,
            source_ids TEXT NOT NULL DEFAULT '[]',
            content TEXT NOT NULL,
            normalized_content TEXT NOT NULL,
            label TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            token_count INTEGER,
            embedding BLOB,
            UNIQUE(tenant_id, project_id, normalized_content, label)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                tenant_id UNINDEXED,
                project_id UNINDEXED,
                content,
                tags
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_checkpoints (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            source_session_id TEXT NOT NULL,
            last_message_index INTEGER,
            last_message_timestamp TEXT,
            content_hash TEXT,
            checkpoint_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(tenant_id, project_id, source_session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_sessions (
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            source_session_id TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, project_id, source_session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS background_sync (
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            is_running INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT,
            sessions_processed INTEGER NOT NULL DEFAULT 0,
            learnings_extracted INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            pid INTEGER,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, project_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_events (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_scope ON log_entries(tenant_id, project_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_session ON log_entries(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_label ON log_entries(label)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_scope ON chunks(tenant_id, project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_label ON chunks(label)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_scope ON audit_events(tenant_id, project_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

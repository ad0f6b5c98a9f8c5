//! Storage abstraction for the memory engine.
//!
//! The [`Store`] trait defines every operation the pipeline, tier writer,
//! and CLI need from persistent storage, enabling a local SQLite-backed
//! implementation and a remote HTTP-backed façade to share one interface.
//! Implementations must be `Send + Sync` to work across the tokio runtime.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{
    normalize_content, BackgroundSyncStatus, Chunk, ChunkSource, CurationStatus, LogEntry,
    LogSource, Scope, SemanticLabel, Session, SessionCheckpoint, SessionStatus, StorageStats,
};

/// A candidate chunk returned from FTS5 keyword search, score ascending
/// (lower BM25 rank is a better match).
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk: Chunk,
    pub raw_score: f64,
}

/// Abstract storage backend for the memory engine.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_session`](Store::create_session) | Start a new session |
/// | [`append_entry`](Store::append_entry) | Record a log entry |
/// | [`store_chunk`](Store::store_chunk) | Index a retrieval unit |
/// | [`search_chunks_fts`](Store::search_chunks_fts) | Full-text search over chunks |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, scope: &Scope, id: Uuid) -> Result<Option<Session>>;
    async fn get_active_session(&self, scope: &Scope) -> Result<Option<Session>>;
    async fn list_sessions(&self, scope: &Scope, limit: i64) -> Result<Vec<Session>>;
    async fn update_session(&self, session: &Session) -> Result<()>;

    async fn append_entry(&self, entry: &LogEntry) -> Result<()>;
    async fn get_entries(&self, scope: &Scope, session_id: Option<Uuid>) -> Result<Vec<LogEntry>>;
    async fn get_entries_by_label(
        &self,
        scope: &Scope,
        label: SemanticLabel,
        min_confidence: f64,
    ) -> Result<Vec<LogEntry>>;

    /// Insert a chunk, returning `Ok(None)` if `(normalize(content), label)`
    /// already exists for the scope (dedup, not an error).
    async fn store_chunk(&self, chunk: &Chunk) -> Result<Option<Uuid>>;
    async fn has_chunk(&self, scope: &Scope, content: &str, label: SemanticLabel) -> Result<bool>;
    async fn search_chunks_fts(
        &self,
        scope: &Scope,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>>;
    async fn list_chunks_with_embeddings(&self, scope: &Scope) -> Result<Vec<Chunk>>;

    async fn is_session_processed(&self, scope: &Scope, source_session_id: &str) -> Result<bool>;
    async fn mark_session_processed(
        &self,
        scope: &Scope,
        source: &str,
        source_session_id: &str,
    ) -> Result<()>;
    /// Clear processed-session markers, optionally narrowed to a single
    /// `source` connector and/or a single `source_session_id`. Returns the
    /// number of markers removed.
    async fn clear_processed_sessions(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64>;

    async fn get_session_checkpoint(
        &self,
        scope: &Scope,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>>;
    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()>;
    /// Clear saved checkpoints, optionally narrowed to a single `source`
    /// connector and/or a single `source_session_id`. Returns the number of
    /// checkpoints removed.
    async fn clear_session_checkpoints(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64>;

    async fn get_stats(&self, scope: &Scope) -> Result<StorageStats>;
    async fn get_last_processed_at(&self, scope: &Scope) -> Result<Option<DateTime<Utc>>>;
    async fn list_recent_source_sessions(
        &self,
        scope: &Scope,
        limit: i64,
    ) -> Result<Vec<String>>;

    async fn start_background_sync(&self, scope: &Scope, pid: Option<i64>) -> Result<()>;
    async fn complete_background_sync(
        &self,
        scope: &Scope,
        sessions_processed: i64,
        learnings_extracted: i64,
        error_message: Option<String>,
    ) -> Result<()>;
    async fn get_background_sync_status(&self, scope: &Scope) -> Result<BackgroundSyncStatus>;
}

/// Local SQLite-backed implementation of [`Store`].
///
/// Every method filters explicitly by `(tenant_id, project_id)`; the
/// sentinel scope `("default", "default")` is accepted here since this
/// store backs `storage.backend = "local"` only.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn ids_to_json(ids: &[Uuid]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn ids_from_json(raw: &str) -> Vec<Uuid> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn metadata_to_json(metadata: &HashMap<String, serde_json::Value>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(raw: &str) -> HashMap<String, serde_json::Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn session_status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Completed => "completed",
        SessionStatus::Abandoned => "abandoned",
    }
}

fn parse_session_status(raw: &str) -> SessionStatus {
    match raw {
        "completed" => SessionStatus::Completed,
        "abandoned" => SessionStatus::Abandoned,
        _ => SessionStatus::Active,
    }
}

fn log_source_str(source: LogSource) -> &'static str {
    match source {
        LogSource::Explicit => "explicit",
        LogSource::Ingested => "ingested",
        LogSource::Extracted => "extracted",
        LogSource::Manual => "manual",
    }
}

fn parse_log_source(raw: &str) -> LogSource {
    match raw {
        "ingested" => LogSource::Ingested,
        "extracted" => LogSource::Extracted,
        "manual" => LogSource::Manual,
        _ => LogSource::Explicit,
    }
}

fn curation_status_str(status: CurationStatus) -> &'static str {
    match status {
        CurationStatus::Pending => "pending",
        CurationStatus::Approved => "approved",
        CurationStatus::Rejected => "rejected",
    }
}

fn parse_curation_status(raw: &str) -> CurationStatus {
    match raw {
        "pending" => CurationStatus::Pending,
        "rejected" => CurationStatus::Rejected,
        _ => CurationStatus::Approved,
    }
}

fn chunk_source_str(source: ChunkSource) -> &'static str {
    match source {
        ChunkSource::LogEntry => "log_entry",
        ChunkSource::Compaction => "compaction",
        ChunkSource::Import => "import",
        ChunkSource::Manual => "manual",
    }
}

fn parse_chunk_source(raw: &str) -> ChunkSource {
    match raw {
        "compaction" => ChunkSource::Compaction,
        "import" => ChunkSource::Import,
        "manual" => ChunkSource::Manual,
        _ => ChunkSource::LogEntry,
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let project_id: String = row.try_get("project_id")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;
    Ok(Session {
        id: Uuid::parse_str(&id)?,
        scope: Scope::new(tenant_id, project_id),
        status: parse_session_status(row.try_get("status")?),
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        ended_at: ended_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
        task: row.try_get("task")?,
        summary: row.try_get("summary")?,
        entry_count: row.try_get("entry_count")?,
    })
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let project_id: String = row.try_get("project_id")?;
    let session_id: Option<String> = row.try_get("session_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let label: String = row.try_get("label")?;
    let tags: String = row.try_get("tags")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(LogEntry {
        id: Uuid::parse_str(&id)?,
        scope: Scope::new(tenant_id, project_id),
        session_id: session_id.map(|s| Uuid::parse_str(&s)).transpose()?,
        source: parse_log_source(row.try_get("source")?),
        source_session_id: row.try_get("source_session_id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
        content: row.try_get("content")?,
        label: SemanticLabel::parse_lenient(&label)
            .ok_or_else(|| anyhow!("unknown label in database: {label}"))?,
        tags: tags_from_json(&tags),
        confidence: row.try_get("confidence")?,
        curation_status: parse_curation_status(row.try_get("curation_status")?),
        metadata: metadata_from_json(&metadata),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let project_id: String = row.try_get("project_id")?;
    let source_ids: String = row.try_get("source_ids")?;
    let label: String = row.try_get("label")?;
    let tags: String = row.try_get("tags")?;
    let created_at: String = row.try_get("created_at")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(Chunk {
        id: Uuid::parse_str(&id)?,
        scope: Scope::new(tenant_id, project_id),
        source: parse_chunk_source(row.try_get("source")?),
        source_ids: ids_from_json(&source_ids),
        content: row.try_get("content")?,
        label: SemanticLabel::parse_lenient(&label)
            .ok_or_else(|| anyhow!("unknown label in database: {label}"))?,
        tags: tags_from_json(&tags),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        token_count: row.try_get("token_count")?,
        embedding: embedding.map(|bytes| decode_embedding(&bytes)),
    })
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sessions (id, tenant_id, project_id, status, started_at, ended_at, task, summary, entry_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(session.id.to_string())
        .bind(&session.scope.tenant_id)
        .bind(&session.scope.project_id)
        .bind(session_status_str(session.status))
        .bind(session.started_at.to_rfc3339())
        .bind(session.ended_at.map(|d| d.to_rfc3339()))
        .bind(&session.task)
        .bind(&session.summary)
        .bind(session.entry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, scope: &Scope, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE id = ? AND tenant_id = ? AND project_id = ?",
        )
        .bind(id.to_string())
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_active_session(&self, scope: &Scope) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE tenant_id = ? AND project_id = ? AND status = 'active' ORDER BY started_at DESC LIMIT 1",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_sessions(&self, scope: &Scope, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE tenant_id = ? AND project_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = ?, ended_at = ?, summary = ?, entry_count = ? WHERE id = ? AND tenant_id = ? AND project_id = ?",
        )
        .bind(session_status_str(session.status))
        .bind(session.ended_at.map(|d| d.to_rfc3339()))
        .bind(&session.summary)
        .bind(session.entry_count)
        .bind(session.id.to_string())
        .bind(&session.scope.tenant_id)
        .bind(&session.scope.project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO log_entries (id, tenant_id, project_id, session_id, source, source_session_id, timestamp, content, label, tags, confidence, curation_status, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.scope.tenant_id)
        .bind(&entry.scope.project_id)
        .bind(entry.session_id.map(|id| id.to_string()))
        .bind(log_source_str(entry.source))
        .bind(&entry.source_session_id)
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.content)
        .bind(entry.label.as_str())
        .bind(tags_to_json(&entry.tags))
        .bind(entry.confidence)
        .bind(curation_status_str(entry.curation_status))
        .bind(metadata_to_json(&entry.metadata))
        .execute(&self.pool)
        .await?;

        if let Some(session_id) = entry.session_id {
            sqlx::query("UPDATE sessions SET entry_count = entry_count + 1 WHERE id = ?")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn get_entries(&self, scope: &Scope, session_id: Option<Uuid>) -> Result<Vec<LogEntry>> {
        let rows = if let Some(session_id) = session_id {
            sqlx::query(
                "SELECT * FROM log_entries WHERE tenant_id = ? AND project_id = ? AND session_id = ? ORDER BY timestamp ASC",
            )
            .bind(&scope.tenant_id)
            .bind(&scope.project_id)
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT * FROM log_entries WHERE tenant_id = ? AND project_id = ? ORDER BY timestamp ASC",
            )
            .bind(&scope.tenant_id)
            .bind(&scope.project_id)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(row_to_entry).collect()
    }

    async fn get_entries_by_label(
        &self,
        scope: &Scope,
        label: SemanticLabel,
        min_confidence: f64,
    ) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM log_entries WHERE tenant_id = ? AND project_id = ? AND label = ? AND confidence >= ? ORDER BY timestamp ASC",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(label.as_str())
        .bind(min_confidence)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn store_chunk(&self, chunk: &Chunk) -> Result<Option<Uuid>> {
        if self.has_chunk(&chunk.scope, &chunk.content, chunk.label).await? {
            return Ok(None);
        }
        let normalized = normalize_content(&chunk.content);
        sqlx::query(
            r#"INSERT INTO chunks (id, tenant_id, project_id, source, source_ids, content, normalized_content, label, tags, created_at, token_count, embedding)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(chunk.id.to_string())
        .bind(&chunk.scope.tenant_id)
        .bind(&chunk.scope.project_id)
        .bind(chunk_source_str(chunk.source))
        .bind(ids_to_json(&chunk.source_ids))
        .bind(&chunk.content)
        .bind(&normalized)
        .bind(chunk.label.as_str())
        .bind(tags_to_json(&chunk.tags))
        .bind(chunk.created_at.to_rfc3339())
        .bind(chunk.token_count)
        .bind(chunk.embedding.as_deref().map(encode_embedding))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, tenant_id, project_id, content, tags) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chunk.id.to_string())
        .bind(&chunk.scope.tenant_id)
        .bind(&chunk.scope.project_id)
        .bind(&chunk.content)
        .bind(tags_to_json(&chunk.tags))
        .execute(&self.pool)
        .await?;

        Ok(Some(chunk.id))
    }

    async fn has_chunk(&self, scope: &Scope, content: &str, label: SemanticLabel) -> Result<bool> {
        let normalized = normalize_content(content);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE tenant_id = ? AND project_id = ? AND normalized_content = ? AND label = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(&normalized)
        .bind(label.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn search_chunks_fts(
        &self,
        scope: &Scope,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        // FTS5 syntax errors (mismatched quotes, bare operators) surface as
        // sqlx::Error::Database; treat as "no match" rather than propagate.
        let rows = match sqlx::query(
            r#"SELECT c.*, bm25(chunks_fts) AS rank
               FROM chunks_fts f
               JOIN chunks c ON c.id = f.chunk_id
               WHERE f.tenant_id = ? AND f.project_id = ? AND chunks_fts MATCH ?
               ORDER BY rank ASC
               LIMIT ?"#,
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(_)) => return Ok(Vec::new()),
            Err(other) => return Err(other.into()),
        };

        rows.iter()
            .map(|row| {
                let chunk = row_to_chunk(row)?;
                let raw_score: f64 = row.try_get("rank")?;
                Ok(ChunkCandidate { chunk, raw_score })
            })
            .collect()
    }

    async fn list_chunks_with_embeddings(&self, scope: &Scope) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE tenant_id = ? AND project_id = ? AND embedding IS NOT NULL",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn is_session_processed(&self, scope: &Scope, source_session_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_sessions WHERE tenant_id = ? AND project_id = ? AND source_session_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(source_session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn mark_session_processed(
        &self,
        scope: &Scope,
        source: &str,
        source_session_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO processed_sessions (tenant_id, project_id, source, source_session_id, processed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(source)
        .bind(source_session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_processed_sessions(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64> {
        let mut sql =
            "DELETE FROM processed_sessions WHERE tenant_id = ? AND project_id = ?".to_string();
        if source.is_some() {
            sql.push_str(" AND source = ?");
        }
        if source_session_id.is_some() {
            sql.push_str(" AND source_session_id = ?");
        }
        let mut query = sqlx::query(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.project_id);
        if let Some(source) = source {
            query = query.bind(source);
        }
        if let Some(source_session_id) = source_session_id {
            query = query.bind(source_session_id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get_session_checkpoint(
        &self,
        scope: &Scope,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        let row = sqlx::query(
            "SELECT * FROM session_checkpoints WHERE tenant_id = ? AND project_id = ? AND source_session_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(source_session_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let id: String = row.try_get("id")?;
        let source: String = row.try_get("source")?;
        let last_message_timestamp: Option<String> = row.try_get("last_message_timestamp")?;
        let checkpoint_at: String = row.try_get("checkpoint_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(SessionCheckpoint {
            id: Uuid::parse_str(&id)?,
            scope: scope.clone(),
            source,
            source_session_id: source_session_id.to_string(),
            last_message_index: row.try_get("last_message_index")?,
            last_message_timestamp: last_message_timestamp
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
            content_hash: row.try_get("content_hash")?,
            checkpoint_at: DateTime::parse_from_rfc3339(&checkpoint_at)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        }))
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO session_checkpoints (id, tenant_id, project_id, source, source_session_id, last_message_index, last_message_timestamp, content_hash, checkpoint_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(tenant_id, project_id, source_session_id) DO UPDATE SET
                   source = excluded.source,
                   last_message_index = excluded.last_message_index,
                   last_message_timestamp = excluded.last_message_timestamp,
                   content_hash = excluded.content_hash,
                   updated_at = excluded.updated_at"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(&checkpoint.scope.tenant_id)
        .bind(&checkpoint.scope.project_id)
        .bind(&checkpoint.source)
        .bind(&checkpoint.source_session_id)
        .bind(checkpoint.last_message_index)
        .bind(checkpoint.last_message_timestamp.map(|d| d.to_rfc3339()))
        .bind(&checkpoint.content_hash)
        .bind(checkpoint.checkpoint_at.to_rfc3339())
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_session_checkpoints(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64> {
        let mut sql =
            "DELETE FROM session_checkpoints WHERE tenant_id = ? AND project_id = ?".to_string();
        if source.is_some() {
            sql.push_str(" AND source = ?");
        }
        if source_session_id.is_some() {
            sql.push_str(" AND source_session_id = ?");
        }
        let mut query = sqlx::query(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.project_id);
        if let Some(source) = source {
            query = query.bind(source);
        }
        if let Some(source_session_id) = source_session_id {
            query = query.bind(source_session_id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get_stats(&self, scope: &Scope) -> Result<StorageStats> {
        let processed_sessions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processed_sessions WHERE tenant_id = ? AND project_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_one(&self.pool)
        .await?;
        let log_entries: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM log_entries WHERE tenant_id = ? AND project_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_one(&self.pool)
        .await?;
        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE tenant_id = ? AND project_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(StorageStats {
            processed_sessions,
            log_entries,
            chunks,
        })
    }

    async fn get_last_processed_at(&self, scope: &Scope) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<String> = sqlx::query_scalar(
            "SELECT MAX(processed_at) FROM processed_sessions WHERE tenant_id = ? AND project_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_one(&self.pool)
        .await?;
        ts.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(Into::into)
    }

    async fn list_recent_source_sessions(
        &self,
        scope: &Scope,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT source_session_id FROM processed_sessions WHERE tenant_id = ? AND project_id = ? ORDER BY processed_at DESC LIMIT ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn start_background_sync(&self, scope: &Scope, pid: Option<i64>) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO background_sync (tenant_id, project_id, is_running, started_at, completed_at, sessions_processed, learnings_extracted, error_message, pid, updated_at)
               VALUES (?, ?, 1, ?, NULL, 0, 0, NULL, ?, ?)
               ON CONFLICT(tenant_id, project_id) DO UPDATE SET
                   is_running = 1,
                   started_at = excluded.started_at,
                   completed_at = NULL,
                   error_message = NULL,
                   pid = excluded.pid,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .bind(Utc::now().to_rfc3339())
        .bind(pid)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_background_sync(
        &self,
        scope: &Scope,
        sessions_processed: i64,
        learnings_extracted: i64,
        error_message: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE background_sync SET
                   is_running = 0,
                   completed_at = ?,
                   sessions_processed = ?,
                   learnings_extracted = ?,
                   error_message = ?,
                   updated_at = ?
               WHERE tenant_id = ? AND project_id = ?"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(sessions_processed)
        .bind(learnings_extracted)
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_background_sync_status(&self, scope: &Scope) -> Result<BackgroundSyncStatus> {
        let row = sqlx::query(
            "SELECT * FROM background_sync WHERE tenant_id = ? AND project_id = ?",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.project_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(BackgroundSyncStatus {
                scope: scope.clone(),
                ..Default::default()
            });
        };

        let started_at: Option<String> = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(BackgroundSyncStatus {
            scope: scope.clone(),
            is_running: row.try_get::<i64, _>("is_running")? != 0,
            started_at: started_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
            completed_at: completed_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
            sessions_processed: row.try_get("sessions_processed")?,
            learnings_extracted: row.try_get("learnings_extracted")?,
            error_message: row.try_get("error_message")?,
            pid: row.try_get("pid")?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn test_store() -> SqliteStore {
        let pool = db::connect(std::path::Path::new(":memory:")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        let session = Session::new(scope.clone(), "fix the parser");
        store.create_session(&session).await.unwrap();

        let active = store.get_active_session(&scope).await.unwrap();
        assert_eq!(active.unwrap().id, session.id);

        let mut updated = session.clone();
        updated.status = SessionStatus::Completed;
        updated.ended_at = Some(Utc::now());
        store.update_session(&updated).await.unwrap();
        assert!(store.get_active_session(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_chunk_dedups_by_normalized_content_and_label() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        let chunk = Chunk {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            source: ChunkSource::LogEntry,
            source_ids: Vec::new(),
            content: "Never rm -rf the build cache".to_string(),
            label: SemanticLabel::Gotcha,
            tags: Vec::new(),
            created_at: Utc::now(),
            token_count: Some(7),
            embedding: None,
        };
        let first = store.store_chunk(&chunk).await.unwrap();
        assert!(first.is_some());

        let mut dup = chunk.clone();
        dup.id = Uuid::new_v4();
        dup.content = "  NEVER RM -RF the   build cache".to_string();
        let second = store.store_chunk(&dup).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fts_search_finds_indexed_chunk() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        let chunk = Chunk {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            source: ChunkSource::LogEntry,
            source_ids: Vec::new(),
            content: "retry with exponential backoff on rate limits".to_string(),
            label: SemanticLabel::Pattern,
            tags: Vec::new(),
            created_at: Utc::now(),
            token_count: None,
            embedding: None,
        };
        store.store_chunk(&chunk).await.unwrap();

        let results = store.search_chunks_fts(&scope, "backoff", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, chunk.id);
    }

    #[tokio::test]
    async fn malformed_fts_query_returns_empty_not_error() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        let results = store.search_chunks_fts(&scope, "\"unterminated", 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn clear_processed_sessions_can_be_narrowed_by_source() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        store.mark_session_processed(&scope, "codex", "c1").await.unwrap();
        store.mark_session_processed(&scope, "cursor", "u1").await.unwrap();

        let cleared = store.clear_processed_sessions(&scope, Some("codex"), None).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(!store.is_session_processed(&scope, "c1").await.unwrap());
        assert!(store.is_session_processed(&scope, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn clear_session_checkpoints_with_no_filter_clears_everything() {
        let store = test_store().await;
        let scope = Scope::default_scope();
        let checkpoint = SessionCheckpoint {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            source: "codex".to_string(),
            source_session_id: "c1".to_string(),
            last_message_index: Some(3),
            last_message_timestamp: None,
            content_hash: Some("abc".to_string()),
            checkpoint_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_session_checkpoint(&checkpoint).await.unwrap();
        assert!(store.get_session_checkpoint(&scope, "c1").await.unwrap().is_some());

        let cleared = store.clear_session_checkpoints(&scope, None, None).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(store.get_session_checkpoint(&scope, "c1").await.unwrap().is_none());
    }
}

//! Remote (shared) storage façade.
//!
//! Wraps a thin HTTP client over `storage.shared.base_url`, retrying
//! transient failures with exponential backoff and recording an
//! [`AuditEvent`] for every mutation when `storage.shared.audit_enabled` is
//! set. Read paths fall back to a local [`SqliteStore`] cache on HTTP
//! failure; write paths do not — after retries are exhausted a write
//! raises [`StorageBackendUnavailable`](crate::error::RecallError::StorageBackendUnavailable).

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SharedStorageConfig;
use crate::error::RecallError;
use crate::models::{
    AuditAction, AuditEvent, BackgroundSyncStatus, Chunk, LogEntry, Scope, SemanticLabel, Session,
    SessionCheckpoint, StorageStats,
};
use crate::storage::{ChunkCandidate, SqliteStore, Store};

/// Role-based permission check mirroring `storage.shared.role`.
fn role_allows_write(role: &str) -> bool {
    matches!(role, "admin" | "writer")
}

/// The sentinel `("default", "default")` scope is only legal against the
/// local backend; a shared backend has no notion of "no tenant" and must
/// reject it before issuing any request.
fn require_non_default_scope(scope: &Scope) -> Result<()> {
    if scope.is_default() {
        return Err(RecallError::NamespaceValidationError(
            "shared storage requires an explicit tenant/project scope; the default scope is local-only".into(),
        )
        .into());
    }
    Ok(())
}

pub struct RemoteStore {
    client: Client,
    base_url: String,
    config: SharedStorageConfig,
    /// Local cache used as a read-path fallback when the remote backend is
    /// unreachable. Never written to directly by callers.
    fallback: SqliteStore,
}

impl RemoteStore {
    pub fn new(config: SharedStorageConfig, fallback: SqliteStore) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| RecallError::ConfigError("storage.shared.base_url is required".into()))?;

        let api_key = std::env::var(&config.api_key_env).ok();
        if config.require_api_key && api_key.as_deref().unwrap_or("").is_empty() {
            return Err(RecallError::ConfigError(format!(
                "storage.shared.require_api_key is set but {} is unset or empty",
                config.api_key_env
            ))
            .into());
        }

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {key}").parse()?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs_f64(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url,
            config,
            fallback,
        })
    }

    async fn post_with_retry(&self, path: &str, body: &impl serde::Serialize) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .json(body)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(_) => return Ok(()),
                Err(err) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    tracing::warn!(attempt, %err, "shared storage write failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(RecallError::StorageBackendUnavailable(err.to_string()).into())
                }
            }
        }
    }

    async fn record_audit(&self, scope: &Scope, action: AuditAction, resource_type: &str, resource_id: Option<String>) {
        if !self.config.audit_enabled {
            return;
        }
        let event = AuditEvent {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            actor: self.config.audit_actor.clone(),
            action,
            resource_type: resource_type.to_string(),
            resource_id,
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.post_with_retry("/audit", &event).await {
            tracing::warn!(%err, "failed to record audit event");
        }
    }

    fn require_write_role(&self) -> Result<()> {
        if !role_allows_write(&self.config.role) {
            return Err(RecallError::StorageBackendUnavailable(format!(
                "role '{}' does not permit write operations",
                self.config.role
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for RemoteStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        require_non_default_scope(&session.scope)?;
        self.require_write_role()?;
        self.post_with_retry("/sessions", session).await?;
        self.record_audit(&session.scope, AuditAction::Create, "session", Some(session.id.to_string())).await;
        Ok(())
    }

    async fn get_session(&self, scope: &Scope, id: Uuid) -> Result<Option<Session>> {
        require_non_default_scope(scope)?;
        self.fallback.get_session(scope, id).await
    }

    async fn get_active_session(&self, scope: &Scope) -> Result<Option<Session>> {
        require_non_default_scope(scope)?;
        self.fallback.get_active_session(scope).await
    }

    async fn list_sessions(&self, scope: &Scope, limit: i64) -> Result<Vec<Session>> {
        require_non_default_scope(scope)?;
        self.fallback.list_sessions(scope, limit).await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        require_non_default_scope(&session.scope)?;
        self.require_write_role()?;
        self.post_with_retry(&format!("/sessions/{}", session.id), session).await?;
        self.record_audit(&session.scope, AuditAction::Update, "session", Some(session.id.to_string())).await;
        Ok(())
    }

    async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        require_non_default_scope(&entry.scope)?;
        self.require_write_role()?;
        self.post_with_retry("/entries", entry).await?;
        self.record_audit(&entry.scope, AuditAction::Create, "log_entry", Some(entry.id.to_string())).await;
        Ok(())
    }

    async fn get_entries(&self, scope: &Scope, session_id: Option<Uuid>) -> Result<Vec<LogEntry>> {
        require_non_default_scope(scope)?;
        self.fallback.get_entries(scope, session_id).await
    }

    async fn get_entries_by_label(
        &self,
        scope: &Scope,
        label: SemanticLabel,
        min_confidence: f64,
    ) -> Result<Vec<LogEntry>> {
        require_non_default_scope(scope)?;
        self.fallback.get_entries_by_label(scope, label, min_confidence).await
    }

    async fn store_chunk(&self, chunk: &Chunk) -> Result<Option<Uuid>> {
        require_non_default_scope(&chunk.scope)?;
        self.require_write_role()?;
        if !self.config.allow_promote {
            return Err(RecallError::StorageBackendUnavailable(
                "storage.shared.allow_promote is disabled".into(),
            )
            .into());
        }
        if self.fallback.has_chunk(&chunk.scope, &chunk.content, chunk.label).await? {
            return Ok(None);
        }
        self.post_with_retry("/chunks", chunk).await?;
        self.record_audit(&chunk.scope, AuditAction::Create, "chunk", Some(chunk.id.to_string())).await;
        Ok(Some(chunk.id))
    }

    async fn has_chunk(&self, scope: &Scope, content: &str, label: SemanticLabel) -> Result<bool> {
        require_non_default_scope(scope)?;
        self.fallback.has_chunk(scope, content, label).await
    }

    async fn search_chunks_fts(
        &self,
        scope: &Scope,
        query: &str,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        require_non_default_scope(scope)?;
        self.fallback.search_chunks_fts(scope, query, limit).await
    }

    async fn list_chunks_with_embeddings(&self, scope: &Scope) -> Result<Vec<Chunk>> {
        require_non_default_scope(scope)?;
        self.fallback.list_chunks_with_embeddings(scope).await
    }

    async fn is_session_processed(&self, scope: &Scope, source_session_id: &str) -> Result<bool> {
        require_non_default_scope(scope)?;
        self.fallback.is_session_processed(scope, source_session_id).await
    }

    async fn mark_session_processed(
        &self,
        scope: &Scope,
        source: &str,
        source_session_id: &str,
    ) -> Result<()> {
        require_non_default_scope(scope)?;
        self.require_write_role()?;
        self.fallback
            .mark_session_processed(scope, source, source_session_id)
            .await
    }

    async fn clear_processed_sessions(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64> {
        require_non_default_scope(scope)?;
        self.require_write_role()?;
        self.record_audit(scope, AuditAction::Clear, "processed_sessions", None).await;
        self.fallback
            .clear_processed_sessions(scope, source, source_session_id)
            .await
    }

    async fn get_session_checkpoint(
        &self,
        scope: &Scope,
        source_session_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        require_non_default_scope(scope)?;
        self.fallback.get_session_checkpoint(scope, source_session_id).await
    }

    async fn save_session_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        require_non_default_scope(&checkpoint.scope)?;
        self.require_write_role()?;
        self.fallback.save_session_checkpoint(checkpoint).await
    }

    async fn clear_session_checkpoints(
        &self,
        scope: &Scope,
        source: Option<&str>,
        source_session_id: Option<&str>,
    ) -> Result<u64> {
        require_non_default_scope(scope)?;
        self.require_write_role()?;
        self.fallback
            .clear_session_checkpoints(scope, source, source_session_id)
            .await
    }

    async fn get_stats(&self, scope: &Scope) -> Result<StorageStats> {
        require_non_default_scope(scope)?;
        self.fallback.get_stats(scope).await
    }

    async fn get_last_processed_at(&self, scope: &Scope) -> Result<Option<DateTime<Utc>>> {
        require_non_default_scope(scope)?;
        self.fallback.get_last_processed_at(scope).await
    }

    async fn list_recent_source_sessions(&self, scope: &Scope, limit: i64) -> Result<Vec<String>> {
        require_non_default_scope(scope)?;
        self.fallback.list_recent_source_sessions(scope, limit).await
    }

    async fn start_background_sync(&self, scope: &Scope, pid: Option<i64>) -> Result<()> {
        require_non_default_scope(scope)?;
        self.require_write_role()?;
        self.record_audit(scope, AuditAction::Start, "background_sync", None).await;
        self.fallback.start_background_sync(scope, pid).await
    }

    async fn complete_background_sync(
        &self,
        scope: &Scope,
        sessions_processed: i64,
        learnings_extracted: i64,
        error_message: Option<String>,
    ) -> Result<()> {
        require_non_default_scope(scope)?;
        self.require_write_role()?;
        self.record_audit(scope, AuditAction::Complete, "background_sync", None).await;
        self.fallback
            .complete_background_sync(scope, sessions_processed, learnings_extracted, error_message)
            .await
    }

    async fn get_background_sync_status(&self, scope: &Scope) -> Result<BackgroundSyncStatus> {
        require_non_default_scope(scope)?;
        self.fallback.get_background_sync_status(scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_admin_can_write_reader_cannot() {
        assert!(role_allows_write("writer"));
        assert!(role_allows_write("admin"));
        assert!(!role_allows_write("reader"));
    }
}

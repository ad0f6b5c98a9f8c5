//! Ingestion pipeline: discover sessions, compare checkpoints, extract
//! learnings, persist them.
//!
//! Orchestrates the [`IngesterRegistry`] and [`TranscriptExtractor`] over
//! a [`Store`], producing a structured [`SyncReport`]. The per-candidate
//! state machine (processed-marker check, content-hash compare,
//! checkpoint-filtered re-extraction) mirrors the teacher's now-removed
//! `ingest.rs` `run_sync`; the candidate discovery/sort/filter shape
//! mirrors `core/sync.py`'s `AutoSync`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::extract::TranscriptExtractor;
use crate::ingest::{IngesterRegistry, RawMessage, RawSession};
use crate::models::{LogEntry, Scope, SessionCheckpoint};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::storage::Store;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(45);
const EXTRACT_RETRY_ATTEMPTS: u32 = 3;
const EXTRACT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const ZERO_LEARNING_WARNING_MIN_MESSAGES: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct SourceCounts {
    pub discovered: u64,
    pub processed: u64,
    pub skipped: u64,
    pub already_processed: u64,
    pub extraction_failed: u64,
    pub empty: u64,
    pub learnings: u64,
    pub llm_batches: u64,
}

#[derive(Debug, Clone)]
pub struct SessionDiagnostic {
    pub source: String,
    pub session_id: String,
    pub status: String,
    pub message_count: Option<usize>,
    pub learnings_extracted: u64,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub sessions_discovered: u64,
    pub sessions_processed: u64,
    pub sessions_skipped: u64,
    pub sessions_already_processed: u64,
    pub sessions_incremental: u64,
    pub empty_sessions: u64,
    pub learnings_extracted: u64,
    pub llm_requests: u64,
    pub by_source: HashMap<String, SourceCounts>,
    pub session_diagnostics: Vec<SessionDiagnostic>,
    pub errors: Vec<String>,
}

/// Filters applied to the candidate set before processing.
#[derive(Debug, Clone, Default)]
pub struct SyncFilters {
    pub since: Option<DateTime<Utc>>,
    pub sources: Option<Vec<String>>,
    pub session_ids: Option<Vec<String>>,
    pub max_sessions: Option<usize>,
    pub dry_run: bool,
    /// Clear checkpoints (narrowed by `sources`/`session_ids` when given)
    /// before discovery, so their sessions are reprocessed incrementally
    /// from scratch instead of being skipped as already-processed.
    pub reset_checkpoints: bool,
    /// Clear both processed-session markers and checkpoints for the scope
    /// before discovery, forcing every session to be reprocessed in full.
    pub reset_full: bool,
}

struct Candidate<'a> {
    ingester: &'a dyn crate::ingest::Ingester,
    source_name: String,
    session_path: std::path::PathBuf,
    session_id: String,
    sort_timestamp: f64,
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    registry: IngesterRegistry,
    extractor: Arc<TranscriptExtractor>,
    progress: Box<dyn SyncProgressReporter>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        registry: IngesterRegistry,
        extractor: Arc<TranscriptExtractor>,
    ) -> Self {
        Self {
            store,
            registry,
            extractor,
            progress: Box::new(NoProgress),
        }
    }

    /// Report sync progress through `reporter` instead of discarding it.
    pub fn with_progress(mut self, reporter: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub async fn sync(&self, scope: &Scope, filters: &SyncFilters) -> anyhow::Result<SyncReport> {
        let mut report = SyncReport::default();

        if self.store.get_background_sync_status(scope).await?.is_running {
            anyhow::bail!("sync already running for this scope");
        }
        if !filters.dry_run {
            self.store.start_background_sync(scope, std::process::id().try_into().ok()).await?;
        }

        let result = self.run_sync(scope, filters, &mut report).await;

        if !filters.dry_run {
            let err_message = result.as_ref().err().map(|e: &anyhow::Error| e.to_string());
            self.store
                .complete_background_sync(
                    scope,
                    report.sessions_processed as i64,
                    report.learnings_extracted as i64,
                    err_message,
                )
                .await?;
        }

        result.map(|_| report)
    }

    async fn run_sync(
        &self,
        scope: &Scope,
        filters: &SyncFilters,
        report: &mut SyncReport,
    ) -> anyhow::Result<()> {
        self.apply_reset(scope, filters).await?;

        let active_ingesters = self.select_ingesters(filters.sources.as_deref());
        for ingester in &active_ingesters {
            report
                .by_source
                .entry(ingester.source_name().to_string())
                .or_default();
        }

        let mut candidates = Vec::new();
        for ingester in &active_ingesters {
            self.progress.report(SyncProgressEvent::Discovering {
                connector: ingester.source_name().to_string(),
            });
            match ingester.discover_sessions(filters.since) {
                Ok(paths) => {
                    for path in paths {
                        let session_id = ingester.get_session_id(&path);
                        let sort_timestamp = session_sort_timestamp(&path, &session_id);
                        candidates.push(Candidate {
                            ingester: *ingester,
                            source_name: ingester.source_name().to_string(),
                            session_path: path,
                            session_id,
                            sort_timestamp,
                        });
                    }
                }
                Err(e) => report
                    .errors
                    .push(format!("{}: {}", ingester.source_name(), e)),
            }
        }

        let (selected, missing_ids) = apply_candidate_filters(candidates, filters);
        if !missing_ids.is_empty() {
            report.errors.push(format!(
                "requested session IDs not found: {}",
                missing_ids.join(", ")
            ));
        }

        report.sessions_discovered = selected.len() as u64;
        for candidate in &selected {
            report
                .by_source
                .entry(candidate.source_name.clone())
                .or_default()
                .discovered += 1;
        }

        if filters.dry_run {
            return Ok(());
        }

        let total = selected.len() as u64;
        for (n, candidate) in selected.into_iter().enumerate() {
            self.progress.report(SyncProgressEvent::Ingesting {
                connector: candidate.source_name.clone(),
                n: n as u64 + 1,
                total,
            });
            self.process_candidate(scope, &candidate, filters, report).await;
        }

        Ok(())
    }

    /// Clears processed-session markers and/or checkpoints ahead of
    /// discovery per `filters.reset_full`/`filters.reset_checkpoints`,
    /// narrowed by `filters.sources`/`filters.session_ids` when given.
    async fn apply_reset(&self, scope: &Scope, filters: &SyncFilters) -> anyhow::Result<()> {
        if filters.reset_full {
            self.store.clear_processed_sessions(scope, None, None).await?;
            self.store.clear_session_checkpoints(scope, None, None).await?;
            return Ok(());
        }
        if !filters.reset_checkpoints {
            return Ok(());
        }
        if let Some(session_ids) = &filters.session_ids {
            for session_id in session_ids {
                self.store
                    .clear_session_checkpoints(scope, None, Some(session_id.as_str()))
                    .await?;
            }
        } else if let Some(sources) = &filters.sources {
            for source in sources {
                self.store
                    .clear_session_checkpoints(scope, Some(source.as_str()), None)
                    .await?;
            }
        } else {
            self.store.clear_session_checkpoints(scope, None, None).await?;
        }
        Ok(())
    }

    fn select_ingesters(&self, sources: Option<&[String]>) -> Vec<&dyn crate::ingest::Ingester> {
        match sources {
            None => self
                .registry
                .ingesters()
                .iter()
                .map(|b| b.as_ref())
                .collect(),
            Some(wanted) => {
                let wanted: Vec<String> = wanted.iter().map(|s| s.to_lowercase()).collect();
                self.registry
                    .ingesters()
                    .iter()
                    .map(|b| b.as_ref())
                    .filter(|i| wanted.contains(&i.source_name().to_lowercase()))
                    .collect()
            }
        }
    }

    async fn process_candidate(
        &self,
        scope: &Scope,
        candidate: &Candidate<'_>,
        filters: &SyncFilters,
        report: &mut SyncReport,
    ) {
        let source_counts = report.by_source.entry(candidate.source_name.clone()).or_default();

        let checkpoint = match self
            .store
            .get_session_checkpoint(scope, &candidate.session_id)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                report.errors.push(format!("{}: {}", candidate.session_id, e));
                return;
            }
        };
        let is_fully_processed = self
            .store
            .is_session_processed(scope, &candidate.session_id)
            .await
            .unwrap_or(false);

        if is_fully_processed && checkpoint.is_none() && !filters.reset_checkpoints {
            source_counts.skipped += 1;
            source_counts.already_processed += 1;
            report.sessions_skipped += 1;
            report.sessions_already_processed += 1;
            report.session_diagnostics.push(SessionDiagnostic {
                source: candidate.source_name.clone(),
                session_id: candidate.session_id.clone(),
                status: "skipped_already_processed".to_string(),
                message_count: None,
                learnings_extracted: 0,
                warning: None,
            });
            return;
        }

        let raw_session = match candidate.ingester.parse_session(&candidate.session_path) {
            Ok(s) => s,
            Err(e) => {
                report.errors.push(format!(
                    "{}:{}: {}",
                    candidate.source_name,
                    candidate.session_path.display(),
                    e
                ));
                report.session_diagnostics.push(SessionDiagnostic {
                    source: candidate.source_name.clone(),
                    session_id: candidate.session_id.clone(),
                    status: "failed_parse".to_string(),
                    message_count: None,
                    learnings_extracted: 0,
                    warning: None,
                });
                return;
            }
        };
        let original_message_count = raw_session.messages.len();

        let content_hash = compute_session_hash(&raw_session);
        if let Some(cp) = &checkpoint {
            if cp.content_hash.as_deref() == Some(content_hash.as_str()) {
                source_counts.skipped += 1;
                source_counts.already_processed += 1;
                report.sessions_skipped += 1;
                report.sessions_already_processed += 1;
                report.session_diagnostics.push(SessionDiagnostic {
                    source: candidate.source_name.clone(),
                    session_id: candidate.session_id.clone(),
                    status: "skipped_already_processed".to_string(),
                    message_count: Some(original_message_count),
                    learnings_extracted: 0,
                    warning: None,
                });
                return;
            }
        }

        let (filtered_session, messages_filtered) =
            filter_messages_from_checkpoint(raw_session, checkpoint.as_ref());
        let message_count = filtered_session.messages.len();

        if message_count < 2 {
            self.save_checkpoint(
                scope,
                &candidate.source_name,
                &candidate.session_id,
                &filtered_session,
                &content_hash,
            )
            .await;
            if !is_fully_processed {
                let _ = self
                    .store
                    .mark_session_processed(scope, &candidate.source_name, &candidate.session_id)
                    .await;
            }
            source_counts.skipped += 1;
            source_counts.empty += 1;
            report.sessions_skipped += 1;
            report.empty_sessions += 1;
            report.session_diagnostics.push(SessionDiagnostic {
                source: candidate.source_name.clone(),
                session_id: candidate.session_id.clone(),
                status: "skipped_empty".to_string(),
                message_count: Some(message_count),
                learnings_extracted: 0,
                warning: None,
            });
            return;
        }

        let extraction = self.extract_with_retry(&filtered_session, scope).await;
        let (entries, llm_batches) = match extraction {
            Ok(v) => v,
            Err(e) => {
                report.errors.push(format!(
                    "{}:{}: extraction failed: {}",
                    candidate.source_name,
                    candidate.session_path.display(),
                    e
                ));
                source_counts.skipped += 1;
                source_counts.extraction_failed += 1;
                report.sessions_skipped += 1;
                report.session_diagnostics.push(SessionDiagnostic {
                    source: candidate.source_name.clone(),
                    session_id: candidate.session_id.clone(),
                    status: "failed_extraction".to_string(),
                    message_count: Some(message_count),
                    learnings_extracted: 0,
                    warning: None,
                });
                return;
            }
        };

        for entry in &entries {
            if let Err(e) = self.store.append_entry(entry).await {
                report.errors.push(format!("{}: {}", candidate.session_id, e));
            }
        }

        self.save_checkpoint(
            scope,
            &candidate.source_name,
            &candidate.session_id,
            &filtered_session,
            &content_hash,
        )
        .await;
        if !is_fully_processed {
            let _ = self
                .store
                .mark_session_processed(scope, &candidate.source_name, &candidate.session_id)
                .await;
        }

        source_counts.processed += 1;
        source_counts.learnings += entries.len() as u64;
        source_counts.llm_batches += llm_batches;
        report.sessions_processed += 1;
        if messages_filtered {
            report.sessions_incremental += 1;
        }
        report.learnings_extracted += entries.len() as u64;
        report.llm_requests += llm_batches;

        let mut warning = None;
        if message_count >= ZERO_LEARNING_WARNING_MIN_MESSAGES && entries.is_empty() {
            let msg = format!(
                "{}:{} has {} messages but yielded 0 learnings",
                candidate.source_name, candidate.session_id, message_count
            );
            warn!("{}", msg);
            report.errors.push(msg.clone());
            warning = Some(msg);
        }

        report.session_diagnostics.push(SessionDiagnostic {
            source: candidate.source_name.clone(),
            session_id: candidate.session_id.clone(),
            status: "processed".to_string(),
            message_count: Some(message_count),
            learnings_extracted: entries.len() as u64,
            warning,
        });
    }

    async fn extract_with_retry(
        &self,
        session: &RawSession,
        scope: &Scope,
    ) -> anyhow::Result<(Vec<LogEntry>, u64)> {
        let mut last_err = None;
        for attempt in 1..=EXTRACT_RETRY_ATTEMPTS {
            let mut batches = 0u64;
            let mut on_progress = |_event: crate::extract::ExtractionProgress| {
                batches += 1;
            };
            let outcome = tokio::time::timeout(
                EXTRACT_TIMEOUT,
                self.extractor.extract(session, scope, Some(&mut on_progress)),
            )
            .await;

            match outcome {
                Ok(Ok(entries)) => return Ok((entries, batches)),
                Ok(Err(e)) => {
                    last_err = Some(e);
                    break;
                }
                Err(_elapsed) => {
                    last_err = Some(anyhow::anyhow!(
                        "extraction timed out after {}s (attempt {}/{})",
                        EXTRACT_TIMEOUT.as_secs(),
                        attempt,
                        EXTRACT_RETRY_ATTEMPTS
                    ));
                    if attempt < EXTRACT_RETRY_ATTEMPTS {
                        tokio::time::sleep(EXTRACT_RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("extraction failed after retries")))
    }

    async fn save_checkpoint(
        &self,
        scope: &Scope,
        source: &str,
        session_id: &str,
        session: &RawSession,
        content_hash: &str,
    ) {
        let Some(last_message) = session.messages.last() else {
            return;
        };
        let checkpoint = SessionCheckpoint {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            source: source.to_string(),
            source_session_id: session_id.to_string(),
            last_message_index: Some(session.messages.len() as i64 - 1),
            last_message_timestamp: last_message.timestamp,
            content_hash: Some(content_hash.to_string()),
            checkpoint_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let _ = self.store.save_session_checkpoint(&checkpoint).await;
    }
}

fn compute_session_hash(session: &RawSession) -> String {
    let joined = session
        .messages
        .iter()
        .map(|m| format!("{}:{}", role_str(m), m.content))
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)[..32].to_string()
}

fn role_str(message: &RawMessage) -> &'static str {
    match message.role {
        crate::ingest::Role::User => "user",
        crate::ingest::Role::Assistant => "assistant",
    }
}

fn filter_messages_from_checkpoint(
    session: RawSession,
    checkpoint: Option<&SessionCheckpoint>,
) -> (RawSession, bool) {
    let Some(checkpoint) = checkpoint else {
        return (session, false);
    };

    if let Some(last_index) = checkpoint.last_message_index {
        let total = session.messages.len() as i64;
        if last_index < total - 1 {
            let start = (last_index + 1).max(0) as usize;
            let mut filtered = session;
            filtered.messages = filtered.messages.split_off(start.min(filtered.messages.len()));
            return (filtered, true);
        }
        return (session, false);
    }

    if let Some(checkpoint_time) = checkpoint.last_message_timestamp {
        let original_len = session.messages.len();
        let mut filtered = session;
        filtered
            .messages
            .retain(|m| m.timestamp.map_or(true, |t| t > checkpoint_time));
        let changed = filtered.messages.len() < original_len;
        return (filtered, changed);
    }

    (session, false)
}

fn session_sort_timestamp(path: &Path, session_id: &str) -> f64 {
    if let Ok(meta) = std::fs::metadata(path) {
        if let Ok(modified) = meta.modified() {
            if let Ok(duration) = modified.duration_since(std::time::UNIX_EPOCH) {
                return duration.as_secs_f64();
            }
        }
    }

    let token = session_id.rsplit('-').next().unwrap_or("");
    if let Ok(numeric) = token.parse::<f64>() {
        return if numeric > 1e12 { numeric / 1000.0 } else { numeric };
    }
    0.0
}

fn apply_candidate_filters<'a>(
    candidates: Vec<Candidate<'a>>,
    filters: &SyncFilters,
) -> (Vec<Candidate<'a>>, Vec<String>) {
    let mut selected = candidates;
    let mut missing_ids = Vec::new();

    if let Some(requested) = &filters.session_ids {
        let requested: std::collections::HashSet<String> = requested
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        selected.retain(|c| requested.contains(&c.session_id));
        let found: std::collections::HashSet<String> =
            selected.iter().map(|c| c.session_id.clone()).collect();
        missing_ids = requested.difference(&found).cloned().collect();
        missing_ids.sort();
    }

    selected.sort_by(|a, b| {
        b.sort_timestamp
            .partial_cmp(&a.sort_timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.session_id.cmp(&a.session_id))
    });

    if let Some(max_sessions) = filters.max_sessions {
        selected.truncate(max_sessions);
    }

    (selected, missing_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawMessage, Role as IngestRole};

    fn msg(role: IngestRole, content: &str) -> RawMessage {
        RawMessage {
            role,
            content: content.to_string(),
            timestamp: None,
            tool_calls: vec![],
        }
    }

    #[test]
    fn compute_session_hash_is_stable_and_length_32() {
        let session = RawSession {
            source: "cursor".to_string(),
            session_id: "cursor-1".to_string(),
            title: None,
            project_path: None,
            started_at: Utc::now(),
            ended_at: None,
            messages: vec![msg(IngestRole::User, "hi"), msg(IngestRole::Assistant, "hello")],
        };
        let h1 = compute_session_hash(&session);
        let h2 = compute_session_hash(&session);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
    }

    #[test]
    fn filter_messages_from_checkpoint_by_index_keeps_tail() {
        let session = RawSession {
            source: "cursor".to_string(),
            session_id: "cursor-1".to_string(),
            title: None,
            project_path: None,
            started_at: Utc::now(),
            ended_at: None,
            messages: vec![
                msg(IngestRole::User, "a"),
                msg(IngestRole::Assistant, "b"),
                msg(IngestRole::User, "c"),
            ],
        };
        let checkpoint = SessionCheckpoint {
            id: Uuid::new_v4(),
            scope: Scope::default_scope(),
            source: "cursor".to_string(),
            source_session_id: "cursor-1".to_string(),
            last_message_index: Some(0),
            last_message_timestamp: None,
            content_hash: None,
            checkpoint_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let (filtered, changed) = filter_messages_from_checkpoint(session, Some(&checkpoint));
        assert!(changed);
        assert_eq!(filtered.messages.len(), 2);
        assert_eq!(filtered.messages[0].content, "b");
    }

    #[test]
    fn session_sort_timestamp_falls_back_to_trailing_token() {
        let ts = session_sort_timestamp(Path::new("/nonexistent/path"), "codex-1700000000");
        assert_eq!(ts, 1_700_000_000.0);
    }
}

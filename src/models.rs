//! Core data models shared across the ingestion, compaction, and retrieval
//! pipelines.
//!
//! Field names and allowed enum values mirror the original implementation's
//! `storage/models.py`, translated into `serde`-friendly Rust types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tenant/project scoping pair threaded through every storage call.
///
/// The sentinel `("default", "default")` is only legal when the configured
/// storage backend is `local`; `Store` implementations reject it otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub project_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn default_scope() -> Self {
        Self::new("default", "default")
    }

    pub fn is_default(&self) -> bool {
        self.tenant_id == "default" && self.project_id == "default"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Explicit,
    Ingested,
    Extracted,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationStatus {
    Pending,
    Approved,
    Rejected,
}

/// Determines which tier a derived fact may be promoted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticLabel {
    HardFailure,
    Gotcha,
    Correction,
    Preference,
    Pattern,
    Decision,
    Exploration,
    Narrative,
}

impl SemanticLabel {
    pub const ALL: [SemanticLabel; 8] = [
        SemanticLabel::HardFailure,
        SemanticLabel::Gotcha,
        SemanticLabel::Correction,
        SemanticLabel::Preference,
        SemanticLabel::Pattern,
        SemanticLabel::Decision,
        SemanticLabel::Exploration,
        SemanticLabel::Narrative,
    ];

    /// Parse a label string from LLM output, allowing a small alias table
    /// before giving up.
    pub fn parse_lenient(raw: &str) -> Option<SemanticLabel> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        Some(match normalized.as_str() {
            "hard_failure" | "hardfailure" | "failure" => SemanticLabel::HardFailure,
            "gotcha" | "quirk" => SemanticLabel::Gotcha,
            "correction" | "fix" | "corrected" => SemanticLabel::Correction,
            "preference" | "pref" => SemanticLabel::Preference,
            "pattern" => SemanticLabel::Pattern,
            "decision" | "decision_rationale" | "rationale" => SemanticLabel::Decision,
            "exploration" | "explore" => SemanticLabel::Exploration,
            "narrative" | "summary" => SemanticLabel::Narrative,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticLabel::HardFailure => "hard_failure",
            SemanticLabel::Gotcha => "gotcha",
            SemanticLabel::Correction => "correction",
            SemanticLabel::Preference => "preference",
            SemanticLabel::Pattern => "pattern",
            SemanticLabel::Decision => "decision",
            SemanticLabel::Exploration => "exploration",
            SemanticLabel::Narrative => "narrative",
        }
    }
}

impl std::fmt::Display for SemanticLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    LogEntry,
    Compaction,
    Import,
    Manual,
}

/// One explicit work unit started by a user. At most one `active` session
/// per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub scope: Scope,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub task: String,
    pub summary: Option<String>,
    pub entry_count: i64,
}

impl Session {
    pub fn new(scope: Scope, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            task: task.into(),
            summary: None,
            entry_count: 0,
        }
    }
}

/// The atomic captured-knowledge unit. Immutable after creation; only
/// `curation_status` is mutated after the fact, via a dedicated command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub scope: Scope,
    pub session_id: Option<Uuid>,
    pub source: LogSource,
    pub source_session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub label: SemanticLabel,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub curation_status: CurationStatus,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        scope: Scope,
        source: LogSource,
        content: impl Into<String>,
        label: SemanticLabel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            session_id: None,
            source,
            source_session_id: None,
            timestamp: Utc::now(),
            content: content.into(),
            label,
            tags: Vec::new(),
            confidence: 1.0,
            curation_status: CurationStatus::Approved,
            metadata: HashMap::new(),
        }
    }
}

/// An indexed retrieval unit. `(normalize(content), label)` is unique per
/// scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub scope: Scope,
    pub source: ChunkSource,
    pub source_ids: Vec<Uuid>,
    pub content: String,
    pub label: SemanticLabel,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub token_count: Option<i64>,
    pub embedding: Option<Vec<f32>>,
}

/// Normalize content for dedup/uniqueness comparisons: lowercase,
/// whitespace-collapsed.
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Per-`source_session_id` incremental-ingestion progress marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub id: Uuid,
    pub scope: Scope,
    pub source: String,
    pub source_session_id: String,
    pub last_message_index: Option<i64>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub checkpoint_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status tracking for an in-flight or last-completed background sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSyncStatus {
    pub scope: Scope,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sessions_processed: i64,
    pub learnings_extracted: i64,
    pub error_message: Option<String>,
    pub pid: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for BackgroundSyncStatus {
    fn default() -> Self {
        Self {
            scope: Scope::default_scope(),
            is_running: false,
            started_at: None,
            completed_at: None,
            sessions_processed: 0,
            learnings_extracted: 0,
            error_message: None,
            pid: None,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregate counts for `get_stats`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct StorageStats {
    pub processed_sessions: i64,
    pub log_entries: i64,
    pub chunks: i64,
}

/// Audit action recorded for shared-backend mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Clear,
    Start,
    Complete,
}

/// Immutable audit event emitted by `RemoteStore` when
/// `storage.shared.audit_enabled` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub scope: Scope,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one iteration-loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Completed,
    ValidationFailed,
    ScopeReduced,
    Blocked,
    Timeout,
}

/// One file per loop iteration, archived under `ralph/iterations/NNN.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub item_id: String,
    pub item_title: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub outcome: Option<IterationOutcome>,
    pub summary: Option<String>,
    pub failure_reason: Option<String>,
    pub gotcha_discovered: Option<String>,
    pub pattern_that_worked: Option<String>,
    pub scope_change: Option<String>,
    pub token_usage: Option<HashMap<String, i64>>,
    pub token_model: Option<String>,
    pub validation_exit_code: Option<i32>,
    pub validation_hint: Option<String>,
    pub files_changed: Vec<String>,
    pub commit_hash: Option<String>,
}

impl IterationReport {
    pub fn new(iteration: u32, item_id: impl Into<String>, item_title: impl Into<String>) -> Self {
        Self {
            iteration,
            item_id: item_id.into(),
            item_title: item_title.into(),
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            outcome: None,
            summary: None,
            failure_reason: None,
            gotcha_discovered: None,
            pattern_that_worked: None,
            scope_change: None,
            token_usage: None,
            token_model: None,
            validation_exit_code: None,
            validation_hint: None,
            files_changed: Vec::new(),
            commit_hash: None,
        }
    }
}

/// Iteration-loop state machine position, persisted in `ralph_state.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RalphStatus {
    Disabled,
    Enabled,
    Iterating,
}

/// Persisted iteration-loop state (`.agent/ralph/ralph_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphState {
    pub status: RalphStatus,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub selected_prd_ids: Option<Vec<String>>,
    pub total_cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl Default for RalphState {
    fn default() -> Self {
        Self {
            status: RalphStatus::Disabled,
            current_iteration: 0,
            total_iterations: 0,
            selected_prd_ids: None,
            total_cost_usd: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// A completed PRD item record archived to `ralph/prd_archive.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedPrdItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub user_story: String,
    pub steps: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub validation_commands: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub completion_iteration: u32,
    pub key_decisions: Vec<String>,
    pub lessons_learned: Vec<String>,
    pub related_files: Vec<String>,
    pub commit_hashes: Vec<String>,
}

impl ArchivedPrdItem {
    /// Text used as input to the deterministic semantic-search embedding.
    pub fn searchable_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.title,
            self.description,
            self.user_story,
            self.lessons_learned.join(" ")
        )
    }
}

/// The three curated markdown artifacts consuming agents read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierFile {
    Guardrails,
    Style,
    Recent,
}

impl TierFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            TierFile::Guardrails => "GUARDRAILS.md",
            TierFile::Style => "STYLE.md",
            TierFile::Recent => "RECENT.md",
        }
    }

    pub fn header_name(&self) -> &'static str {
        match self {
            TierFile::Guardrails => "Guardrails",
            TierFile::Style => "Style",
            TierFile::Recent => "Recent",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TierFile::Guardrails => "Rules and warnings learned during development.",
            TierFile::Style => "Patterns and preferences learned during development.",
            TierFile::Recent => "Recent development activity summaries.",
        }
    }

    pub fn default_max_entries(&self) -> usize {
        match self {
            TierFile::Guardrails => 50,
            TierFile::Style => 100,
            TierFile::Recent => 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_is_default() {
        assert!(Scope::default_scope().is_default());
        assert!(!Scope::new("acme", "repo1").is_default());
    }

    #[test]
    fn normalize_content_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_content("  Hello   World\n"),
            normalize_content("hello world")
        );
    }

    #[test]
    fn label_parse_lenient_accepts_aliases() {
        assert_eq!(
            SemanticLabel::parse_lenient("Hard-Failure"),
            Some(SemanticLabel::HardFailure)
        );
        assert_eq!(SemanticLabel::parse_lenient("bogus"), None);
    }
}

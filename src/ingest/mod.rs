//! Ingester plugin contract.
//!
//! Each external coding-agent tool stores its transcripts in its own
//! on-disk format. An [`Ingester`] discovers that tool's session files,
//! names them stably, and normalizes them into a [`RawSession`] the
//! extraction pipeline can chunk and summarize.

pub mod jsonl;
pub mod nested_json;
pub mod workspace_sqlite;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawToolCall {
    pub tool: String,
    pub args: Map<String, Value>,
    pub result: Option<String>,
    pub success: bool,
    pub duration_ms: Option<i64>,
}

impl RawToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
            result: None,
            success: true,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Clone)]
pub struct RawSession {
    pub source: String,
    pub session_id: String,
    pub title: Option<String>,
    pub project_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub messages: Vec<RawMessage>,
}

/// Discovers, identifies, and parses a single coding-agent tool's session
/// storage into the canonical [`RawSession`] shape.
pub trait Ingester: Send + Sync {
    fn source_name(&self) -> &str;

    /// List session paths, oldest-first by discovery order; `since` (if
    /// given) filters out sessions known to be older.
    fn discover_sessions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>>;

    /// Stable id of the form `"<source>-<native-id>"`.
    fn get_session_id(&self, path: &Path) -> String;

    fn parse_session(&self, path: &Path) -> Result<RawSession>;
}

/// Registry of all built-in ingesters, consulted by the pipeline's
/// discovery phase.
pub struct IngesterRegistry {
    ingesters: Vec<Box<dyn Ingester>>,
}

impl IngesterRegistry {
    pub fn new() -> Self {
        Self {
            ingesters: Vec::new(),
        }
    }

    pub fn register(&mut self, ingester: Box<dyn Ingester>) {
        self.ingesters.push(ingester);
    }

    pub fn ingesters(&self) -> &[Box<dyn Ingester>] {
        &self.ingesters
    }

    pub fn find(&self, source_name: &str) -> Option<&dyn Ingester> {
        self.ingesters
            .iter()
            .find(|i| i.source_name() == source_name)
            .map(|i| i.as_ref())
    }
}

impl Default for IngesterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// --- Shared normalization helpers, used by all three variants -------------

/// Accepts ISO-8601 (with or without trailing `Z`), seconds-since-epoch,
/// and milliseconds-since-epoch (values over 10^12 are treated as ms).
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => {
            let normalized = s.replace('Z', "+00:00");
            DateTime::parse_from_rfc3339(&normalized)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

pub(crate) fn parse_timestamp_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        if let Some(value) = obj.get(*key) {
            if let Some(parsed) = parse_timestamp(value) {
                return Some(parsed);
            }
        }
    }
    None
}

pub(crate) fn normalize_role(raw: &str) -> Option<Role> {
    match raw.trim().to_lowercase().as_str() {
        "user" | "human" | "prompt" => Some(Role::User),
        "assistant" | "ai" | "model" => Some(Role::Assistant),
        _ => None,
    }
}

/// Drops trivial messages (fewer than 3 non-whitespace chars and no tool
/// calls) and collapses adjacent duplicates of the same role + content.
pub(crate) fn apply_normalization_invariants(messages: Vec<RawMessage>) -> Vec<RawMessage> {
    let mut deduped: Vec<RawMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        let significant = message.content.trim().chars().filter(|c| !c.is_whitespace()).count() >= 3;
        if !significant && message.tool_calls.is_empty() {
            continue;
        }
        if let Some(previous) = deduped.last() {
            if previous.role == message.role && previous.content == message.content {
                continue;
            }
        }
        deduped.push(message);
    }
    deduped
}

/// First non-trivial user message, trimmed to <=96 chars with an ellipsis;
/// otherwise the session id with separators replaced by spaces.
pub(crate) fn infer_title(messages: &[RawMessage], fallback: &str) -> String {
    for message in messages {
        if message.role != Role::User {
            continue;
        }
        let normalized = message.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.chars().count() < 5 || normalized == "[tool-result]" {
            continue;
        }
        if normalized.chars().count() > 96 {
            let truncated: String = normalized.chars().take(93).collect();
            return format!("{}...", truncated.trim_end());
        }
        return normalized;
    }

    let cleaned = fallback
        .replace('-', " ")
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

pub(crate) fn value_as_args(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("raw".to_string(), other.clone());
            map
        }
    }
}

pub(crate) fn stringify_result(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timestamp_distinguishes_seconds_and_millis() {
        let secs = parse_timestamp(&Value::from(1_700_000_000)).unwrap();
        let millis = parse_timestamp(&Value::from(1_700_000_000_000i64)).unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn infer_title_truncates_long_messages() {
        let long = "x".repeat(200);
        let messages = vec![RawMessage {
            role: Role::User,
            content: long,
            timestamp: None,
            tool_calls: vec![],
        }];
        let title = infer_title(&messages, "fallback-id");
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 96);
    }

    #[test]
    fn infer_title_falls_back_to_cleaned_session_id() {
        let title = infer_title(&[], "codex-session_123");
        assert_eq!(title, "codex session 123");
    }

    #[test]
    fn normalization_drops_trivial_messages_and_dedups_adjacent() {
        let messages = vec![
            RawMessage {
                role: Role::User,
                content: "hi".to_string(),
                timestamp: None,
                tool_calls: vec![],
            },
            RawMessage {
                role: Role::User,
                content: "hello there".to_string(),
                timestamp: None,
                tool_calls: vec![],
            },
            RawMessage {
                role: Role::User,
                content: "hello there".to_string(),
                timestamp: None,
                tool_calls: vec![],
            },
        ];
        let result = apply_normalization_invariants(messages);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].content, "hello there");
    }
}

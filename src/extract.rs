//! Semantic learning extraction from normalized session transcripts.
//!
//! Sends each message batch of a session to an [`LlmProvider`], then
//! defensively parses whatever comes back into [`LogEntry`] candidates.
//! Models can return a bare JSON array, an object wrapping the array
//! under one of several keys, or prose with the array embedded in a
//! fenced code block — `LLMPayload` tries each shape in turn before
//! falling back to a balanced-bracket scan over the raw text.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::ingest::{RawMessage, RawSession, Role as IngestRole};
use crate::llm::{LlmProvider, Message};
use crate::models::{CurationStatus, LogEntry, LogSource, Scope, SemanticLabel};

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are analyzing a development session transcript
to extract learnings that will help future AI agents working on this codebase.

Your job is to identify valuable insights in these categories:

1. hard_failure: Things that definitively broke or didn't work
2. gotcha: Non-obvious issues or quirks discovered
3. correction: When the user corrected the agent's approach
4. preference: Implicit or explicit team/codebase preferences
5. pattern: Useful patterns that worked well
6. decision: Significant architectural or design decisions with rationale

RULES:
- Focus on knowledge that helps future agents avoid mistakes or work more effectively
- Be specific and actionable
- Include the "why" when possible
- Do not extract routine operations
- Do not extract workflow/process instructions (task status updates, ticket/plan handling)
- Never include chain-of-thought, reasoning traces, or commentary in output
- If there are no meaningful learnings, return an empty array

For confidence scoring:
- High (0.9): Explicit statement or direct feedback
- Medium (0.7): Inferred from behavior or context
- Low (0.5): Tentative observation"#;

fn user_prompt(
    source: &str,
    project_path: &str,
    date: &str,
    duration: &str,
    segment: &str,
    transcript: &str,
) -> String {
    format!(
        r#"Analyze this development session transcript and extract learnings.

Session source: {source}
Project: {project_path}
Date: {date}
Duration: {duration}
Segment: {segment}

=== TRANSCRIPT START ===
{transcript}
=== TRANSCRIPT END ===

Output as a JSON array. Each item must have:
{{
  "label": "<hard_failure|gotcha|correction|preference|pattern|decision>",
  "content": "<concise, actionable description>",
  "tags": ["<relevant>", "<tags>"],
  "confidence": <0.5-1.0>,
  "evidence": "<brief quote or reference>"
}}

If there are no meaningful learnings, output exactly: []
Do not include markdown fences, prose, or thinking tags.
Return only raw JSON.

JSON array:"#
    )
}

/// One batch's worth of extraction progress, surfaced to CLI/TUI callers.
#[derive(Debug, Clone)]
pub struct ExtractionProgress {
    pub source: String,
    pub session_id: String,
    pub batch_index: usize,
    pub batch_count: usize,
    pub batch_messages: usize,
    pub messages_processed: usize,
    pub messages_total: usize,
    pub batch_learnings: usize,
}

/// Extracts [`LogEntry`] candidates from a [`RawSession`] by batching its
/// messages through an [`LlmProvider`].
pub struct TranscriptExtractor {
    llm: Arc<dyn LlmProvider>,
    messages_per_batch: usize,
}

impl TranscriptExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, messages_per_batch: usize) -> Self {
        Self {
            llm,
            messages_per_batch: messages_per_batch.max(1),
        }
    }

    pub async fn extract(
        &self,
        session: &RawSession,
        scope: &Scope,
        mut progress: Option<&mut dyn FnMut(ExtractionProgress)>,
    ) -> anyhow::Result<Vec<LogEntry>> {
        if session.messages.len() < 2 {
            return Ok(Vec::new());
        }

        let batches = chunk_messages(&session.messages, self.messages_per_batch);
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let total_messages = session.messages.len();
        let duration = build_duration(session);
        let mut combined = Vec::new();
        let mut messages_processed = 0usize;

        for (batch_index, batch) in batches.iter().enumerate() {
            messages_processed += batch.len();

            let transcript = format_transcript(session.source.as_str(), batch, 5_000);
            if transcript.len() < 200 {
                continue;
            }

            let response = self
                .llm
                .generate(
                    &[
                        Message::system(EXTRACTION_SYSTEM_PROMPT),
                        Message::user(user_prompt(
                            &session.source,
                            session
                                .project_path
                                .as_ref()
                                .map(|p| p.display().to_string())
                                .as_deref()
                                .unwrap_or("unknown"),
                            &session.started_at.format("%Y-%m-%d %H:%M").to_string(),
                            &duration,
                            &format!("batch {}/{}", batch_index + 1, batches.len()),
                            &transcript,
                        )),
                    ],
                    0.1,
                    700,
                )
                .await?;

            let batch_entries = parse_llm_response(&response.content, session, scope);
            if let Some(cb) = progress.as_deref_mut() {
                cb(ExtractionProgress {
                    source: session.source.clone(),
                    session_id: session.session_id.clone(),
                    batch_index: batch_index + 1,
                    batch_count: batches.len(),
                    batch_messages: batch.len(),
                    messages_processed,
                    messages_total: total_messages,
                    batch_learnings: batch_entries.len(),
                });
            }
            combined.extend(batch_entries);
        }

        Ok(deduplicate_entries(combined))
    }
}

fn chunk_messages(messages: &[RawMessage], chunk_size: usize) -> Vec<&[RawMessage]> {
    messages.chunks(chunk_size).collect()
}

fn build_duration(session: &RawSession) -> String {
    let Some(ended_at) = session.ended_at else {
        return "unknown".to_string();
    };
    let minutes = (ended_at - session.started_at).num_minutes();
    if minutes < 60 {
        format!("{} minutes", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

fn format_transcript(_source: &str, messages: &[RawMessage], max_chars: usize) -> String {
    let mut lines = Vec::new();

    for message in messages {
        let ts = message
            .timestamp
            .map(|t| format!(" [{}]", t.format("%H:%M")))
            .unwrap_or_default();
        let role_display = match message.role {
            IngestRole::User => "USER",
            IngestRole::Assistant => "ASSISTANT",
        };
        lines.push(format!("### {role_display}{ts}"));
        lines.push(String::new());
        lines.push(message.content.clone());

        for tool_call in &message.tool_calls {
            let status = if tool_call.success { "OK" } else { "ERR" };
            lines.push(format!("\n  -> Tool: {} {}", tool_call.tool, status));

            if !tool_call.args.is_empty() {
                let mut args_str = serde_json::to_string(&tool_call.args).unwrap_or_default();
                if args_str.len() > 200 {
                    args_str.truncate(200);
                    args_str.push_str("...");
                }
                lines.push(format!("    Args: {args_str}"));
            }

            if let Some(result) = &tool_call.result {
                let mut result_str = result.clone();
                if result_str.len() > 300 {
                    result_str.truncate(300);
                    result_str.push_str("...");
                }
                lines.push(format!("    Result: {result_str}"));
            }
        }

        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
    }

    let transcript = lines.join("\n");
    if transcript.len() <= max_chars {
        return transcript;
    }

    let keep_each = (max_chars.saturating_sub(100)) / 2;
    let head: String = transcript.chars().take(keep_each).collect();
    let tail_start = transcript.chars().count().saturating_sub(keep_each);
    let tail: String = transcript.chars().skip(tail_start).collect();
    format!("{head}\n\n[... middle of session truncated for length ...]\n\n{tail}")
}

/// Dynamic shape an LLM's extraction response may come back in.
enum LlmPayload {
    Array(Vec<Value>),
    Wrapped(Vec<Value>),
}

impl LlmPayload {
    fn into_items(self) -> Vec<Value> {
        match self {
            LlmPayload::Array(items) | LlmPayload::Wrapped(items) => items,
        }
    }
}

const WRAPPER_KEYS: [&str; 5] = ["learnings", "entries", "items", "results", "data"];

fn unwrap_payload(value: Value) -> Option<LlmPayload> {
    match value {
        Value::Array(items) => Some(LlmPayload::Array(items)),
        Value::Object(map) => WRAPPER_KEYS.iter().find_map(|key| match map.get(*key) {
            Some(Value::Array(items)) => Some(LlmPayload::Wrapped(items.clone())),
            _ => None,
        }),
        _ => None,
    }
}

fn sanitize_llm_response(response: &str) -> String {
    let cleaned = response.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    let reasoning_re =
        Regex::new(r"(?is)<\s*(think|analysis|reasoning)[^>]*>.*?<\s*/\s*(think|analysis|reasoning)\s*>")
            .expect("reasoning tag regex");
    let without_reasoning = reasoning_re.replace_all(cleaned, "");

    let fence_re = Regex::new(r"(?i)```(?:json)?").expect("fence regex");
    let without_fences = fence_re.replace_all(&without_reasoning, "");
    without_fences.replace("```", "").trim().to_string()
}

/// Scans `text` for every balanced `opening`/`closing` bracket span,
/// ignoring brackets inside quoted strings.
fn extract_balanced_segments(text: &str, opening: char, closing: char) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();

    for start in 0..chars.len() {
        if chars[start] != opening {
            continue;
        }
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for idx in start..chars.len() {
            let c = chars[idx];
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            if c == '"' {
                in_string = true;
                continue;
            }
            if c == opening {
                depth += 1;
            } else if c == closing {
                depth -= 1;
                if depth == 0 {
                    segments.push(chars[start..=idx].iter().collect());
                    break;
                }
            }
        }
    }
    segments
}

fn parse_json_array(text: &str) -> Option<Vec<Value>> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(payload) = unwrap_payload(value) {
            return Some(payload.into_items());
        }
    }

    for (opening, closing) in [('[', ']'), ('{', '}')] {
        for candidate in extract_balanced_segments(text, opening, closing) {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
                if let Some(payload) = unwrap_payload(value) {
                    return Some(payload.into_items());
                }
            }
        }
    }

    None
}

fn parse_llm_response(response: &str, session: &RawSession, scope: &Scope) -> Vec<LogEntry> {
    let cleaned = sanitize_llm_response(response);
    if matches!(cleaned.as_str(), "[]" | "" | "NONE" | "None" | "null") {
        return Vec::new();
    }

    let Some(items) = parse_json_array(&cleaned) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| item.as_object().cloned())
        .filter_map(|obj| build_entry(&obj, session, scope))
        .collect()
}

const BLOCKED_PHRASES: [&str; 10] = [
    "do not modify plan",
    "don't modify plan",
    "do not edit plan",
    "in_progress",
    "todo",
    "to-do",
    "ticket",
    "jira",
    "workflow",
    "process step",
];

fn is_functional_learning(content: &str) -> bool {
    let lowered = content.to_lowercase();
    !BLOCKED_PHRASES.iter().any(|phrase| lowered.contains(phrase))
        && !lowered.contains("project management")
}

fn resolve_label(label_str: &str) -> SemanticLabel {
    if let Some(label) = SemanticLabel::parse_lenient(label_str) {
        return label;
    }
    match label_str {
        "failure" | "error" => SemanticLabel::HardFailure,
        "warning" => SemanticLabel::Gotcha,
        "tip" => SemanticLabel::Pattern,
        "style" => SemanticLabel::Preference,
        _ => SemanticLabel::Pattern,
    }
}

fn build_entry(
    learning: &serde_json::Map<String, Value>,
    session: &RawSession,
    scope: &Scope,
) -> Option<LogEntry> {
    let content = learning
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let label_str = learning
        .get("label")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    if content.is_empty() || label_str.is_empty() || !is_functional_learning(&content) {
        return None;
    }

    let label = resolve_label(&label_str);

    let tags = match learning.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_lowercase()],
        _ => Vec::new(),
    };

    let confidence = learning
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.7)
        .clamp(0.0, 1.0);

    let evidence = learning
        .get("evidence")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("evidence".to_string(), Value::String(evidence));
    metadata.insert(
        "source_tool".to_string(),
        Value::String(session.source.clone()),
    );
    metadata.insert(
        "extracted_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    Some(LogEntry {
        id: uuid::Uuid::new_v4(),
        scope: scope.clone(),
        session_id: None,
        source: LogSource::Extracted,
        source_session_id: Some(session.session_id.clone()),
        timestamp: Utc::now(),
        content,
        label,
        tags,
        confidence,
        curation_status: CurationStatus::Pending,
        metadata,
    })
}

fn deduplicate_entries(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::with_capacity(entries.len());
    for entry in entries {
        let key = (entry.label.as_str().to_string(), entry.content.trim().to_lowercase());
        if seen.insert(key) {
            deduped.push(entry);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawMessage, RawToolCall};
    use crate::llm::StubProvider;
    use crate::models::Scope;
    use chrono::Utc;
    use std::sync::Arc;

    fn sample_session() -> RawSession {
        RawSession {
            source: "cursor".to_string(),
            session_id: "cursor-abc".to_string(),
            title: Some("fix the bug".to_string()),
            project_path: None,
            started_at: Utc::now(),
            ended_at: None,
            messages: vec![
                RawMessage {
                    role: IngestRole::User,
                    content: "the build keeps failing on CI".to_string(),
                    timestamp: None,
                    tool_calls: vec![],
                },
                RawMessage {
                    role: IngestRole::Assistant,
                    content: "found it, missing feature flag".to_string(),
                    timestamp: None,
                    tool_calls: vec![RawToolCall::new("bash")],
                },
            ],
        }
    }

    #[test]
    fn sanitize_strips_reasoning_tags_and_fences() {
        let raw = "<think>hmm</think>```json\n[]\n```";
        assert_eq!(sanitize_llm_response(raw), "[]");
    }

    #[test]
    fn parse_json_array_unwraps_learnings_key() {
        let text = r#"{"learnings": [{"label": "pattern", "content": "x"}]}"#;
        let items = parse_json_array(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn parse_json_array_recovers_from_surrounding_prose() {
        let text = "Sure, here you go:\n[{\"label\": \"gotcha\", \"content\": \"watch out\"}]\nhope that helps";
        let items = parse_json_array(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn build_entry_rejects_blocked_phrases() {
        let session = sample_session();
        let scope = Scope::new("t", "p");
        let mut learning = serde_json::Map::new();
        learning.insert("label".to_string(), Value::String("pattern".to_string()));
        learning.insert(
            "content".to_string(),
            Value::String("update the ticket status to in_progress".to_string()),
        );
        assert!(build_entry(&learning, &session, &scope).is_none());
    }

    #[test]
    fn build_entry_clamps_confidence_and_resolves_fallback_label() {
        let session = sample_session();
        let scope = Scope::new("t", "p");
        let mut learning = serde_json::Map::new();
        learning.insert("label".to_string(), Value::String("tip".to_string()));
        learning.insert(
            "content".to_string(),
            Value::String("always check the flag".to_string()),
        );
        learning.insert("confidence".to_string(), serde_json::json!(5.0));
        let entry = build_entry(&learning, &session, &scope).unwrap();
        assert_eq!(entry.label, SemanticLabel::Pattern);
        assert_eq!(entry.confidence, 1.0);
    }

    #[tokio::test]
    async fn extract_short_session_returns_empty() {
        let extractor = TranscriptExtractor::new(Arc::new(StubProvider::new("stub".into())), 100);
        let session = RawSession {
            messages: vec![sample_session().messages.remove(0)],
            ..sample_session()
        };
        let scope = Scope::new("t", "p");
        let entries = extractor.extract(&session, &scope, None).await.unwrap();
        assert!(entries.is_empty());
    }
}

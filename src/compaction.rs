//! Compaction engine: synthesizes curated tier files from pending log
//! entries and indexes durable entries as retrievable chunks.
//!
//! Three independent LLM synthesis passes (guardrails, style, recent)
//! plus a chunk-indexing pass. Each pass renders its candidate entries as
//! prompt lines, asks the LLM for a `{"items": [...]}` JSON delta, and
//! merges only genuinely new lines into the corresponding tier file,
//! treating Ralph iteration-loop blocks (`## <ts> Iteration N (ID)`) as
//! opaque regions it must not disturb.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::config::{CompactionConfig, RetrievalConfig};
use crate::llm::{LlmProvider, Message};
use crate::models::{Chunk, ChunkSource, CurationStatus, LogEntry, Scope, SemanticLabel, TierFile};
use crate::storage::Store;
use crate::tier_store::{is_ralph_entry_start, TierWriter, WritePolicy};

const GUARDRAILS_PROMPT_TEMPLATE: &str = r#"You are synthesizing guardrails from development learnings.

Current GUARDRAILS.md:
{current_guardrails}

Candidate learnings:
{entries}

Return ONLY JSON in this shape:
{{
  "items": [
    {{
      "type": "FAILURE|GOTCHA|CORRECTION",
      "rule": "<concise actionable rule>",
      "why": "<brief reason>"
    }}
  ]
}}

Rules:
- Include only NEW, durable rules not already in the current file.
- If no updates are needed, return: {{"items":[]}}
- No markdown fences and no prose.
"#;

const STYLE_PROMPT_TEMPLATE: &str = r#"You are synthesizing coding style from development learnings.

Current STYLE.md:
{current_style}

Candidate learnings:
{entries}

Return ONLY JSON in this shape:
{{
  "items": [
    {{
      "type": "PREFERENCE|PATTERN",
      "guideline": "<concise guideline>"
    }}
  ]
}}

Rules:
- Include only NEW guidance not already in the current file.
- If no updates are needed, return: {{"items":[]}}
- No markdown fences and no prose.
"#;

const RECENT_PROMPT_TEMPLATE: &str = r#"Summarize recent development activity for RECENT.md.

Current RECENT.md:
{current_recent}

Session evidence:
{sessions}

Return ONLY JSON in this shape:
{{
  "items": [
    {{
      "date": "YYYY-MM-DD",
      "summary": "1-2 sentence summary"
    }}
  ]
}}

Rules:
- Keep summaries concrete and outcome-focused.
- Include up to 12 items, newest first.
- If no update is needed, return: {{"items":[]}}
- No markdown fences and no prose.
"#;

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*-\s*\[([A-Z_]+)\]\s*(.+?)\s*$").unwrap())
}

fn recent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\*\*(\d{4}-\d{2}-\d{2})\*\*:\s*(.+)\s*$").unwrap())
}

/// Summary of one [`CompactionEngine::compact`] run.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    pub guardrails_updated: bool,
    pub style_updated: bool,
    pub recent_updated: bool,
    pub chunks_indexed: u64,
    pub llm_requests: u64,
    pub llm_responses: u64,
}

pub struct CompactionEngine {
    store: Arc<dyn Store>,
    tiers: TierWriter,
    llm: Arc<dyn LlmProvider>,
    compaction: CompactionConfig,
    retrieval: RetrievalConfig,
}

impl CompactionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        root: impl Into<std::path::PathBuf>,
        llm: Arc<dyn LlmProvider>,
        compaction: CompactionConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            tiers: TierWriter::new(root, WritePolicy::default()),
            llm,
            compaction,
            retrieval,
        }
    }

    /// Run one compaction pass for `scope`. `force` lowers the pattern
    /// promotion threshold to 1 occurrence, used by an explicit
    /// user-triggered compaction rather than the automatic one.
    pub async fn compact(&self, scope: &Scope, force: bool) -> anyhow::Result<CompactionResult> {
        let mut result = CompactionResult::default();

        let pattern_threshold = if force {
            1
        } else {
            self.compaction.promote_pattern_after_occurrences.max(1)
        };
        let embedding_dimensions = self.retrieval.embedding_dimensions.max(8);

        let curation_status = CurationStatus::Approved;
        let guardrail_labels = [
            SemanticLabel::HardFailure,
            SemanticLabel::Gotcha,
            SemanticLabel::Correction,
        ];
        let style_labels = [SemanticLabel::Preference, SemanticLabel::Pattern];
        let non_style_labels = self.non_style_index_labels();
        let non_style_thresholds = self.non_style_index_thresholds();

        let guardrail_entries = self
            .fetch_by_labels(scope, &guardrail_labels, curation_status)
            .await?;
        let style_entries = self
            .fetch_by_labels(scope, &style_labels, curation_status)
            .await?;
        let non_style_entries = filter_by_threshold(
            self.fetch_by_labels(scope, &non_style_labels, curation_status)
                .await?,
            &non_style_thresholds,
        );
        let promoted_style_entries = promoted_style_entries(&style_entries, pattern_threshold);

        if !guardrail_entries.is_empty() {
            let current = self.tiers.read_tier(TierFile::Guardrails)?;
            let entries_text = format_entries_for_prompt(&guardrail_entries);
            let prompt = GUARDRAILS_PROMPT_TEMPLATE
                .replace("{current_guardrails}", if current.is_empty() { "(empty)" } else { &current })
                .replace("{entries}", &entries_text);
            result.llm_requests += 1;
            let response = self
                .llm
                .generate(&[Message::user(prompt)], 0.2, 700)
                .await?;
            result.llm_responses += 1;
            let synthesized =
                extract_typed_lines(&response.content, &["FAILURE", "GOTCHA", "CORRECTION"]);
            if !synthesized.is_empty() {
                let changed =
                    self.merge_and_write_tier(TierFile::Guardrails, &current, &synthesized)?;
                result.guardrails_updated = changed;
            }
        }

        if !promoted_style_entries.is_empty() {
            let current = self.tiers.read_tier(TierFile::Style)?;
            let entries_text = format_entries_for_prompt(&promoted_style_entries);
            let prompt = STYLE_PROMPT_TEMPLATE
                .replace("{current_style}", if current.is_empty() { "(empty)" } else { &current })
                .replace("{entries}", &entries_text);
            result.llm_requests += 1;
            let response = self
                .llm
                .generate(&[Message::user(prompt)], 0.2, 700)
                .await?;
            result.llm_responses += 1;
            let synthesized = extract_typed_lines(&response.content, &["PREFERENCE", "PATTERN"]);
            if !synthesized.is_empty() {
                let changed = self.merge_and_write_tier(TierFile::Style, &current, &synthesized)?;
                result.style_updated = changed;
            }
        }

        let recent_evidence = self.recent_evidence_lines(scope).await?;
        if !recent_evidence.is_empty() {
            let current_recent = self.tiers.read_tier(TierFile::Recent)?;
            let prompt = RECENT_PROMPT_TEMPLATE
                .replace(
                    "{current_recent}",
                    if current_recent.is_empty() { "(empty)" } else { &current_recent },
                )
                .replace("{sessions}", &recent_evidence.join("\n"));
            result.llm_requests += 1;
            let response = self
                .llm
                .generate(&[Message::user(prompt)], 0.2, 700)
                .await?;
            result.llm_responses += 1;
            let mut recent_lines = extract_recent_lines(&response.content);
            if !recent_lines.is_empty() {
                recent_lines = trim_recent_lines(recent_lines, self.compaction.max_recent_tokens);
                let changed = self.write_recent_lines(&current_recent, &recent_lines)?;
                result.recent_updated = changed;
            }
        }

        let mut indexed_ids = HashSet::new();
        let all_candidates = guardrail_entries
            .into_iter()
            .chain(promoted_style_entries.into_iter())
            .chain(non_style_entries.into_iter());
        for entry in all_candidates {
            if !indexed_ids.insert(entry.id) {
                continue;
            }
            if self
                .store
                .has_chunk(scope, &entry.content, entry.label)
                .await?
            {
                continue;
            }
            let embedding = if self.retrieval.embedding_enabled {
                Some(hash_seeded_embedding(&entry.content, embedding_dimensions))
            } else {
                None
            };
            let chunk = Chunk {
                id: Uuid::new_v4(),
                scope: scope.clone(),
                source: ChunkSource::LogEntry,
                source_ids: vec![entry.id],
                content: entry.content.clone(),
                label: entry.label,
                tags: entry.tags.clone(),
                created_at: chrono::Utc::now(),
                token_count: None,
                embedding,
            };
            if self.store.store_chunk(&chunk).await?.is_some() {
                result.chunks_indexed += 1;
            }
        }

        Ok(result)
    }

    async fn fetch_by_labels(
        &self,
        scope: &Scope,
        labels: &[SemanticLabel],
        curation_status: CurationStatus,
    ) -> anyhow::Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for label in labels {
            let mut matching = self.store.get_entries_by_label(scope, *label, 0.0).await?;
            matching.retain(|entry| entry.curation_status == curation_status);
            entries.append(&mut matching);
        }
        Ok(entries)
    }

    fn non_style_index_labels(&self) -> Vec<SemanticLabel> {
        let mut labels = Vec::new();
        if self.compaction.index_decision_entries {
            labels.push(SemanticLabel::Decision);
        }
        if self.compaction.index_exploration_entries {
            labels.push(SemanticLabel::Exploration);
        }
        if self.compaction.index_narrative_entries {
            labels.push(SemanticLabel::Narrative);
        }
        labels
    }

    fn non_style_index_thresholds(&self) -> HashMap<SemanticLabel, f64> {
        let mut thresholds = HashMap::new();
        thresholds.insert(SemanticLabel::Decision, self.compaction.index_decision_min_confidence);
        thresholds.insert(
            SemanticLabel::Exploration,
            self.compaction.index_exploration_min_confidence,
        );
        thresholds.insert(SemanticLabel::Narrative, self.compaction.index_narrative_min_confidence);
        thresholds
    }

    /// Evidence lines for the `RECENT.md` synthesis prompt. Prefers
    /// completed [`Session`](crate::models::Session) rows; falls back to
    /// bare source-session ids when none are tracked (source ingesters
    /// that never open a local session row, e.g. a one-shot sync).
    async fn recent_evidence_lines(&self, scope: &Scope) -> anyhow::Result<Vec<String>> {
        let sessions = self.store.list_sessions(scope, 20).await?;
        let completed: Vec<_> = sessions
            .into_iter()
            .filter(|s| s.status == crate::models::SessionStatus::Completed)
            .collect();
        if !completed.is_empty() {
            return Ok(completed
                .iter()
                .map(|session| {
                    let date = session
                        .ended_at
                        .map(|ts| ts.date_naive().to_string())
                        .unwrap_or_else(|| "unknown-date".to_string());
                    let summary = session.summary.clone().unwrap_or_else(|| "No summary provided".to_string());
                    format!("- {date}: task={}; summary={summary}", session.task)
                })
                .collect());
        }

        let inferred = self.store.list_recent_source_sessions(scope, 20).await?;
        Ok(inferred
            .iter()
            .map(|session_id| format!("- unknown-date: source_session_id={session_id}"))
            .collect())
    }

    fn merge_and_write_tier(
        &self,
        tier: TierFile,
        current: &str,
        new_lines: &[String],
    ) -> anyhow::Result<bool> {
        let (preamble, existing_lines) = split_preamble_and_lines(current, bullet_re());
        let mut seen: HashSet<String> = existing_lines.iter().map(|l| normalize_line(l)).collect();
        let mut additions = Vec::new();
        for line in new_lines {
            let normalized = normalize_line(line);
            if !normalized.is_empty() && !seen.contains(&normalized) {
                additions.push(line.trim().to_string());
                seen.insert(normalized);
            }
        }
        if additions.is_empty() {
            return Ok(false);
        }
        let mut updated_lines = existing_lines;
        updated_lines.extend(additions);
        let updated = compose_tier_text(&preamble, &updated_lines);
        if updated.trim() == current.trim() {
            return Ok(false);
        }
        self.tiers.archive_tier_snapshot(tier, current)?;
        self.tiers.write_tier(tier, &updated)?;
        Ok(true)
    }

    fn write_recent_lines(&self, current: &str, lines: &[String]) -> anyhow::Result<bool> {
        let (preamble, _existing) = split_preamble_and_lines(current, recent_re());
        let updated = compose_tier_text(&preamble, lines);
        if updated.trim() == current.trim() {
            return Ok(false);
        }
        self.tiers.archive_tier_snapshot(TierFile::Recent, current)?;
        self.tiers.write_tier(TierFile::Recent, &updated)?;
        Ok(true)
    }
}

fn format_entries_for_prompt(entries: &[LogEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("- id={} [{}] {}", entry.id, entry.label.as_str(), entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn normalize_line(line: &str) -> String {
    normalize_content(line)
}

fn promoted_style_entries(style_entries: &[LogEntry], pattern_threshold: u32) -> Vec<LogEntry> {
    let mut pattern_counts: HashMap<String, u32> = HashMap::new();
    for entry in style_entries {
        if entry.label == SemanticLabel::Pattern {
            *pattern_counts.entry(normalize_content(&entry.content)).or_insert(0) += 1;
        }
    }
    style_entries
        .iter()
        .filter(|entry| match entry.label {
            SemanticLabel::Preference => true,
            SemanticLabel::Pattern => {
                let count = pattern_counts
                    .get(&normalize_content(&entry.content))
                    .copied()
                    .unwrap_or(0);
                count >= pattern_threshold.max(1)
            }
            _ => false,
        })
        .cloned()
        .collect()
}

fn filter_by_threshold(
    entries: Vec<LogEntry>,
    thresholds: &HashMap<SemanticLabel, f64>,
) -> Vec<LogEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.confidence >= thresholds.get(&entry.label).copied().unwrap_or(0.0))
        .collect()
}

/// Parse an LLM response into a JSON value, stripping code fences and
/// falling back to a brace/bracket scan when the model wraps its JSON in
/// prose. Mirrors the extraction pipeline's defensive parsing but targets
/// the `{"items": [...]}` object shape these prompts ask for.
fn parse_json_payload(content: &str) -> Option<Value> {
    let mut cleaned = content.trim().to_string();
    cleaned = cleaned.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        let start = cleaned.find(open);
        let end = cleaned.rfind(close);
        if let (Some(start), Some(end)) = (start, end) {
            if end > start {
                if let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn payload_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(map) => map.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn extract_typed_lines(content: &str, allowed_types: &[&str]) -> Vec<String> {
    if let Some(payload) = parse_json_payload(content) {
        let items = payload_items(&payload);
        let mut lines = Vec::new();
        for item in &items {
            let Some(obj) = item.as_object() else { continue };
            let kind = obj.get("type").and_then(|v| v.as_str()).unwrap_or("").trim().to_uppercase();
            if !allowed_types.contains(&kind.as_str()) {
                continue;
            }
            let text = ["rule", "content", "guideline"]
                .iter()
                .filter_map(|key| obj.get(*key).and_then(|v| v.as_str()))
                .map(|s| s.trim())
                .find(|s| !s.is_empty())
                .unwrap_or("");
            if text.is_empty() {
                continue;
            }
            let suffix = ["why", "reason"]
                .iter()
                .filter_map(|key| obj.get(*key).and_then(|v| v.as_str()))
                .map(|s| s.trim())
                .find(|s| !s.is_empty() && !text.to_lowercase().contains(&s.to_lowercase()))
                .map(|s| format!(" ({s})"))
                .unwrap_or_default();
            lines.push(format!("- [{kind}] {text}{suffix}"));
        }
        if !lines.is_empty() {
            return lines;
        }
    }

    let mut fallback = Vec::new();
    let cleaned = content.replace("```json", "").replace("```", "");
    for line in cleaned.lines() {
        if let Some(caps) = bullet_re().captures(line) {
            let kind = caps[1].trim().to_uppercase();
            let text = caps[2].trim();
            if allowed_types.contains(&kind.as_str()) && !text.is_empty() {
                fallback.push(format!("- [{kind}] {text}"));
            }
        }
    }
    fallback
}

fn extract_recent_lines(content: &str) -> Vec<String> {
    if let Some(payload) = parse_json_payload(content) {
        let items = payload_items(&payload);
        let mut lines = Vec::new();
        for item in &items {
            let Some(obj) = item.as_object() else { continue };
            let date = obj.get("date").and_then(|v| v.as_str()).unwrap_or("").trim();
            let summary = obj.get("summary").and_then(|v| v.as_str()).unwrap_or("").trim();
            if !date.is_empty() && !summary.is_empty() {
                lines.push(format!("**{date}**: {summary}"));
            }
        }
        if !lines.is_empty() {
            return lines;
        }
    }

    let cleaned = content.replace("```json", "").replace("```", "");
    cleaned
        .lines()
        .filter(|line| recent_re().is_match(line))
        .map(|line| line.trim().to_string())
        .collect()
}

fn trim_recent_lines(lines: Vec<String>, token_budget: u32) -> Vec<String> {
    if token_budget == 0 {
        return lines;
    }
    let budget_chars = token_budget as usize * 4;
    let mut kept = Vec::new();
    let mut total = 0usize;
    for line in lines {
        let next_total = total + line.len() + 1;
        if !kept.is_empty() && next_total > budget_chars {
            break;
        }
        total = next_total;
        kept.push(line);
    }
    kept
}

/// Split a tier file's raw content into its free-form preamble and the
/// flat bullet/recent lines a synthesis pass manages, skipping over any
/// Ralph iteration-loop blocks as opaque regions.
fn split_preamble_and_lines(content: &str, matcher: &Regex) -> (Vec<String>, Vec<String>) {
    let mut preamble = Vec::new();
    let mut extracted = Vec::new();
    let mut in_ralph_block = false;
    let mut ralph_empty_run = 0;
    let mut found_entry = false;

    for line in content.lines() {
        if is_ralph_entry_start(line) {
            in_ralph_block = true;
            ralph_empty_run = 0;
            found_entry = true;
            continue;
        }

        if in_ralph_block {
            if line.starts_with("## ") && !is_ralph_entry_start(line) {
                in_ralph_block = false;
            } else if line.trim().is_empty() {
                ralph_empty_run += 1;
                if ralph_empty_run >= 2 {
                    in_ralph_block = false;
                }
                continue;
            } else {
                ralph_empty_run = 0;
                continue;
            }
        }

        if matcher.is_match(line) {
            extracted.push(line.trim().to_string());
            found_entry = true;
        } else if !found_entry {
            preamble.push(line.to_string());
        }
    }

    (preamble, extracted)
}

fn compose_tier_text(preamble_lines: &[String], body_lines: &[String]) -> String {
    let preamble = preamble_lines.join("\n").trim_end().to_string();
    let body = body_lines.join("\n").trim().to_string();
    match (preamble.is_empty(), body.is_empty()) {
        (false, false) => format!("{preamble}\n\n{body}\n"),
        (false, true) => format!("{preamble}\n"),
        (true, false) => format!("{body}\n"),
        (true, true) => String::new(),
    }
}

/// Deterministic hash-seeded embedding. Not a learned model: stable
/// across runs for the same content so dedup/similarity scoring is
/// reproducible without a network call. Callers that need real semantic
/// similarity should set `retrieval.embedding_enabled = false` and rely
/// on FTS5, or plug in a real embedding backend at a later integration
/// point.
pub(crate) fn hash_seeded_embedding(content: &str, dimensions: usize) -> Vec<f32> {
    let normalized = normalize_content(content);
    let mut vector = Vec::with_capacity(dimensions);
    let mut counter: u64 = 0;
    while vector.len() < dimensions {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks(4) {
            if vector.len() >= dimensions {
                break;
            }
            let mut buf = [0u8; 4];
            buf[..chunk.len()].copy_from_slice(chunk);
            let raw = u32::from_le_bytes(buf);
            vector.push((raw as f64 / u32::MAX as f64) as f32 * 2.0 - 1.0);
        }
        counter += 1;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_seeded_embedding_is_deterministic_and_unit_norm() {
        let a = hash_seeded_embedding("always validate inputs", 16);
        let b = hash_seeded_embedding("always validate inputs", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn extract_typed_lines_parses_items_object() {
        let response = r#"{"items":[{"type":"gotcha","rule":"retry on 429","why":"rate limits"}]}"#;
        let lines = extract_typed_lines(response, &["FAILURE", "GOTCHA", "CORRECTION"]);
        assert_eq!(lines, vec!["- [GOTCHA] retry on 429 (rate limits)".to_string()]);
    }

    #[test]
    fn extract_typed_lines_falls_back_to_bullet_regex() {
        let response = "Sure, here you go:\n- [PATTERN] extract small functions\nthanks!";
        let lines = extract_typed_lines(response, &["PREFERENCE", "PATTERN"]);
        assert_eq!(lines, vec!["- [PATTERN] extract small functions".to_string()]);
    }

    #[test]
    fn promoted_style_entries_requires_repeated_pattern() {
        let scope = Scope::default_scope();
        let mut a = LogEntry::new(scope.clone(), crate::models::LogSource::Extracted, "use small functions", SemanticLabel::Pattern);
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        let singleton = LogEntry::new(scope, crate::models::LogSource::Extracted, "only seen once", SemanticLabel::Pattern);
        a.curation_status = CurationStatus::Approved;
        b.curation_status = CurationStatus::Approved;
        let entries = vec![a, b, singleton];
        let promoted = promoted_style_entries(&entries, 2);
        assert_eq!(promoted.len(), 2);
    }

    #[test]
    fn split_preamble_and_lines_skips_ralph_blocks() {
        let content = "# Style\n\n## 2026-01-01T00:00:00Z Iteration 1 (ITEM-1)\n- Scope item: thing\n\n- [PATTERN] keep functions small\n";
        let (preamble, extracted) = split_preamble_and_lines(content, bullet_re());
        assert_eq!(preamble, vec!["# Style".to_string(), "".to_string()]);
        assert_eq!(extracted, vec!["- [PATTERN] keep functions small".to_string()]);
    }
}

//! Tier file writer and compaction sub-engine.
//!
//! Maintains the three curated markdown artifacts consuming agents read:
//! `GUARDRAILS.md`, `STYLE.md`, and `RECENT.md`, under `<root>/.agent/`.
//! Writes are policy-driven (append-with-bound or replace-section), guarded
//! by a duplicate check, and validated against a canonical section schema
//! before being committed atomically (write-temp, then rename).

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::RecallError;
use crate::models::TierFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    ReplaceSection,
}

#[derive(Debug, Clone)]
pub struct WritePolicy {
    pub mode: WriteMode,
    pub deduplicate: bool,
    pub max_entries: Option<usize>,
    pub section_target: Option<String>,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            mode: WriteMode::Append,
            deduplicate: true,
            max_entries: None,
            section_target: None,
        }
    }
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^##\s+\S").unwrap())
}

fn iteration_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Iteration\s+(\d+)\s+\(([^)]+)\)").unwrap())
}

fn normalize_for_dedup(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_dedup(text).as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Writer for structured tier file updates with policies and validation.
pub struct TierWriter {
    root: PathBuf,
    policy: WritePolicy,
}

impl TierWriter {
    pub fn new(root: impl Into<PathBuf>, policy: WritePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    fn tier_path(&self, tier: TierFile) -> PathBuf {
        self.root.join(".agent").join(tier.file_name())
    }

    pub fn read_tier(&self, tier: TierFile) -> Result<String> {
        match std::fs::read_to_string(self.tier_path(tier)) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Snapshot a tier's pre-rewrite contents under `.agent/archive/` before
    /// a compaction pass overwrites it. No-op for empty content.
    pub(crate) fn archive_tier_snapshot(&self, tier: TierFile, previous_content: &str) -> Result<()> {
        if previous_content.trim().is_empty() {
            return Ok(());
        }
        let archive_dir = self.root.join(".agent").join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let name = format!("{}-{}.md", tier.file_name().trim_end_matches(".md").to_lowercase(), timestamp);
        std::fs::write(archive_dir.join(name), previous_content)?;
        Ok(())
    }

    /// Write content atomically: write to a sibling temp file, then rename
    /// over the target. Exposed crate-wide for callers (e.g. the
    /// compaction engine) that manage their own merge/dedup policy
    /// instead of going through [`WritePolicy`].
    pub(crate) fn write_tier(&self, tier: TierFile, content: &str) -> Result<()> {
        let path = self.tier_path(tier);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("md.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn write_guardrails_entry(
        &self,
        iteration: u32,
        item_id: &str,
        item_title: &str,
        reason: &str,
        validation_hint: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let ts = timestamp.unwrap_or_else(Utc::now);
        let ts_str = ts.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut lines = vec![
            String::new(),
            format!("## {ts_str} Iteration {iteration} ({item_id})"),
            format!("- Scope item: {item_title}"),
        ];

        lines.push(
            match reason {
                "validation_failed" => {
                    "- Do not move to a new PRD item while validation is red.".to_string()
                }
                "agent_timeout" => {
                    "- Agent exceeded iteration timeout; reduce scope and keep commits smaller."
                        .to_string()
                }
                "abort" => {
                    "- Abort means scope exceeded safety; reduce change size next iteration."
                        .to_string()
                }
                _ => "- Keep changes isolated and verifiable before commit.".to_string(),
            },
        );

        if !validation_hint.is_empty() {
            lines.push(format!("- Runtime validation signal: {validation_hint}"));
        }
        lines.push(format!(
            "- Runtime logs: ralph/.runtime/agent-{iteration}.log, ralph/.runtime/validate-{iteration}.log"
        ));

        self.write_with_policy(TierFile::Guardrails, &lines.join("\n"), "general")
    }

    pub fn write_guardrails_hard_failure(
        &self,
        iteration: u32,
        item_id: &str,
        item_title: &str,
        validation_errors: &[String],
        validation_hint: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let ts = timestamp.unwrap_or_else(Utc::now);
        let ts_str = ts.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut lines = vec![
            String::new(),
            format!("## {ts_str} HARD FAILURE Iteration {iteration} ({item_id})"),
            format!("- Item: {item_title}"),
            "- Validation command must be green before the next iteration begins.".to_string(),
        ];

        if validation_errors.is_empty() {
            lines.push("- Validation failed without captured output.".to_string());
        } else {
            lines.push("- Top validation errors:".to_string());
            for error in validation_errors.iter().take(6) {
                lines.push(format!("  - {error}"));
            }
        }

        if !validation_hint.is_empty() {
            lines.push(format!("- Primary actionable signal: {validation_hint}"));
        }
        lines.push(format!(
            "- Runtime logs: ralph/.runtime/agent-{iteration}.log, ralph/.runtime/validate-{iteration}.log"
        ));

        self.write_with_policy(TierFile::Guardrails, &lines.join("\n"), "hard_failure")
    }

    pub fn write_style_entry(
        &self,
        iteration: u32,
        item_id: &str,
        validation_hint: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let ts = timestamp.unwrap_or_else(Utc::now);
        let ts_str = ts.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut lines = vec![
            String::new(),
            format!("## {ts_str} Iteration {iteration} ({item_id})"),
            "- Prefer one logical change per commit.".to_string(),
            "- Keep the validation command green before committing.".to_string(),
        ];

        if !validation_hint.is_empty() {
            lines.push(format!(
                "- Start debugging from the first actionable validation line: {validation_hint}"
            ));
        } else {
            lines.push(
                "- Keep runtime validate logs concise so the first actionable line is obvious."
                    .to_string(),
            );
        }
        lines.push(format!(
            "- Runtime logs: ralph/.runtime/agent-{iteration}.log, ralph/.runtime/validate-{iteration}.log"
        ));

        self.write_with_policy(TierFile::Style, &lines.join("\n"), "iteration")
    }

    pub fn write_recent_entry(
        &self,
        iteration: u32,
        item_id: &str,
        item_title: &str,
        work_mode: &str,
        agent_exit: i32,
        validate_status: &str,
        outcome: &str,
        validation_hint: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let ts = timestamp.unwrap_or_else(Utc::now);
        let ts_str = ts.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut lines = vec![
            String::new(),
            format!("## {ts_str} Iteration {iteration}"),
            format!("- Item: {item_id} - {item_title}"),
            format!("- Mode: {work_mode}"),
            format!("- Agent exit code: {agent_exit}"),
            format!("- Validation: {validate_status}"),
            format!("- Outcome: {outcome}"),
        ];

        if !validation_hint.is_empty() {
            lines.push(format!("- Validation signal: {validation_hint}"));
        }
        lines.push(format!(
            "- Runtime logs: ralph/.runtime/agent-{iteration}.log, ralph/.runtime/validate-{iteration}.log"
        ));

        self.write_with_policy(TierFile::Recent, &lines.join("\n"), "iteration")
    }

    fn ensure_header(&self, tier: TierFile, content: &str) -> String {
        if content.trim().is_empty() {
            return default_header(tier);
        }
        let header_line = format!("# {}", tier.header_name());
        if !content.trim_start().starts_with(&header_line) {
            return format!("{}\n\n{}", default_header(tier).trim_end(), content);
        }
        content.to_string()
    }

    fn write_with_policy(&self, tier: TierFile, content: &str, section_hint: &str) -> Result<bool> {
        let current = self.read_tier(tier)?;
        let current = self.ensure_header(tier, &current);

        if self.policy.deduplicate && is_duplicate(&current, content) {
            return Ok(false);
        }

        let updated = if self.policy.mode == WriteMode::ReplaceSection {
            let hint = self.policy.section_target.as_deref().unwrap_or(section_hint);
            replace_section(&current, content, hint)
        } else {
            bounded_append(&current, content, tier, self.policy.max_entries)
        };

        let errors = validate_tier_content(tier, &updated);
        if !errors.is_empty() {
            return Err(RecallError::TierValidationError(errors.join(", ")).into());
        }

        self.write_tier(tier, &updated)?;
        Ok(true)
    }
}

fn default_header(tier: TierFile) -> String {
    format!("# {}\n\n{}\n", tier.header_name(), tier.description())
}

fn is_duplicate(current: &str, new_content: &str) -> bool {
    let new_hash = content_hash(new_content);

    let mut new_iteration_item: Option<(String, String)> = None;
    for line in new_content.lines() {
        if let Some(stripped) = line.strip_prefix("## ") {
            if let Some(caps) = iteration_item_re().captures(stripped) {
                new_iteration_item = Some((caps[1].to_string(), caps[2].to_string()));
            }
            break;
        }
    }

    for line in current.lines() {
        if content_hash(line) == new_hash {
            return true;
        }
        if let (Some((iter, item)), true) = (&new_iteration_item, line.starts_with("## ")) {
            if let Some(caps) = iteration_item_re().captures(line) {
                if &caps[1] == iter && &caps[2] == item {
                    return true;
                }
            }
        }
    }
    false
}

fn replace_section(current: &str, new_content: &str, section_hint: &str) -> String {
    let lines: Vec<&str> = current.split('\n').collect();
    let hint_lower = section_hint.to_lowercase();

    let section_start = lines
        .iter()
        .position(|line| line.starts_with("## ") && line.to_lowercase().contains(&hint_lower));

    let Some(start) = section_start else {
        return format!("{current}\n{new_content}");
    };

    let section_end = lines[start + 1..]
        .iter()
        .position(|line| line.starts_with("## "))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    let mut new_lines: Vec<&str> = lines[..start].to_vec();
    new_lines.extend(new_content.split('\n'));
    new_lines.extend(&lines[section_end..]);
    new_lines.join("\n")
}

fn bounded_append(current: &str, new_content: &str, tier: TierFile, max_entries: Option<usize>) -> String {
    let max_entries = max_entries.unwrap_or_else(|| tier.default_max_entries());
    let lines: Vec<&str> = current.split('\n').collect();
    let entry_count = lines.iter().filter(|l| l.starts_with("## ")).count();

    let kept_lines: Vec<&str> = if entry_count >= max_entries {
        let entries_to_remove = entry_count - max_entries + 1;
        let mut result = Vec::new();
        let mut removed = 0;
        let mut skipping = false;
        for line in &lines {
            if line.starts_with("## ") {
                if removed < entries_to_remove {
                    removed += 1;
                    skipping = true;
                    continue;
                } else {
                    skipping = false;
                }
            }
            if !skipping {
                result.push(*line);
            }
        }
        result
    } else {
        lines
    };

    format!("{}\n{}", kept_lines.join("\n"), new_content)
}

pub fn validate_tier_content(tier: TierFile, content: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let lines: Vec<&str> = content.split('\n').collect();

    let required_header = format!("# {}", tier.header_name());
    if !lines.iter().any(|l| l.trim_start().starts_with(&required_header)) {
        errors.push("Missing required header section".to_string());
    }

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("## ") && !header_re().is_match(line) {
            errors.push(format!("Line {}: Malformed section header (missing content)", i + 1));
        }
    }

    let entry_count = lines.iter().filter(|l| l.starts_with("## ")).count();
    let max = tier.default_max_entries();
    if entry_count > max {
        errors.push(format!(
            "Entry count ({entry_count}) exceeds maximum ({max}) for tier {}",
            tier.header_name()
        ));
    }

    errors
}

/// Lint a tier file's content, returning (errors, warnings); in strict mode
/// all warnings become errors.
pub fn lint_tier_file(tier: TierFile, content: &str, strict: bool) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if content.trim().is_empty() {
        errors.push("Tier file is empty".to_string());
        return (errors, warnings);
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let required_header = format!("# {}", tier.header_name());
    if !lines.iter().any(|l| l.trim_start().starts_with(&required_header)) {
        errors.push("Missing required header".to_string());
    }

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("## ") {
            let content_length: usize = lines[i + 1..(i + 10).min(lines.len())]
                .iter()
                .take_while(|l| !l.starts_with("## "))
                .map(|l| l.trim().len())
                .sum();
            if content_length < 20 {
                warnings.push(format!("Line {}: Low-signal entry (very short content)", i + 1));
            }
        }
    }

    for error in validate_tier_content(tier, content) {
        if error.contains("Duplicate") {
            errors.push(error);
        } else if strict {
            errors.push(error);
        } else {
            warnings.push(error);
        }
    }

    if strict && !warnings.is_empty() {
        errors.extend(warnings.drain(..));
    }

    (errors, warnings)
}

#[derive(Debug, Clone)]
pub struct TierStatistics {
    pub entry_count: usize,
    pub content_size: usize,
    pub line_count: usize,
}

pub fn get_tier_statistics(content: &str) -> TierStatistics {
    let lines: Vec<&str> = content.split('\n').collect();
    let entry_count = lines.iter().filter(|l| l.starts_with("## ")).count();
    let content_size: usize = lines
        .iter()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .map(|l| l.len())
        .sum();
    TierStatistics {
        entry_count,
        content_size,
        line_count: lines.len(),
    }
}

/// Estimate token count from content length (chars/4 heuristic).
pub fn estimate_token_count(content: &str) -> usize {
    if content.is_empty() {
        0
    } else {
        (content.len() + 3) / 4
    }
}

pub fn should_compact_for_tokens(content: &str, max_tokens: usize) -> bool {
    if max_tokens == 0 {
        return false;
    }
    estimate_token_count(content) > max_tokens
}

// --- Compaction sub-engine -------------------------------------------------

#[derive(Debug, Clone)]
pub struct TierCompactionConfig {
    pub auto_run: bool,
    pub max_entries_per_tier: usize,
    pub strict_deduplication: bool,
    pub summary_threshold_entries: usize,
    pub summary_max_entries: usize,
}

impl Default for TierCompactionConfig {
    fn default() -> Self {
        Self {
            auto_run: true,
            max_entries_per_tier: 50,
            strict_deduplication: false,
            summary_threshold_entries: 40,
            summary_max_entries: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierCompactionResult {
    pub tier: TierFile,
    pub entries_before: usize,
    pub entries_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub duplicates_removed: usize,
    pub entries_summarized: usize,
}

#[derive(Debug, Clone)]
pub struct TierCompactionSummary {
    pub results: Vec<TierCompactionResult>,
    pub auto_run: bool,
}

impl TierCompactionSummary {
    pub fn total_entries_before(&self) -> usize {
        self.results.iter().map(|r| r.entries_before).sum()
    }
    pub fn total_entries_after(&self) -> usize {
        self.results.iter().map(|r| r.entries_after).sum()
    }
    pub fn total_duplicates_removed(&self) -> usize {
        self.results.iter().map(|r| r.duplicates_removed).sum()
    }
    pub fn total_entries_summarized(&self) -> usize {
        self.results.iter().map(|r| r.entries_summarized).sum()
    }
}

#[derive(Debug, Clone)]
struct ParsedEntry {
    timestamp: String,
    iteration: u32,
    item_id: String,
    header_line: String,
    content: String,
    is_summary: bool,
}

fn entry_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^##\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)\s+Iteration\s+(\d+)\s+\(([^)]+)\)")
            .unwrap()
    })
}

/// Whether `line` opens an iteration-loop entry block (`## <ts> Iteration N
/// (ITEM-ID)`). Used by the compaction engine to treat those blocks as
/// opaque while scanning a tier file for its own flat bullet lines.
pub(crate) fn is_ralph_entry_start(line: &str) -> bool {
    entry_header_re().is_match(line)
}

pub struct TierCompactionHook {
    root: PathBuf,
    config: TierCompactionConfig,
}

impl TierCompactionHook {
    pub fn new(root: impl Into<PathBuf>, config: TierCompactionConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn tier_path(&self, tier: TierFile) -> PathBuf {
        self.root.join(".agent").join(tier.file_name())
    }

    fn read_tier(&self, tier: TierFile) -> Result<String> {
        match std::fs::read_to_string(self.tier_path(tier)) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_tier(&self, tier: TierFile, content: &str) -> Result<()> {
        let path = self.tier_path(tier);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("md.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn compact_all(&self) -> Result<TierCompactionSummary> {
        let mut results = Vec::new();
        for tier in [TierFile::Guardrails, TierFile::Style, TierFile::Recent] {
            results.push(self.compact_tier(tier)?);
        }
        Ok(TierCompactionSummary {
            results,
            auto_run: self.config.auto_run,
        })
    }

    pub fn compact_tier(&self, tier: TierFile) -> Result<TierCompactionResult> {
        let content = self.read_tier(tier)?;
        let bytes_before = content.len();

        if content.trim().is_empty() {
            return Ok(TierCompactionResult {
                tier,
                entries_before: 0,
                entries_after: 0,
                bytes_before,
                bytes_after: 0,
                duplicates_removed: 0,
                entries_summarized: 0,
            });
        }

        let entries = parse_entries(&content);
        let entries_before = entries.len();

        let (entries, duplicates_removed) = remove_duplicates(entries, self.config.strict_deduplication);
        let entries = apply_size_budget(entries, self.config.max_entries_per_tier);
        let (entries, entries_summarized) = maybe_summarize(
            entries,
            self.config.summary_threshold_entries,
            self.config.summary_max_entries,
            self.config.max_entries_per_tier,
        );

        let new_content = reconstruct_content(tier, &entries);
        let bytes_after = new_content.len();

        if new_content != content {
            self.write_tier(tier, &new_content)?;
        }

        Ok(TierCompactionResult {
            tier,
            entries_before,
            entries_after: entries.len(),
            bytes_before,
            bytes_after,
            duplicates_removed,
            entries_summarized,
        })
    }
}

fn parse_entries(content: &str) -> Vec<ParsedEntry> {
    let mut entries = Vec::new();
    let mut current: Option<ParsedEntry> = None;
    let mut current_lines: Vec<&str> = Vec::new();

    for line in content.split('\n') {
        if let Some(caps) = entry_header_re().captures(line) {
            if let Some(mut entry) = current.take() {
                entry.content = current_lines.join("\n");
                entries.push(entry);
            }
            current = Some(ParsedEntry {
                timestamp: caps[1].to_string(),
                iteration: caps[2].parse().unwrap_or(0),
                item_id: caps[3].to_string(),
                header_line: line.to_string(),
                content: String::new(),
                is_summary: false,
            });
            current_lines = Vec::new();
        } else if current.is_some() {
            current_lines.push(line);
        }
    }
    if let Some(mut entry) = current {
        entry.content = current_lines.join("\n");
        entries.push(entry);
    }
    entries
}

fn remove_duplicates(entries: Vec<ParsedEntry>, strict: bool) -> (Vec<ParsedEntry>, usize) {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    let mut removed = 0;

    for entry in entries {
        let mut key = format!("{}:{}", entry.iteration, entry.item_id);
        if strict {
            let mut hasher = Sha256::new();
            hasher.update(entry.content.as_bytes());
            key = format!("{key}:{}", hex::encode(hasher.finalize()));
        }
        if seen.contains(&key) {
            removed += 1;
            continue;
        }
        seen.insert(key);
        unique.push(entry);
    }
    (unique, removed)
}

fn apply_size_budget(entries: Vec<ParsedEntry>, max_entries: usize) -> Vec<ParsedEntry> {
    if entries.len() <= max_entries {
        return entries;
    }
    let mut sorted = entries;
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let drop_count = sorted.len() - max_entries;
    let mut kept: Vec<ParsedEntry> = sorted.into_iter().skip(drop_count).collect();
    kept.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    kept
}

fn maybe_summarize(
    entries: Vec<ParsedEntry>,
    threshold: usize,
    max_summary_entries: usize,
    max_entries_per_tier: usize,
) -> (Vec<ParsedEntry>, usize) {
    if entries.len() <= threshold {
        return (entries, 0);
    }

    let mut by_item: indexmap_like::OrderedMap<String, Vec<ParsedEntry>> = indexmap_like::OrderedMap::new();
    for entry in entries {
        by_item.entry(entry.item_id.clone()).push(entry);
    }

    let mut summarized = Vec::new();
    let mut entries_summarized = 0;

    for (item_id, mut item_entries) in by_item.into_iter() {
        if item_entries.len() > 1 && summarized.len() < max_summary_entries {
            item_entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            let latest = item_entries.pop().unwrap();
            let summarized_count = item_entries.len() + 1;
            entries_summarized += item_entries.len();
            summarized.push(ParsedEntry {
                timestamp: latest.timestamp,
                iteration: latest.iteration,
                item_id,
                header_line: latest.header_line,
                content: format!("(Summarized {summarized_count} entries for this item)"),
                is_summary: true,
            });
        } else {
            summarized.extend(item_entries);
        }
    }

    summarized.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    summarized.truncate(max_entries_per_tier);

    (summarized, entries_summarized)
}

fn reconstruct_content(tier: TierFile, entries: &[ParsedEntry]) -> String {
    let mut lines = vec![default_header(tier)];
    for entry in entries {
        lines.push(entry.header_line.clone());
        if entry.is_summary {
            lines.push(format!("- {}", entry.content));
        } else {
            lines.push(entry.content.clone());
        }
    }
    format!("{}\n", lines.join("\n"))
}

/// Minimal insertion-order-preserving map, avoiding a dependency on the
/// `indexmap` crate for this one summarization pass.
mod indexmap_like {
    pub struct OrderedMap<K, V> {
        keys: Vec<K>,
        values: std::collections::HashMap<K, V>,
    }

    impl<K: std::hash::Hash + Eq + Clone, V: Default> OrderedMap<K, V> {
        pub fn new() -> Self {
            Self {
                keys: Vec::new(),
                values: std::collections::HashMap::new(),
            }
        }

        pub fn entry(&mut self, key: K) -> &mut V {
            if !self.values.contains_key(&key) {
                self.keys.push(key.clone());
                self.values.insert(key.clone(), V::default());
            }
            self.values.get_mut(&key).unwrap()
        }

        pub fn into_iter(self) -> impl Iterator<Item = (K, V)> {
            let Self { keys, mut values } = self;
            keys.into_iter().map(move |k| {
                let v = values.remove(&k).unwrap();
                (k, v)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_guardrails_entry_creates_header_and_section() {
        let dir = tempdir().unwrap();
        let writer = TierWriter::new(dir.path(), WritePolicy::default());
        let written = writer
            .write_guardrails_entry(3, "ITEM-1", "Fix parser", "validation_failed", "", None)
            .unwrap();
        assert!(written);

        let content = writer.read_tier(TierFile::Guardrails).unwrap();
        assert!(content.starts_with("# Guardrails"));
        assert!(content.contains("Iteration 3 (ITEM-1)"));
    }

    #[test]
    fn duplicate_iteration_item_id_is_skipped() {
        let dir = tempdir().unwrap();
        let writer = TierWriter::new(dir.path(), WritePolicy::default());
        assert!(writer
            .write_style_entry(1, "ITEM-1", "", None)
            .unwrap());
        assert!(!writer
            .write_style_entry(1, "ITEM-1", "", None)
            .unwrap());
    }

    #[test]
    fn bounded_append_evicts_oldest_entries() {
        let dir = tempdir().unwrap();
        let policy = WritePolicy {
            max_entries: Some(2),
            ..WritePolicy::default()
        };
        let writer = TierWriter::new(dir.path(), policy);
        for i in 1..=3 {
            writer.write_recent_entry(i, "ITEM-1", "Title", "build", 0, "pass", "completed", "", None).unwrap();
        }
        let content = writer.read_tier(TierFile::Recent).unwrap();
        let entry_count = content.lines().filter(|l| l.starts_with("## ")).count();
        assert_eq!(entry_count, 2);
        assert!(!content.contains("Iteration 1"));
    }

    #[test]
    fn compaction_removes_duplicates_and_respects_budget() {
        let dir = tempdir().unwrap();
        let writer = TierWriter::new(dir.path(), WritePolicy::default());
        for i in 1..=5 {
            writer
                .write_recent_entry(i, &format!("ITEM-{i}"), "Title", "build", 0, "pass", "completed", "", None)
                .unwrap();
        }

        let hook = TierCompactionHook::new(
            dir.path(),
            TierCompactionConfig {
                max_entries_per_tier: 3,
                ..TierCompactionConfig::default()
            },
        );
        let result = hook.compact_tier(TierFile::Recent).unwrap();
        assert_eq!(result.entries_before, 5);
        assert_eq!(result.entries_after, 3);
    }

    #[test]
    fn estimate_token_count_uses_chars_over_four() {
        assert_eq!(estimate_token_count(""), 0);
        assert_eq!(estimate_token_count("abcd"), 1);
        assert_eq!(estimate_token_count("abcdefgh"), 2);
    }
}

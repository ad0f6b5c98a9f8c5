//! Variant C — nested-JSON ingester.
//!
//! Grounded on `ingest/opencode.py`: a per-session root JSON file, with
//! adjacent per-message JSON files under `message/<session-id>/`, and
//! per-message `part/<message-id>/*.json` files holding `text`, `file`,
//! `tool`, and `patch` parts. Synthetic generated-context blocks
//! (`<file>...</file>`, "Called the X tool...") are dropped; user file
//! parts collapse into an `Attached files:` list; patch parts become a
//! synthetic `patch` tool call.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use super::{
    infer_title, normalize_role, parse_timestamp_field, stringify_result, Ingester, RawMessage,
    RawSession, RawToolCall, Role,
};

pub struct NestedJsonIngester {
    project_path: PathBuf,
    storage_dir: PathBuf,
}

impl NestedJsonIngester {
    pub fn new(project_path: PathBuf, opencode_dir: PathBuf) -> Self {
        Self {
            project_path,
            storage_dir: opencode_dir.join("storage"),
        }
    }

    fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Value>(&text).ok()? {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    fn project_worktree(&self, project_id: Option<&str>) -> Option<PathBuf> {
        let project_id = project_id?;
        let project_path = self.storage_dir.join("project").join(format!("{project_id}.json"));
        let payload = Self::read_json_object(&project_path)?;
        payload.get("worktree").and_then(Value::as_str).map(PathBuf::from)
    }

    fn session_matches_project(&self, payload: &Map<String, Value>) -> bool {
        if let Some(dir) = payload.get("directory").and_then(Value::as_str) {
            if PathBuf::from(dir) == self.project_path {
                return true;
            }
        }
        let project_id = payload.get("projectID").and_then(Value::as_str);
        self.project_worktree(project_id)
            .map(|w| w == self.project_path)
            .unwrap_or(false)
    }

    fn session_updated_at(payload: &Map<String, Value>, fallback_path: &Path) -> DateTime<Utc> {
        if let Some(Value::Object(time)) = payload.get("time") {
            if let Some(updated) = parse_timestamp_field(time, &["updated"]) {
                return updated;
            }
            if let Some(created) = parse_timestamp_field(time, &["created"]) {
                return created;
            }
        }
        std::fs::metadata(fallback_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    }

    fn is_generated_context_block(text: &str) -> bool {
        let lowered = text.trim().to_lowercase();
        if lowered.starts_with("called the ") && lowered.contains(" tool with the following input:") {
            return true;
        }
        text.starts_with("<file>") && text.contains("(End of file")
    }

    fn file_label(payload: &Map<String, Value>) -> Option<String> {
        if let Some(filename) = payload.get("filename").and_then(Value::as_str) {
            if !filename.trim().is_empty() {
                return Some(filename.trim().to_string());
            }
        }
        if let Some(Value::Object(source)) = payload.get("source") {
            if let Some(path) = source.get("path").and_then(Value::as_str) {
                if !path.trim().is_empty() {
                    return Some(path.trim().to_string());
                }
            }
        }
        payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    fn part_timestamp(payload: &Map<String, Value>) -> Option<DateTime<Utc>> {
        if let Some(Value::Object(time)) = payload.get("time") {
            if let Some(ts) = parse_timestamp_field(time, &["start", "end"]) {
                return Some(ts);
            }
        }
        if let Some(Value::Object(state)) = payload.get("state") {
            if let Some(Value::Object(time)) = state.get("time") {
                if let Some(ts) = parse_timestamp_field(time, &["start", "end"]) {
                    return Some(ts);
                }
            }
        }
        None
    }

    fn load_message_parts(&self, message_id: &str) -> Vec<Map<String, Value>> {
        let part_dir = self.storage_dir.join("part").join(message_id);
        let Ok(entries) = std::fs::read_dir(&part_dir) else { return Vec::new() };

        let mut parsed: Vec<(Option<i64>, String, Map<String, Value>)> = entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let payload = Self::read_json_object(&e.path())?;
                let ts = Self::part_timestamp(&payload).map(|t| t.timestamp());
                Some((ts, name, payload))
            })
            .collect();

        parsed.sort_by(|a, b| a.0.unwrap_or(i64::MAX).cmp(&b.0.unwrap_or(i64::MAX)).then_with(|| a.1.cmp(&b.1)));
        parsed.into_iter().map(|(_, _, payload)| payload).collect()
    }

    fn extract_content(role: &Role, parts: &[Map<String, Value>]) -> String {
        let mut text_parts = Vec::new();
        let mut attachments = Vec::new();

        for part in parts {
            let part_type = part.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();
            match part_type.as_str() {
                "text" => {
                    let text = part.get("text").and_then(Value::as_str).unwrap_or("").trim().to_string();
                    if text.is_empty() || Self::is_generated_context_block(&text) {
                        continue;
                    }
                    text_parts.push(text);
                }
                "file" => {
                    if let Some(label) = Self::file_label(part) {
                        attachments.push(label);
                    }
                }
                _ => {}
            }
        }

        let mut content = text_parts.join("\n\n").trim().to_string();
        if matches!(role, Role::User) && !attachments.is_empty() {
            let block = format!(
                "Attached files:\n{}",
                attachments.iter().map(|a| format!("- {a}")).collect::<Vec<_>>().join("\n")
            );
            content = if content.is_empty() { block } else { format!("{content}\n\n{block}") };
        }
        content
    }

    fn extract_tool_calls(parts: &[Map<String, Value>]) -> Vec<RawToolCall> {
        let mut tool_calls = Vec::new();
        for part in parts {
            let part_type = part.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();

            if part_type == "tool" {
                let empty = Map::new();
                let state = part.get("state").and_then(Value::as_object).unwrap_or(&empty);
                let args = state.get("input").and_then(Value::as_object).cloned().unwrap_or_default();
                let status = state.get("status").and_then(Value::as_str).unwrap_or("").to_lowercase();
                let error_like = matches!(
                    status.as_str(),
                    "failed" | "error" | "cancelled" | "canceled" | "timed_out" | "timeout"
                );
                let success = !error_like
                    && !state.get("error").map(|v| !v.is_null()).unwrap_or(false)
                    && !state.get("is_error").and_then(Value::as_bool).unwrap_or(false);

                let duration_ms = state.get("time").and_then(Value::as_object).and_then(|t| {
                    let start = parse_timestamp_field(t, &["start"])?;
                    let end = parse_timestamp_field(t, &["end"])?;
                    Some((end - start).num_milliseconds().max(0))
                });

                let tool = part
                    .get("tool")
                    .and_then(Value::as_str)
                    .or_else(|| state.get("title").and_then(Value::as_str))
                    .unwrap_or("unknown")
                    .to_string();

                tool_calls.push(RawToolCall {
                    tool,
                    args,
                    result: state.get("output").and_then(stringify_result),
                    success,
                    duration_ms,
                });
            } else if part_type == "patch" {
                let mut args = Map::new();
                if let Some(Value::Array(files)) = part.get("files") {
                    args.insert(
                        "files".to_string(),
                        Value::Array(files.iter().filter(|f| f.is_string()).cloned().collect()),
                    );
                }
                tool_calls.push(RawToolCall {
                    tool: "patch".to_string(),
                    args,
                    result: part.get("hash").and_then(stringify_result),
                    success: true,
                    duration_ms: None,
                });
            }
        }
        tool_calls
    }

    fn message_timestamp(payload: &Map<String, Value>, parts: &[Map<String, Value>]) -> Option<DateTime<Utc>> {
        if let Some(Value::Object(time)) = payload.get("time") {
            if let Some(ts) = parse_timestamp_field(time, &["created", "completed"]) {
                return Some(ts);
            }
        }
        parts.iter().find_map(Self::part_timestamp)
    }
}

impl Ingester for NestedJsonIngester {
    fn source_name(&self) -> &str {
        "opencode"
    }

    fn discover_sessions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>> {
        let sessions_root = self.storage_dir.join("session");
        if !sessions_root.exists() {
            return Ok(Vec::new());
        }

        let mut discovered: Vec<(i64, PathBuf)> = Vec::new();
        let mut stack = vec![sessions_root];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !name.starts_with("ses_") || path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(payload) = Self::read_json_object(&path) else { continue };
                if !self.session_matches_project(&payload) {
                    continue;
                }
                let updated_at = Self::session_updated_at(&payload, &path);
                if let Some(since) = since {
                    if updated_at < since {
                        continue;
                    }
                }
                discovered.push((updated_at.timestamp(), path));
            }
        }

        discovered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(discovered.into_iter().map(|(_, path)| path).collect())
    }

    fn get_session_id(&self, path: &Path) -> String {
        let native_id = Self::read_json_object(path)
            .and_then(|p| p.get("id").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| path.file_stem().and_then(|s| s.to_str()).unwrap_or("session").to_string());
        format!("opencode-{native_id}")
    }

    fn parse_session(&self, path: &Path) -> Result<RawSession> {
        let payload = Self::read_json_object(path).ok_or_else(|| anyhow!("invalid OpenCode session file: {}", path.display()))?;

        let native_id = payload.get("id").and_then(Value::as_str).map(String::from).unwrap_or_else(|| {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("session").to_string()
        });
        let session_id = self.get_session_id(path);
        let message_dir = self.storage_dir.join("message").join(&native_id);

        let mut started_at = Self::session_updated_at(&payload, path);
        let mut ended_at = started_at;
        if let Some(Value::Object(time)) = payload.get("time") {
            if let Some(created) = parse_timestamp_field(time, &["created"]) {
                started_at = created;
            }
            if let Some(updated) = parse_timestamp_field(time, &["updated"]) {
                ended_at = updated;
            }
        }

        let mut messages = Vec::new();
        if message_dir.exists() {
            let mut rows: Vec<(i64, RawMessage)> = Vec::new();
            if let Ok(entries) = std::fs::read_dir(&message_dir) {
                for entry in entries.flatten() {
                    let message_path = entry.path();
                    if message_path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(message_payload) = Self::read_json_object(&message_path) else { continue };
                    let message_id = message_payload
                        .get("id")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| message_path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string());

                    let parts = self.load_message_parts(&message_id);
                    let role_raw = message_payload.get("role").and_then(Value::as_str).unwrap_or("assistant");
                    let role = normalize_role(role_raw).unwrap_or(Role::Assistant);
                    let timestamp = Self::message_timestamp(&message_payload, &parts);
                    let content = Self::extract_content(&role, &parts);
                    let tool_calls = Self::extract_tool_calls(&parts);

                    if content.trim().chars().filter(|c| !c.is_whitespace()).count() < 3 && tool_calls.is_empty() {
                        continue;
                    }

                    if let Some(ts) = timestamp {
                        started_at = started_at.min(ts);
                        ended_at = ended_at.max(ts);
                    }

                    let sort_key = timestamp.map(|t| t.timestamp()).unwrap_or(i64::MAX);
                    rows.push((
                        sort_key,
                        RawMessage {
                            role,
                            content: if content.is_empty() { "[tool-result]".to_string() } else { content },
                            timestamp,
                            tool_calls,
                        },
                    ));
                }
            }
            rows.sort_by_key(|(ts, _)| *ts);
            messages = rows.into_iter().map(|(_, m)| m).collect();
        }

        let project_path = payload
            .get("directory")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| self.project_worktree(payload.get("projectID").and_then(Value::as_str)))
            .unwrap_or_else(|| self.project_path.clone());

        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| infer_title(&messages, &native_id));

        Ok(RawSession {
            source: self.source_name().to_string(),
            session_id,
            title: Some(title),
            project_path: Some(project_path),
            started_at,
            ended_at: Some(ended_at),
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_generated_context_blocks_and_collapses_attachments() {
        let parts = vec![
            Map::from_iter([
                ("type".to_string(), Value::String("text".to_string())),
                ("text".to_string(), Value::String("Called the Read tool with the following input:".to_string())),
            ]),
            Map::from_iter([
                ("type".to_string(), Value::String("text".to_string())),
                ("text".to_string(), Value::String("please review this".to_string())),
            ]),
            Map::from_iter([
                ("type".to_string(), Value::String("file".to_string())),
                ("filename".to_string(), Value::String("src/main.rs".to_string())),
            ]),
        ];
        let content = NestedJsonIngester::extract_content(&Role::User, &parts);
        assert!(content.contains("please review this"));
        assert!(content.contains("Attached files:"));
        assert!(content.contains("src/main.rs"));
        assert!(!content.to_lowercase().contains("called the"));
    }

    #[test]
    fn patch_part_becomes_synthetic_tool_call() {
        let parts = vec![Map::from_iter([
            ("type".to_string(), Value::String("patch".to_string())),
            ("files".to_string(), Value::Array(vec![Value::String("a.rs".to_string())])),
            ("hash".to_string(), Value::String("abc123".to_string())),
        ])];
        let calls = NestedJsonIngester::extract_tool_calls(&parts);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "patch");
        assert_eq!(calls[0].result.as_deref(), Some("abc123"));
    }
}

//! Variant B — per-file JSONL ingester.
//!
//! Grounded on `ingest/codex.py`: one file per session, either JSON Lines
//! (`session_meta`, `response_item`/`message`, `function_call` /
//! `custom_tool_call` / `*_output`) or a legacy single-JSON-object form.
//! Tool call outputs are linked back to the most recent matching
//! `call_id`, falling back to the last pending call when no id is given.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{
    apply_normalization_invariants, infer_title, normalize_role, parse_timestamp_field,
    stringify_result, value_as_args, Ingester, RawMessage, RawSession, RawToolCall, Role,
};

pub struct JsonlIngester {
    project_path: PathBuf,
    sessions_dir: PathBuf,
}

impl JsonlIngester {
    pub fn new(project_path: PathBuf, sessions_dir: PathBuf) -> Self {
        Self {
            project_path,
            sessions_dir,
        }
    }

    fn read_session_meta(path: &Path) -> (Option<String>, Option<PathBuf>, Option<DateTime<Utc>>) {
        let Ok(text) = std::fs::read_to_string(path) else {
            return (None, None, None);
        };

        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(&text) {
                if let Some(Value::Object(session)) = payload.get("session") {
                    let id = session.get("id").and_then(Value::as_str).map(String::from);
                    let cwd = session
                        .get("cwd")
                        .and_then(Value::as_str)
                        .map(PathBuf::from);
                    let started_at = parse_timestamp_field(session, &["timestamp"]);
                    return (id, cwd, started_at);
                }
            }
            return (None, None, None);
        }

        let mut session_id = None;
        let mut cwd = None;
        let mut started_at = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(Value::Object(event)) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if started_at.is_none() {
                started_at = parse_timestamp_field(&event, &["timestamp"]);
            }
            let event_type = event.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();
            let Some(Value::Object(payload)) = event.get("payload") else {
                continue;
            };
            if event_type == "session_meta" {
                session_id = payload.get("id").and_then(Value::as_str).map(String::from).or(session_id);
                cwd = payload
                    .get("cwd")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .or(cwd);
            } else if event_type == "turn_context" && cwd.is_none() {
                cwd = payload.get("cwd").and_then(Value::as_str).map(PathBuf::from);
            }
            if session_id.is_some() && cwd.is_some() && started_at.is_some() {
                break;
            }
        }
        (session_id, cwd, started_at)
    }

    fn session_matches_project(&self, path: &Path) -> bool {
        let (_, cwd, _) = Self::read_session_meta(path);
        cwd.map(|c| c == self.project_path).unwrap_or(false)
    }

    fn extract_message_content(value: &Value) -> String {
        match value {
            Value::String(s) => s.trim().to_string(),
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|block| match block {
                        Value::String(s) => {
                            let t = s.trim();
                            if t.is_empty() { None } else { Some(t.to_string()) }
                        }
                        Value::Object(obj) => obj
                            .get("text")
                            .and_then(Value::as_str)
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty()),
                        _ => None,
                    })
                    .collect();
                parts.join("\n\n")
            }
            Value::Object(obj) => obj
                .get("text")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    fn parse_jsonl_session(&self, path: &Path) -> Result<RawSession> {
        let (native_id, cwd, meta_started_at) = Self::read_session_meta(path);
        let session_id = self.get_session_id(path);

        let fallback_time = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut started_at = meta_started_at.unwrap_or(fallback_time);
        let mut ended_at = started_at;

        let mut rows: Vec<(i64, usize, RawMessage)> = Vec::new();
        let mut pending: Vec<RawToolCall> = Vec::new();
        let mut pending_by_call_id: HashMap<String, usize> = HashMap::new();

        let text = std::fs::read_to_string(path)?;
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(Value::Object(event)) = serde_json::from_str::<Value>(line) else {
                continue;
            };

            let event_time = parse_timestamp_field(&event, &["timestamp"]);
            if let Some(t) = event_time {
                started_at = started_at.min(t);
                ended_at = ended_at.max(t);
            }

            if event.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase() != "response_item" {
                continue;
            }
            let Some(Value::Object(payload)) = event.get("payload") else { continue };
            let payload_type = payload.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();

            match payload_type.as_str() {
                "message" => {
                    let Some(role) = payload
                        .get("role")
                        .and_then(Value::as_str)
                        .and_then(normalize_role)
                    else {
                        continue;
                    };
                    let content = payload
                        .get("content")
                        .map(Self::extract_message_content)
                        .unwrap_or_default();
                    let tool_calls = std::mem::take(&mut pending);
                    pending_by_call_id.clear();

                    if content.trim().chars().filter(|c| !c.is_whitespace()).count() < 3
                        && tool_calls.is_empty()
                    {
                        continue;
                    }

                    let message = RawMessage {
                        role,
                        content: if content.is_empty() { "[tool-result]".to_string() } else { content },
                        timestamp: event_time,
                        tool_calls,
                    };
                    let sort_key = event_time.map(|t| t.timestamp()).unwrap_or(i64::MAX);
                    rows.push((sort_key, index, message));
                }
                "function_call" | "custom_tool_call" => {
                    let args_key = if payload_type == "custom_tool_call" { "input" } else { "arguments" };
                    let args = payload.get(args_key).map(value_as_args).unwrap_or_default();
                    let tool = payload.get("name").and_then(Value::as_str).unwrap_or("tool").to_string();
                    pending.push(RawToolCall {
                        tool,
                        args,
                        result: None,
                        success: true,
                        duration_ms: None,
                    });
                    if let Some(call_id) = payload.get("call_id").and_then(Value::as_str) {
                        pending_by_call_id.insert(call_id.to_string(), pending.len() - 1);
                    }
                }
                "function_call_output" | "custom_tool_call_output" => {
                    let output = payload.get("output").map(stringify_result).flatten();
                    let success = !payload.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                    let call_id = payload.get("call_id").and_then(Value::as_str);

                    let target_index = call_id
                        .and_then(|id| pending_by_call_id.get(id).copied())
                        .or_else(|| if pending.is_empty() { None } else { Some(pending.len() - 1) });

                    if let Some(idx) = target_index {
                        if let Some(call) = pending.get_mut(idx) {
                            call.result = output;
                            call.success = success;
                        }
                    } else {
                        pending.push(RawToolCall {
                            tool: "tool_result".to_string(),
                            args: Default::default(),
                            result: output,
                            success,
                            duration_ms: None,
                        });
                    }
                }
                _ => {}
            }
        }

        if !pending.is_empty() {
            rows.push((
                ended_at.timestamp(),
                rows.len(),
                RawMessage {
                    role: Role::Assistant,
                    content: "[tool-result]".to_string(),
                    timestamp: Some(ended_at),
                    tool_calls: pending,
                },
            ));
        }

        rows.sort_by_key(|(ts, idx, _)| (*ts, *idx));
        let messages = apply_normalization_invariants(rows.into_iter().map(|(_, _, m)| m).collect());

        let native_id = native_id.unwrap_or_else(|| {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("session").to_string()
        });
        let title = infer_title(&messages, &native_id);
        let project_path = cwd.unwrap_or_else(|| self.project_path.clone());

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

    fn parse_legacy_json_session(&self, path: &Path) -> Result<RawSession> {
        let text = std::fs::read_to_string(path)?;
        let Value::Object(payload) = serde_json::from_str::<Value>(&text)? else {
            return Err(anyhow!("invalid legacy session file: {}", path.display()));
        };

        let session_data = payload.get("session").and_then(Value::as_object).cloned().unwrap_or_default();
        let entries = payload.get("items").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut messages = Vec::new();
        for entry in &entries {
            let Some(obj) = entry.as_object() else { continue };
            let Some(role) = obj.get("role").and_then(Value::as_str).and_then(normalize_role) else {
                continue;
            };
            let content = obj.get("content").map(Self::extract_message_content).unwrap_or_default();
            if content.trim().chars().filter(|c| !c.is_whitespace()).count() < 3 {
                continue;
            }
            messages.push(RawMessage {
                role,
                content,
                timestamp: None,
                tool_calls: vec![],
            });
        }

        let started_at = parse_timestamp_field(&session_data, &["timestamp"]).unwrap_or_else(|| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now())
        });

        let native_id = session_data
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| path.file_stem().and_then(|s| s.to_str()).unwrap_or("session").to_string());
        let messages = apply_normalization_invariants(messages);
        let title = infer_title(&messages, &native_id);
        let project_path = session_data
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.project_path.clone());

        Ok(RawSession {
            source: self.source_name().to_string(),
            session_id: self.get_session_id(path),
            title: Some(title),
            project_path: Some(project_path),
            started_at,
            ended_at: None,
            messages,
        })
    }
}

impl Ingester for JsonlIngester {
    fn source_name(&self) -> &str {
        "codex"
    }

    fn discover_sessions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut discovered: Vec<(i64, PathBuf)> = Vec::new();
        let mut stack = vec![self.sessions_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str());
                if !matches!(ext, Some("json") | Some("jsonl")) {
                    continue;
                }
                if !self.session_matches_project(&path) {
                    continue;
                }

                let (_, _, meta_time) = Self::read_session_meta(&path);
                let updated_at = meta_time.unwrap_or_else(|| {
                    std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now())
                });
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
        let (native_id, _, _) = Self::read_session_meta(path);
        let native_id = native_id.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("session").to_string()
        });
        format!("codex-{native_id}")
    }

    fn parse_session(&self, path: &Path) -> Result<RawSession> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") => self.parse_jsonl_session(path),
            Some("json") => self.parse_legacy_json_session(path),
            _ => Err(anyhow!("unsupported session format: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parses_message_and_links_tool_output() {
        let dir = tempdir().unwrap();
        let sessions_dir = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();
        let session_path = sessions_dir.join("rollout-1.jsonl");

        let mut file = std::fs::File::create(&session_path).unwrap();
        writeln!(
            file,
            r#"{{"type":"session_meta","timestamp":1700000000,"payload":{{"id":"abc123","cwd":"{}"}}}}"#,
            dir.path().display()
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"response_item","timestamp":1700000001,"payload":{{"type":"message","role":"user","content":"please fix the bug"}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"response_item","timestamp":1700000002,"payload":{{"type":"function_call","name":"shell","call_id":"call-1","arguments":{{"cmd":"ls"}}}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"response_item","timestamp":1700000003,"payload":{{"type":"function_call_output","call_id":"call-1","output":"file.txt"}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"response_item","timestamp":1700000004,"payload":{{"type":"message","role":"assistant","content":"done"}}}}"#
        )
        .unwrap();

        let ingester = JsonlIngester::new(dir.path().to_path_buf(), sessions_dir);
        let session = ingester.parse_session(&session_path).unwrap();

        assert_eq!(session.session_id, "codex-abc123");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].tool_calls.len(), 1);
        assert_eq!(session.messages[1].tool_calls[0].result.as_deref(), Some("file.txt"));
    }
}

//! Variant A — workspace-SQLite ingester.
//!
//! Grounded on `ingest/cursor.py`: locates workspace directories under a
//! platform-specific storage root by matching a `workspace.json` manifest's
//! `folder`/`workspace` URI, then reads each workspace's own SQLite
//! database (`state.vscdb`) with a synchronous, read-only `rusqlite`
//! connection — a different SQLite crate than this tool's own async
//! `sqlx` pool, chosen because this is a one-shot blocking read of a
//! foreign file, not a connection this process owns long-term.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{
    apply_normalization_invariants, infer_title, normalize_role, parse_timestamp_field,
    stringify_result, value_as_args, Ingester, RawMessage, RawSession, RawToolCall, Role,
};

pub struct WorkspaceSqliteIngester {
    project_path: PathBuf,
    db_path_override: Option<PathBuf>,
    storage_dir: PathBuf,
    include_all_workspaces: bool,
}

impl WorkspaceSqliteIngester {
    pub fn new(project_path: PathBuf, storage_dir: PathBuf, include_all_workspaces: bool) -> Self {
        Self {
            project_path,
            db_path_override: None,
            storage_dir,
            include_all_workspaces,
        }
    }

    pub fn with_db_path(mut self, db_path: PathBuf) -> Self {
        self.db_path_override = Some(db_path);
        self
    }

    /// Decodes a `file://` URI (or bare path) the way Cursor's workspace
    /// manifest stores it; percent-decodes and strips the leading slash
    /// VS Code prepends to Windows drive letters.
    fn decode_workspace_uri(raw: &str) -> Option<PathBuf> {
        if let Some(rest) = raw.strip_prefix("file://") {
            let decoded = percent_decode(rest);
            let decoded = if decoded.len() > 2
                && decoded.starts_with('/')
                && decoded.as_bytes().get(2) == Some(&b':')
            {
                decoded[1..].to_string()
            } else {
                decoded
            };
            return Some(PathBuf::from(decoded));
        }
        if raw.contains("://") {
            return None;
        }
        Some(PathBuf::from(percent_decode(raw)))
    }

    fn workspace_matches_project(&self, metadata_path: &Path) -> bool {
        let Ok(text) = std::fs::read_to_string(metadata_path) else {
            return false;
        };
        let Ok(Value::Object(metadata)) = serde_json::from_str::<Value>(&text) else {
            return false;
        };

        if let Some(Value::String(folder)) = metadata.get("folder") {
            if let Some(path) = Self::decode_workspace_uri(folder) {
                if path == self.project_path {
                    return true;
                }
            }
        }

        if let Some(Value::String(workspace)) = metadata.get("workspace") {
            if let Some(path) = Self::decode_workspace_uri(workspace) {
                return path == self.project_path;
            }
        }

        false
    }

    fn find_workspace_dbs(&self) -> Vec<PathBuf> {
        if let Some(explicit) = &self.db_path_override {
            return if explicit.exists() {
                vec![explicit.clone()]
            } else {
                Vec::new()
            };
        }

        if !self.storage_dir.exists() {
            return Vec::new();
        }

        let mut workspace_dirs = std::collections::BTreeSet::new();
        if let Ok(entries) = walk_matching(&self.storage_dir, "workspace.json") {
            for metadata_path in entries {
                if let Some(parent) = metadata_path.parent() {
                    workspace_dirs.insert(parent.to_path_buf());
                }
            }
        }

        let mut found = Vec::new();
        for workspace_dir in workspace_dirs {
            let db_path = workspace_dir.join("state.vscdb");
            if !db_path.exists() {
                continue;
            }
            if self.include_all_workspaces {
                found.push(db_path);
                continue;
            }
            let metadata_path = workspace_dir.join("workspace.json");
            if metadata_path.exists() && self.workspace_matches_project(&metadata_path) {
                found.push(db_path);
                break;
            }
        }
        found
    }

    fn extract_rows(db_path: &Path) -> Result<Vec<(String, Value)>> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let mut rows = Vec::new();

        let mut stmt = conn.prepare("SELECT key, value FROM ItemTable")?;
        let mut query_rows = stmt.query([])?;
        while let Some(row) = query_rows.next()? {
            let key: String = row.get(0)?;
            let text = match row.get_ref(1)? {
                rusqlite::types::ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                rusqlite::types::ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                _ => continue,
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&text) else { continue };

            let key_lower = key.to_lowercase();
            if key_lower == "aiservice.prompts"
                || key_lower == "aiservice.generations"
                || key_lower.contains("aichat")
                || key_lower.contains("composer")
            {
                rows.push((key, parsed));
            }
        }

        Ok(rows)
    }

    fn parse_rows(rows: Vec<(String, Value)>) -> Vec<RawMessage> {
        let mut messages = Vec::new();
        for (key, data) in rows {
            let key_lower = key.to_lowercase();
            let parsed = if key_lower == "aiservice.prompts" {
                Self::parse_prompts(&data)
            } else if key_lower == "aiservice.generations" {
                Self::parse_generations(&data)
            } else if key_lower.contains("aichat") {
                Self::parse_chatdata(&data)
            } else {
                Vec::new()
            };
            messages.extend(parsed);
        }
        messages
    }

    fn parse_prompts(data: &Value) -> Vec<RawMessage> {
        let Value::Array(items) = data else { return Vec::new() };
        items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let content = Self::extract_content(obj, &["text", "content", "prompt"]);
                Self::build_message(Role::User, content, parse_timestamp_field(obj, &["unixMs", "timestamp"]), vec![])
            })
            .collect()
    }

    fn parse_generations(data: &Value) -> Vec<RawMessage> {
        let Value::Array(items) = data else { return Vec::new() };
        items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let content = Self::extract_content(obj, &["textDescription", "text", "content", "message"]);
                Self::build_message(Role::Assistant, content, parse_timestamp_field(obj, &["unixMs", "timestamp"]), vec![])
            })
            .collect()
    }

    fn parse_chatdata(data: &Value) -> Vec<RawMessage> {
        let mut bubbles = Vec::new();
        Self::collect_bubbles(data, &mut bubbles);

        bubbles
            .iter()
            .filter_map(|bubble| {
                let role_raw = bubble
                    .get("type")
                    .or_else(|| bubble.get("role"))
                    .and_then(Value::as_str)
                    .unwrap_or("assistant");
                let role = normalize_role(role_raw).unwrap_or(
                    if matches!(role_raw.to_lowercase().as_str(), "user" | "human") {
                        Role::User
                    } else {
                        Role::Assistant
                    },
                );
                let content = Self::extract_content(bubble, &["text", "rawText", "content", "message", "body", "markdown"]);
                let timestamp = parse_timestamp_field(bubble, &["unixMs", "timestamp", "createdAt"]);
                let tool_calls = Self::extract_tool_calls(bubble);
                Self::build_message(role, content, timestamp, tool_calls)
            })
            .collect()
    }

    fn collect_bubbles(node: &Value, bubbles: &mut Vec<serde_json::Map<String, Value>>) {
        match node {
            Value::Array(items) => {
                for item in items {
                    Self::collect_bubbles(item, bubbles);
                }
            }
            Value::Object(obj) => {
                if let Some(Value::Array(bubble_list)) = obj.get("bubbles") {
                    for bubble in bubble_list {
                        if let Some(b) = bubble.as_object() {
                            bubbles.push(b.clone());
                        }
                    }
                }
                if let Some(Value::Array(tabs)) = obj.get("tabs") {
                    for tab in tabs {
                        Self::collect_bubbles(tab, bubbles);
                    }
                }
                for (key, value) in obj {
                    if key == "bubbles" || key == "tabs" {
                        continue;
                    }
                    if value.is_object() || value.is_array() {
                        Self::collect_bubbles(value, bubbles);
                    }
                }
            }
            _ => {}
        }
    }

    fn extract_content(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
        for key in keys {
            let Some(value) = obj.get(*key) else { continue };
            match value {
                Value::String(s) => return s.clone(),
                Value::Array(items) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|block| {
                            block
                                .as_object()
                                .and_then(|b| b.get("text").or_else(|| b.get("content")).or_else(|| b.get("value")))
                                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                                .unwrap_or_else(|| block.to_string())
                        })
                        .collect();
                    return parts.join(" ");
                }
                _ => {}
            }
        }
        String::new()
    }

    fn extract_tool_calls(obj: &serde_json::Map<String, Value>) -> Vec<RawToolCall> {
        for key in ["tool_calls", "toolCalls", "tools", "function_calls"] {
            let Some(Value::Array(calls)) = obj.get(key) else { continue };
            return calls
                .iter()
                .filter_map(|call| {
                    let call_obj = call.as_object()?;
                    let tool = call_obj
                        .get("name")
                        .or_else(|| call_obj.get("function"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let args = call_obj
                        .get("arguments")
                        .or_else(|| call_obj.get("args"))
                        .map(value_as_args)
                        .unwrap_or_default();
                    Some(RawToolCall {
                        tool,
                        args,
                        result: call_obj.get("result").and_then(stringify_result),
                        success: call_obj.get("success").and_then(Value::as_bool).unwrap_or(true),
                        duration_ms: None,
                    })
                })
                .collect();
        }
        Vec::new()
    }

    fn build_message(
        role: Role,
        content: String,
        timestamp: Option<DateTime<Utc>>,
        tool_calls: Vec<RawToolCall>,
    ) -> Option<RawMessage> {
        if content.trim().chars().filter(|c| !c.is_whitespace()).count() < 3 {
            return None;
        }
        Some(RawMessage {
            role,
            content,
            timestamp,
            tool_calls,
        })
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn walk_matching(root: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
                matches.push(path);
            }
        }
    }
    Ok(matches)
}

impl Ingester for WorkspaceSqliteIngester {
    fn source_name(&self) -> &str {
        "cursor"
    }

    fn discover_sessions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>> {
        let db_paths = self.find_workspace_dbs();
        if let Some(since) = since {
            let mut filtered = Vec::new();
            for path in db_paths {
                if let Ok(metadata) = std::fs::metadata(&path) {
                    if let Ok(modified) = metadata.modified() {
                        let mtime: DateTime<Utc> = modified.into();
                        if mtime >= since {
                            filtered.push(path);
                        }
                    }
                }
            }
            return Ok(filtered);
        }
        Ok(db_paths)
    }

    fn get_session_id(&self, path: &Path) -> String {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let parent_name = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        format!("cursor-{parent_name}-{mtime}")
    }

    fn parse_session(&self, path: &Path) -> Result<RawSession> {
        let rows = Self::extract_rows(path)?;
        let messages = Self::parse_rows(rows);

        let mut earliest: Option<DateTime<Utc>> = None;
        let mut latest: Option<DateTime<Utc>> = None;
        for message in &messages {
            if let Some(ts) = message.timestamp {
                earliest = Some(earliest.map_or(ts, |e: DateTime<Utc>| e.min(ts)));
                latest = Some(latest.map_or(ts, |l: DateTime<Utc>| l.max(ts)));
            }
        }

        let mut sortable: Vec<(i64, usize, RawMessage)> = messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| (m.timestamp.map(|t| t.timestamp()).unwrap_or(0), i, m))
            .collect();
        sortable.sort_by_key(|(ts, idx, _)| (*ts, *idx));
        let ordered: Vec<RawMessage> = sortable.into_iter().map(|(_, _, m)| m).collect();
        let deduped = apply_normalization_invariants(ordered);

        let session_id = self.get_session_id(path);
        let mtime_fallback = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap());

        let title = infer_title(&deduped, &session_id);

        Ok(RawSession {
            source: self.source_name().to_string(),
            session_id,
            title: Some(title),
            project_path: Some(self.project_path.clone()),
            started_at: earliest.unwrap_or(mtime_fallback),
            ended_at: latest,
            messages: deduped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_message_rejects_trivial_content() {
        assert!(WorkspaceSqliteIngester::build_message(Role::User, "hi".into(), None, vec![]).is_none());
        assert!(WorkspaceSqliteIngester::build_message(Role::User, "hello".into(), None, vec![]).is_some());
    }

    #[test]
    fn collect_bubbles_walks_nested_tabs() {
        let payload: Value = serde_json::json!({
            "tabs": [
                { "bubbles": [{ "type": "user", "text": "hi there" }] }
            ]
        });
        let mut bubbles = Vec::new();
        WorkspaceSqliteIngester::collect_bubbles(&payload, &mut bubbles);
        assert_eq!(bubbles.len(), 1);
        assert_eq!(bubbles[0].get("text").unwrap().as_str(), Some("hi there"));
    }
}

//! Guardrail hook generation and installation.
//!
//! Grounded on `ralph/hooks.py`: guardrail patterns are extracted from
//! backtick-quoted substrings and `block(ed): ...` suffixes in the
//! guardrails tier text, unioned with a fixed set of default-dangerous
//! patterns, and compiled into a pre-tool-use script that exits 2 (and
//! blocks the tool call) on a case-insensitive match. A post-tool-use
//! script appends a JSON-lines event log, and a notification script
//! dispatches through the host's native notifier.
//!
//! Deliberate deviation: the corpus generates `python3`-shebang scripts;
//! this crate has no Python runtime to lean on, so the generated scripts
//! are POSIX `sh` using `grep -E` instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};

pub const RALPH_PRE_HOOK_NAME: &str = "ralph-pre-tool-use";
pub const RALPH_POST_HOOK_NAME: &str = "ralph-post-tool-use";
pub const RALPH_NOTIFICATION_HOOK_NAME: &str = "ralph-notification";

pub const DEFAULT_BLOCK_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r"rm\s+-rf\s+\*",
    r"drop\s+table",
    r"mkfs\b",
    r"dd\s+if=",
    r"shutdown\b",
    r"reboot\b",
    r"kill\s+-9\s+-1",
    r"format\s+[a-z]:",
];

#[derive(Debug, Clone)]
pub struct HookPaths {
    pub hooks_dir: PathBuf,
    pub pre_tool_path: PathBuf,
    pub post_tool_path: PathBuf,
    pub notification_path: PathBuf,
    pub events_path: PathBuf,
}

pub fn get_hook_paths(agent_dir: &Path) -> HookPaths {
    let hooks_dir = agent_dir.join("ralph").join("hooks");
    HookPaths {
        pre_tool_path: hooks_dir.join("pre_tool_use.sh"),
        post_tool_path: hooks_dir.join("post_tool_use.sh"),
        notification_path: hooks_dir.join("notification.sh"),
        events_path: agent_dir.join("ralph").join("tool_events.jsonl"),
        hooks_dir,
    }
}

fn backtick_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]+)`").unwrap())
}

fn block_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bblock(?:ed)?\b\s*[:\-]\s*(.+)$").unwrap())
}

/// Pull quoted/labeled guardrail patterns out of the guardrails tier text.
pub fn extract_guardrail_patterns(guardrails_text: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    for raw_line in guardrails_text.lines() {
        let line = raw_line.trim();
        if !line.starts_with('-') {
            continue;
        }
        for caps in backtick_re().captures_iter(line) {
            let cleaned = caps[1].trim();
            if !cleaned.is_empty() {
                patterns.push(cleaned.to_string());
            }
        }
        if let Some(caps) = block_suffix_re().captures(line) {
            let value = caps[1].trim();
            if !value.is_empty() {
                patterns.push(value.to_string());
            }
        }
    }
    patterns
}

/// Extracted patterns unioned with [`DEFAULT_BLOCK_PATTERNS`], order
/// preserved, duplicates removed.
pub fn build_guardrail_patterns(guardrails_text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for pattern in extract_guardrail_patterns(guardrails_text)
        .into_iter()
        .chain(DEFAULT_BLOCK_PATTERNS.iter().map(|s| s.to_string()))
    {
        if seen.insert(pattern.clone()) {
            ordered.push(pattern);
        }
    }
    ordered
}

fn payload_to_text(payload: &Value) -> String {
    let tool = payload
        .get("tool")
        .or_else(|| payload.get("name"))
        .or_else(|| payload.get("tool_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let args = payload
        .get("arguments")
        .or_else(|| payload.get("input"))
        .or_else(|| payload.get("args"))
        .cloned()
        .unwrap_or(Value::Null);
    format!("{tool} {args}").trim().to_string()
}

/// Returns `(blocked, matched_pattern)`. Invalid regexes are skipped.
pub fn should_block_payload(payload: &Value, patterns: &[String]) -> (bool, Option<String>) {
    let text = payload_to_text(payload);
    if text.is_empty() {
        return (false, None);
    }
    for pattern in patterns {
        let Ok(re) = Regex::new(&format!("(?i){pattern}")) else { continue };
        if re.is_match(&text) {
            return (true, Some(pattern.clone()));
        }
    }
    (false, None)
}

fn summarize_result(result: &Value, limit: usize) -> String {
    let text = match result {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = text.trim();
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(limit.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

pub fn build_tool_event(payload: &Value) -> Value {
    let tool = payload
        .get("tool")
        .or_else(|| payload.get("name"))
        .or_else(|| payload.get("tool_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let args = payload
        .get("arguments")
        .or_else(|| payload.get("input"))
        .or_else(|| payload.get("args"))
        .cloned()
        .unwrap_or(Value::Null);
    let result = payload
        .get("result")
        .or_else(|| payload.get("output"))
        .cloned()
        .unwrap_or(Value::Null);
    let success = payload
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or_else(|| {
            !payload.get("error").map(|e| !e.is_null()).unwrap_or(false)
                && !payload.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false)
        });

    let mut event = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "tool": tool,
        "arguments": args,
        "result_summary": summarize_result(&result, 200),
        "success": success,
    });
    if let Some(error) = payload.get("error") {
        if !error.is_null() {
            event["error"] = error.clone();
        }
    }
    event
}

pub fn append_tool_event(events_path: &Path, payload: &Value) -> Result<Value> {
    if let Some(parent) = events_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let event = build_tool_event(payload);
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(events_path)?;
    use std::io::Write;
    writeln!(file, "{event}")?;
    Ok(event)
}

fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Writes `pre_tool_use.sh`, returning the patterns compiled into it.
/// Reads the payload JSON from stdin, builds `"<tool> <args>"`, and exits
/// 2 if any pattern matches case-insensitively.
pub fn generate_pre_tool_script(
    guardrails_text: &str,
    output_path: &Path,
    patterns: Option<&[String]>,
) -> Result<Vec<String>> {
    let guardrail_patterns = patterns
        .map(|p| p.to_vec())
        .unwrap_or_else(|| build_guardrail_patterns(guardrails_text));
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut pattern_lines = String::new();
    for pattern in &guardrail_patterns {
        pattern_lines.push_str(&shell_single_quote(pattern));
        pattern_lines.push('\n');
    }

    let script = format!(
        r#"#!/bin/sh
# Blocks a tool call whose "<tool> <arguments>" text matches a guardrail pattern.
set -eu

PAYLOAD="$(cat)"
if [ -z "$PAYLOAD" ]; then
    exit 0
fi

PATTERNS='{patterns_block}'

printf '%s\n' "$PATTERNS" | while IFS= read -r pattern; do
    [ -z "$pattern" ] && continue
    if printf '%s' "$PAYLOAD" | grep -Eiq -- "$pattern"; then
        echo "Blocked by Ralph guardrails: $pattern" >&2
        exit 2
    fi
done
status=$?
if [ "$status" -eq 2 ]; then
    exit 2
fi
exit 0
"#,
        patterns_block = pattern_lines.trim_end(),
    );

    std::fs::write(output_path, script)?;
    set_executable(output_path)?;
    Ok(guardrail_patterns)
}

/// Writes `post_tool_use.sh`. Reads the payload JSON from stdin and
/// appends a summarized JSON-lines event to `events_path`.
pub fn generate_post_tool_script(output_path: &Path, events_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let script = format!(
        r#"#!/bin/sh
# Appends a summarized JSON-lines record of the tool call to the event log.
set -eu

EVENTS_PATH={events_path}
PAYLOAD="$(cat)"
TOOL=$(printf '%s' "$PAYLOAD" | grep -Eo '"(tool|name|tool_name)"[[:space:]]*:[[:space:]]*"[^"]*"' | head -n 1 | sed -E 's/.*:[[:space:]]*"([^"]*)"/\1/')
[ -z "$TOOL" ] && TOOL=unknown
TIMESTAMP=$(date -u +"%Y-%m-%dT%H:%M:%SZ")

mkdir -p "$(dirname "$EVENTS_PATH")"
printf '{{"timestamp":"%s","tool":"%s","raw":%s}}\n' "$TIMESTAMP" "$TOOL" "$PAYLOAD" >> "$EVENTS_PATH"
exit 0
"#,
        events_path = shell_single_quote(&events_path.to_string_lossy()),
    );
    std::fs::write(output_path, script)?;
    set_executable(output_path)?;
    Ok(())
}

/// Writes `notification.sh`. Reads `{title, message}` JSON from stdin and
/// dispatches through the host's native notifier.
pub fn generate_notification_script(output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let script = r#"#!/bin/sh
# Dispatches a notification through the host's native notifier, if any.
set -eu

PAYLOAD="$(cat)"
TITLE=$(printf '%s' "$PAYLOAD" | grep -Eo '"(title|heading)"[[:space:]]*:[[:space:]]*"[^"]*"' | head -n 1 | sed -E 's/.*:[[:space:]]*"([^"]*)"/\1/')
MESSAGE=$(printf '%s' "$PAYLOAD" | grep -Eo '"(message|content|text)"[[:space:]]*:[[:space:]]*"[^"]*"' | head -n 1 | sed -E 's/.*:[[:space:]]*"([^"]*)"/\1/')
[ -z "$TITLE" ] && TITLE="Ralph notification"

case "$(uname -s)" in
    Darwin)
        osascript -e "display notification \"$MESSAGE\" with title \"$TITLE\"" >/dev/null 2>&1 || exit 1
        ;;
    Linux)
        command -v notify-send >/dev/null 2>&1 && notify-send "$TITLE" "$MESSAGE" >/dev/null 2>&1 || exit 1
        ;;
    *)
        ;;
esac
exit 0
"#;
    std::fs::write(output_path, script)?;
    set_executable(output_path)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn load_settings(settings_path: &Path) -> Value {
    std::fs::read_to_string(settings_path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| json!({}))
}

fn write_settings(settings_path: &Path, settings: &Value) -> Result<()> {
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(settings_path, serde_json::to_string_pretty(settings)?)
        .with_context(|| format!("writing hook settings to {}", settings_path.display()))
}

fn ensure_hook_list<'a>(settings: &'a mut Value, hook_name: &str) -> &'a mut Vec<Value> {
    let hooks = settings
        .as_object_mut()
        .unwrap()
        .entry("hooks")
        .or_insert_with(|| json!({}));
    let entry = hooks.as_object_mut().unwrap().entry(hook_name).or_insert_with(|| json!([]));
    if !entry.is_array() {
        *entry = json!([]);
    }
    entry.as_array_mut().unwrap()
}

fn upsert_hook_entry(hook_list: &mut Vec<Value>, entry: Value, name: &str) {
    for existing in hook_list.iter_mut() {
        if existing.get("name").and_then(|v| v.as_str()) == Some(name) {
            *existing = entry;
            return;
        }
    }
    hook_list.push(entry);
}

/// Install/refresh the three hook entries in the host settings file, keyed
/// by stable hook name so re-installing updates rather than duplicates.
pub fn install_hooks(
    settings_path: &Path,
    pre_command: &str,
    post_command: &str,
    notification_command: Option<&str>,
) -> Result<bool> {
    let mut settings = load_settings(settings_path);

    upsert_hook_entry(
        ensure_hook_list(&mut settings, "PreToolUse"),
        json!({"name": RALPH_PRE_HOOK_NAME, "type": "command", "command": pre_command}),
        RALPH_PRE_HOOK_NAME,
    );
    upsert_hook_entry(
        ensure_hook_list(&mut settings, "PostToolUse"),
        json!({"name": RALPH_POST_HOOK_NAME, "type": "command", "command": post_command}),
        RALPH_POST_HOOK_NAME,
    );
    if let Some(notification_command) = notification_command {
        upsert_hook_entry(
            ensure_hook_list(&mut settings, "Notification"),
            json!({"name": RALPH_NOTIFICATION_HOOK_NAME, "type": "command", "command": notification_command}),
            RALPH_NOTIFICATION_HOOK_NAME,
        );
    }

    write_settings(settings_path, &settings)?;
    Ok(true)
}

/// Remove Ralph's hook entries from the host settings file. Returns
/// whether anything changed.
pub fn uninstall_hooks(settings_path: &Path) -> Result<bool> {
    let mut settings = load_settings(settings_path);
    let Some(hooks) = settings.get_mut("hooks").and_then(|h| h.as_object_mut()) else {
        return Ok(false);
    };

    let mut changed = false;
    for (hook_name, target) in [
        ("PreToolUse", RALPH_PRE_HOOK_NAME),
        ("PostToolUse", RALPH_POST_HOOK_NAME),
        ("Notification", RALPH_NOTIFICATION_HOOK_NAME),
    ] {
        let Some(list) = hooks.get_mut(hook_name).and_then(|l| l.as_array_mut()) else { continue };
        let original_len = list.len();
        list.retain(|item| item.get("name").and_then(|v| v.as_str()) != Some(target));
        if list.len() != original_len {
            changed = true;
        }
    }

    if changed {
        write_settings(settings_path, &settings)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extract_guardrail_patterns_reads_backticks_and_block_suffix() {
        let text = "- never run `rm -rf /tmp/x`\n- Block: curl http://evil\n- plain line";
        let patterns = extract_guardrail_patterns(text);
        assert_eq!(patterns, vec!["rm -rf /tmp/x".to_string(), "curl http://evil".to_string()]);
    }

    #[test]
    fn build_guardrail_patterns_unions_with_defaults_deduplicated() {
        let text = "- `drop table`";
        let patterns = build_guardrail_patterns(text);
        assert_eq!(patterns.iter().filter(|p| p.as_str() == "drop table").count(), 1);
        assert!(patterns.contains(&"mkfs\\b".to_string()));
    }

    #[test]
    fn should_block_payload_matches_case_insensitively() {
        let payload = json!({"tool": "Bash", "arguments": {"command": "RM -RF /"}});
        let (blocked, pattern) = should_block_payload(&payload, &[r"rm\s+-rf\s+/".to_string()]);
        assert!(blocked);
        assert_eq!(pattern.as_deref(), Some(r"rm\s+-rf\s+/"));
    }

    #[test]
    fn should_block_payload_skips_invalid_regex() {
        let payload = json!({"tool": "Bash", "arguments": {"command": "ls"}});
        let (blocked, _) = should_block_payload(&payload, &["(unterminated".to_string()]);
        assert!(!blocked);
    }

    #[test]
    fn build_tool_event_summarizes_and_defaults_success() {
        let payload = json!({"tool": "Read", "arguments": {"path": "x.rs"}, "result": "ok"});
        let event = build_tool_event(&payload);
        assert_eq!(event["tool"], "Read");
        assert_eq!(event["success"], true);
        assert_eq!(event["result_summary"], "ok");
    }

    #[test]
    fn generate_pre_tool_script_writes_executable_file_with_patterns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hooks").join("pre_tool_use.sh");
        let patterns = generate_pre_tool_script("- `rm -rf /data`", &path, None).unwrap();
        assert!(patterns.contains(&"rm -rf /data".to_string()));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("#!/bin/sh"));
    }

    #[test]
    fn install_then_uninstall_hooks_roundtrips() {
        let dir = tempdir().unwrap();
        let settings_path = dir.path().join("settings.json");
        install_hooks(&settings_path, "pre.sh", "post.sh", Some("notify.sh")).unwrap();

        let settings = load_settings(&settings_path);
        assert_eq!(settings["hooks"]["PreToolUse"].as_array().unwrap().len(), 1);

        let changed = uninstall_hooks(&settings_path).unwrap();
        assert!(changed);
        let settings = load_settings(&settings_path);
        assert_eq!(settings["hooks"]["PreToolUse"].as_array().unwrap().len(), 0);
    }
}

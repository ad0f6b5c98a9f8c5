//! Exercises the generated guardrail scripts themselves (not just the
//! Rust functions that build them) by invoking them through `sh`, the
//! way a host agent tool actually would.

use std::io::Write;
use std::process::{Command, Stdio};

use recall_harness::ralph::hooks::{generate_pre_tool_script, generate_post_tool_script};

fn run_script(path: &std::path::Path, stdin_payload: &str) -> (i32, String) {
    let mut child = Command::new("sh")
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn sh");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin_payload.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (output.status.code().unwrap_or(-1), stderr)
}

#[test]
fn pre_tool_script_blocks_a_dangerous_command() {
    let tmp = tempfile::tempdir().unwrap();
    let script_path = tmp.path().join("pre_tool_use.sh");
    let guardrails_text = "- Never run `rm -rf /tmp/data` in this repo\n";
    generate_pre_tool_script(guardrails_text, &script_path, None).unwrap();

    let payload = r#"{"tool": "Bash", "args": {"command": "rm -rf /tmp/data"}}"#;
    let (exit_code, stderr) = run_script(&script_path, payload);
    assert_eq!(exit_code, 2, "stderr: {stderr}");
    assert!(stderr.contains("Blocked by Ralph guardrails"));
}

#[test]
fn pre_tool_script_allows_a_benign_command() {
    let tmp = tempfile::tempdir().unwrap();
    let script_path = tmp.path().join("pre_tool_use.sh");
    let guardrails_text = "- Never run `rm -rf /tmp/data` in this repo\n";
    generate_pre_tool_script(guardrails_text, &script_path, None).unwrap();

    let payload = r#"{"tool": "Bash", "args": {"command": "ls -la"}}"#;
    let (exit_code, _stderr) = run_script(&script_path, payload);
    assert_eq!(exit_code, 0);
}

#[test]
fn pre_tool_script_blocks_default_dangerous_patterns_even_with_no_guardrails_text() {
    let tmp = tempfile::tempdir().unwrap();
    let script_path = tmp.path().join("pre_tool_use.sh");
    generate_pre_tool_script("", &script_path, None).unwrap();

    let payload = r#"{"tool": "Bash", "args": {"command": "sudo rm -rf / --no-preserve-root"}}"#;
    let (exit_code, _stderr) = run_script(&script_path, payload);
    assert_eq!(exit_code, 2);
}

#[test]
fn post_tool_script_appends_event_log_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let script_path = tmp.path().join("post_tool_use.sh");
    let events_path = tmp.path().join("events.jsonl");
    generate_post_tool_script(&script_path, &events_path).unwrap();

    let payload = r#"{"tool": "Write", "args": {"path": "foo.rs"}}"#;
    let (exit_code, _stderr) = run_script(&script_path, payload);
    assert_eq!(exit_code, 0);

    let logged = std::fs::read_to_string(&events_path).unwrap();
    assert!(logged.contains("\"tool\":\"Write\""));
}

//! End-to-end tests for the `ralph` iteration loop driver, exercised
//! through its public API against a temp `.agent` directory. None of
//! these spawn a real coding-CLI binary on purpose (the sandbox this
//! crate is built in has none installed); the spawn-failure path itself
//! is what `run_iteration` must turn into a `Blocked` outcome.

use std::sync::atomic::AtomicBool;

use recall_harness::config::RalphLoopConfig;
use recall_harness::models::RalphStatus;
use recall_harness::ralph::{ProgressEvent, RalphLoopDriver};

fn write_prd(agent_dir: &std::path::Path, items_json: &str) {
    let ralph_dir = agent_dir.join("ralph");
    std::fs::create_dir_all(&ralph_dir).unwrap();
    std::fs::write(ralph_dir.join("prd.json"), items_json).unwrap();
}

#[tokio::test]
async fn enable_then_disable_roundtrips_state() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_dir = tmp.path().join(".agent");
    let driver = RalphLoopDriver::new(&agent_dir, RalphLoopConfig::default());

    let enabled = driver.enable().unwrap();
    assert_eq!(enabled.status, RalphStatus::Enabled);
    assert_eq!(enabled.total_iterations, 0);

    let reloaded = driver.load_state().unwrap();
    assert_eq!(reloaded.status, RalphStatus::Enabled);

    let disabled = driver.disable().unwrap();
    assert_eq!(disabled.status, RalphStatus::Disabled);
}

#[tokio::test]
async fn run_iteration_with_no_prd_items_errors_without_crashing() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_dir = tmp.path().join(".agent");
    let driver = RalphLoopDriver::new(&agent_dir, RalphLoopConfig::default());
    driver.enable().unwrap();

    let cancel = AtomicBool::new(false);
    let result = driver.run_iteration(&|_event: ProgressEvent| {}, &cancel).await;
    assert!(result.is_err(), "no PRD items available should error, not panic");
}

#[tokio::test]
async fn run_iteration_against_missing_coding_cli_yields_blocked_outcome() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_dir = tmp.path().join(".agent");
    write_prd(
        &agent_dir,
        r#"{"items": [
            {"id": "item-1", "title": "Add a widget", "description": "Build it", "passes": false, "priority": 1}
        ]}"#,
    );

    let mut config = RalphLoopConfig::default();
    config.coding_cli = Some("claude-code".to_string());
    let driver = RalphLoopDriver::new(&agent_dir, config);
    driver.enable().unwrap();

    let cancel = AtomicBool::new(false);
    let mut outcomes = Vec::new();
    let progress = |event: ProgressEvent| {
        if let ProgressEvent::IterationComplete { outcome, .. } = event {
            outcomes.push(outcome);
        }
    };
    // `claude` is not installed in this environment, so spawning fails
    // and run_iteration surfaces a LoopSpawnError rather than panicking.
    let result = driver.run_iteration(&progress, &cancel).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("spawn"));

    let state = driver.load_state().unwrap();
    assert_eq!(state.status, RalphStatus::Enabled);
}

#[tokio::test]
async fn unsupported_coding_cli_is_rejected_before_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_dir = tmp.path().join(".agent");
    write_prd(
        &agent_dir,
        r#"{"items": [{"id": "item-1", "title": "t", "description": "d", "passes": false, "priority": 1}]}"#,
    );

    let mut config = RalphLoopConfig::default();
    config.coding_cli = Some("not-a-real-cli".to_string());
    let driver = RalphLoopDriver::new(&agent_dir, config);
    driver.enable().unwrap();

    let cancel = AtomicBool::new(false);
    let result = driver.run_iteration(&|_| {}, &cancel).await;
    assert!(result.is_err());
}

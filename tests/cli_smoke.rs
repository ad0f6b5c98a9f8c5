//! CLI smoke tests that invoke the compiled `recall` binary the way the
//! teacher's own `tests/integration.rs` invokes `ctx`: locate the test
//! binary's sibling, run it against a throwaway repo, and assert on
//! stdout/exit status.

use std::path::PathBuf;
use std::process::Command;

fn recall_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // test binary name
    path.pop(); // deps/
    path.push("recall");
    path
}

fn run_recall(repo: &std::path::Path, args: &[&str]) -> (String, String, bool) {
    let binary = recall_binary();
    let output = Command::new(&binary)
        .arg("--repo")
        .arg(repo)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run recall binary at {:?}: {}", binary, e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn write_stub_config(repo: &std::path::Path) {
    std::fs::create_dir_all(repo.join(".agent")).unwrap();
    std::fs::write(
        repo.join(".agent").join("config.yaml"),
        r#"[llm]
provider = "stub"
model = "stub-model"
"#,
    )
    .unwrap();
}

#[test]
fn init_creates_agent_dir_and_database() {
    let tmp = tempfile::tempdir().unwrap();
    let (_stdout, stderr, ok) = run_recall(tmp.path(), &["init"]);
    assert!(ok, "init failed: {stderr}");
    assert!(tmp.path().join(".agent").exists());
    assert!(tmp.path().join(".agent/memory.db").exists());
}

#[test]
fn sync_with_no_sessions_reports_zero_discovered() {
    let tmp = tempfile::tempdir().unwrap();
    write_stub_config(tmp.path());
    let (_stdout, stderr, ok) = run_recall(tmp.path(), &["init"]);
    assert!(ok, "init failed: {stderr}");

    let (stdout, stderr, ok) = run_recall(tmp.path(), &["sync"]);
    assert!(ok, "sync failed: {stderr}");
    assert!(stdout.contains("sync:"), "unexpected stdout: {stdout}");
}

#[test]
fn sync_reset_full_on_empty_store_is_a_harmless_noop() {
    let tmp = tempfile::tempdir().unwrap();
    write_stub_config(tmp.path());
    let (_stdout, stderr, ok) = run_recall(tmp.path(), &["init"]);
    assert!(ok, "init failed: {stderr}");

    let (stdout, stderr, ok) = run_recall(tmp.path(), &["sync", "--reset-full"]);
    assert!(ok, "sync --reset-full failed: {stderr}");
    assert!(stdout.contains("sync:"), "unexpected stdout: {stdout}");
}

#[test]
fn context_bundle_renders_even_with_no_data() {
    let tmp = tempfile::tempdir().unwrap();
    write_stub_config(tmp.path());
    run_recall(tmp.path(), &["init"]);

    let (stdout, stderr, ok) = run_recall(tmp.path(), &["context", "write a parser"]);
    assert!(ok, "context failed: {stderr}");
    assert!(stdout.contains("write a parser"));
}

#[test]
fn distinct_tenants_do_not_error_against_the_same_repo() {
    let tmp = tempfile::tempdir().unwrap();
    write_stub_config(tmp.path());
    run_recall(tmp.path(), &["init"]);

    let (_out_a, err_a, ok_a) =
        run_recall(tmp.path(), &["--tenant", "alice", "context", "task"]);
    let (_out_b, err_b, ok_b) =
        run_recall(tmp.path(), &["--tenant", "bob", "context", "task"]);
    assert!(ok_a, "tenant alice failed: {err_a}");
    assert!(ok_b, "tenant bob failed: {err_b}");
}

#[test]
fn hooks_install_then_uninstall_roundtrips_settings_file() {
    let tmp = tempfile::tempdir().unwrap();
    write_stub_config(tmp.path());
    run_recall(tmp.path(), &["init"]);

    let settings = tmp.path().join("settings.json");
    std::fs::write(&settings, "{}").unwrap();

    let (stdout, stderr, ok) = run_recall(tmp.path(), &["hooks", "install", settings.to_str().unwrap()]);
    assert!(ok, "hooks install failed: {stderr}");
    assert!(stdout.contains("Installed"));

    let installed = std::fs::read_to_string(&settings).unwrap();
    assert!(installed.contains("ralph-pre-tool-use"));

    let (stdout, stderr, ok) = run_recall(tmp.path(), &["hooks", "uninstall", settings.to_str().unwrap()]);
    assert!(ok, "hooks uninstall failed: {stderr}");
    assert!(stdout.contains("Removed"));

    let uninstalled = std::fs::read_to_string(&settings).unwrap();
    assert!(!uninstalled.contains("ralph-pre-tool-use"));
}

//! Cooperative iteration-loop driver: one PRD item per iteration, an agent
//! subprocess does the work, a validation command confirms it, and the
//! tier files and iteration archive record the result.
//!
//! The teacher has no subprocess driver of its own; streaming follows its
//! `tokio = { features = ["full"] }` usage pattern — one task pumping the
//! child's stdout lines into a bounded channel, drained by the
//! progress-callback dispatcher. Report shape and numbering are grounded
//! on `ralph/iteration_store.py` via [`super::reports::IterationReportStore`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::RalphLoopConfig;
use crate::error::RecallError;
use crate::models::{IterationOutcome, IterationReport, RalphState, RalphStatus};
use crate::tier_store::{TierWriter, WritePolicy};

use super::reports::IterationReportStore;

const DEFAULT_ITERATION_TIMEOUT_SECONDS: u64 = 900;

/// Progress events emitted during one iteration, per spec.md §4.8 step 9.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    IterationStarted { iteration: u32, item_id: String },
    OutputLine(String),
    AgentComplete { exit_code: i32 },
    ValidationComplete { success: bool, hint: Option<String> },
    IterationComplete { outcome: IterationOutcome, duration_seconds: f64 },
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },
}

pub type ProgressCallback<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

pub struct RalphLoopDriver {
    agent_dir: PathBuf,
    ralph_dir: PathBuf,
    tiers: TierWriter,
    reports: IterationReportStore,
    config: RalphLoopConfig,
}

enum AgentInvocation {
    Direct { program: String, args: Vec<String>, stdin: Option<String> },
    Shell { command: String },
}

impl RalphLoopDriver {
    pub fn new(agent_dir: impl Into<PathBuf>, config: RalphLoopConfig) -> Self {
        let agent_dir = agent_dir.into();
        let ralph_dir = agent_dir.join("ralph");
        Self {
            tiers: TierWriter::new(&agent_dir, WritePolicy::default()),
            reports: IterationReportStore::new(&ralph_dir),
            ralph_dir,
            agent_dir,
            config,
        }
    }

    fn state_path(&self) -> PathBuf {
        self.ralph_dir.join("ralph_state.json")
    }

    fn prd_path(&self) -> PathBuf {
        self.ralph_dir.join("prd.json")
    }

    pub fn load_state(&self) -> Result<RalphState> {
        match std::fs::read_to_string(self.state_path()) {
            Ok(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RalphState::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save_state(&self, state: &RalphState) -> Result<()> {
        std::fs::create_dir_all(&self.ralph_dir)?;
        std::fs::write(self.state_path(), serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    pub fn enable(&self) -> Result<RalphState> {
        let mut state = self.load_state()?;
        state.status = RalphStatus::Enabled;
        state.selected_prd_ids = self.config.selected_prd_ids.clone();
        state.updated_at = Utc::now();
        self.save_state(&state)?;
        Ok(state)
    }

    pub fn disable(&self) -> Result<RalphState> {
        let mut state = self.load_state()?;
        state.status = RalphStatus::Disabled;
        state.updated_at = Utc::now();
        self.save_state(&state)?;
        Ok(state)
    }

    /// Delegates the entire loop to `script_path` via a streaming
    /// subprocess instead of driving iterations in-process, passing along
    /// the PRD path, the configured coding CLI, and the iteration budget
    /// the way the original implementation's shell fallback mode does.
    /// Returns the script's exit code.
    pub async fn run_external_script(
        &self,
        script_path: &Path,
        max_iterations: u32,
        progress: &ProgressCallback<'_>,
        cancel: &AtomicBool,
    ) -> Result<i32> {
        let mut cmd = Command::new(script_path);
        cmd.arg("--agent-cmd")
            .arg(self.config.coding_cli.as_deref().unwrap_or("claude-code"))
            .arg("--max-iterations")
            .arg(max_iterations.to_string())
            .arg("--prd-file")
            .arg(self.prd_path())
            .arg("--compact-mode")
            .arg(&self.config.compact_mode)
            .arg("--sleep-seconds")
            .arg(self.config.sleep_seconds.to_string());
        cmd.current_dir(self.agent_dir.parent().unwrap_or(&self.agent_dir));
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

        let mut child = cmd.spawn().with_context(|| format!("spawning {}", script_path.display()))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);
        loop {
            tokio::select! {
                line = rx.recv() => {
                    match line {
                        Some(line) => progress(ProgressEvent::OutputLine(line)),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
            }
            if cancel.load(Ordering::SeqCst) {
                let _ = child.start_kill();
                break;
            }
        }
        let _ = pump.await;
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    fn load_prd_items(&self) -> Result<Vec<Value>> {
        let text = match std::fs::read_to_string(self.prd_path()) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let payload: Value = serde_json::from_str(&text)?;
        Ok(payload.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default())
    }

    /// Step 1: next not-yet-passed item, from the selected list if
    /// configured, else by ascending `priority` (file order as a tiebreak).
    fn select_next_item(&self, state: &RalphState) -> Result<Option<Value>> {
        let items = self.load_prd_items()?;
        let selected = state.selected_prd_ids.as_ref().or(self.config.selected_prd_ids.as_ref());

        if let Some(selected) = selected {
            for id in selected {
                if let Some(item) = items.iter().find(|item| field_str(item, "id") == *id) {
                    if !field_bool(item, "passes") {
                        return Ok(Some(item.clone()));
                    }
                }
            }
            return Ok(None);
        }

        let mut candidates: Vec<&Value> = items.iter().filter(|item| !field_bool(item, "passes")).collect();
        candidates.sort_by_key(|item| item.get("priority").and_then(|v| v.as_i64()).unwrap_or(i64::MAX));
        Ok(candidates.into_iter().next().cloned())
    }

    /// Run exactly one iteration end to end. Returns the finalized report.
    pub async fn run_iteration(
        &self,
        progress: &ProgressCallback<'_>,
        cancel: &AtomicBool,
    ) -> Result<IterationReport> {
        let mut state = self.load_state()?;
        state.status = RalphStatus::Iterating;
        self.save_state(&state)?;

        let Some(item) = self.select_next_item(&state)? else {
            state.status = RalphStatus::Enabled;
            self.save_state(&state)?;
            anyhow::bail!("no PRD item available to iterate on");
        };
        let item_id = field_str(&item, "id");
        let item_title = field_str(&item, "title");

        let requested_iteration = state.current_iteration + 1;
        let mut report = self.reports.create_for_iteration(requested_iteration, &item_id, &item_title)?;
        progress(ProgressEvent::IterationStarted { iteration: report.iteration, item_id: item_id.clone() });

        let timeout = std::time::Duration::from_secs(DEFAULT_ITERATION_TIMEOUT_SECONDS);
        let invocation = build_agent_invocation(&self.config, &self.ralph_dir, &item)?;
        let prompt = render_prompt(&item);

        let run_outcome = self.run_agent_subprocess(&invocation, &prompt, progress, cancel, timeout).await;

        let (agent_exit, timed_out, scope_reduced, cancelled) = match run_outcome {
            Ok(result) => result,
            Err(err) => {
                report.outcome = Some(IterationOutcome::Blocked);
                report.failure_reason = Some(format!("agent spawn failed: {err}"));
                let finalized = self.reports.finalize_current(-1, report.failure_reason.as_deref())?;
                let finalized = finalized.context("in-flight report vanished")?;
                self.write_tier_entries(&finalized, "agent_spawn_failed")?;
                state.status = RalphStatus::Enabled;
                state.current_iteration = finalized.iteration;
                self.save_state(&state)?;
                return Err(RecallError::LoopSpawnError(err.to_string()).into());
            }
        };
        progress(ProgressEvent::AgentComplete { exit_code: agent_exit });

        if cancelled {
            let diff_text = self.capture_diff().unwrap_or_default();
            self.reports.save_current_diff(&report, &diff_text)?;
            let mut finalized = self
                .reports
                .finalize_current(agent_exit, Some("cancelled"))?
                .context("in-flight report vanished")?;
            finalized.outcome = Some(IterationOutcome::Blocked);
            finalized.files_changed = parse_diff_files(&diff_text);
            self.reports.save_current(&finalized)?;
            self.write_tier_entries(&finalized, "cancelled")?;

            state.current_iteration = finalized.iteration;
            state.status = RalphStatus::Enabled;
            state.updated_at = Utc::now();
            self.save_state(&state)?;

            progress(ProgressEvent::IterationComplete {
                outcome: IterationOutcome::Blocked,
                duration_seconds: finalized.duration_seconds.unwrap_or(0.0),
            });
            return Ok(finalized);
        }

        let diff_text = self.capture_diff().unwrap_or_default();
        self.reports.save_current_diff(&report, &diff_text)?;

        let (validation_exit, validation_hint) = if timed_out {
            (agent_exit, None)
        } else {
            self.run_validation(&item).await?
        };
        progress(ProgressEvent::ValidationComplete {
            success: validation_exit == 0,
            hint: validation_hint.clone(),
        });

        let outcome = derive_outcome(agent_exit, validation_exit, timed_out, scope_reduced);
        let reason = match outcome {
            IterationOutcome::ValidationFailed => "validation_failed",
            IterationOutcome::Timeout => "agent_timeout",
            IterationOutcome::Blocked => "abort",
            _ => "general",
        };

        let mut finalized = self
            .reports
            .finalize_current(validation_exit, validation_hint.as_deref())?
            .context("in-flight report vanished")?;
        finalized.outcome = Some(outcome);
        finalized.files_changed = parse_diff_files(&diff_text);
        self.reports.save_current(&finalized)?;

        self.write_tier_entries(&finalized, reason)?;

        if outcome == IterationOutcome::Completed {
            state.selected_prd_ids = None;
        }
        state.total_iterations += 1;
        state.current_iteration = finalized.iteration;
        state.total_cost_usd = self.sum_cost_usd()?;
        state.status = RalphStatus::Enabled;
        state.updated_at = Utc::now();
        self.save_state(&state)?;

        progress(ProgressEvent::IterationComplete {
            outcome,
            duration_seconds: finalized.duration_seconds.unwrap_or(0.0),
        });

        if let Some(budget) = self.config.cost_budget_usd {
            if state.total_cost_usd > budget {
                progress(ProgressEvent::BudgetExceeded { spent_usd: state.total_cost_usd, budget_usd: budget });
                return Err(RecallError::BudgetExceeded { spent: state.total_cost_usd, budget }.into());
            }
        }

        Ok(finalized)
    }

    async fn run_agent_subprocess(
        &self,
        invocation: &AgentInvocation,
        prompt: &str,
        progress: &ProgressCallback<'_>,
        cancel: &AtomicBool,
        timeout: std::time::Duration,
    ) -> Result<(i32, bool, bool, bool)> {
        let mut command = match invocation {
            AgentInvocation::Direct { program, args, .. } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            AgentInvocation::Shell { command } => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        };
        command.current_dir(self.agent_dir.parent().unwrap_or(&self.agent_dir));
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let needs_stdin = matches!(invocation, AgentInvocation::Direct { stdin: Some(_), .. });
        command.stdin(if needs_stdin { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn().context("spawning agent subprocess")?;

        if let AgentInvocation::Direct { stdin: Some(text), .. } = invocation {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes()).await.ok();
            }
        } else {
            let _ = prompt;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let scope_reduced = Arc::new(AtomicBool::new(false));
        let scope_reduced_writer = scope_reduced.clone();

        // Poll `cancel` on a short tick alongside output lines so a
        // cancellation request is honored even if the child goes quiet.
        const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);
        let wait_and_drain = async {
            let mut cancelled = false;
            loop {
                tokio::select! {
                    line = rx.recv() => {
                        match line {
                            Some(line) => {
                                if line.to_lowercase().contains("scope reduced") {
                                    scope_reduced_writer.store(true, Ordering::SeqCst);
                                }
                                progress(ProgressEvent::OutputLine(line));
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
                }
                if cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    let _ = child.start_kill();
                    break;
                }
            }
            let _ = pump.await;
            (cancelled, child.wait().await)
        };

        match tokio::time::timeout(timeout, wait_and_drain).await {
            Ok((cancelled, Ok(status))) => Ok((
                status.code().unwrap_or(-1),
                false,
                scope_reduced.load(Ordering::SeqCst),
                cancelled,
            )),
            Ok((_, Err(err))) => Err(err.into()),
            Err(_) => {
                let _ = child.start_kill();
                Ok((-1, true, scope_reduced.load(Ordering::SeqCst), false))
            }
        }
    }

    async fn run_validation(&self, item: &Value) -> Result<(i32, Option<String>)> {
        let commands = field_str_list(item, &["validation", "validation_commands"]);
        if commands.is_empty() {
            return Ok((0, None));
        }
        let joined = commands.join(" && ");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&joined)
            .current_dir(self.agent_dir.parent().unwrap_or(&self.agent_dir))
            .output()
            .await
            .context("running validation command")?;

        let exit_code = output.status.code().unwrap_or(-1);
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let hint = last_actionable_line(&combined);
        Ok((exit_code, hint))
    }

    fn capture_diff(&self) -> Result<String> {
        let repo_dir = self.agent_dir.parent().unwrap_or(&self.agent_dir);
        let output = std::process::Command::new("git").arg("diff").arg("HEAD").current_dir(repo_dir).output();
        match output {
            Ok(output) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
            _ => Ok(String::new()),
        }
    }

    fn write_tier_entries(&self, report: &IterationReport, reason: &str) -> Result<()> {
        let validation_hint = report.validation_hint.as_deref().unwrap_or("");
        if report.outcome == Some(IterationOutcome::ValidationFailed) {
            self.tiers.write_guardrails_hard_failure(
                report.iteration,
                &report.item_id,
                &report.item_title,
                &validation_hint.lines().map(|s| s.to_string()).collect::<Vec<_>>(),
                validation_hint,
                None,
            )?;
        } else {
            self.tiers.write_guardrails_entry(
                report.iteration,
                &report.item_id,
                &report.item_title,
                reason,
                validation_hint,
                None,
            )?;
        }
        self.tiers.write_style_entry(report.iteration, &report.item_id, validation_hint, None)?;

        let work_mode = "agent";
        let outcome_str = report
            .outcome
            .map(|o| format!("{o:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let validate_status = if report.validation_exit_code == Some(0) { "passed" } else { "failed" };
        self.tiers.write_recent_entry(
            report.iteration,
            &report.item_id,
            &report.item_title,
            work_mode,
            report.validation_exit_code.unwrap_or(-1),
            validate_status,
            &outcome_str,
            validation_hint,
            None,
        )?;
        Ok(())
    }

    /// Sum of `cost_usd_cents` across archived reports' `token_usage` maps.
    /// Coding CLIs don't expose cost uniformly on stdout, so this resolves
    /// spec.md's "sum token_usage" step to whatever numeric cost signal the
    /// agent wrapper chose to report under that key; absent entries cost 0.
    fn sum_cost_usd(&self) -> Result<f64> {
        let total_cents: i64 = self
            .reports
            .load_all()?
            .iter()
            .filter_map(|report| report.token_usage.as_ref())
            .filter_map(|usage| usage.get("cost_usd_cents"))
            .sum();
        Ok(total_cents as f64 / 100.0)
    }
}

fn field_str(value: &Value, key: &str) -> String {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

fn field_bool(value: &Value, key: &str) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn field_str_list(value: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(items) = value.get(*key).and_then(|v| v.as_array()) {
            return items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
        }
    }
    Vec::new()
}

fn render_prompt(item: &Value) -> String {
    let title = field_str(item, "title");
    let description = field_str(item, "description");
    let user_story = field_str(item, "user_story");
    let steps = field_str_list(item, &["steps"]).join("\n- ");
    let acceptance = field_str_list(item, &["acceptance", "acceptance_criteria"]).join("\n- ");

    let mut prompt = format!("# Task: {title}\n\n{description}\n");
    if !user_story.is_empty() {
        prompt.push_str(&format!("\nUser story: {user_story}\n"));
    }
    if !steps.is_empty() {
        prompt.push_str(&format!("\nSteps:\n- {steps}\n"));
    }
    if !acceptance.is_empty() {
        prompt.push_str(&format!("\nAcceptance criteria:\n- {acceptance}\n"));
    }
    prompt
}

/// Build the agent argv/stdin per spec.md §6's invocation-convention table.
fn build_agent_invocation(config: &RalphLoopConfig, ralph_dir: &Path, item: &Value) -> Result<AgentInvocation> {
    let cli = config.coding_cli.as_deref().unwrap_or("claude-code");
    let model = config.cli_model.as_deref();
    let prompt = render_prompt(item);

    match cli {
        "claude-code" => {
            let mut args = Vec::new();
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            Ok(AgentInvocation::Direct { program: "claude".to_string(), args, stdin: Some(prompt) })
        }
        "codex" => {
            let mut args = vec!["exec".to_string()];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push(prompt);
            Ok(AgentInvocation::Direct { program: "codex".to_string(), args, stdin: None })
        }
        "opencode" => {
            std::fs::create_dir_all(ralph_dir)?;
            let prompt_path = ralph_dir.join(".runtime-prompt.txt");
            if let Some(parent) = prompt_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&prompt_path, &prompt)?;
            let model_flag = model.map(|m| format!("-m {m} ")).unwrap_or_default();
            let command = format!(
                "opencode run {model_flag}\"$(cat {})\"",
                shell_quote(&prompt_path.to_string_lossy())
            );
            Ok(AgentInvocation::Shell { command })
        }
        other => anyhow::bail!("unsupported coding_cli: {other}"),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn derive_outcome(agent_exit: i32, validation_exit: i32, timed_out: bool, scope_reduced: bool) -> IterationOutcome {
    if timed_out {
        return IterationOutcome::Timeout;
    }
    if scope_reduced {
        return IterationOutcome::ScopeReduced;
    }
    if agent_exit != 0 {
        return IterationOutcome::Blocked;
    }
    if validation_exit == 0 {
        IterationOutcome::Completed
    } else {
        IterationOutcome::ValidationFailed
    }
}

fn parse_diff_files(diff_text: &str) -> Vec<String> {
    diff_text
        .lines()
        .filter_map(|line| line.strip_prefix("+++ b/").or_else(|| line.strip_prefix("--- a/")))
        .map(|s| s.to_string())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Last non-blank line of combined stdout+stderr, used as the validation
/// report's actionable hint.
fn last_actionable_line(text: &str) -> Option<String> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_outcome_matches_truth_table() {
        assert_eq!(derive_outcome(0, 0, false, false), IterationOutcome::Completed);
        assert_eq!(derive_outcome(0, 1, false, false), IterationOutcome::ValidationFailed);
        assert_eq!(derive_outcome(1, 0, false, false), IterationOutcome::Blocked);
        assert_eq!(derive_outcome(0, 0, true, false), IterationOutcome::Timeout);
        assert_eq!(derive_outcome(0, 0, false, true), IterationOutcome::ScopeReduced);
    }

    #[test]
    fn build_agent_invocation_claude_code_passes_prompt_via_stdin() {
        let config = RalphLoopConfig {
            coding_cli: Some("claude-code".to_string()),
            cli_model: Some("claude-sonnet-4".to_string()),
            ..RalphLoopConfig::default()
        };
        let item = serde_json::json!({"id": "ITEM-1", "title": "Add feature", "description": "do it"});
        let dir = tempfile::tempdir().unwrap();
        let invocation = build_agent_invocation(&config, dir.path(), &item).unwrap();
        match invocation {
            AgentInvocation::Direct { program, args, stdin } => {
                assert_eq!(program, "claude");
                assert_eq!(args, vec!["--model".to_string(), "claude-sonnet-4".to_string()]);
                assert!(stdin.unwrap().contains("Add feature"));
            }
            _ => panic!("expected direct invocation"),
        }
    }

    #[test]
    fn build_agent_invocation_opencode_writes_prompt_file_and_uses_shell() {
        let config = RalphLoopConfig { coding_cli: Some("opencode".to_string()), ..RalphLoopConfig::default() };
        let item = serde_json::json!({"id": "ITEM-1", "title": "Add feature", "description": "do it"});
        let dir = tempfile::tempdir().unwrap();
        let invocation = build_agent_invocation(&config, dir.path(), &item).unwrap();
        match invocation {
            AgentInvocation::Shell { command } => {
                assert!(command.starts_with("opencode run "));
                assert!(command.contains("$(cat"));
            }
            _ => panic!("expected shell invocation"),
        }
        assert!(dir.path().join(".runtime-prompt.txt").exists());
    }

    #[test]
    fn last_actionable_line_skips_trailing_blank_lines() {
        let text = "line one\nFAILED: test_foo\n\n\n";
        assert_eq!(last_actionable_line(text).as_deref(), Some("FAILED: test_foo"));
    }

    #[test]
    fn parse_diff_files_extracts_unique_sorted_paths() {
        let diff = "--- a/src/main.rs\n+++ b/src/main.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n";
        assert_eq!(parse_diff_files(diff), vec!["src/lib.rs".to_string(), "src/main.rs".to_string()]);
    }
}

//! Per-iteration report archive: a `current.json` in-flight report plus
//! zero-padded `NNN.json` archives, one per completed iteration.
//!
//! Grounded on `ralph/iteration_store.py`'s `IterationReportStore`:
//! `create_for_iteration` allocates the smallest iteration number that
//! isn't already archived or currently in flight, `finalize_current`
//! stamps completion time/duration/outcome and moves `current.json` into
//! the archive, and `load_recent`/`load_all` read archived reports back
//! sorted by filename.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;

use crate::models::{IterationOutcome, IterationReport};

pub struct IterationReportStore {
    iterations_dir: PathBuf,
    current_path: PathBuf,
}

impl IterationReportStore {
    pub fn new(ralph_dir: impl AsRef<Path>) -> Self {
        let iterations_dir = ralph_dir.as_ref().join("iterations");
        let current_path = iterations_dir.join("current.json");
        Self { iterations_dir, current_path }
    }

    pub fn create_for_iteration(&self, iteration: u32, item_id: &str, item_title: &str) -> Result<IterationReport> {
        let resolved_iteration = self.allocate_iteration_number(iteration)?;
        let report = IterationReport::new(resolved_iteration, item_id, item_title);
        self.save_current(&report)?;
        Ok(report)
    }

    /// Finalize the in-flight report: stamp completion time/duration,
    /// mark `Completed` on a green validation exit, archive it, and
    /// remove `current.json`.
    pub fn finalize_current(
        &self,
        validation_exit: i32,
        validation_hint: Option<&str>,
    ) -> Result<Option<IterationReport>> {
        let Some(mut report) = self.load_current()? else { return Ok(None) };
        let now = Utc::now();
        report.validation_exit_code = Some(validation_exit);
        report.validation_hint = validation_hint.map(|s| s.to_string());
        report.completed_at = Some(now);
        report.duration_seconds = Some((now - report.started_at).num_milliseconds().max(0) as f64 / 1000.0);
        if validation_exit == 0 {
            report.outcome = Some(IterationOutcome::Completed);
        }
        self.archive_report(&mut report)?;
        let _ = std::fs::remove_file(&self.current_path);
        Ok(Some(report))
    }

    pub fn load_current(&self) -> Result<Option<IterationReport>> {
        self.load_report_path(&self.current_path)
    }

    pub fn save_current(&self, report: &IterationReport) -> Result<()> {
        std::fs::create_dir_all(&self.iterations_dir)?;
        std::fs::write(&self.current_path, serde_json::to_string_pretty(report)?)?;
        Ok(())
    }

    pub fn load_recent(&self, count: usize) -> Result<Vec<IterationReport>> {
        if count == 0 || !self.iterations_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = self.archive_paths()?;
        paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

        let mut reports = Vec::new();
        for path in paths {
            if let Some(report) = self.load_report_path(&path)? {
                reports.push(report);
                if reports.len() >= count {
                    break;
                }
            }
        }
        Ok(reports)
    }

    pub fn load_all(&self) -> Result<Vec<IterationReport>> {
        if !self.iterations_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = self.archive_paths()?;
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut reports = Vec::new();
        for path in paths {
            if let Some(report) = self.load_report_path(&path)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    pub fn save_current_diff(&self, report: &IterationReport, diff_text: &str) -> Result<()> {
        if diff_text.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.iterations_dir)?;
        let path = self.iterations_dir.join(format!("{:03}.diff", report.iteration));
        std::fs::write(path, diff_text)?;
        Ok(())
    }

    pub fn load_diff_for_iteration(&self, iteration: u32) -> Option<String> {
        let path = self.iterations_dir.join(format!("{iteration:03}.diff"));
        std::fs::read_to_string(path).ok()
    }

    fn archive_report(&self, report: &mut IterationReport) -> Result<()> {
        std::fs::create_dir_all(&self.iterations_dir)?;
        let mut archive_iteration = if report.iteration > 0 { report.iteration } else { 1 };
        let mut archive_path = self.iterations_dir.join(format!("{archive_iteration:03}.json"));
        if archive_path.exists() {
            archive_iteration = self.allocate_iteration_number(archive_iteration)?;
            archive_path = self.iterations_dir.join(format!("{archive_iteration:03}.json"));
        }
        report.iteration = archive_iteration;
        std::fs::write(archive_path, serde_json::to_string_pretty(report)?)?;
        Ok(())
    }

    /// The smallest positive integer not already present among archived
    /// iterations and not equal to the in-flight current iteration.
    fn allocate_iteration_number(&self, requested: u32) -> Result<u32> {
        let preferred = if requested > 0 { requested } else { 1 };
        let used = self.used_iteration_numbers()?;
        if !used.contains(&preferred) {
            return Ok(preferred);
        }

        let mut candidate = used.iter().max().copied().unwrap_or(preferred).max(preferred);
        while used.contains(&candidate) {
            candidate += 1;
        }
        Ok(candidate)
    }

    fn used_iteration_numbers(&self) -> Result<HashSet<u32>> {
        let mut used = HashSet::new();
        for path in self.archive_paths()? {
            if let Some(value) = parse_archive_iteration(&path) {
                used.insert(value);
            }
        }
        if let Some(current) = self.load_current()? {
            if current.iteration > 0 {
                used.insert(current.iteration);
            }
        }
        Ok(used)
    }

    fn archive_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.iterations_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.iterations_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if path.file_name() == self.current_path.file_name() {
                continue;
            }
            paths.push(path);
        }
        Ok(paths)
    }

    fn load_report_path(&self, path: &Path) -> Result<Option<IterationReport>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&text).ok())
    }
}

fn parse_archive_iteration(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u32 = stem.parse().ok()?;
    if value > 0 { Some(value) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_for_iteration_allocates_requested_number_when_free() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        let report = store.create_for_iteration(3, "ITEM-1", "Do the thing").unwrap();
        assert_eq!(report.iteration, 3);
    }

    #[test]
    fn create_for_iteration_skips_numbers_already_archived() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        let mut first = store.create_for_iteration(1, "ITEM-1", "First").unwrap();
        store.archive_report(&mut first).unwrap();

        let second = store.create_for_iteration(1, "ITEM-2", "Second").unwrap();
        assert_eq!(second.iteration, 2);
    }

    #[test]
    fn finalize_current_marks_completed_on_green_validation() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        store.create_for_iteration(1, "ITEM-1", "Do the thing").unwrap();

        let finalized = store.finalize_current(0, None).unwrap().unwrap();
        assert_eq!(finalized.outcome, Some(IterationOutcome::Completed));
        assert!(finalized.duration_seconds.is_some());
        assert!(store.load_current().unwrap().is_none());
    }

    #[test]
    fn finalize_current_does_not_mark_completed_on_red_validation() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        store.create_for_iteration(1, "ITEM-1", "Do the thing").unwrap();

        let finalized = store.finalize_current(1, Some("test failure at foo.rs:10")).unwrap().unwrap();
        assert_eq!(finalized.outcome, None);
        assert_eq!(finalized.validation_hint.as_deref(), Some("test failure at foo.rs:10"));
    }

    #[test]
    fn load_recent_returns_newest_first() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        for i in 1..=3 {
            store.create_for_iteration(i, "ITEM-1", "work").unwrap();
            store.finalize_current(0, None).unwrap();
        }
        let recent = store.load_recent(10).unwrap();
        let iterations: Vec<u32> = recent.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![3, 2, 1]);
    }

    #[test]
    fn save_and_load_diff_roundtrips() {
        let dir = tempdir().unwrap();
        let store = IterationReportStore::new(dir.path());
        let report = store.create_for_iteration(1, "ITEM-1", "work").unwrap();
        store.save_current_diff(&report, "diff --git a/x b/x\n").unwrap();
        assert_eq!(store.load_diff_for_iteration(1).as_deref(), Some("diff --git a/x b/x\n"));
        assert!(store.load_diff_for_iteration(99).is_none());
    }
}

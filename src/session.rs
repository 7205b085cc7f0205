//! Run history - what each experiment and combination did in one driver run

use crate::experiment::Params;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default location for run summaries, relative to the driver's cwd; see
/// `Driver::with_default_session_dir`
pub const SESSIONS_DIR: &str = ".distexp/sessions";

/// Outcome of one driver run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub experiments: Vec<ExperimentRecord>,
}

/// History of a single experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub status: ExperimentStatus,
    pub combinations: Vec<CombinationRecord>,
    pub error: Option<String>,
}

/// One parameter combination and every invocation it took
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationRecord {
    pub index: usize,
    pub params: Params,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub status: CombinationStatus,
    pub invocations: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not run because an earlier experiment failed
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CombinationStatus {
    Running,
    Restarting,
    Completed,
    Failed,
}

/// Start time of a new run, strictly after every earlier one in this process
fn unique_start() -> DateTime<Utc> {
    static LAST: Mutex<Option<i64>> = Mutex::new(None);
    let mut last = LAST.lock().unwrap_or_else(|e| e.into_inner());
    let mut micros = Utc::now().timestamp_micros();
    if let Some(prev) = *last {
        micros = micros.max(prev + 1);
    }
    *last = Some(micros);
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

impl RunSummary {
    pub fn new() -> Self {
        let now = unique_start();
        Self {
            id: now.format("%Y-%m-%d-%H-%M-%S-%6f").to_string(),
            started_at: now,
            ended_at: None,
            experiments: Vec::new(),
        }
    }

    /// Register an experiment as pending
    pub fn add_experiment(&mut self, name: &str) {
        self.experiments.push(ExperimentRecord {
            name: name.to_string(),
            status: ExperimentStatus::Pending,
            combinations: Vec::new(),
            error: None,
        });
    }

    pub fn experiment(&self, name: &str) -> Option<&ExperimentRecord> {
        self.experiments.iter().find(|e| e.name == name)
    }

    pub(crate) fn experiment_mut(&mut self, name: &str) -> Option<&mut ExperimentRecord> {
        self.experiments.iter_mut().find(|e| e.name == name)
    }

    /// True when every experiment completed
    pub fn is_success(&self) -> bool {
        self.experiments
            .iter()
            .all(|e| e.status == ExperimentStatus::Completed)
    }

    /// Turn recorded failures back into an error
    pub fn ensure_success(&self) -> Result<()> {
        let failed: Vec<String> = self
            .experiments
            .iter()
            .filter(|e| e.status == ExperimentStatus::Failed)
            .map(|e| format!("{}: {}", e.name, e.error.as_deref().unwrap_or("failed")))
            .collect();
        if !failed.is_empty() {
            anyhow::bail!("{} experiment(s) failed\n{}", failed.len(), failed.join("\n"));
        }
        Ok(())
    }

    /// End the run
    pub fn end(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.id))
    }

    /// Save to `dir` and point `latest.json` at it
    ///
    /// Refuses to replace a summary saved under the same id by another run.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating session directory {}", dir.display()))?;

        let path = self.path_in(dir);
        let json = serde_json::to_string_pretty(self)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                anyhow::bail!("run summary {} already exists", path.display())
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("writing {}", path.display())))
            }
        };
        file.write_all(json.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;

        let latest_path = dir.join("latest.json");
        let _ = fs::remove_file(&latest_path);
        #[cfg(unix)]
        {
            use std::os::unix::fs as unix_fs;
            unix_fs::symlink(format!("{}.json", self.id), &latest_path)?;
        }
        #[cfg(not(unix))]
        fs::copy(&path, &latest_path)?;

        Ok(path)
    }

    pub fn load(dir: &Path, id: &str) -> Result<Self> {
        let path = dir.join(format!("{}.json", id));
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_latest(dir: &Path) -> Result<Self> {
        let latest_path = dir.join("latest.json");
        if !latest_path.exists() {
            anyhow::bail!("No latest run summary in {}", dir.display());
        }
        let content = fs::read_to_string(&latest_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Ids of every saved summary, most recent first
    pub fn list_all(dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if stem != "latest" {
                        runs.push(stem.to_string());
                    }
                }
            }
        }

        runs.sort();
        runs.reverse();
        Ok(runs)
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentRecord {
    /// Start tracking a combination
    pub(crate) fn start_combination(&mut self, index: usize, params: &Params) {
        self.combinations.push(CombinationRecord {
            index,
            params: params.clone(),
            started: Utc::now(),
            ended: None,
            status: CombinationStatus::Running,
            invocations: 0,
            error: None,
        });
    }

    pub(crate) fn current(&mut self) -> Option<&mut CombinationRecord> {
        self.combinations.last_mut()
    }

    /// Total restarts across all combinations
    pub fn restarts(&self) -> u32 {
        self.combinations
            .iter()
            .map(|c| c.invocations.saturating_sub(1))
            .sum()
    }
}

impl CombinationRecord {
    pub(crate) fn finish(&mut self, status: CombinationStatus, error: Option<String>) {
        self.ended = Some(Utc::now());
        self.status = status;
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_creation() {
        let summary = RunSummary::new();
        assert!(summary.ended_at.is_none());
        assert!(summary.experiments.is_empty());
        assert!(summary.is_success());
    }

    #[test]
    fn test_combination_tracking() {
        let mut summary = RunSummary::new();
        summary.add_experiment("tpch");
        let exp = summary.experiment_mut("tpch").unwrap();
        exp.start_combination(0, &Params::new().with("sf", 10));
        let combo = exp.current().unwrap();
        combo.invocations = 3;
        combo.finish(CombinationStatus::Completed, None);

        let exp = summary.experiment("tpch").unwrap();
        assert_eq!(exp.combinations[0].status, CombinationStatus::Completed);
        assert_eq!(exp.restarts(), 2);
        assert!(exp.combinations[0].ended.is_some());
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = RunSummary::new();
        summary.add_experiment("sleep");
        summary.experiment_mut("sleep").unwrap().status = ExperimentStatus::Failed;
        summary.end();

        let path = summary.save(dir.path()).unwrap();
        assert!(path.exists());

        let latest = RunSummary::load_latest(dir.path()).unwrap();
        assert_eq!(latest.id, summary.id);
        assert_eq!(latest.experiments[0].status, ExperimentStatus::Failed);
        assert!(latest.ensure_success().is_err());
        assert_eq!(RunSummary::list_all(dir.path()).unwrap(), vec![summary.id.clone()]);
        assert!(summary.save(dir.path()).is_err());
    }

    #[test]
    fn test_back_to_back_runs_keep_both_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunSummary::new();
        let second = RunSummary::new();
        assert!(first.id < second.id);

        first.save(dir.path()).unwrap();
        second.save(dir.path()).unwrap();

        assert_eq!(
            RunSummary::list_all(dir.path()).unwrap(),
            vec![second.id.clone(), first.id.clone()]
        );
        assert_eq!(RunSummary::load_latest(dir.path()).unwrap().id, second.id);
    }
}

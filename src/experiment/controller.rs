//! Experiment controller - runs registered experiments one after another
//!
//! Each combination moves through `Running -> {Completed | Restarting | Failed}`.
//! A restart re-invokes the same combination until the experiment's
//! `max_restarts` is used up; after every invocation the commands it left
//! running are killed.

use super::registry::{Action, Experiment, ExperimentRegistry};
use crate::config::RunPolicy;
use crate::core::Invocation;
use crate::error::DriverError;
use crate::session::{
    CombinationStatus, ExperimentRecord, ExperimentStatus, RunSummary, SESSIONS_DIR,
};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Instant;

/// Entry point for running a registry
#[derive(Debug, Clone, Default)]
pub struct Driver {
    policy: RunPolicy,
    session_dir: Option<PathBuf>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Persist the run summary as JSON under `dir`
    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    /// Persist run summaries under `.distexp/sessions` in the current directory
    pub fn with_default_session_dir(self) -> Self {
        self.with_session_dir(SESSIONS_DIR)
    }

    /// Run every experiment in registration order
    ///
    /// Experiment failures are recorded in the summary; the returned error is
    /// reserved for failing to persist it.
    pub async fn run(&self, registry: ExperimentRegistry) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        for experiment in registry.iter() {
            summary.add_experiment(experiment.name());
        }
        log::info!("running {} experiment(s)", registry.len());

        let mut halted = false;
        for experiment in registry.iter() {
            let Some(record) = summary.experiment_mut(experiment.name()) else {
                continue;
            };
            if halted {
                record.status = ExperimentStatus::Skipped;
                log::warn!("[{}] skipped after an earlier failure", experiment.name());
                continue;
            }

            record.status = ExperimentStatus::Running;
            let started = Instant::now();
            match run_experiment(experiment, record).await {
                Ok(()) => {
                    record.status = ExperimentStatus::Completed;
                    log::info!(
                        "[{}] completed in {:.1}s",
                        experiment.name(),
                        started.elapsed().as_secs_f64()
                    );
                }
                Err(e) => {
                    record.status = ExperimentStatus::Failed;
                    record.error = Some(format!("{:#}", e));
                    log::error!("[{}] failed: {:#}", experiment.name(), e);
                    if !self.policy.continue_on_failure {
                        halted = true;
                    }
                }
            }
        }

        summary.end();
        if let Some(dir) = &self.session_dir {
            let path = summary.save(dir)?;
            log::info!("run summary written to {}", path.display());
        }
        Ok(summary)
    }
}

async fn run_experiment(experiment: &Experiment, record: &mut ExperimentRecord) -> Result<()> {
    let combinations = experiment.combinations()?;
    let total = combinations.len();
    if total == 0 {
        log::warn!("[{}] parameter grid is empty, nothing to run", experiment.name());
    }

    for (index, params) in combinations.into_iter().enumerate() {
        log::info!(
            "[{}] combination {}/{}: {}",
            experiment.name(),
            index + 1,
            total,
            params
        );
        record.start_combination(index, &params);
        let mut restarts = 0;

        loop {
            let invocation = Invocation::new(experiment.raises_on_rc());
            let outcome = invocation.scope(experiment.invoke(params.clone())).await;
            invocation.kill_running().await;

            let Some(combo) = record.current() else {
                break;
            };
            combo.invocations += 1;

            match outcome {
                Ok(Action::Done) => {
                    combo.finish(CombinationStatus::Completed, None);
                    break;
                }
                Ok(Action::Restart) if restarts < experiment.restart_limit() => {
                    restarts += 1;
                    combo.status = CombinationStatus::Restarting;
                    log::warn!(
                        "[{}] restarting combination {} ({}/{})",
                        experiment.name(),
                        index + 1,
                        restarts,
                        experiment.restart_limit()
                    );
                }
                Ok(Action::Restart) => {
                    let err = DriverError::MaxRestartsExceeded {
                        experiment: experiment.name().to_string(),
                        combination: params.to_string(),
                        restarts,
                        max_restarts: experiment.restart_limit(),
                    };
                    combo.finish(CombinationStatus::Failed, Some(err.to_string()));
                    return Err(err.into());
                }
                Err(e) => {
                    combo.finish(CombinationStatus::Failed, Some(format!("{:#}", e)));
                    return Err(e.context(format!("combination {} [{}]", index + 1, params)));
                }
            }
        }
    }
    Ok(())
}

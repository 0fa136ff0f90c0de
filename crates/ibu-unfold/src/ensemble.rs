use std::sync::Arc;

use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::Distribution;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::unfolder::{IterativeUnfolder, UnfoldingRun};

/// One independent unfolding to execute.
#[derive(Debug, Clone)]
pub struct EnsembleJob {
    /// Label reported back with the outcome.
    pub label: String,
    /// Unfolder, shareable between jobs since runs never mutate it.
    pub unfolder: Arc<IterativeUnfolder>,
    /// Observed effect distribution of this job.
    pub observed: Distribution,
}

/// Options governing ensemble execution.
#[derive(Debug, Clone)]
pub struct EnsembleOpts {
    /// Number of worker threads.
    pub concurrency: usize,
}

impl Default for EnsembleOpts {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Converged or ran out of iterations.
    Completed {
        /// Full run.
        run: Box<UnfoldingRun>,
    },
    /// Failed with an error.
    Failed {
        /// Error that stopped the run.
        error: UnfoldError,
        /// Iterations finished before the failure.
        completed_iterations: usize,
    },
}

/// Labelled job outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Job label.
    pub label: String,
    /// Job outcome.
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Completed run, if any.
    pub fn run(&self) -> Option<&UnfoldingRun> {
        match &self.outcome {
            JobOutcome::Completed { run } => Some(run.as_ref()),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// Per-bin spread of the final probabilities over successful runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnsembleSummary {
    /// Number of completed runs.
    pub completed: usize,
    /// Number of failed runs.
    pub failed: usize,
    /// Per-bin mean, empty when no run completed.
    pub mean: Vec<f64>,
    /// Per-bin sample standard deviation, zero with fewer than two runs.
    pub std_dev: Vec<f64>,
    /// Why no aggregate could be formed, e.g. runs over different bin counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnfoldError>,
}

impl EnsembleSummary {
    fn from_runs(runs: &[&UnfoldingRun], failed: usize) -> Self {
        let Some(first) = runs.first() else {
            return Self {
                failed,
                ..Self::default()
            };
        };
        let bins = first.final_probabilities().len();
        if let Some(odd) = runs
            .iter()
            .find(|run| run.final_probabilities().len() != bins)
        {
            return Self {
                completed: runs.len(),
                failed,
                error: Some(UnfoldError::shape(
                    "ensemble-bins",
                    "ensemble member",
                    bins,
                    odd.final_probabilities().len(),
                )),
                ..Self::default()
            };
        }
        let count = runs.len() as f64;
        let mut mean = vec![0.0; bins];
        for run in runs {
            for (acc, value) in mean.iter_mut().zip(run.final_probabilities().values()) {
                *acc += value / count;
            }
        }
        let std_dev = if runs.len() < 2 {
            vec![0.0; bins]
        } else {
            (0..bins)
                .map(|bin| {
                    let ss: f64 = runs
                        .iter()
                        .map(|run| (run.final_probabilities().values()[bin] - mean[bin]).powi(2))
                        .sum();
                    (ss / (count - 1.0)).sqrt()
                })
                .collect()
        };
        Self {
            completed: runs.len(),
            failed,
            mean,
            std_dev,
            error: None,
        }
    }
}

/// Ordered job outcomes plus their aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleReport {
    /// Outcomes in submission order.
    pub jobs: Vec<JobReport>,
    /// Aggregate over completed runs.
    pub summary: EnsembleSummary,
}

/// Runs every job on a dedicated thread pool and waits for all of them.
///
/// A failing job is reported in place and does not stop the others. Jobs
/// whose runs cannot be aggregated still report every outcome, with the
/// reason in [`EnsembleSummary::error`].
pub fn run_ensemble(jobs: &[EnsembleJob], opts: &EnsembleOpts) -> Result<EnsembleReport, UnfoldError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.concurrency.max(1))
        .build()
        .map_err(|err| {
            UnfoldError::Configuration(ErrorInfo::new("thread-pool", err.to_string()))
        })?;

    let mut ordered: Vec<(usize, JobReport)> = pool.install(|| {
        jobs.par_iter()
            .enumerate()
            .map(|(index, job)| {
                let outcome = match job.unfolder.run(&job.observed) {
                    Ok(run) => JobOutcome::Completed { run: Box::new(run) },
                    Err(failure) => {
                        tracing::warn!(label = %job.label, error = %failure.error, "ensemble job failed");
                        JobOutcome::Failed {
                            completed_iterations: failure.history.len(),
                            error: failure.error,
                        }
                    }
                };
                (
                    index,
                    JobReport {
                        label: job.label.clone(),
                        outcome,
                    },
                )
            })
            .collect()
    });
    ordered.sort_by_key(|(index, _)| *index);
    let reports: Vec<JobReport> = ordered.into_iter().map(|(_, report)| report).collect();

    let runs: Vec<&UnfoldingRun> = reports.iter().filter_map(JobReport::run).collect();
    let failed = reports.len() - runs.len();
    let summary = EnsembleSummary::from_runs(&runs, failed);
    if let Some(error) = &summary.error {
        tracing::warn!(%error, "ensemble runs cannot be aggregated");
    }
    tracing::info!(
        jobs = reports.len(),
        completed = summary.completed,
        failed,
        "ensemble finished"
    );
    Ok(EnsembleReport {
        jobs: reports,
        summary,
    })
}

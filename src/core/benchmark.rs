//! Repeated timing of one submission: compile once, run a warm-up, then measure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;

use crate::constants::{
    BENCHMARK_STABLE_IQR_RATIO, DEFAULT_BENCHMARK_REPEATS, DEFAULT_BENCHMARK_WARMUPS,
};
use crate::core::{
    cancel::CancelToken,
    domain::{CompileFailure, ExecutionOutcome, Limits, RequestState, Submission},
    errors::HarnessError,
    harness::{CompileOutput, Harness, RequestTracker},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchmarkPlan {
    /// Runs executed first and left out of the statistics.
    pub warmups: usize,
    pub repeats: usize,
}

impl Default for BenchmarkPlan {
    fn default() -> Self {
        Self {
            warmups: DEFAULT_BENCHMARK_WARMUPS,
            repeats: DEFAULT_BENCHMARK_REPEATS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Unstable,
    NoSuccess,
}

/// Wall-time statistics over the measured runs. Only runs that exited with code 0 are
/// samples; `counts` covers every measured run by verdict.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub runs_ms: Vec<u64>,
    pub counts: BTreeMap<&'static str, usize>,
    pub median_ms: Option<f64>,
    pub p10_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub iqr_ms: Option<f64>,
    pub stability: Stability,
    pub recorded_at: DateTime<Utc>,
}

impl BenchmarkReport {
    pub fn from_outcomes(outcomes: &[ExecutionOutcome], recorded_at: DateTime<Utc>) -> Self {
        let runs_ms = outcomes
            .iter()
            .filter(|outcome| outcome.verdict.is_success())
            .map(|outcome| outcome.execution_time_ms)
            .collect_vec();

        let counts = outcomes
            .iter()
            .map(|outcome| outcome.verdict.name())
            .counts()
            .into_iter()
            .collect();

        let sorted = runs_ms.iter().sorted().map(|&ms| ms as f64).collect_vec();
        let median_ms = percentile(&sorted, 50.0);
        let iqr_ms = percentile(&sorted, 75.0)
            .zip(percentile(&sorted, 25.0))
            .map(|(p75, p25)| p75 - p25);

        let stability = match (median_ms, iqr_ms) {
            (Some(median), Some(iqr)) if iqr <= BENCHMARK_STABLE_IQR_RATIO * median => {
                Stability::Stable
            }
            (Some(_), Some(_)) => Stability::Unstable,
            _ => Stability::NoSuccess,
        };

        Self {
            median_ms,
            p10_ms: percentile(&sorted, 10.0),
            p90_ms: percentile(&sorted, 90.0),
            iqr_ms,
            stability,
            recorded_at,
            runs_ms,
            counts,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BenchmarkOutcome {
    Measured(BenchmarkReport),
    CompileFailed(CompileFailure),
}

/// Percentile of ascending `sorted` with linear interpolation between closest ranks.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted {
        [] => None,
        [only] => Some(*only),
        _ => {
            let rank = (sorted.len() - 1) as f64 * (p / 100.0);
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(sorted.len() - 1);
            if lower == upper {
                return Some(sorted[lower]);
            }
            Some(sorted[lower] * (upper as f64 - rank) + sorted[upper] * (rank - lower as f64))
        }
    }
}

impl Harness {
    pub async fn benchmark(
        &self,
        submission: &Submission,
        limits: &Limits,
        plan: BenchmarkPlan,
    ) -> Result<BenchmarkOutcome, HarnessError> {
        self.benchmark_with_cancel(submission, limits, plan, &CancelToken::new())
            .await
    }

    #[tracing::instrument(skip(self, submission, limits, cancel))]
    pub async fn benchmark_with_cancel(
        &self,
        submission: &Submission,
        limits: &Limits,
        plan: BenchmarkPlan,
        cancel: &CancelToken,
    ) -> Result<BenchmarkOutcome, HarnessError> {
        let limits = self.accept(submission, limits)?;
        let workspace = self.open_workspace()?;
        let mut tracker = RequestTracker::new(workspace.id());

        let result = async {
            let artifact = match self
                .compile_phase(&mut tracker, submission, &workspace, cancel)
                .await?
            {
                CompileOutput::Artifact(artifact) => artifact,
                CompileOutput::Failed(failure) => {
                    return Ok::<_, HarnessError>(BenchmarkOutcome::CompileFailed(failure));
                }
            };

            tracker.advance(RequestState::Running);
            let mut measured = Vec::with_capacity(plan.repeats);
            for run in 0..plan.warmups + plan.repeats.max(1) {
                // Every run starts from an empty working directory.
                if run > 0 {
                    workspace
                        .reset_run_dir()
                        .map_err(|e| tracker.fail(HarnessError::Workspace(e)))?;
                }
                let outcome = self
                    .runner()
                    .run(&artifact, submission, &limits, &workspace, cancel)
                    .await
                    .map_err(|e| tracker.fail(e))?;
                tracing::debug!(
                    "Benchmark run {}: {} in {} ms",
                    run,
                    outcome.verdict,
                    outcome.execution_time_ms
                );
                if run >= plan.warmups {
                    measured.push(outcome);
                }
            }

            if let Some(last) = measured.last() {
                tracker.advance(RequestState::Finished(last.verdict));
            }
            Ok(BenchmarkOutcome::Measured(BenchmarkReport::from_outcomes(
                &measured,
                Utc::now(),
            )))
        }
        .await;

        workspace.close();
        result
    }
}

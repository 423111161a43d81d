use std::time::Duration;

use crate::core::{
    cancel::CancelToken,
    domain::{CompiledArtifact, ExecutionOutcome, Submission, ValidatedLimits},
    errors::{HarnessError, Phase},
    traits::runner::Runner,
    workspace::Workspace,
};

#[derive(Debug, Clone)]
pub struct RunnerStub {
    outcome: ExecutionOutcome,
    delay: Duration,
}

impl RunnerStub {
    pub fn new(outcome: ExecutionOutcome, delay: Duration) -> Self {
        Self { outcome, delay }
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    #[tracing::instrument(skip_all)]
    async fn run(
        &self,
        artifact: &CompiledArtifact,
        submission: &Submission,
        _limits: &ValidatedLimits,
        _workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, HarnessError> {
        tracing::debug!(
            "Start execution: artifact={:?}, stdin={} bytes",
            artifact.path,
            submission.stdin.len()
        );
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(HarnessError::Cancelled { phase: Phase::Run }),
        }
        tracing::debug!("Execution result: {:?}", self.outcome);

        Ok(self.outcome.clone())
    }
}

use crate::core::{
    cancel::CancelToken,
    domain::{CompiledArtifact, ExecutionOutcome, Submission, ValidatedLimits},
    errors::HarnessError,
    workspace::Workspace,
};

/// Runs a compiled artifact once under the given limits.
///
/// Runtime faults of the program (timeouts, memory, signals, non-zero exit) are part of the
/// returned outcome. `Err` is reserved for infrastructure faults and cancellation.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    async fn run(
        &self,
        artifact: &CompiledArtifact,
        submission: &Submission,
        limits: &ValidatedLimits,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, HarnessError>;
}

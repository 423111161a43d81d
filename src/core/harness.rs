use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::core::{
    cancel::CancelToken,
    clock::{Clock, SystemClock},
    domain::{
        CompileFailure, CompiledArtifact, Limits, Report, RequestState, Submission,
        ValidatedLimits,
    },
    errors::{HarnessError, Phase},
    traits::{
        compiler::{CompileError, Compiler},
        runner::Runner,
    },
    workspace::Workspace,
};
use crate::native::{compiler::GnuCppCompiler, runner::NativeRunner};

/// Entry point: one submission in, one report out.
#[derive(Clone, Debug)]
pub struct Harness {
    compiler: Arc<dyn Compiler>,
    runner: Arc<dyn Runner>,
    config: HarnessConfig,
}

impl Harness {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        runner: Arc<dyn Runner>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            compiler,
            runner,
            config,
        }
    }

    /// Compiles with g++ and runs on the host.
    pub fn native(config: HarnessConfig) -> Self {
        Self::native_with_clock(config, Arc::new(SystemClock))
    }

    pub fn native_with_clock(config: HarnessConfig, clock: Arc<dyn Clock>) -> Self {
        let compiler = Arc::new(GnuCppCompiler::new(config.clone(), clock.clone()));
        let runner = Arc::new(NativeRunner::new(config.clone(), clock));
        Self::new(compiler, runner, config)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn submit(
        &self,
        submission: &Submission,
        limits: &Limits,
    ) -> Result<Report, HarnessError> {
        self.submit_with_cancel(submission, limits, &CancelToken::new())
            .await
    }

    /// Like [`Harness::submit`], abandoning the request once `cancel` fires. A cancelled
    /// request ends in [`HarnessError::Cancelled`] after its processes have been reaped.
    pub async fn submit_with_cancel(
        &self,
        submission: &Submission,
        limits: &Limits,
        cancel: &CancelToken,
    ) -> Result<Report, HarnessError> {
        let limits = self.accept(submission, limits)?;
        let workspace = self.open_workspace()?;
        let span = tracing::info_span!("request", id = %workspace.id());

        let result = self
            .process(submission, &limits, &workspace, cancel)
            .instrument(span)
            .await;

        workspace.close();
        result
    }

    async fn process(
        &self,
        submission: &Submission,
        limits: &ValidatedLimits,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Report, HarnessError> {
        let mut tracker = RequestTracker::new(workspace.id());

        let artifact = match self
            .compile_phase(&mut tracker, submission, workspace, cancel)
            .await?
        {
            CompileOutput::Artifact(artifact) => artifact,
            CompileOutput::Failed(failure) => return Ok(Report::CompileFailed(failure)),
        };

        if cancel.is_cancelled() {
            tracker.advance(RequestState::Cancelled);
            return Err(HarnessError::Cancelled { phase: Phase::Run });
        }

        tracker.advance(RequestState::Running);
        match self
            .runner
            .run(&artifact, submission, limits, workspace, cancel)
            .await
        {
            Ok(outcome) => {
                tracker.advance(RequestState::Finished(outcome.verdict));
                Ok(Report::Executed(outcome))
            }
            Err(e) => Err(tracker.fail(e)),
        }
    }

    /// Validates the request before anything touches the filesystem.
    pub(crate) fn accept(
        &self,
        submission: &Submission,
        limits: &Limits,
    ) -> Result<ValidatedLimits, HarnessError> {
        let limits = limits.validate()?;
        if submission.source.is_empty() {
            return Err(HarnessError::EmptySource);
        }
        Ok(limits)
    }

    pub(crate) fn open_workspace(&self) -> Result<Workspace, HarnessError> {
        Workspace::create(&self.config.workspace_root).map_err(|e| {
            tracing::error!(
                "Cannot create workspace under {}: {}",
                self.config.workspace_root.display(),
                e
            );
            HarnessError::Workspace(e)
        })
    }

    pub(crate) async fn compile_phase(
        &self,
        tracker: &mut RequestTracker,
        submission: &Submission,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<CompileOutput, HarnessError> {
        tracker.advance(RequestState::Compiling);

        tracing::debug!("Start compiling");
        let compilation_result = self
            .compiler
            .compile(&submission.source, workspace, cancel)
            .await;

        match compilation_result {
            Ok(artifact) => {
                tracker.advance(RequestState::Compiled);
                Ok(CompileOutput::Artifact(artifact))
            }
            Err(CompileError::CompilationFailed(failure)) => {
                tracing::debug!("Compilation failed: {:?}", failure.reason);
                tracker.advance(RequestState::CompileFailed);
                Ok(CompileOutput::Failed(failure))
            }
            Err(CompileError::Internal(e)) => Err(tracker.fail(e)),
        }
    }

    pub(crate) fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }
}

pub(crate) enum CompileOutput {
    Artifact(CompiledArtifact),
    Failed(CompileFailure),
}

/// Follows one request through its states and logs every transition.
#[derive(Debug)]
pub(crate) struct RequestTracker {
    id: Uuid,
    state: RequestState,
}

impl RequestTracker {
    pub(crate) fn new(id: Uuid) -> Self {
        tracing::info!("Request {} accepted", id);
        Self {
            id,
            state: RequestState::Accepted,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &RequestState {
        &self.state
    }

    pub(crate) fn advance(&mut self, next: RequestState) {
        if !self.state.can_advance_to(&next) {
            tracing::error!(
                "Request {}: unexpected transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
        }
        tracing::info!("Request {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Records a harness error and hands it back.
    pub(crate) fn fail(&mut self, error: HarnessError) -> HarnessError {
        match error {
            HarnessError::Cancelled { .. } => self.advance(RequestState::Cancelled),
            ref e => tracing::error!("Request {} failed in {:?}: {}", self.id, self.state, e),
        }
        error
    }
}

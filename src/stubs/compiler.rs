use std::time::Duration;

use crate::core::{
    cancel::CancelToken,
    domain::{CompileFailure, CompiledArtifact},
    errors::{HarnessError, Phase},
    traits::compiler::{CompileError, Compiler},
    workspace::Workspace,
};

#[derive(Debug, Clone)]
pub struct CompilerStub {
    result: Result<(), CompileFailure>,
    delay: Duration,
}

impl CompilerStub {
    pub fn new(result: Result<(), CompileFailure>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Compiler for CompilerStub {
    #[tracing::instrument(skip(self, workspace, cancel))]
    async fn compile(
        &self,
        source: &[u8],
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<CompiledArtifact, CompileError> {
        tracing::debug!("Start compilation: source={} bytes", source.len());
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                return Err(HarnessError::Cancelled { phase: Phase::Compile }.into());
            }
        }
        tracing::debug!("Compilation result: {:?}", self.result);

        match &self.result {
            Ok(()) => Ok(CompiledArtifact {
                path: workspace.artifact_path(),
                diagnostics: String::new(),
            }),
            Err(failure) => Err(CompileError::CompilationFailed(failure.clone())),
        }
    }
}

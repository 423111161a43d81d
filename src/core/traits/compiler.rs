use thiserror::Error;

use crate::core::{
    cancel::CancelToken,
    domain::{CompileFailure, CompiledArtifact},
    errors::HarnessError,
    workspace::Workspace,
};

#[derive(Debug, Error)]
pub enum CompileError {
    /// The submission did not compile. Reported to the caller, never raised.
    #[error("compilation failed")]
    CompilationFailed(CompileFailure),
    #[error(transparent)]
    Internal(#[from] HarnessError),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Compiler: std::fmt::Debug + Send + Sync {
    /// Compiles `source` inside `workspace`. The artifact must live under the workspace.
    async fn compile(
        &self,
        source: &[u8],
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<CompiledArtifact, CompileError>;
}

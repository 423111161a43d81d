use std::ffi::OsString;
use std::io;
use std::sync::Arc;

use tokio::fs;

use crate::config::{HarnessConfig, NetworkPolicy};
use crate::constants::GNUCPP_FLAGS;
use crate::core::{
    cancel::CancelToken,
    clock::Clock,
    domain::{CompileFailure, CompileFailureReason, CompileLimitType, CompiledArtifact, ExitStatus},
    errors::{HarnessError, Phase},
    traits::compiler::{CompileError, Compiler},
    verdict::KillReason,
    workspace::Workspace,
};
use crate::native::sandbox::{ProcessSpec, ResourceLimits, Sandbox, SandboxError};

/// Compiles submissions with GNU g++ under the harness-wide compile limits.
#[derive(Clone, Debug)]
pub struct GnuCppCompiler {
    config: HarnessConfig,
    sandbox: Sandbox,
}

impl GnuCppCompiler {
    pub fn new(config: HarnessConfig, clock: Arc<dyn Clock>) -> Self {
        let sandbox = Sandbox::new(clock, config.sample_interval, config.output_drain_grace);
        Self { config, sandbox }
    }

    fn process_spec(&self, workspace: &Workspace) -> ProcessSpec {
        let mut args: Vec<OsString> = GNUCPP_FLAGS.iter().map(OsString::from).collect();
        args.push("-o".into());
        args.push(workspace.artifact_path().into_os_string());
        args.push(workspace.source_path().into_os_string());

        ProcessSpec {
            program: self.config.gnucpp_path.clone(),
            args,
            cwd: workspace.path().to_path_buf(),
            stdin: Vec::new(),
            wall_limit: self.config.compile_timeout,
            memory_limit: Some(self.config.compile_memory_bytes),
            output_limit: self.config.diagnostics_limit_bytes,
            rlimits: ResourceLimits::default(),
            network: NetworkPolicy::Shared,
        }
    }
}

#[async_trait::async_trait]
impl Compiler for GnuCppCompiler {
    #[tracing::instrument(skip(self, source, workspace, cancel), fields(workspace = %workspace.id()))]
    async fn compile(
        &self,
        source: &[u8],
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<CompiledArtifact, CompileError> {
        fs::write(workspace.source_path(), source)
            .await
            .map_err(HarnessError::Workspace)?;

        let report = match self.sandbox.execute(&self.process_spec(workspace), cancel).await {
            Ok(report) => report,
            Err(SandboxError::Spawn(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HarnessError::CompilerMissing {
                    path: self.config.gnucpp_path.clone(),
                }
                .into());
            }
            Err(e) => return Err(e.into_harness_error(Phase::Compile).into()),
        };

        tracing::debug!(
            "Compiler finished in {:?} with {:?}",
            report.elapsed(),
            report.exit_status
        );

        let memory_exceeded = report.kill == Some(KillReason::Memory)
            || report.peak_memory_bytes > self.config.compile_memory_bytes;
        let timed_out = report.kill == Some(KillReason::WallClock);
        let exit_status = report.exit_status;
        let diagnostics = report.stderr.into_string();

        let reason = if memory_exceeded {
            CompileFailureReason::LimitsExceeded {
                limit: CompileLimitType::Ram,
            }
        } else if timed_out {
            CompileFailureReason::LimitsExceeded {
                limit: CompileLimitType::Time,
            }
        } else {
            match exit_status {
                ExitStatus::Code(0) => {
                    return Ok(CompiledArtifact {
                        path: workspace.artifact_path(),
                        diagnostics,
                    });
                }
                ExitStatus::Code(code) => CompileFailureReason::CompilerError {
                    exit_code: Some(code),
                },
                ExitStatus::Signal(_) => CompileFailureReason::CompilerError { exit_code: None },
            }
        };

        Err(CompileError::CompilationFailed(CompileFailure {
            reason,
            diagnostics,
        }))
    }
}

use std::ffi::OsString;
use std::sync::Arc;

use crate::config::HarnessConfig;
use crate::core::{
    cancel::CancelToken,
    clock::Clock,
    domain::{CompiledArtifact, ExecutionOutcome, Submission, ValidatedLimits},
    errors::{HarnessError, Phase},
    traits::runner::Runner,
    verdict::{RunObservation, classify},
    workspace::Workspace,
};
use crate::native::sandbox::{ProcessSpec, ResourceLimits, Sandbox};

/// Runs compiled submissions directly on the host, one process group per run.
#[derive(Clone, Debug)]
pub struct NativeRunner {
    config: HarnessConfig,
    sandbox: Sandbox,
}

impl NativeRunner {
    pub fn new(config: HarnessConfig, clock: Arc<dyn Clock>) -> Self {
        let sandbox = Sandbox::new(clock, config.sample_interval, config.output_drain_grace);
        Self { config, sandbox }
    }

    fn process_spec(
        &self,
        artifact: &CompiledArtifact,
        submission: &Submission,
        limits: &ValidatedLimits,
        workspace: &Workspace,
    ) -> ProcessSpec {
        let cpu_seconds = limits.cpu_time().as_millis().div_ceil(1000) as u64;

        ProcessSpec {
            program: artifact.path.clone(),
            args: submission.args.iter().map(OsString::from).collect(),
            cwd: workspace.run_dir().to_path_buf(),
            stdin: submission.stdin.clone(),
            wall_limit: limits.wall_time(),
            memory_limit: Some(limits.memory_bytes()),
            output_limit: limits.output_bytes(),
            rlimits: ResourceLimits {
                cpu_seconds: Some(cpu_seconds.max(1)),
                file_size_bytes: Some(limits.output_bytes()),
                stack_bytes: Some(self.config.stack_limit_bytes.min(limits.memory_bytes())),
                open_files: Some(self.config.open_files_limit),
            },
            network: self.config.network,
        }
    }
}

#[async_trait::async_trait]
impl Runner for NativeRunner {
    #[tracing::instrument(skip_all, fields(workspace = %workspace.id()))]
    async fn run(
        &self,
        artifact: &CompiledArtifact,
        submission: &Submission,
        limits: &ValidatedLimits,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, HarnessError> {
        let spec = self.process_spec(artifact, submission, limits, workspace);
        let report = self
            .sandbox
            .execute(&spec, cancel)
            .await
            .map_err(|e| e.into_harness_error(Phase::Run))?;

        let verdict = classify(
            &RunObservation {
                exit_status: report.exit_status,
                exited_at: report.exited_at,
                deadline: report.deadline,
                kill: report.kill,
                peak_memory_bytes: report.peak_memory_bytes,
                cpu_time: report.cpu_time,
            },
            limits,
        );
        tracing::debug!("Run finished: {}", verdict);

        Ok(ExecutionOutcome {
            verdict,
            exit_status: report.exit_status,
            execution_time_ms: report.elapsed().as_millis() as u64,
            cpu_time_ms: report.cpu_time.as_millis() as u64,
            peak_memory_usage_bytes: report.peak_memory_bytes,
            output_truncated: report.stdout.truncated || report.stderr.truncated,
            stdout: report.stdout.into_string(),
            stderr: report.stderr.into_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::NetworkPolicy;
    use crate::core::clock::SystemClock;
    use crate::core::domain::{ExitStatus, Limits, TimeLimitKind, Verdict};

    fn limits(wall_time_ms: u64, output_bytes: u64) -> ValidatedLimits {
        Limits {
            wall_time_ms: Some(wall_time_ms),
            cpu_time_ms: Some(wall_time_ms),
            memory_bytes: Some(256 * 1024 * 1024),
            output_bytes: Some(output_bytes),
        }
        .validate()
        .unwrap()
    }

    fn runner() -> NativeRunner {
        let config = HarnessConfig {
            network: NetworkPolicy::BestEffort,
            ..HarnessConfig::default()
        };
        NativeRunner::new(config, Arc::new(SystemClock))
    }

    // Shell scripts stand in for compiled artifacts so these tests need no compiler.
    fn script(workspace: &Workspace, body: &str) -> CompiledArtifact {
        use std::os::unix::fs::PermissionsExt;

        let path = workspace.artifact_path();
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        CompiledArtifact {
            path,
            diagnostics: String::new(),
        }
    }

    #[test]
    fn test_process_spec_limits() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let artifact = CompiledArtifact {
            path: PathBuf::from("/bin/true"),
            diagnostics: String::new(),
        };
        let limits = Limits {
            wall_time_ms: Some(3000),
            cpu_time_ms: Some(1500),
            memory_bytes: Some(64 * 1024 * 1024),
            output_bytes: Some(4096),
        }
        .validate()
        .unwrap();

        let spec = runner().process_spec(
            &artifact,
            &Submission::new("int main() {}").with_args(["a", "b"]),
            &limits,
            &workspace,
        );

        assert_eq!(spec.cwd, workspace.run_dir());
        assert_eq!(spec.args, vec![OsString::from("a"), OsString::from("b")]);
        assert_eq!(spec.rlimits.cpu_seconds, Some(2));
        assert_eq!(spec.rlimits.file_size_bytes, Some(4096));
        assert_eq!(spec.rlimits.stack_bytes, Some(64 * 1024 * 1024));
        assert_eq!(spec.memory_limit, Some(64 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_run_echoes_stdin_and_args() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let artifact = script(&workspace, "echo \"$1\"; cat");
        let submission = Submission::new("int main() {}")
            .with_args(["first"])
            .with_stdin("from stdin\n");

        let outcome = runner()
            .run(
                &artifact,
                &submission,
                &limits(5000, 1024),
                &workspace,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, Verdict::ExitedNormally { exit_code: 0 });
        assert_eq!(outcome.exit_status, ExitStatus::Code(0));
        assert_eq!(outcome.stdout, "first\nfrom stdin\n");
        assert!(!outcome.output_truncated);
    }

    #[tokio::test]
    async fn test_run_reports_timeout() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let artifact = script(&workspace, "sleep 5");

        let outcome = runner()
            .run(
                &artifact,
                &Submission::new("int main() {}"),
                &limits(200, 1024),
                &workspace,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.verdict,
            Verdict::TimedOut {
                limit: TimeLimitKind::WallClock
            }
        );
        assert!(outcome.execution_time_ms >= 200);
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let artifact = script(&workspace, "sleep 5");
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = runner()
            .run(
                &artifact,
                &Submission::new("int main() {}"),
                &limits(5000, 1024),
                &workspace,
                &cancel,
            )
            .await;

        assert!(matches!(
            result,
            Err(HarnessError::Cancelled { phase: Phase::Run })
        ));
    }
}

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_TIME_LIMIT_MS;
use crate::core::errors::{LimitField, LimitsError};

/// Untrusted program source plus the inputs handed to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub source: Vec<u8>,
    pub args: Vec<String>,
    pub stdin: Vec<u8>,
}

impl Submission {
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            args: Vec::new(),
            stdin: Vec::new(),
        }
    }

    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_stdin(self, stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            stdin: stdin.into(),
            ..self
        }
    }
}

/// Caller-specified ceilings, as received. Use [`Limits::validate`] before running anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub wall_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
}

impl Limits {
    pub fn validate(&self) -> Result<ValidatedLimits, LimitsError> {
        let wall_time_ms = require_time(LimitField::WallTime, self.wall_time_ms)?;
        let cpu_time_ms = require_time(LimitField::CpuTime, self.cpu_time_ms)?;
        let memory_bytes = require_positive(LimitField::Memory, self.memory_bytes)?;
        let output_bytes = require_positive(LimitField::Output, self.output_bytes)?;

        Ok(ValidatedLimits {
            wall_time: Duration::from_millis(wall_time_ms),
            cpu_time: Duration::from_millis(cpu_time_ms),
            memory_bytes,
            output_bytes,
        })
    }
}

fn require_positive(field: LimitField, value: Option<u64>) -> Result<u64, LimitsError> {
    match value {
        None => Err(LimitsError::Missing { field }),
        Some(0) => Err(LimitsError::NonPositive { field }),
        Some(value) => Ok(value),
    }
}

fn require_time(field: LimitField, value: Option<u64>) -> Result<u64, LimitsError> {
    let value = require_positive(field, value)?;
    if value > MAX_TIME_LIMIT_MS {
        return Err(LimitsError::OutOfRange {
            field,
            value,
            max: MAX_TIME_LIMIT_MS,
        });
    }
    Ok(value)
}

/// Limits that passed validation: every ceiling is present and positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatedLimits {
    wall_time: Duration,
    cpu_time: Duration,
    memory_bytes: u64,
    output_bytes: u64,
}

impl ValidatedLimits {
    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_bytes
    }
}

/// Executable produced by a successful compile phase. It lives inside the request
/// workspace and disappears with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    pub diagnostics: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompileFailure {
    pub reason: CompileFailureReason,
    pub diagnostics: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileFailureReason {
    CompilerError { exit_code: Option<i32> },
    LimitsExceeded { limit: CompileLimitType },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileLimitType {
    Ram,
    Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLimitKind {
    WallClock,
    Cpu,
}

/// Terminal classification of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    ExitedNormally { exit_code: i32 },
    TimedOut { limit: TimeLimitKind },
    MemoryExceeded,
    SignalKilled { signal: i32 },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::ExitedNormally { exit_code: 0 })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Verdict::ExitedNormally { .. } => "exited_normally",
            Verdict::TimedOut { .. } => "timed_out",
            Verdict::MemoryExceeded => "memory_exceeded",
            Verdict::SignalKilled { .. } => "signal_killed",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::ExitedNormally { exit_code } => write!(f, "exited with code {}", exit_code),
            Verdict::TimedOut { limit: TimeLimitKind::WallClock } => {
                write!(f, "wall-clock limit exceeded")
            }
            Verdict::TimedOut { limit: TimeLimitKind::Cpu } => write!(f, "cpu time limit exceeded"),
            Verdict::MemoryExceeded => write!(f, "memory limit exceeded"),
            Verdict::SignalKilled { signal } => write!(f, "killed by signal {}", signal),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub verdict: Verdict,
    pub exit_status: ExitStatus,
    pub execution_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_usage_bytes: u64,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
}

impl ExecutionOutcome {
    /// Compares everything except timing and memory measurements.
    pub fn same_behaviour(&self, other: &ExecutionOutcome) -> bool {
        (
            &self.verdict,
            &self.exit_status,
            &self.stdout,
            &self.stderr,
            self.output_truncated,
        ) == (
            &other.verdict,
            &other.exit_status,
            &other.stdout,
            &other.stderr,
            other.output_truncated,
        )
    }
}

/// What a successful `submit` call hands back. Infrastructure faults travel separately as
/// [`HarnessError`](crate::core::errors::HarnessError).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Report {
    Executed(ExecutionOutcome),
    CompileFailed(CompileFailure),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    Accepted,
    Compiling,
    CompileFailed,
    Compiled,
    Running,
    Finished(Verdict),
    Cancelled,
}

impl RequestState {
    pub fn can_advance_to(&self, next: &RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Accepted, Compiling)
                | (Compiling, CompileFailed)
                | (Compiling, Compiled)
                | (Compiling, Cancelled)
                | (Compiled, Running)
                | (Compiled, Cancelled)
                | (Running, Finished(_))
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::CompileFailed | RequestState::Finished(_) | RequestState::Cancelled
        )
    }
}

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitField {
    WallTime,
    CpuTime,
    Memory,
    Output,
}

impl fmt::Display for LimitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitField::WallTime => "wall_time_ms",
            LimitField::CpuTime => "cpu_time_ms",
            LimitField::Memory => "memory_bytes",
            LimitField::Output => "output_bytes",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LimitsError {
    #[error("limit {field} is missing")]
    Missing { field: LimitField },
    #[error("limit {field} must be positive")]
    NonPositive { field: LimitField },
    #[error("limit {field} = {value} exceeds the maximum of {max}")]
    OutOfRange {
        field: LimitField,
        value: u64,
        max: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("compile"),
            Phase::Run => f.write_str("run"),
        }
    }
}

/// Faults that are not the submission's doing, plus requests rejected before anything ran.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid limits: {0}")]
    InvalidLimits(#[from] LimitsError),

    #[error("submission source is empty")]
    EmptySource,

    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("compiler not found at {path}")]
    CompilerMissing { path: PathBuf },

    #[error("failed to spawn {phase} process: {source}")]
    Spawn {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {phase} process: {source}")]
    Wait {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("request cancelled during {phase} phase")]
    Cancelled { phase: Phase },
}

impl HarnessError {
    /// Whether the caller may retry the same request. Rejections and cancellations are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            HarnessError::InvalidLimits(_)
                | HarnessError::EmptySource
                | HarnessError::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rejected = HarnessError::InvalidLimits(LimitsError::Missing {
            field: LimitField::Memory,
        });
        assert!(!rejected.is_retryable());
        assert!(!HarnessError::EmptySource.is_retryable());
        assert!(!HarnessError::Cancelled { phase: Phase::Run }.is_retryable());

        let spawn = HarnessError::Spawn {
            phase: Phase::Run,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(spawn.is_retryable());
        assert!(
            HarnessError::CompilerMissing {
                path: PathBuf::from("/usr/bin/g++")
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_messages_name_the_field() {
        let err = HarnessError::from(LimitsError::NonPositive {
            field: LimitField::WallTime,
        });
        assert_eq!(
            err.to_string(),
            "invalid limits: limit wall_time_ms must be positive"
        );
    }
}

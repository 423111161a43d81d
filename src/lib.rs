//! Compile-and-execute harness for untrusted C++ submissions.
//!
//! A [`Harness`](core::harness::Harness) turns one submission and its limits into exactly
//! one report: an execution outcome, a compile failure, or a harness error. Every process it
//! spawns runs in its own process group and is killed and reaped before the call returns.
//!
//! The harness expects a PID-1 supervisor (such as `tini`) above it to reap descendants
//! that get re-parented when their process group is killed.

pub mod config;
pub mod constants;
pub mod core;
pub mod native;

#[cfg(test)]
mod stubs;

pub use crate::config::{HarnessConfig, NetworkPolicy};
pub use crate::core::benchmark::{BenchmarkOutcome, BenchmarkPlan, BenchmarkReport, Stability};
pub use crate::core::cancel::CancelToken;
pub use crate::core::clock::{Clock, SystemClock};
pub use crate::core::domain::{
    CompileFailure, CompileFailureReason, CompileLimitType, CompiledArtifact, ExecutionOutcome,
    ExitStatus, Limits, Report, Submission, TimeLimitKind, ValidatedLimits, Verdict,
};
pub use crate::core::errors::{HarnessError, LimitsError};
pub use crate::core::harness::Harness;

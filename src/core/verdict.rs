use std::time::{Duration, Instant};

use crate::core::domain::{ExitStatus, TimeLimitKind, ValidatedLimits, Verdict};

/// Why the harness killed a process group before it exited by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    WallClock,
    Memory,
    Cancelled,
}

/// Everything the run phase learned about one finished process.
#[derive(Clone, Debug)]
pub struct RunObservation {
    pub exit_status: ExitStatus,
    pub exited_at: Instant,
    pub deadline: Instant,
    pub kill: Option<KillReason>,
    pub peak_memory_bytes: u64,
    pub cpu_time: Duration,
}

/// Maps an observation onto a verdict.
///
/// Order matters: a proactive memory kill wins, then the wall-clock deadline (an exit counts
/// as normal only when it was observed strictly before the deadline), then retroactive
/// memory accounting, then CPU time, then the raw exit status.
pub fn classify(observation: &RunObservation, limits: &ValidatedLimits) -> Verdict {
    if observation.kill == Some(KillReason::Memory) {
        return Verdict::MemoryExceeded;
    }

    if observation.exited_at >= observation.deadline {
        return Verdict::TimedOut {
            limit: TimeLimitKind::WallClock,
        };
    }

    if observation.peak_memory_bytes > limits.memory_bytes() {
        return Verdict::MemoryExceeded;
    }

    if observation.cpu_time > limits.cpu_time()
        || observation.exit_status == ExitStatus::Signal(libc::SIGXCPU)
    {
        return Verdict::TimedOut {
            limit: TimeLimitKind::Cpu,
        };
    }

    match observation.exit_status {
        ExitStatus::Code(exit_code) => Verdict::ExitedNormally { exit_code },
        ExitStatus::Signal(signal) => Verdict::SignalKilled { signal },
    }
}

use std::time::Duration;

pub const DEFAULT_GNUCPP_PATH: &str = "g++";

/// Flags passed to the compiler on every submission. Callers cannot extend them.
pub const GNUCPP_FLAGS: &[&str] = &["-O2", "-std=gnu++17", "-pipe", "-fdiagnostics-color=never"];

pub const SOURCE_FILE_NAME: &str = "solution.cpp";
pub const ARTIFACT_FILE_NAME: &str = "solution.out";
pub const RUN_DIR_NAME: &str = "sandbox";
pub const WORKSPACE_PREFIX: &str = "cpp-harness-";

pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPILE_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_DIAGNOSTICS_LIMIT_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);
pub const DEFAULT_STACK_LIMIT_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_OPEN_FILES_LIMIT: u64 = 64;

/// Upper bound for wall-clock and CPU ceilings.
pub const MAX_TIME_LIMIT_MS: u64 = 24 * 60 * 60 * 1000;

pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub const DEFAULT_BENCHMARK_WARMUPS: usize = 1;
pub const DEFAULT_BENCHMARK_REPEATS: usize = 5;
/// A benchmark is stable when its IQR stays within this share of the median.
pub const BENCHMARK_STABLE_IQR_RATIO: f64 = 0.05;

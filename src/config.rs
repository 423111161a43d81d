use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_COMPILE_MEMORY_BYTES, DEFAULT_COMPILE_TIMEOUT, DEFAULT_DIAGNOSTICS_LIMIT_BYTES,
    DEFAULT_GNUCPP_PATH, DEFAULT_OPEN_FILES_LIMIT, DEFAULT_OUTPUT_DRAIN_GRACE,
    DEFAULT_SAMPLE_INTERVAL, DEFAULT_STACK_LIMIT_BYTES,
};

/// How the run phase is cut off from the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// The program gets a fresh, empty network namespace. Failing to create one fails the
    /// request with a harness error.
    #[default]
    Isolated,
    /// Try to create a network namespace, run anyway if the kernel refuses.
    BestEffort,
    /// No isolation.
    Shared,
}

impl FromStr for NetworkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(NetworkPolicy::Isolated),
            "best-effort" | "best_effort" => Ok(NetworkPolicy::BestEffort),
            "shared" => Ok(NetworkPolicy::Shared),
            other => Err(format!("unknown network policy '{}'", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Harness-wide settings. Per-request ceilings travel with each request as
/// [`Limits`](crate::core::domain::Limits); everything here applies to every request.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub gnucpp_path: PathBuf,
    pub compile_timeout: Duration,
    pub compile_memory_bytes: u64,
    pub diagnostics_limit_bytes: u64,
    pub workspace_root: PathBuf,
    pub sample_interval: Duration,
    pub output_drain_grace: Duration,
    pub stack_limit_bytes: u64,
    pub open_files_limit: u64,
    pub network: NetworkPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            gnucpp_path: PathBuf::from(DEFAULT_GNUCPP_PATH),
            compile_timeout: DEFAULT_COMPILE_TIMEOUT,
            compile_memory_bytes: DEFAULT_COMPILE_MEMORY_BYTES,
            diagnostics_limit_bytes: DEFAULT_DIAGNOSTICS_LIMIT_BYTES,
            workspace_root: std::env::temp_dir().join("cpp-harness"),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            output_drain_grace: DEFAULT_OUTPUT_DRAIN_GRACE,
            stack_limit_bytes: DEFAULT_STACK_LIMIT_BYTES,
            open_files_limit: DEFAULT_OPEN_FILES_LIMIT,
            network: NetworkPolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// Reads overrides from the process environment.
    ///
    /// | variable                        | field                   |
    /// |---------------------------------|-------------------------|
    /// | `GNUCPP_PATH`                   | `gnucpp_path`           |
    /// | `HARNESS_COMPILE_TIMEOUT_MS`    | `compile_timeout`       |
    /// | `HARNESS_COMPILE_MEMORY_BYTES`  | `compile_memory_bytes`  |
    /// | `HARNESS_WORKSPACE_ROOT`        | `workspace_root`        |
    /// | `HARNESS_SAMPLE_INTERVAL_MS`    | `sample_interval`       |
    /// | `HARNESS_STACK_LIMIT_BYTES`     | `stack_limit_bytes`     |
    /// | `HARNESS_NETWORK`               | `network`               |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("GNUCPP_PATH") {
            config.gnucpp_path = PathBuf::from(path);
        }
        if let Some(root) = lookup("HARNESS_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(value) = lookup("HARNESS_COMPILE_TIMEOUT_MS") {
            config.compile_timeout =
                Duration::from_millis(parse_positive("HARNESS_COMPILE_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("HARNESS_COMPILE_MEMORY_BYTES") {
            config.compile_memory_bytes = parse_positive("HARNESS_COMPILE_MEMORY_BYTES", &value)?;
        }
        if let Some(value) = lookup("HARNESS_SAMPLE_INTERVAL_MS") {
            config.sample_interval =
                Duration::from_millis(parse_positive("HARNESS_SAMPLE_INTERVAL_MS", &value)?);
        }
        if let Some(value) = lookup("HARNESS_STACK_LIMIT_BYTES") {
            config.stack_limit_bytes = parse_positive("HARNESS_STACK_LIMIT_BYTES", &value)?;
        }
        if let Some(value) = lookup("HARNESS_NETWORK") {
            config.network = value
                .parse()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "HARNESS_NETWORK",
                    value: value.clone(),
                    reason,
                })?;
        }

        Ok(config)
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason,
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be positive".to_string())),
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(invalid(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = HarnessConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.gnucpp_path, PathBuf::from("g++"));
        assert_eq!(config.compile_timeout, DEFAULT_COMPILE_TIMEOUT);
        assert_eq!(config.network, NetworkPolicy::Isolated);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = HarnessConfig::from_lookup(lookup_from(&[
            ("GNUCPP_PATH", "/opt/gcc/bin/g++"),
            ("HARNESS_COMPILE_TIMEOUT_MS", "5000"),
            ("HARNESS_SAMPLE_INTERVAL_MS", "5"),
            ("HARNESS_NETWORK", "best-effort"),
        ]))
        .unwrap();

        assert_eq!(config.gnucpp_path, PathBuf::from("/opt/gcc/bin/g++"));
        assert_eq!(config.compile_timeout, Duration::from_secs(5));
        assert_eq!(config.sample_interval, Duration::from_millis(5));
        assert_eq!(config.network, NetworkPolicy::BestEffort);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = HarnessConfig::from_lookup(lookup_from(&[("HARNESS_COMPILE_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "HARNESS_COMPILE_TIMEOUT_MS",
                ..
            }
        ));

        let err = HarnessConfig::from_lookup(lookup_from(&[("HARNESS_NETWORK", "wide-open")]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown network policy"));
    }
}

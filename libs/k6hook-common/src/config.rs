// Launcher configuration shared by the server and its tests

use std::time::Duration;

pub const DEFAULT_LISTEN_PORT: u16 = 8000;
pub const DEFAULT_MAX_CONCURRENT_TESTS: usize = 1000;
pub const DEFAULT_K6_BINARY: &str = "k6";

/// Tunables for a launch handler.
///
/// Readiness is checked a fixed number of times with a fixed pause; a run
/// that never prints its output banner within that window is failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub max_concurrent_tests: usize,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    /// Retry-After hint used when no run duration has been observed
    pub default_wait_time: Duration,
}

impl LaunchConfig {
    pub fn new(max_concurrent_tests: usize) -> Self {
        Self {
            max_concurrent_tests,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tests == 0 {
            return Err("max concurrent tests must be at least 1".to_string());
        }
        if self.readiness_attempts == 0 {
            return Err("readiness attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tests: DEFAULT_MAX_CONCURRENT_TESTS,
            readiness_attempts: 10,
            readiness_interval: Duration::from_secs(2),
            default_wait_time: Duration::from_secs(60),
        }
    }
}

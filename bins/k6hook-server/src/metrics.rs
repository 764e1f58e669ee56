//! Prometheus metrics for the launch handler and the wait-time estimate
//! derived from them.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `launch_max_concurrent_tests` | Gauge | |
//! | `launch_available_concurrent_tests` | Gauge | |
//! | `launch_test_duration_seconds` | Histogram | `exitCode` |
//! | `launch_requests_total` | Counter | `code` |
//!
//! Each handler owns its registry, so several handlers can live in one
//! process (tests do this).

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// k6 runs last from seconds to hours
pub const TEST_DURATION_BUCKETS: &[f64] = &[
    5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

/// Runs older than this no longer influence the Retry-After estimate
pub const DURATION_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Sliding window of recent execution durations, in seconds
#[derive(Debug)]
pub struct DurationWindow {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl DurationWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(Instant, f64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(samples: &mut VecDeque<(Instant, f64)>, window: Duration, now: Instant) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) <= window {
                break;
            }
            samples.pop_front();
        }
    }

    pub fn observe_at(&self, at: Instant, seconds: f64) {
        let mut samples = self.lock();
        samples.push_back((at, seconds));
        Self::evict(&mut samples, self.window, at);
    }

    /// Nearest-rank median of the samples still inside the window
    pub fn median_at(&self, now: Instant) -> Option<f64> {
        let mut samples = self.lock();
        Self::evict(&mut samples, self.window, now);
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = samples.iter().map(|(_, seconds)| *seconds).collect();
        values.sort_by(f64::total_cmp);
        Some(values[(values.len() - 1) / 2])
    }
}

pub struct LaunchMetrics {
    registry: Registry,
    available_concurrent_tests: IntGauge,
    test_duration: HistogramVec,
    requests: IntCounterVec,
    recent_durations: DurationWindow,
}

impl LaunchMetrics {
    pub fn new(max_concurrent_tests: usize) -> MetricsResult<Self> {
        let registry = Registry::new();

        let max = IntGauge::new(
            "launch_max_concurrent_tests",
            "The maximum number of concurrent tests",
        )?;
        max.set(i64::try_from(max_concurrent_tests).unwrap_or(i64::MAX));
        registry.register(Box::new(max))?;

        let available_concurrent_tests = IntGauge::new(
            "launch_available_concurrent_tests",
            "The current number of available concurrent tests. If 0 then new requests will be rejected",
        )?;
        available_concurrent_tests.set(i64::try_from(max_concurrent_tests).unwrap_or(i64::MAX));
        registry.register(Box::new(available_concurrent_tests.clone()))?;

        let test_duration = HistogramVec::new(
            HistogramOpts::new(
                "launch_test_duration_seconds",
                "Durations of the executed k6 test runs in seconds",
            )
            .buckets(TEST_DURATION_BUCKETS.to_vec()),
            &["exitCode"],
        )?;
        registry.register(Box::new(test_duration.clone()))?;

        let requests = IntCounterVec::new(
            Opts::new(
                "launch_requests_total",
                "Launch requests handled, by HTTP status code",
            ),
            &["code"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        Ok(Self {
            registry,
            available_concurrent_tests,
            test_duration,
            requests,
            recent_durations: DurationWindow::new(DURATION_WINDOW),
        })
    }

    /// Record a finished run. Runs whose exit was never observed report a
    /// zero duration and are skipped.
    pub fn observe_run(&self, exit_code: i32, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let seconds = duration.as_secs_f64();
        self.test_duration
            .with_label_values(&[&exit_code.to_string()])
            .observe(seconds);
        self.recent_durations.observe_at(Instant::now(), seconds);
    }

    pub fn record_request(&self, status: u16) {
        self.requests
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn set_available(&self, available: usize) {
        self.available_concurrent_tests
            .set(i64::try_from(available).unwrap_or(i64::MAX));
    }

    pub fn median_duration(&self) -> Option<Duration> {
        self.recent_durations
            .median_at(Instant::now())
            .map(Duration::from_secs_f64)
    }

    /// Retry-After hint in whole seconds: the median recent run duration,
    /// or `fallback` when nothing has finished recently. Never zero.
    pub fn wait_time(&self, fallback: Duration) -> u64 {
        self.median_duration()
            .unwrap_or(fallback)
            .as_secs()
            .max(1)
    }

    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_empty_window() {
        let window = DurationWindow::new(DURATION_WINDOW);
        assert_eq!(window.median_at(Instant::now()), None);
    }

    #[test]
    fn test_median_nearest_rank() {
        let window = DurationWindow::new(DURATION_WINDOW);
        let now = Instant::now();
        for seconds in [30.0, 10.0, 20.0] {
            window.observe_at(now, seconds);
        }
        assert_eq!(window.median_at(now), Some(20.0));

        window.observe_at(now, 40.0);
        assert_eq!(window.median_at(now), Some(20.0));
    }

    #[test]
    fn test_old_samples_leave_the_window() {
        let window = DurationWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        window.observe_at(start, 500.0);
        window.observe_at(start + Duration::from_secs(30), 10.0);

        assert_eq!(window.median_at(start + Duration::from_secs(45)), Some(10.0));
        assert_eq!(window.median_at(start + Duration::from_secs(120)), None);
    }

    #[test]
    fn test_wait_time_fallback_and_median() {
        let metrics = LaunchMetrics::new(10).unwrap();
        assert_eq!(metrics.wait_time(Duration::from_secs(60)), 60);

        metrics.observe_run(0, Duration::from_secs(42));
        metrics.observe_run(1, Duration::from_secs(90));
        metrics.observe_run(0, Duration::from_secs(12));
        assert_eq!(metrics.wait_time(Duration::from_secs(60)), 42);
    }

    #[test]
    fn test_wait_time_is_at_least_one_second() {
        let metrics = LaunchMetrics::new(10).unwrap();
        metrics.observe_run(0, Duration::from_millis(200));
        assert_eq!(metrics.wait_time(Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_zero_duration_is_ignored() {
        let metrics = LaunchMetrics::new(10).unwrap();
        metrics.observe_run(-1, Duration::ZERO);
        assert_eq!(metrics.median_duration(), None);
    }

    #[test]
    fn test_encode_text() {
        let metrics = LaunchMetrics::new(3).unwrap();
        metrics.set_available(2);
        metrics.record_request(429);
        metrics.observe_run(0, Duration::from_secs(7));

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("launch_max_concurrent_tests 3"));
        assert!(text.contains("launch_available_concurrent_tests 2"));
        assert!(text.contains("launch_requests_total{code=\"429\"} 1"));
        assert!(text.contains("launch_test_duration_seconds_count{exitCode=\"0\"} 1"));
    }
}

// Launch handler: shared state behind /launch-test

use anyhow::Context;
use futures_util::future::{BoxFuture, FutureExt};
use k6hook_common::config::LaunchConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::admission::AdmissionGate;
use crate::engine::K6Client;
use crate::failure_memo::FailureMemo;
use crate::metrics::{LaunchMetrics, MetricsResult};
use crate::reaper::ProcessReaper;
use crate::secrets::SecretStore;
use crate::slack::Notifier;

/// Pause between readiness checks; swapped out in tests
pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn tokio_sleeper() -> Sleeper {
    Arc::new(|duration| tokio::time::sleep(duration).boxed())
}

/// State shared by every launch request: the admission gate, the failure
/// memo, the reaper and the collaborators a run needs.
pub struct LaunchHandler {
    pub(crate) client: Arc<dyn K6Client>,
    pub(crate) secrets: Option<Arc<dyn SecretStore>>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) gate: AdmissionGate,
    pub(crate) failures: FailureMemo,
    pub(crate) reaper: ProcessReaper,
    pub(crate) metrics: Arc<LaunchMetrics>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) config: LaunchConfig,
    pub(crate) sleep: Sleeper,
}

impl LaunchHandler {
    /// Must be called inside a tokio runtime; the reaper starts right away
    /// and stops once `shutdown` fires.
    pub fn new(
        shutdown: CancellationToken,
        client: Arc<dyn K6Client>,
        secrets: Option<Arc<dyn SecretStore>>,
        notifier: Arc<dyn Notifier>,
        config: LaunchConfig,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid launch configuration")?;

        let metrics = Arc::new(
            LaunchMetrics::new(config.max_concurrent_tests)
                .context("registering launch metrics")?,
        );
        let reaper = ProcessReaper::start(
            config.max_concurrent_tests,
            shutdown.clone(),
            metrics.clone(),
        );

        Ok(Self {
            client,
            secrets,
            notifier,
            gate: AdmissionGate::new(config.max_concurrent_tests),
            failures: FailureMemo::new(),
            reaper,
            metrics,
            shutdown,
            config,
            sleep: tokio_sleeper(),
        })
    }

    pub fn with_sleeper(mut self, sleep: Sleeper) -> Self {
        self.sleep = sleep;
        self
    }

    /// Blocks until shutdown has fired and every handed-off run was reaped
    pub async fn wait(&self) {
        self.reaper.wait().await;
        debug!("Launch handler finished");
    }

    /// Retry-After seconds for rejected requests
    pub fn wait_time(&self) -> u64 {
        self.metrics.wait_time(self.config.default_wait_time)
    }

    pub fn available_test_runs(&self) -> usize {
        self.gate.available()
    }

    pub fn metrics(&self) -> &LaunchMetrics {
        &self.metrics
    }

    /// Prometheus text exposition, with the availability gauge refreshed
    pub fn encode_metrics(&self) -> MetricsResult<String> {
        self.metrics.set_available(self.gate.available());
        self.metrics.encode_text()
    }
}

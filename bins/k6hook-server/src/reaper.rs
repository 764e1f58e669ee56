// Process reaper: waits on runs nobody else is waiting for

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::Permit;
use crate::engine::TestRun;
use crate::metrics::LaunchMetrics;

struct Reapable {
    run: Box<dyn TestRun>,
    permit: Permit,
}

/// Owns the obligation to wait on every run handed to it, exactly once.
///
/// For each run, in order: wait, record the duration, cancel the run's
/// attached scope, release its admission permit. Once shutdown fires no new
/// runs are taken; the runs already registered are waited on (not killed)
/// before [`ProcessReaper::wait`] returns.
pub struct ProcessReaper {
    intake: mpsc::Sender<Reapable>,
    finished: CancellationToken,
    metrics: Arc<LaunchMetrics>,
}

impl ProcessReaper {
    /// Spawn the dispatcher. At most `limit` runs are waited on at once and
    /// at most `limit` more can be queued.
    pub fn start(limit: usize, shutdown: CancellationToken, metrics: Arc<LaunchMetrics>) -> Self {
        let limit = limit.max(1);
        let (intake, rx) = mpsc::channel(limit);
        let finished = CancellationToken::new();

        tokio::spawn(dispatch(
            rx,
            limit,
            shutdown,
            metrics.clone(),
            finished.clone(),
        ));

        Self {
            intake,
            finished,
            metrics,
        }
    }

    /// Hand a run and its permit over. Blocks while the intake queue is full.
    /// After shutdown the run is reaped inline by the caller instead.
    pub async fn submit(&self, run: Box<dyn TestRun>, permit: Permit) {
        let pid = run.pid();
        if let Err(mpsc::error::SendError(item)) =
            self.intake.send(Reapable { run, permit }).await
        {
            warn!(pid, "Reaper is shutting down, reaping test run inline");
            reap(item, self.metrics.clone()).await;
        }
    }

    /// Resolves once shutdown has fired and every registered run was reaped
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

async fn dispatch(
    mut intake: mpsc::Receiver<Reapable>,
    limit: usize,
    shutdown: CancellationToken,
    metrics: Arc<LaunchMetrics>,
    finished: CancellationToken,
) {
    let mut waiting = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(()) = waiting.next(), if !waiting.is_empty() => {}
            item = intake.recv(), if waiting.len() < limit => match item {
                Some(item) => waiting.push(reap(item, metrics.clone())),
                None => break,
            },
        }
    }

    // Stop intake, keep whatever was already queued
    intake.close();
    while let Some(item) = intake.recv().await {
        waiting.push(reap(item, metrics.clone()));
    }

    if !waiting.is_empty() {
        info!(runs = waiting.len(), "Waiting for test runs to exit");
    }
    while waiting.next().await.is_some() {}

    debug!("Reaper finished");
    finished.cancel();
}

async fn reap(item: Reapable, metrics: Arc<LaunchMetrics>) {
    let Reapable { mut run, permit } = item;
    let pid = run.pid();
    debug!(pid, "Waiting for test run to exit");

    if let Err(e) = run.wait().await {
        debug!(pid, error = %e, "Test run exited with an error");
    }
    metrics.observe_run(run.exit_code(), run.execution_duration());
    run.cleanup_context();
    permit.release();

    debug!(pid, "Test run exited");
}

// One /launch-test request, from admission to response

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use k6hook_common::types::{EMOJI_FAILURE, EMOJI_SUCCESS, EMOJI_WARNING};
use k6hook_common::{LaunchPayload, PayloadError, RunKey};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::Permit;
use crate::engine::{RunError, StartError, TestRun};
use crate::launch::LaunchHandler;
use crate::output::{cloud_url, OutputBuffer};
use crate::secrets::{resolve_env_vars, ResolveError};
use crate::slack::{ThreadHandles, RESULTS_FILE_NAME};

/// Everything that turns a launch request into a 400
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("error while validating request: {0}")]
    Validation(#[from] PayloadError),

    #[error("not enough time since last failure")]
    TooSoon,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("error while launching the test: {0}")]
    Start(#[from] StartError),

    #[error("error while waiting for test to start: timeout")]
    NotReady,

    #[error("couldn't find the cloud URL in the output")]
    NoCloudUrl,

    #[error("failed to run: {0}")]
    Run(#[from] RunError),
}

/// Plain-text error body terminated by a newline
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        format!("{message}\n"),
    )
        .into_response()
}

pub(crate) fn too_many_requests(retry_after: u64) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "Maximum concurrent test runs reached",
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn output_response(output: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from(output),
    )
        .into_response()
}

/// Why a run scope was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// The caller went away while waiting for results
    Request,
    /// Process-wide shutdown
    Shutdown,
    /// Cancelled directly, after the run was reaped or the request ended
    Manual,
}

/// Tie a run scope to the request and to shutdown. The request only counts
/// when the caller is waiting for results; a fire-and-forget run outlives
/// its request.
pub(crate) async fn propagate_cancel(
    run_scope: CancellationToken,
    request_scope: CancellationToken,
    shutdown: CancellationToken,
    wait_for_results: bool,
) -> CancelSource {
    let source = if wait_for_results {
        tokio::select! {
            _ = run_scope.cancelled() => CancelSource::Manual,
            _ = request_scope.cancelled() => CancelSource::Request,
            _ = shutdown.cancelled() => CancelSource::Shutdown,
        }
    } else {
        tokio::select! {
            _ = run_scope.cancelled() => CancelSource::Manual,
            _ = shutdown.cancelled() => CancelSource::Shutdown,
        }
    };

    run_scope.cancel();
    match source {
        CancelSource::Manual => debug!("Run scope released"),
        source => info!(?source, "Canceling process"),
    }
    source
}

struct SingleRequest<'a> {
    handler: &'a LaunchHandler,
    payload: LaunchPayload,
    key: RunKey,
    /// `None` once released or handed to the reaper
    permit: Option<Permit>,
    output: OutputBuffer,
    run_scope: Option<CancellationToken>,
}

impl Drop for SingleRequest<'_> {
    fn drop(&mut self) {
        // A caller that waited is done with the process either way
        if self.payload.metadata.wait_for_results {
            if let Some(scope) = &self.run_scope {
                scope.cancel();
            }
        }
    }
}

impl LaunchHandler {
    /// Serve one launch request. `request_scope` is cancelled when the
    /// caller disconnects.
    pub async fn handle(&self, body: &[u8], request_scope: CancellationToken) -> Response {
        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(at_capacity) => {
                let retry_after = self.wait_time();
                warn!(retry_after, "{}. Rejecting request", at_capacity);
                return too_many_requests(retry_after);
            }
        };

        info!("Parsing the request payload");
        let payload = match LaunchPayload::from_json(body) {
            Ok(payload) => payload,
            Err(e) => {
                permit.release();
                let err = LaunchError::from(e);
                error!(error = %err, "Invalid launch request");
                return error_response(StatusCode::BAD_REQUEST, &err.to_string());
            }
        };

        let request = SingleRequest {
            handler: self,
            key: payload.key(),
            payload,
            permit: Some(permit),
            output: OutputBuffer::new(),
            run_scope: None,
        };
        request.run(request_scope).await
    }
}

impl SingleRequest<'_> {
    async fn run(mut self, request_scope: CancellationToken) -> Response {
        let handler = self.handler;
        let metadata = self.payload.metadata.clone();

        if handler
            .failures
            .too_soon(&self.key, metadata.min_failure_delay, Utc::now())
        {
            return self.fail(LaunchError::TooSoon);
        }

        info!(run_key = %self.key, "Fetching secrets (if any)");
        let env = match resolve_env_vars(&self.payload, handler.secrets.as_deref()).await {
            Ok(env) => env,
            Err(e) => return self.fail(e.into()),
        };

        let run_scope = CancellationToken::new();
        self.run_scope = Some(run_scope.clone());
        tokio::spawn(propagate_cancel(
            run_scope.clone(),
            request_scope,
            handler.shutdown.clone(),
            metadata.wait_for_results,
        ));

        info!(run_key = %self.key, "Launching k6 test");
        let mut run = match handler
            .client
            .start(
                run_scope,
                &metadata.script,
                metadata.upload_to_cloud,
                env,
                self.output.clone(),
            )
            .await
        {
            Ok(run) => run,
            Err(e) => return self.fail(e.into()),
        };

        info!(pid = run.pid(), "Waiting for output path");
        let mut context = metadata.notification_context.clone();
        if !self.wait_until_ready().await {
            let threads = self
                .send_messages(EMOJI_FAILURE, "didn't start successfully", &context)
                .await;
            self.add_output_to_threads(&threads).await;
            self.hand_off(run).await;
            return self.fail(LaunchError::NotReady);
        }

        if metadata.upload_to_cloud {
            match cloud_url(&self.output.contents()) {
                Some(url) => {
                    info!(url = %url, "Cloud run URL");
                    context.push_str(&format!("\nCloud URL: <{url}>"));
                }
                None => {
                    self.hand_off(run).await;
                    return self.fail(LaunchError::NoCloudUrl);
                }
            }
        }

        let threads = self
            .send_messages(EMOJI_WARNING, "has started", &context)
            .await;

        if !metadata.wait_for_results {
            info!(
                "The load test for {}.{} was launched successfully!",
                self.payload.name(),
                self.payload.namespace()
            );
            self.hand_off(run).await;
            return StatusCode::OK.into_response();
        }

        info!("Waiting for the results");
        let result = run.wait().await;
        handler
            .metrics
            .observe_run(run.exit_code(), run.execution_duration());
        self.add_output_to_threads(&threads).await;

        if let Err(e) = result {
            self.update_messages(&threads, EMOJI_FAILURE, "has failed", &context)
                .await;
            return self.fail(e.into());
        }

        self.update_messages(&threads, EMOJI_SUCCESS, "has succeeded", &context)
            .await;
        self.release();
        info!(
            "The load test for {}.{} succeeded!",
            self.payload.name(),
            self.payload.namespace()
        );
        output_response(self.output.bytes())
    }

    /// Poll the captured output for the readiness marker, sleeping between
    /// attempts. There is no check after the last sleep.
    async fn wait_until_ready(&self) -> bool {
        let config = &self.handler.config;
        for _ in 0..config.readiness_attempts {
            if self.output.is_ready() {
                return true;
            }
            debug!(
                "Waiting {:?} for test to start",
                config.readiness_interval
            );
            (self.handler.sleep)(config.readiness_interval).await;
        }
        false
    }

    /// Give the run and its permit to the reaper. Only ever called once,
    /// on the paths that do not wait for the run themselves.
    async fn hand_off(&mut self, mut run: Box<dyn TestRun>) {
        if let Some(scope) = &self.run_scope {
            run.set_cancel_scope(scope.clone());
        }
        let Some(permit) = self.permit.take() else {
            debug_assert!(false, "test run handed off twice");
            error!(pid = run.pid(), "Test run handed off twice, killing it");
            run.kill();
            return;
        };
        self.handler.reaper.submit(run, permit).await;
    }

    fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }

    /// Record the failure and build the 400 response, with whatever output
    /// was captured appended. A started run is killed; if it was handed
    /// off, the reaper still waits on it and frees its slot.
    fn fail(&mut self, err: LaunchError) -> Response {
        self.handler.failures.record(&self.key);
        let mut message = err.to_string();
        error!(run_key = %self.key, error = %message, "Load test failed");

        if !self.output.is_empty() {
            message.push('\n');
            message.push_str(&self.output.contents());
        }
        if let Some(scope) = &self.run_scope {
            scope.cancel();
        }
        self.release();
        error_response(StatusCode::BAD_REQUEST, &message)
    }

    async fn send_messages(&self, emoji: &str, status: &str, context: &str) -> ThreadHandles {
        let text = self.payload.status_message(emoji, status);
        match self
            .handler
            .notifier
            .send_messages(&self.payload.metadata.slack_channels, &text, context)
            .await
        {
            Ok(threads) => threads,
            Err(e) => {
                error!(error = %e, "Failed to send notification");
                ThreadHandles::new()
            }
        }
    }

    async fn update_messages(&self, threads: &ThreadHandles, emoji: &str, status: &str, context: &str) {
        let text = self.payload.status_message(emoji, status);
        if let Err(e) = self
            .handler
            .notifier
            .update_messages(threads, &text, context)
            .await
        {
            error!(error = %e, "Failed to update notification");
        }
    }

    async fn add_output_to_threads(&self, threads: &ThreadHandles) {
        if let Err(e) = self
            .handler
            .notifier
            .add_file_to_threads(threads, RESULTS_FILE_NAME, &self.output.contents())
            .await
        {
            error!(error = %e, "Failed to upload results");
        }
    }
}

//! Execution Engine - launching and supervising k6 runs
//!
//! **Core Responsibility:**
//! Start `k6 run` for a script and hand back a [`TestRun`] the caller owns.
//!
//! **Boundary:**
//! - Engine knows HOW to run k6 (binary, temp script file, environment)
//! - Engine does NOT decide whether a run is ready or whether it passed
//! - Output is streamed into an [`OutputBuffer`] while the process runs
//!
//! Every started child is supervised by a background task that always waits
//! on it, so dropping a handle never leaves a zombie behind.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::output::OutputBuffer;

/// How long to keep reading stdout/stderr after the process has exited
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("could not create a tempfile for the script: {0}")]
    TempFile(#[source] io::Error),

    #[error("could not write the script to a tempfile: {0}")]
    WriteScript(#[source] io::Error),

    #[error("could not start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("exit status {0}")]
    ExitCode(i32),

    /// Killed by a signal, carries the platform description of the status
    #[error("{0}")]
    Terminated(String),

    #[error("error waiting for k6: {0}")]
    Wait(String),
}

impl RunError {
    pub fn from_status(status: &ExitStatus) -> Result<(), RunError> {
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(RunError::ExitCode(code)),
            None => Err(RunError::Terminated(status.to_string())),
        }
    }
}

/// Starts k6 runs
#[async_trait]
pub trait K6Client: Send + Sync {
    /// Start a run. The process is killed when `cancel` fires.
    async fn start(
        &self,
        cancel: CancellationToken,
        script: &str,
        upload: bool,
        env: Option<BTreeMap<String, String>>,
        output: OutputBuffer,
    ) -> Result<Box<dyn TestRun>, StartError>;
}

/// Handle to a started run.
///
/// Whoever holds the box is responsible for calling [`TestRun::wait`].
#[async_trait]
pub trait TestRun: Send + Sync {
    /// Wait for the process to exit. Calling it again returns the recorded
    /// outcome.
    async fn wait(&mut self) -> Result<(), RunError>;

    fn kill(&self);

    fn pid(&self) -> Option<u32>;

    fn exited(&self) -> bool;

    /// `-1` while running or when the process was killed by a signal
    fn exit_code(&self) -> i32;

    /// Zero until the exit has been observed
    fn execution_duration(&self) -> Duration;

    /// Attach the scope to cancel once the run has been reaped
    fn set_cancel_scope(&mut self, scope: CancellationToken);

    fn cleanup_context(&self);
}

/// Runs the k6 binary found on this host
pub struct LocalRunner {
    binary: String,
    cloud_token: Option<String>,
}

impl LocalRunner {
    pub fn new(binary: impl Into<String>, cloud_token: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            cloud_token,
        }
    }
}

pub(crate) fn run_args(upload: bool, script_path: &str) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if upload {
        args.push("--out".to_string());
        args.push("cloud".to_string());
    }
    args.push(script_path.to_string());
    args
}

#[async_trait]
impl K6Client for LocalRunner {
    async fn start(
        &self,
        cancel: CancellationToken,
        script: &str,
        upload: bool,
        env: Option<BTreeMap<String, String>>,
        output: OutputBuffer,
    ) -> Result<Box<dyn TestRun>, StartError> {
        let mut file = tempfile::Builder::new()
            .prefix("k6-script")
            .tempfile()
            .map_err(StartError::TempFile)?;
        file.write_all(script.as_bytes())
            .and_then(|_| file.flush())
            .map_err(StartError::WriteScript)?;
        let script_path = file.into_temp_path();

        let args = run_args(upload, &script_path.to_string_lossy());
        let mut command = Command::new(&self.binary);
        command.args(&args);
        if let Some(token) = &self.cloud_token {
            command.env("K6_CLOUD_TOKEN", token);
        }
        if let Some(env) = env {
            command.envs(env);
        }

        debug!(script = %script, "k6 script");
        info!(command = %format!("{} {}", self.binary, args.join(" ")), "Launching k6");

        let run = LocalTestRun::spawn(command, Some(script_path), cancel, output).map_err(
            |source| StartError::Spawn {
                binary: self.binary.clone(),
                source,
            },
        )?;
        Ok(Box::new(run))
    }
}

#[derive(Debug, Clone)]
struct Exit {
    result: Result<(), RunError>,
    code: i32,
    exited_at: Instant,
}

/// A child process owned by a supervisor task
pub struct LocalTestRun {
    pid: Option<u32>,
    started_at: Instant,
    kill: CancellationToken,
    exit: watch::Receiver<Option<Exit>>,
    cancel_scope: Option<CancellationToken>,
}

impl LocalTestRun {
    /// Spawn `command` with its output piped into `output`. The script file,
    /// if any, is removed once the process has exited.
    pub(crate) fn spawn(
        mut command: Command,
        script: Option<TempPath>,
        cancel: CancellationToken,
        output: OutputBuffer,
    ) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started_at = Instant::now();
        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump(stdout, output.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump(stderr, output.clone())));

        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => {
                    debug!(pid, "Run scope cancelled, killing k6");
                    None
                }
                _ = kill_requested.cancelled() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => terminate(&mut child).await,
            };
            let exited_at = Instant::now();

            for pump in [stdout, stderr].into_iter().flatten() {
                drain(pump).await;
            }
            drop(script);

            let exit = match status {
                Ok(status) => Exit {
                    result: RunError::from_status(&status),
                    code: status.code().unwrap_or(-1),
                    exited_at,
                },
                Err(e) => Exit {
                    result: Err(RunError::Wait(e.to_string())),
                    code: -1,
                    exited_at,
                },
            };
            debug!(pid, code = exit.code, "k6 exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            started_at,
            kill,
            exit: exit_rx,
            cancel_scope: None,
        })
    }
}

async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill k6 process");
    }
    child.wait().await
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: OutputBuffer) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.append(&buf[..n]),
        }
    }
}

async fn drain(mut pump: JoinHandle<()>) {
    if tokio::time::timeout(IO_DRAIN_TIMEOUT, &mut pump).await.is_err() {
        warn!("k6 output pipe still open after exit, dropping the rest");
        pump.abort();
    }
}

#[async_trait]
impl TestRun for LocalTestRun {
    async fn wait(&mut self) -> Result<(), RunError> {
        let result = match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.as_ref().map(|exit| exit.result.clone()),
            Err(_) => None,
        };
        result.unwrap_or_else(|| Err(RunError::Wait("supervisor stopped".to_string())))
    }

    fn kill(&self) {
        self.kill.cancel();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn exit_code(&self) -> i32 {
        self.exit.borrow().as_ref().map_or(-1, |exit| exit.code)
    }

    fn execution_duration(&self) -> Duration {
        self.exit
            .borrow()
            .as_ref()
            .map_or(Duration::ZERO, |exit| {
                exit.exited_at.duration_since(self.started_at)
            })
    }

    fn set_cancel_scope(&mut self, scope: CancellationToken) {
        self.cancel_scope = Some(scope);
    }

    fn cleanup_context(&self) {
        if let Some(scope) = &self.cancel_scope {
            scope.cancel();
        }
    }
}

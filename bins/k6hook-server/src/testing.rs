// Hand-written fakes for the launch handler's collaborators

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::{K6Client, RunError, StartError, TestRun};
use crate::output::OutputBuffer;
use crate::secrets::{SecretData, SecretError, SecretStore};
use crate::slack::{NotifyError, Notifier, ThreadHandles};

/// Behaviour of one fake k6 run
#[derive(Debug, Clone)]
pub struct FakeScript {
    /// Written to the output buffer when the run starts
    pub initial_output: String,
    /// Written when the run finishes
    pub final_output: String,
    pub result: Result<(), RunError>,
    pub exit_code: i32,
    pub duration: Duration,
    /// Block `wait` until released or until the run scope is cancelled
    pub hold: bool,
}

impl FakeScript {
    pub fn succeeding(final_output: &str) -> Self {
        Self {
            initial_output: String::new(),
            final_output: final_output.to_string(),
            result: Ok(()),
            exit_code: 0,
            duration: Duration::from_secs(30),
            hold: false,
        }
    }

    pub fn failing(exit_code: i32, final_output: &str) -> Self {
        Self {
            result: Err(RunError::ExitCode(exit_code)),
            exit_code,
            ..Self::succeeding(final_output)
        }
    }

    pub fn with_initial_output(mut self, output: &str) -> Self {
        self.initial_output = output.to_string();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn held(mut self) -> Self {
        self.hold = true;
        self
    }
}

/// What a test can observe about a fake run
#[derive(Debug, Default)]
pub struct RunProbe {
    pub waits: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub kills: AtomicUsize,
    /// Set when the run scope ended a held wait
    pub cancelled: AtomicBool,
    /// Cancel to let a held run finish
    pub release: CancellationToken,
}

pub struct FakeTestRun {
    script: FakeScript,
    probe: Arc<RunProbe>,
    scope: CancellationToken,
    output: OutputBuffer,
    cancel_scope: Option<CancellationToken>,
    outcome: Option<Result<(), RunError>>,
}

impl FakeTestRun {
    pub fn new(
        script: FakeScript,
        scope: CancellationToken,
        output: OutputBuffer,
    ) -> (Self, Arc<RunProbe>) {
        output.append(script.initial_output.as_bytes());
        let probe = Arc::new(RunProbe::default());
        let run = Self {
            script,
            probe: probe.clone(),
            scope,
            output,
            cancel_scope: None,
            outcome: None,
        };
        (run, probe)
    }

    fn killed(&self) -> bool {
        self.probe.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRun for FakeTestRun {
    async fn wait(&mut self) -> Result<(), RunError> {
        self.probe.waits.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        if self.script.hold {
            tokio::select! {
                _ = self.probe.release.cancelled() => {}
                _ = self.scope.cancelled() => {
                    self.probe.cancelled.store(true, Ordering::SeqCst);
                    let outcome = Err(RunError::Terminated("signal: 9 (SIGKILL)".to_string()));
                    self.outcome = Some(outcome.clone());
                    return outcome;
                }
            }
        }

        self.output.append(self.script.final_output.as_bytes());
        self.outcome = Some(self.script.result.clone());
        self.script.result.clone()
    }

    fn kill(&self) {
        self.probe.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn exited(&self) -> bool {
        self.outcome.is_some()
    }

    fn exit_code(&self) -> i32 {
        match self.outcome {
            Some(_) if !self.killed() => self.script.exit_code,
            _ => -1,
        }
    }

    fn execution_duration(&self) -> Duration {
        if self.outcome.is_some() {
            self.script.duration
        } else {
            Duration::ZERO
        }
    }

    fn set_cancel_scope(&mut self, scope: CancellationToken) {
        self.cancel_scope = Some(scope);
    }

    fn cleanup_context(&self) {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Some(scope) = &self.cancel_scope {
            scope.cancel();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub script: String,
    pub upload: bool,
    pub env: Option<BTreeMap<String, String>>,
}

/// Starts [`FakeTestRun`]s. Scripts are consumed in order; the last one is
/// reused for every further start.
#[derive(Default)]
pub struct FakeK6Client {
    scripts: Mutex<VecDeque<FakeScript>>,
    fail_start: Option<String>,
    starts: Mutex<Vec<StartCall>>,
    probes: Mutex<Vec<Arc<RunProbe>>>,
    scopes: Mutex<Vec<CancellationToken>>,
}

impl FakeK6Client {
    pub fn new(scripts: Vec<FakeScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn failing_to_start(message: &str) -> Self {
        Self {
            fail_start: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().unwrap().clone()
    }

    pub fn probe(&self, index: usize) -> Arc<RunProbe> {
        self.probes.lock().unwrap()[index].clone()
    }

    pub fn probes(&self) -> Vec<Arc<RunProbe>> {
        self.probes.lock().unwrap().clone()
    }

    /// The run scope handed to the n-th start, including failed starts
    pub fn scope(&self, index: usize) -> CancellationToken {
        self.scopes.lock().unwrap()[index].clone()
    }

    fn next_script(&self) -> FakeScript {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap()
        } else {
            scripts
                .front()
                .cloned()
                .unwrap_or_else(|| FakeScript::succeeding(""))
        }
    }
}

#[async_trait]
impl K6Client for FakeK6Client {
    async fn start(
        &self,
        cancel: CancellationToken,
        script: &str,
        upload: bool,
        env: Option<BTreeMap<String, String>>,
        output: OutputBuffer,
    ) -> Result<Box<dyn TestRun>, StartError> {
        self.starts.lock().unwrap().push(StartCall {
            script: script.to_string(),
            upload,
            env,
        });
        self.scopes.lock().unwrap().push(cancel.clone());
        if let Some(message) = &self.fail_start {
            return Err(StartError::Spawn {
                binary: "k6".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, message.clone()),
            });
        }

        let (run, probe) = FakeTestRun::new(self.next_script(), cancel, output);
        self.probes.lock().unwrap().push(probe);
        Ok(Box::new(run))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    Send {
        channels: Vec<String>,
        text: String,
        context: String,
    },
    Update {
        threads: ThreadHandles,
        text: String,
        context: String,
    },
    AddFile {
        threads: ThreadHandles,
        file_name: String,
        content: String,
    },
}

/// Records every call. Thread handles are `C-<channel>` -> `ts-<n>`.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, method: &str, call: NotifierCall) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(NotifyError::Api {
                method: method.to_string(),
                error: "fatal_error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_messages(
        &self,
        channels: &[String],
        text: &str,
        context: &str,
    ) -> Result<ThreadHandles, NotifyError> {
        self.record(
            "chat.postMessage",
            NotifierCall::Send {
                channels: channels.to_vec(),
                text: text.to_string(),
                context: context.to_string(),
            },
        )?;
        Ok(channels
            .iter()
            .enumerate()
            .map(|(n, channel)| (format!("C-{channel}"), format!("ts-{}", n + 1)))
            .collect())
    }

    async fn update_messages(
        &self,
        threads: &ThreadHandles,
        text: &str,
        context: &str,
    ) -> Result<(), NotifyError> {
        self.record(
            "chat.update",
            NotifierCall::Update {
                threads: threads.clone(),
                text: text.to_string(),
                context: context.to_string(),
            },
        )
    }

    async fn add_file_to_threads(
        &self,
        threads: &ThreadHandles,
        file_name: &str,
        content: &str,
    ) -> Result<(), NotifyError> {
        self.record(
            "files.completeUploadExternal",
            NotifierCall::AddFile {
                threads: threads.clone(),
                file_name: file_name.to_string(),
                content: content.to_string(),
            },
        )
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<(String, String), SecretData>>,
}

impl MemorySecretStore {
    pub fn insert(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(key, value)| (key.to_string(), value.as_bytes().to_vec()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })
    }
}

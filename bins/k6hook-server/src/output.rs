// Captured k6 output and the helpers that inspect it while a run is live

use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// k6 prints its `output:` banner once the test is actually underway
pub const READINESS_MARKER: &str = "output:";

lazy_static! {
    static ref CLOUD_URL: Regex = Regex::new(
        r"output: cloud \((?P<url>https://((app\.k6\.io)|([^/]+\.grafana\.net/a/k6-app))/runs/\d+)\)"
    )
    .expect("cloud url pattern is valid");
}

/// Append-only sink shared between the process pumps and the request handler.
///
/// Clones share the same underlying buffer, so the handler can poll the
/// accumulated text while the process is still writing to it.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Snapshot of everything captured so far
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.contents().contains(READINESS_MARKER)
    }
}

impl io::Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Extract the cloud run URL k6 prints when streaming results with
/// `--out cloud`. Both the legacy `app.k6.io` and the Grafana Cloud
/// hosting forms are recognised.
pub fn cloud_url(output: &str) -> Option<String> {
    CLOUD_URL
        .captures(output)
        .and_then(|captures| captures.name("url"))
        .map(|url| url.as_str().to_string())
}

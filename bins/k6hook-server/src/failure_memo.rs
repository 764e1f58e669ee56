// Last-failure timestamps per run key

use chrono::{DateTime, Utc};
use k6hook_common::RunKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Remembers when each run key last failed so that a controller retrying a
/// failed webhook in a tight loop is turned away instead of relaunching k6.
///
/// Check and record are separate operations; two concurrent requests for the
/// same key can both pass the check.
#[derive(Debug, Default)]
pub struct FailureMemo {
    last_failures: Mutex<HashMap<RunKey, DateTime<Utc>>>,
}

impl FailureMemo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunKey, DateTime<Utc>>> {
        self.last_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, key: &RunKey) {
        self.record_at(key, Utc::now());
    }

    pub fn record_at(&self, key: &RunKey, at: DateTime<Utc>) {
        self.lock().insert(key.clone(), at);
    }

    pub fn last_failure(&self, key: &RunKey) -> Option<DateTime<Utc>> {
        self.lock().get(key).copied()
    }

    /// True when `key` failed less than `min_delay` before `now`
    pub fn too_soon(&self, key: &RunKey, min_delay: Duration, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_failure(key) else {
            return false;
        };
        // A clock that went backwards counts as no time elapsed
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        elapsed < min_delay
    }
}

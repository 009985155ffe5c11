//! Observable runtime state of a model instance
//!
//! Every instance embeds a [`RuntimeTracker`]. It is a pure observability sink:
//! lifecycle code, download pollers and backends all publish into it through
//! [`RuntimeTracker::update`], and the dashboard reads consistent snapshots.
//! It shares no lock with the lifecycle exclusivity lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

pub type JsonMap = BTreeMap<String, serde_json::Value>;

/// Lifecycle phase shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of an instance's lifecycle phase and progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub state: LifecycleState,
    /// Always within 0..=100
    pub progress: u8,
    pub status: String,
    pub details: JsonMap,
    /// Where/how the model is being served, if at all
    pub server: Option<JsonMap>,
    pub downloaded: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeState {
    /// Fresh idle state
    pub fn idle(downloaded: bool) -> Self {
        Self {
            state: LifecycleState::Idle,
            progress: 0,
            status: "Idle".to_string(),
            details: JsonMap::new(),
            server: None,
            downloaded,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Field update that distinguishes "leave untouched" from "set to this value"
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
}

impl<T> Patch<T> {
    fn apply(self, target: &mut T) {
        if let Patch::Set(value) = self {
            *target = value;
        }
    }
}

/// Sparse set of field updates applied atomically by [`RuntimeTracker::update`]
#[derive(Debug, Clone, Default)]
pub struct RuntimeUpdate {
    pub state: Option<LifecycleState>,
    pub progress: Option<f64>,
    pub status: Option<String>,
    pub details: Patch<JsonMap>,
    pub server: Patch<Option<JsonMap>>,
    pub downloaded: Option<bool>,
    pub last_error: Patch<Option<String>>,
}

impl RuntimeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: LifecycleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn progress(mut self, progress: impl Into<f64>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn details(mut self, details: JsonMap) -> Self {
        self.details = Patch::Set(details);
        self
    }

    pub fn server(mut self, server: JsonMap) -> Self {
        self.server = Patch::Set(Some(server));
        self
    }

    pub fn clear_server(mut self) -> Self {
        self.server = Patch::Set(None);
        self
    }

    pub fn downloaded(mut self, downloaded: bool) -> Self {
        self.downloaded = Some(downloaded);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Patch::Set(Some(error.into()));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Patch::Set(None);
        self
    }
}

/// Clamp to 0..=100 and drop the fractional part
pub fn clamp_progress(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.clamp(0.0, 100.0) as u8
}

/// Mutex-guarded runtime record, callable from any thread
#[derive(Debug)]
pub struct RuntimeTracker {
    state: Mutex<RuntimeState>,
}

impl RuntimeTracker {
    pub fn new(downloaded: bool) -> Self {
        Self {
            state: Mutex::new(RuntimeState::idle(downloaded)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        // A panicking writer cannot leave a half-applied update behind: every
        // field is assigned from already-computed values.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply all provided fields at once and stamp `updated_at`
    pub fn update(&self, update: RuntimeUpdate) {
        let mut state = self.lock();
        if let Some(lifecycle) = update.state {
            state.state = lifecycle;
        }
        if let Some(progress) = update.progress {
            state.progress = clamp_progress(progress);
        }
        if let Some(status) = update.status {
            state.status = status;
        }
        update.details.apply(&mut state.details);
        update.server.apply(&mut state.server);
        if let Some(downloaded) = update.downloaded {
            state.downloaded = downloaded;
        }
        update.last_error.apply(&mut state.last_error);
        state.updated_at = Utc::now();
    }

    /// Deep copy of the current record
    pub fn snapshot(&self) -> RuntimeState {
        self.lock().clone()
    }
}

impl Default for RuntimeTracker {
    fn default() -> Self {
        Self::new(false)
    }
}

//! In-memory record of evaluations, optionally mirrored to a JSONL file.

use crate::{EngineError, RuntimeMode, now_millis};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

pub const EVALUATION_LOG_ENV: &str = "PNP_EVALUATION_LOG_PATH";
/// Events kept in memory before the oldest are evicted. The JSONL mirror is
/// unaffected.
pub const MAX_RETAINED_EVENTS: usize = 4096;

static EVALUATION_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_evaluation_log_path(path: Option<PathBuf>) {
    let cell = EVALUATION_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPath {
    Local,
    Remote,
}

impl EvaluationPath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationEvent {
    pub ts_millis: u128,
    pub job: String,
    pub path: EvaluationPath,
    pub mode: RuntimeMode,
    pub outcome: EvaluationOutcome,
    pub reason_code: String,
}

impl EvaluationEvent {
    #[must_use]
    pub fn new(
        job: &str,
        path: EvaluationPath,
        mode: RuntimeMode,
        result: Result<(), &EngineError>,
    ) -> Self {
        let (outcome, reason_code) = match result {
            Ok(()) => (EvaluationOutcome::Pass, "ok".to_string()),
            Err(err) => (EvaluationOutcome::Fail, err.reason_code().to_string()),
        };
        Self {
            ts_millis: now_millis(),
            job: job.to_string(),
            path,
            mode,
            outcome,
            reason_code,
        }
    }
}

#[derive(Debug)]
pub struct EvaluationLedger {
    events: Mutex<VecDeque<EvaluationEvent>>,
    capacity: usize,
    log_failures: Mutex<Vec<String>>,
}

impl Default for EvaluationLedger {
    fn default() -> Self {
        Self::with_capacity(MAX_RETAINED_EVENTS)
    }
}

impl EvaluationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger holding at most `capacity` events (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            log_failures: Mutex::new(Vec::new()),
        }
    }

    /// Keeps the event and appends it to the configured JSONL log. Log
    /// write failures never fail the evaluation; they are kept for
    /// [`Self::log_failures`].
    pub fn record(&self, event: EvaluationEvent) {
        if let Err(err) = maybe_append_evaluation_log(&event) {
            if let Ok(mut failures) = self.log_failures.lock() {
                failures.push(err);
            }
        }
        if let Ok(mut events) = self.events.lock() {
            while events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<EvaluationEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every retained event, oldest first.
    pub fn drain(&self) -> Vec<EvaluationEvent> {
        self.events
            .lock()
            .map(|mut events| events.drain(..).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn last(&self) -> Option<EvaluationEvent> {
        self.events
            .lock()
            .ok()
            .and_then(|events| events.back().cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map_or(0, |events| events.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn log_failures(&self) -> Vec<String> {
        self.log_failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }
}

fn maybe_append_evaluation_log(entry: &EvaluationEvent) -> Result<(), String> {
    let configured = EVALUATION_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(EVALUATION_LOG_ENV).map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing evaluation log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending evaluation log {}: {err}", path.display()))
}

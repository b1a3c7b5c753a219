//! Run records and the per-run log stream.
//!
//! A [`RunHandle`] is the engine's shared view of one run: its mutable
//! record (status, per-test and per-step breakdown), its cancellation token,
//! and its append-only [`RunLog`]. The log assigns a monotonic sequence
//! number to every entry under one lock, so the per-run order is total;
//! subscribers replay the buffer and then follow live appends, deduping on
//! sequence number, which makes the observed order identical regardless of
//! when a subscriber attached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::plugins::ActivityLog;

/// Lifecycle status shared by runs, tests, and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    /// True once no further transition can occur.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Stable uppercase name, as used in log payloads and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// One entry in a run's log stream.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub run_id: String,
    /// Position in the run's total order.
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub level: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    /// Set on the closing marker only; carries the final run status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<RunStatus>,
}

// ============================================================================
// Log stream
// ============================================================================

struct LogBuffer {
    entries: Vec<Arc<LogEntry>>,
    closed: bool,
}

/// Append-only, totally ordered log owned by one run.
pub struct RunLog {
    run_id: String,
    buffer: Mutex<LogBuffer>,
    live: broadcast::Sender<Arc<LogEntry>>,
}

impl RunLog {
    /// Creates an empty open log for `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            run_id: run_id.into(),
            buffer: Mutex::new(LogBuffer {
                entries: Vec::new(),
                closed: false,
            }),
            live,
        }
    }

    /// Appends one entry. Appends after close are dropped (the terminal
    /// marker is final by contract).
    pub fn append(
        &self,
        test_name: Option<String>,
        step_name: Option<String>,
        level: &str,
        payload: Value,
    ) {
        self.push(test_name, step_name, level, payload, None);
    }

    /// Appends the terminal marker and closes the stream.
    pub fn close(&self, final_status: RunStatus) {
        self.push(
            None,
            None,
            "info",
            serde_json::json!({"message": "run finished", "status": final_status.as_str()}),
            Some(final_status),
        );
    }

    fn push(
        &self,
        test_name: Option<String>,
        step_name: Option<String>,
        level: &str,
        payload: Value,
        terminal: Option<RunStatus>,
    ) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buffer.closed {
            return;
        }
        let entry = Arc::new(LogEntry {
            run_id: self.run_id.clone(),
            seq: buffer.entries.len() as u64,
            test_name,
            step_name,
            level: level.to_string(),
            timestamp: Utc::now(),
            payload,
            terminal,
        });
        buffer.entries.push(entry.clone());
        if terminal.is_some() {
            buffer.closed = true;
        }
        // Send under the lock so broadcast order matches buffer order.
        let _ = self.live.send(entry);
    }

    /// All entries appended so far, in order.
    pub fn entries(&self) -> Vec<Arc<LogEntry>> {
        match self.buffer.lock() {
            Ok(buffer) => buffer.entries.clone(),
            Err(poisoned) => poisoned.into_inner().entries.clone(),
        }
    }

    /// Opens a subscription that replays every past entry, then follows live
    /// appends until the terminal marker.
    pub fn subscribe(self: &Arc<Self>) -> LogSubscription {
        let buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        let receiver = self.live.subscribe();
        LogSubscription {
            log: Arc::clone(self),
            backlog: buffer.entries.iter().cloned().collect(),
            receiver,
            next_seq: 0,
            finished: false,
        }
    }
}

/// Reader over one run's log. See [`RunLog::subscribe`].
pub struct LogSubscription {
    log: Arc<RunLog>,
    backlog: VecDeque<Arc<LogEntry>>,
    receiver: broadcast::Receiver<Arc<LogEntry>>,
    next_seq: u64,
    finished: bool,
}

impl LogSubscription {
    /// Next entry in the run's total order, or `None` after the terminal
    /// marker has been delivered.
    pub async fn next(&mut self) -> Option<Arc<LogEntry>> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(entry) = self.backlog.pop_front() {
                if entry.seq < self.next_seq {
                    continue;
                }
                return Some(self.deliver(entry));
            }
            match self.receiver.recv().await {
                Ok(entry) => {
                    if entry.seq < self.next_seq {
                        continue;
                    }
                    return Some(self.deliver(entry));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Refill from the buffer; sequence numbers dedupe any
                    // overlap with entries still queued in the channel.
                    self.backlog = self
                        .log
                        .entries()
                        .into_iter()
                        .filter(|e| e.seq >= self.next_seq)
                        .collect();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, entry: Arc<LogEntry>) -> Arc<LogEntry> {
        self.next_seq = entry.seq + 1;
        if entry.terminal.is_some() {
            self.finished = true;
        }
        entry
    }
}

/// Log sink handed to activities, pre-scoped to a test/step.
pub struct ScopedLog {
    log: Arc<RunLog>,
    test_name: Option<String>,
    step_name: Option<String>,
}

impl ScopedLog {
    /// Scopes `log` to the given test/step names.
    pub fn new(log: Arc<RunLog>, test_name: Option<String>, step_name: Option<String>) -> Self {
        Self {
            log,
            test_name,
            step_name,
        }
    }
}

impl ActivityLog for ScopedLog {
    fn emit(&self, level: &str, payload: Value) {
        self.log.append(
            self.test_name.clone(),
            self.step_name.clone(),
            level,
            payload,
        );
    }
}

// ============================================================================
// Run records
// ============================================================================

/// Record of one executed (or executing) step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub name: String,
    pub plugin: String,
    pub status: RunStatus,
    /// Execute invocations actually made.
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<crate::assertions::AssertionOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saves: Vec<crate::saves::SaveOutcome>,
}

/// Record of one test within a run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestRecord {
    pub name: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub steps: Vec<StepRecord>,
}

/// Snapshot of a run: what GetRun returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub suite_name: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub tests: Vec<TestRecord>,
}

/// Shared, mutable state of one run.
pub struct RunHandle {
    pub run_id: String,
    pub log: Arc<RunLog>,
    /// Cooperative cancellation for the whole run (user cancel or deadline).
    pub cancel: CancellationToken,
    record: Mutex<RunRecord>,
    /// Distinguishes a deadline-driven cancel from a user cancel.
    timed_out: AtomicBool,
    status_tx: watch::Sender<RunStatus>,
}

impl RunHandle {
    /// Creates a PENDING run.
    pub fn new(run_id: impl Into<String>, suite_name: impl Into<String>) -> Arc<Self> {
        let run_id = run_id.into();
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        Arc::new(Self {
            log: Arc::new(RunLog::new(run_id.clone())),
            cancel: CancellationToken::new(),
            record: Mutex::new(RunRecord {
                run_id: run_id.clone(),
                suite_name: suite_name.into(),
                status: RunStatus::Pending,
                started_at: None,
                ended_at: None,
                duration_ms: 0,
                tests: Vec::new(),
            }),
            timed_out: AtomicBool::new(false),
            status_tx,
            run_id,
        })
    }

    /// Applies a mutation to the run record under its lock.
    pub fn update<F: FnOnce(&mut RunRecord)>(&self, mutate: F) {
        let mut record = match self.record.lock() {
            Ok(record) => record,
            Err(poisoned) => poisoned.into_inner(),
        };
        mutate(&mut record);
        let _ = self.status_tx.send(record.status);
    }

    /// Clones the current record.
    pub fn snapshot(&self) -> RunRecord {
        match self.record.lock() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.snapshot().status
    }

    /// Marks the deadline as the cancellation cause and fires the token.
    pub fn trigger_timeout(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// True when cancellation was caused by the deadline.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Transitions to RUNNING and stamps the start time.
    pub fn mark_started(&self) {
        self.update(|record| {
            record.status = RunStatus::Running;
            record.started_at = Some(Utc::now());
        });
    }

    /// Transitions to the terminal status, stamps timings, and closes the
    /// log stream with the terminal marker.
    pub fn finish(&self, status: RunStatus) {
        self.update(|record| {
            record.status = status;
            let ended = Utc::now();
            record.ended_at = Some(ended);
            if let Some(started) = record.started_at {
                record.duration_ms = (ended - started).num_milliseconds().max(0) as u64;
            }
        });
        self.log.close(status);
    }

    /// Resolves once the run reaches a terminal status, returning it.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status_tx.subscribe();
        let current = *rx.borrow();
        if current.is_terminal() {
            return current;
        }
        loop {
            if rx.changed().await.is_err() {
                // Sender lives inside self, so this cannot happen while the
                // handle is alive; treat as the last observed status.
                return *rx.borrow();
            }
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
        }
    }
}

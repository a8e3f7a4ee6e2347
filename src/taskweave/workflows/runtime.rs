//! Deterministic workflow runtime.
//!
//! A workflow is a deterministic async program over a [`WorkflowCtx`]. The
//! only suspension points are [`activity`](WorkflowCtx::activity),
//! [`sleep`](WorkflowCtx::sleep), and
//! [`await_signal`](WorkflowCtx::await_signal); wall-clock reads and fresh
//! ids go through [`side_effect`](WorkflowCtx::side_effect)-backed markers.
//! Workflow code itself performs no I/O, reads no clock, and draws no
//! randomness — all of that lives in activities.
//!
//! Every completed step is appended to a history keyed by a deterministic
//! step key. Replaying a workflow with its recorded history returns the
//! recorded results instead of re-executing side effects, which makes
//! re-execution after a crash (or a test re-run) observationally identical:
//!
//! - a cached activity result (success *or* failure) is returned as-is;
//! - a fired timer returns immediately;
//! - a received signal is replayed from the history;
//! - the event-sequence counter is restored to its post-step value, so
//!   replayed publishes are deduplicated by the bus and live steps continue
//!   the monotonic sequence.
//!
//! Before each activity attempt the event counter is snapshotted; a retry of
//! the same logical step restores the snapshot and therefore re-emits the
//! same logical indexes, which the bus drops — events appear at most once
//! per logical occurrence despite retries.
//!
//! Cancellation: [`WorkflowCtx::cancel`] trips a token observed by every
//! running activity; awaited activities surface [`Error::Canceled`] and the
//! workflow unwinds. Partial state up to the last recorded step remains in
//! the history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::taskweave::activities::{ActivityContext, EventSink};
use crate::taskweave::error::{Error, Result};
use crate::taskweave::event_bus::{EventBus, EventType};
use crate::taskweave::types::WorkflowIdentity;

/// One recorded step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HistoryEntry {
    /// An activity completed successfully with a serialized result.
    ActivityCompleted { result: Value, post_seq: u64 },
    /// An activity failed; the error kind and message are recorded so a
    /// replay reproduces the same classified failure.
    ActivityFailed {
        error_kind: String,
        message: String,
        post_seq: u64,
    },
    /// A workflow timer fired.
    TimerFired,
    /// A signal was consumed, with its payload.
    SignalReceived { payload: Value },
    /// A side-effect marker (deterministic id, recorded wall time).
    Marker { value: Value },
}

/// Replayable history of one workflow run, keyed by step key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    entries: HashMap<String, HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a step key has a recorded outcome.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&HistoryEntry> {
        self.entries.get(key)
    }

    fn record(&mut self, key: String, entry: HistoryEntry) {
        self.entries.insert(key, entry);
    }
}

/// Delivers external signals into a running (or replaying) workflow.
pub struct SignalHub {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    notify: Notify,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Deliver a signal by name.
    pub fn send(&self, name: impl Into<String>, payload: Value) {
        let mut queues = self.queues.lock().expect("signal hub poisoned");
        queues.entry(name.into()).or_default().push_back(payload);
        drop(queues);
        self.notify.notify_waiters();
    }

    async fn recv(&self, name: &str) -> Value {
        loop {
            let notified = self.notify.notified();
            {
                let mut queues = self.queues.lock().expect("signal hub poisoned");
                if let Some(queue) = queues.get_mut(name) {
                    if let Some(payload) = queue.pop_front() {
                        return payload;
                    }
                }
            }
            notified.await;
        }
    }
}

/// Execution context handed to a workflow program.
pub struct WorkflowCtx {
    pub identity: WorkflowIdentity,
    events: EventSink,
    history: Mutex<History>,
    signals: Arc<SignalHub>,
    cancel: CancellationToken,
}

impl WorkflowCtx {
    /// Create a fresh run with an empty history.
    pub fn new(identity: WorkflowIdentity, bus: Arc<EventBus>) -> Self {
        Self::with_history(identity, bus, History::new())
    }

    /// Create a run that replays the given history.
    pub fn with_history(identity: WorkflowIdentity, bus: Arc<EventBus>, history: History) -> Self {
        let events = EventSink::new(bus, identity.workflow_id.clone());
        Self {
            identity,
            events,
            history: Mutex::new(history),
            signals: Arc::new(SignalHub::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The event sink; workflow steps emit through this.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Emit an event from workflow code.
    pub fn emit(&self, event_type: EventType, message: impl Into<String>) {
        self.events.emit(event_type, message);
    }

    /// Emit an event with attribution and payload from workflow code.
    pub fn emit_with(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        agent_id: Option<&str>,
        payload: Option<Value>,
    ) {
        self.events.emit_with(event_type, message, agent_id, payload);
    }

    /// Handle for delivering signals from outside the workflow.
    pub fn signals(&self) -> Arc<SignalHub> {
        Arc::clone(&self.signals)
    }

    /// Cancellation token shared with all activities of this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the run: running activities observe it and surface
    /// [`Error::Canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot the history (e.g. to persist it or replay in tests).
    pub fn history_snapshot(&self) -> History {
        self.history.lock().expect("history poisoned").clone()
    }

    fn lookup(&self, key: &str) -> Option<HistoryEntry> {
        self.history.lock().expect("history poisoned").get(key).cloned()
    }

    fn record(&self, key: &str, entry: HistoryEntry) {
        self.history
            .lock()
            .expect("history poisoned")
            .record(key.to_string(), entry);
    }

    /// Run an activity (attempt 1) under the step key `key`.
    pub async fn activity<T, F, Fut>(&self, key: &str, run: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ActivityContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.activity_attempt(key, 1, run).await
    }

    /// Run an activity with an explicit attempt number. The attempt is part
    /// of the step key and of the activity's idempotency key, so each retry
    /// is its own recorded step while re-emitting the same event indexes.
    pub async fn activity_attempt<T, F, Fut>(&self, key: &str, attempt: u32, run: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ActivityContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let step_key = if attempt <= 1 {
            format!("activity:{}", key)
        } else {
            format!("activity:{}#{}", key, attempt)
        };

        if let Some(entry) = self.lookup(&step_key) {
            return match entry {
                HistoryEntry::ActivityCompleted { result, post_seq } => {
                    self.events.restore(post_seq);
                    serde_json::from_value(result).map_err(Error::from)
                }
                HistoryEntry::ActivityFailed {
                    error_kind,
                    message,
                    post_seq,
                } => {
                    self.events.restore(post_seq);
                    Err(error_from_kind(&error_kind, &message))
                }
                _ => Err(Error::other(format!(
                    "history entry for {} is not an activity",
                    step_key
                ))),
            };
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let snapshot = self.events.snapshot();
        let activity_ctx = ActivityContext::new(self.identity.clone(), key, self.events.clone())
            .with_attempt(attempt)
            .with_cancel(self.cancel.clone());

        match run(activity_ctx).await {
            Ok(value) => {
                let result = serde_json::to_value(&value)?;
                self.record(
                    &step_key,
                    HistoryEntry::ActivityCompleted {
                        result,
                        post_seq: self.events.snapshot(),
                    },
                );
                Ok(value)
            }
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(err) => {
                let post_seq = self.events.snapshot();
                self.record(
                    &step_key,
                    HistoryEntry::ActivityFailed {
                        error_kind: err.kind().to_string(),
                        message: err.to_string(),
                        post_seq,
                    },
                );
                // Restore the counter so a retry re-emits the same indexes,
                // which the bus then deduplicates.
                self.events.restore(snapshot);
                Err(err)
            }
        }
    }

    /// Workflow-timer sleep. Replays return immediately.
    pub async fn sleep(&self, key: &str, duration: Duration) -> Result<()> {
        let step_key = format!("timer:{}", key);
        if self.lookup(&step_key).is_some() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Canceled),
            _ = tokio::time::sleep(duration) => {}
        }
        self.record(&step_key, HistoryEntry::TimerFired);
        Ok(())
    }

    /// Await a signal named `name`, recording it under the step key `key`
    /// (keys must be unique per await; names may repeat across rounds).
    pub async fn await_signal_keyed(&self, key: &str, name: &str) -> Result<Value> {
        let step_key = format!("signal:{}", key);
        if let Some(HistoryEntry::SignalReceived { payload }) = self.lookup(&step_key) {
            return Ok(payload);
        }
        let payload = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Canceled),
            payload = self.signals.recv(name) => payload,
        };
        self.record(&step_key, HistoryEntry::SignalReceived { payload: payload.clone() });
        Ok(payload)
    }

    /// Await a signal whose name doubles as its step key.
    pub async fn await_signal(&self, name: &str) -> Result<Value> {
        self.await_signal_keyed(name, name).await
    }

    /// Record-once side effect: computed on first execution, replayed from
    /// the marker afterwards. The only sanctioned way for workflow code to
    /// obtain wall time or fresh ids.
    pub fn side_effect<F>(&self, key: &str, compute: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        let step_key = format!("marker:{}", key);
        if let Some(HistoryEntry::Marker { value }) = self.lookup(&step_key) {
            return value;
        }
        let value = compute();
        self.record(&step_key, HistoryEntry::Marker { value: value.clone() });
        value
    }

    /// Deterministic fresh id.
    pub fn new_id(&self, key: &str) -> String {
        self.side_effect(key, || Value::String(uuid::Uuid::new_v4().to_string()))
            .as_str()
            .expect("id marker is a string")
            .to_string()
    }

    /// Deterministic wall-clock timestamp (RFC 3339).
    pub fn wall_time(&self, key: &str) -> String {
        self.side_effect(key, || Value::String(chrono::Utc::now().to_rfc3339()))
            .as_str()
            .expect("time marker is a string")
            .to_string()
    }
}

/// Reconstruct a classified error from its recorded kind.
fn error_from_kind(kind: &str, message: &str) -> Error {
    match kind {
        "budget_denied" => Error::BudgetDenied(message.to_string()),
        "circuit_open" => Error::CircuitOpen(message.to_string()),
        "timeout" => Error::Timeout(Duration::ZERO),
        "canceled" => Error::Canceled,
        "upstream_5xx" => Error::UpstreamStatus {
            status: 500,
            excerpt: message.to_string(),
        },
        "upstream_4xx" => Error::UpstreamStatus {
            status: 400,
            excerpt: message.to_string(),
        },
        "decode" => Error::Decode {
            context: "replayed".to_string(),
            excerpt: message.to_string(),
        },
        "persistence" => Error::Persistence(message.to_string()),
        "store" => Error::Store(message.to_string()),
        "config" => Error::Config(message.to_string()),
        "invalid_input" => Error::InvalidInput(message.to_string()),
        _ => Error::Other(message.to_string()),
    }
}

//! Side-effectful activity steps.
//!
//! Activities are the only place the orchestrator touches the outside world:
//! HTTP calls to the LLM/embeddings/vector services, store writes, event
//! emission. Each activity performs at most one kind of external call, reads
//! its deadline from [`ActivityTimeouts`], records pre/post-call heartbeats,
//! and returns typed results; the caller classifies errors as retryable or
//! fatal via [`Error::is_retryable`].
//!
//! Dependencies are explicit: everything an activity needs lives on the
//! [`ActivityRegistry`], which is constructed once at boot and shared. There
//! are no process-wide singletons.
//!
//! Submodules implement the individual activities:
//!
//! - [`decompose`]: query → subtask plan
//! - [`agent`]: per-subtask agent execution and the autonomous loop step
//! - [`synthesis`]: result synthesis with language matching and citations
//! - [`verify`]: claim verification against citations
//! - [`coverage`]: iterative-research coverage evaluation with guardrails
//! - [`search`]: search route construction and result merging (pure)
//! - [`review`]: HITL research-plan generation and review state
//! - [`compress`]: session history compression
//!
//! [`ActivityTimeouts`]: crate::taskweave::config::ActivityTimeouts
//! [`Error::is_retryable`]: crate::taskweave::error::Error::is_retryable

pub mod agent;
pub mod compress;
pub mod coverage;
pub mod decompose;
pub mod review;
pub mod search;
pub mod synthesis;
pub mod verify;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::taskweave::budget::BudgetManager;
use crate::taskweave::config::TaskweaveConfig;
use crate::taskweave::context::CorrelationContext;
use crate::taskweave::error::{Error, Result};
use crate::taskweave::event_bus::{EventBus, EventType, WorkflowEvent};
use crate::taskweave::memory::MemoryService;
use crate::taskweave::persistence::PersistenceQueue;
use crate::taskweave::stores::{KvStore, LlmService};
use crate::taskweave::types::{UsageRecord, WorkflowIdentity};

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Publishes events for one workflow with logical indexes drawn from a
/// shared monotonic counter.
///
/// The counter is owned by the workflow run; before each activity the
/// workflow snapshots it and restores the snapshot on retry, so a retried
/// activity re-emits the *same* logical indexes and the bus's
/// `(workflow_id, seq)` dedup keeps every occurrence at-most-once on the
/// client stream.
#[derive(Clone)]
pub struct EventSink {
    bus: Arc<EventBus>,
    workflow_id: String,
    seq: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink starting at logical index 1.
    pub fn new(bus: Arc<EventBus>, workflow_id: impl Into<String>) -> Self {
        Self {
            bus,
            workflow_id: workflow_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit a plain event.
    pub fn emit(&self, event_type: EventType, message: impl Into<String>) {
        self.emit_with(event_type, message, None, None);
    }

    /// Emit an event with optional agent attribution and payload.
    pub fn emit_with(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        agent_id: Option<&str>,
        payload: Option<Value>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut event = WorkflowEvent::new(&self.workflow_id, event_type, message).with_seq(seq);
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        if let Some(payload) = payload {
            event = event.with_payload(payload);
        }
        self.bus.publish(event);
    }

    /// Current counter value, for pre-activity snapshots.
    pub fn snapshot(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Restore a snapshot before retrying an activity.
    pub fn restore(&self, snapshot: u64) {
        self.seq.store(snapshot, Ordering::SeqCst);
    }

    /// Workflow this sink publishes for.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

// ---------------------------------------------------------------------------
// Activity context
// ---------------------------------------------------------------------------

/// Ambient context of one activity execution.
pub struct ActivityContext {
    pub identity: WorkflowIdentity,
    /// Deterministic activity id within the workflow (e.g. `"agent-s1"`).
    pub activity_id: String,
    /// 1-based attempt counter; part of the idempotency key.
    pub attempt: u32,
    /// Cancellation is observed between and during external calls.
    pub cancel: CancellationToken,
    /// Event sink shared with the owning workflow run.
    pub events: EventSink,
    last_heartbeat: Mutex<Instant>,
}

impl ActivityContext {
    /// Create a context for attempt 1.
    pub fn new(
        identity: WorkflowIdentity,
        activity_id: impl Into<String>,
        events: EventSink,
    ) -> Self {
        Self {
            identity,
            activity_id: activity_id.into(),
            attempt: 1,
            cancel: CancellationToken::new(),
            events,
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    /// Builder: set the attempt counter.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Builder: share a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record a heartbeat. Long activities call this before and after their
    /// external call so a supervisor can detect stalls.
    pub fn heartbeat(&self, note: &str) {
        let mut last = self.last_heartbeat.lock().expect("heartbeat lock poisoned");
        *last = Instant::now();
        log::debug!(
            "heartbeat {}/{} attempt {}: {}",
            self.identity.workflow_id,
            self.activity_id,
            self.attempt,
            note
        );
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .elapsed()
    }

    /// Idempotency key of this execution: workflow + activity + attempt.
    pub fn idempotency_key(&self) -> String {
        crate::taskweave::types::usage_idempotency_key(
            &self.identity.workflow_id,
            &self.activity_id,
            self.attempt,
        )
    }

    /// Correlation headers for outbound HTTP from this activity.
    pub fn correlation(&self, agent_id: Option<&str>) -> CorrelationContext {
        let mut correlation = CorrelationContext::for_workflow(&self.identity.workflow_id);
        if let Some(agent_id) = agent_id {
            correlation = correlation.with_agent(agent_id);
        }
        correlation
    }
}

/// Await `future` with a deadline, observing the activity's cancellation
/// token. Cancellation surfaces as [`Error::Canceled`]; a deadline overrun
/// surfaces as the retryable [`Error::Timeout`].
pub async fn bounded<T, F>(ctx: &ActivityContext, deadline: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(Error::Canceled),
        outcome = tokio::time::timeout(deadline, future) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        },
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff with jitter for retryable upstream failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Jitter fraction in `[0,1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for fatal-on-first-failure activities.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, retry_index: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(retry_index as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Run `operation` with bounded retries. Only errors for which
/// [`Error::is_retryable`] holds are retried; the closure receives the
/// 1-based attempt number so callers can thread it into idempotency keys.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                log::warn!(
                    "attempt {} failed ({}), retrying in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit dependency bundle for every activity.
///
/// Constructed at boot, shared as `Arc<ActivityRegistry>` between workflow
/// runs and torn down at shutdown.
pub struct ActivityRegistry {
    pub(crate) config: TaskweaveConfig,
    pub(crate) llm: Arc<dyn LlmService>,
    pub(crate) memory: Arc<MemoryService>,
    pub(crate) budget: Arc<BudgetManager>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) persistence: Arc<PersistenceQueue>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) retry: RetryPolicy,
    pub(crate) decomposition_errors_total: AtomicU64,
    pub(crate) decomposition_latency_ms_total: AtomicU64,
    pub(crate) decomposition_count: AtomicU64,
}

impl ActivityRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TaskweaveConfig,
        llm: Arc<dyn LlmService>,
        memory: Arc<MemoryService>,
        budget: Arc<BudgetManager>,
        bus: Arc<EventBus>,
        persistence: Arc<PersistenceQueue>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            llm,
            memory,
            budget,
            bus,
            persistence,
            kv,
            retry: RetryPolicy::default(),
            decomposition_errors_total: AtomicU64::new(0),
            decomposition_latency_ms_total: AtomicU64::new(0),
            decomposition_count: AtomicU64::new(0),
        }
    }

    /// Builder: override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The event bus activities and workflows publish to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The budget control plane.
    pub fn budget(&self) -> &Arc<BudgetManager> {
        &self.budget
    }

    /// The memory layer.
    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    /// The effective configuration.
    pub fn config(&self) -> &TaskweaveConfig {
        &self.config
    }

    /// Total decomposition failures, for diagnostics.
    pub fn decomposition_errors(&self) -> u64 {
        self.decomposition_errors_total.load(Ordering::Relaxed)
    }

    /// Mean decomposition latency in milliseconds, for diagnostics.
    pub fn decomposition_latency_mean_ms(&self) -> f64 {
        let count = self.decomposition_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.decomposition_latency_ms_total.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Record usage against the budget ledgers. A duplicate idempotency key
    /// is a no-op, so replays and retries are safe.
    pub fn record_usage(&self, record: &UsageRecord) {
        self.budget.record_usage(record);
    }

    /// Fetch conditioning memory for a query.
    pub async fn fetch_memory(
        &self,
        ctx: &ActivityContext,
        request: &crate::taskweave::memory::RetrievalRequest,
    ) -> Result<Vec<crate::taskweave::memory::MemoryHit>> {
        ctx.heartbeat("memory:fetch");
        let hits = self.memory.retrieve(request).await?;
        ctx.heartbeat("memory:done");
        Ok(hits)
    }
}

//! Workflow event streaming fabric.
//!
//! An in-process publish/subscribe bus keyed by workflow id. Workflow steps
//! publish typed [`WorkflowEvent`]s carrying a monotonically increasing
//! logical index ([`WorkflowEvent::seq`]); clients subscribe to a workflow and
//! observe execution in real time.
//!
//! Guarantees:
//!
//! - **At-most-once per `(workflow_id, seq)`**: a republished logical index
//!   (e.g. from a replayed or retried step) is dropped, so retries never
//!   duplicate events on the client stream.
//! - **Non-blocking publish**: publishing takes only short in-memory critical
//!   sections and never waits on a subscriber.
//! - **Bounded subscriber queues**: when a subscriber queue overflows, the
//!   oldest queued events are dropped and the subscriber is marked lossy; the
//!   next delivery carries [`EventDelivery::lossy`] so the client can detect
//!   the gap (the `seq` numbers also make gaps visible).
//! - **Cursor restart**: a bounded ring of recent events per workflow lets a
//!   client resubscribe from a logical index via [`EventBus::subscribe_from`].
//!
//! Dropping a [`Subscription`] releases its resources; terminal workflows are
//! cleaned up with [`EventBus::remove_workflow`].
//!
//! # Example
//!
//! ```rust
//! use taskweave::event_bus::{EventBus, EventType, WorkflowEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new();
//! let mut sub = bus.subscribe("wf-1");
//!
//! bus.publish(WorkflowEvent::new("wf-1", EventType::WorkflowStarted, "started").with_seq(1));
//!
//! let delivery = sub.recv().await.unwrap();
//! assert_eq!(delivery.event.seq, 1);
//! assert!(!delivery.lossy);
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Default bound on each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Default number of recent events retained per workflow for cursor restarts.
pub const DEFAULT_RETENTION: usize = 512;

/// Closed set of event types emitted by workflows and activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Lifecycle
    WorkflowStarted,
    WorkflowCompleted,
    AgentStarted,
    AgentCompleted,
    // Errors
    ErrorOccurred,
    ErrorRecovery,
    // Messaging
    MessageSent,
    MessageReceived,
    WorkspaceUpdated,
    // Team coordination
    TeamRecruited,
    TeamRetired,
    RoleAssigned,
    Delegation,
    DependencySatisfied,
    // UX
    ToolInvoked,
    AgentThinking,
    TeamStatus,
    Progress,
    DataProcessing,
    Waiting,
    // LLM
    LlmPrompt,
    LlmPartial,
    LlmOutput,
    ToolObservation,
    // Approval
    ApprovalRequested,
    ApprovalDecision,
}

/// A single event on the stream. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Workflow this event belongs to.
    pub workflow_id: String,
    /// Event type from the closed taxonomy.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Agent that produced the event, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Structured payload, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Wall-clock publication timestamp.
    pub timestamp: DateTime<Utc>,
    /// Monotonically increasing logical index assigned by the producing
    /// workflow step. The bus deduplicates on `(workflow_id, seq)`.
    pub seq: u64,
}

impl WorkflowEvent {
    /// Create an event with `seq = 0`; producers assign the logical index via
    /// [`with_seq`](WorkflowEvent::with_seq).
    pub fn new(
        workflow_id: impl Into<String>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            event_type,
            agent_id: None,
            message: message.into(),
            payload: None,
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    /// Builder: attribute the event to an agent.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Builder: attach a structured payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builder: set the logical index.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// One delivered event plus the subscriber's loss marker.
///
/// `lossy` is `true` on the first delivery after the subscriber's queue
/// overflowed and dropped events; it resets afterwards.
#[derive(Debug, Clone)]
pub struct EventDelivery {
    pub event: Arc<WorkflowEvent>,
    pub lossy: bool,
}

struct QueueState {
    queue: VecDeque<Arc<WorkflowEvent>>,
    lossy: bool,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                lossy: false,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an event, dropping the oldest entry on overflow.
    fn push(&self, event: Arc<WorkflowEvent>) -> bool {
        let mut state = self.state.lock().expect("subscriber queue poisoned");
        if state.closed {
            return false;
        }
        state.queue.push_back(event);
        if state.queue.len() > self.capacity {
            state.queue.pop_front();
            state.lossy = true;
        }
        drop(state);
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("subscriber queue poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }
}

struct Topic {
    /// Logical indexes already published, for at-most-once delivery.
    seen: HashSet<u64>,
    /// Bounded ring of recent events for cursor restarts.
    buffer: VecDeque<Arc<WorkflowEvent>>,
    subscribers: Vec<Arc<SubscriberQueue>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

/// In-process pub/sub of typed events keyed by workflow id.
pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
    subscriber_capacity: usize,
    retention: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with default capacity and retention.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_RETENTION)
    }

    /// Create a bus with explicit per-subscriber capacity and per-workflow
    /// retention.
    pub fn with_capacity(subscriber_capacity: usize, retention: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            subscriber_capacity: subscriber_capacity.max(1),
            retention: retention.max(1),
        }
    }

    /// Publish an event. Best-effort and non-blocking: the call only takes
    /// short in-memory critical sections. A duplicate `(workflow_id, seq)` is
    /// silently dropped so retried steps never duplicate events.
    pub fn publish(&self, event: WorkflowEvent) {
        let mut topics = self.topics.lock().expect("event bus poisoned");
        let topic = topics
            .entry(event.workflow_id.clone())
            .or_insert_with(Topic::new);

        if !topic.seen.insert(event.seq) {
            log::debug!(
                "dropping duplicate event seq={} for workflow {}",
                event.seq,
                event.workflow_id
            );
            return;
        }

        let event = Arc::new(event);
        topic.buffer.push_back(Arc::clone(&event));
        while topic.buffer.len() > self.retention {
            topic.buffer.pop_front();
        }

        topic
            .subscribers
            .retain(|subscriber| subscriber.push(Arc::clone(&event)));
    }

    /// Subscribe to a workflow's live event stream.
    pub fn subscribe(&self, workflow_id: impl Into<String>) -> Subscription {
        self.subscribe_inner(workflow_id.into(), None)
    }

    /// Subscribe starting from a logical index: retained events with
    /// `seq >= cursor` are replayed into the new subscription first.
    pub fn subscribe_from(&self, workflow_id: impl Into<String>, cursor: u64) -> Subscription {
        self.subscribe_inner(workflow_id.into(), Some(cursor))
    }

    fn subscribe_inner(&self, workflow_id: String, cursor: Option<u64>) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.subscriber_capacity));
        let mut topics = self.topics.lock().expect("event bus poisoned");
        let topic = topics.entry(workflow_id.clone()).or_insert_with(Topic::new);
        if let Some(cursor) = cursor {
            for event in topic.buffer.iter().filter(|e| e.seq >= cursor) {
                queue.push(Arc::clone(event));
            }
        }
        topic.subscribers.push(Arc::clone(&queue));
        Subscription { queue, workflow_id }
    }

    /// Drop all state for a terminal workflow: retained buffer, dedup set,
    /// and every open subscription (their `recv` returns `None`).
    pub fn remove_workflow(&self, workflow_id: &str) {
        let removed = {
            let mut topics = self.topics.lock().expect("event bus poisoned");
            topics.remove(workflow_id)
        };
        if let Some(topic) = removed {
            for subscriber in topic.subscribers {
                subscriber.close();
            }
        }
    }

    /// Number of workflows with live state, for diagnostics.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("event bus poisoned").len()
    }

    /// Forward a workflow's events to an [`EventHandler`] on a background
    /// task. The task ends when the workflow is removed from the bus.
    pub fn attach_handler(
        self: &Arc<Self>,
        workflow_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let mut subscription = self.subscribe(workflow_id);
        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                handler.on_event(&delivery.event).await;
            }
        })
    }
}

/// A live subscription to one workflow's events.
///
/// Dropping the subscription unsubscribes and releases its queue; the bus
/// prunes the dead entry on the next publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    workflow_id: String,
}

impl Subscription {
    /// Await the next event. Returns `None` once the workflow was removed
    /// from the bus and the queue has drained.
    pub async fn recv(&mut self) -> Option<EventDelivery> {
        loop {
            {
                let mut state = self.queue.state.lock().expect("subscriber queue poisoned");
                if let Some(event) = state.queue.pop_front() {
                    let lossy = state.lossy;
                    state.lossy = false;
                    return Some(EventDelivery { event, lossy });
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Subscription::recv).
    pub fn try_recv(&mut self) -> Option<EventDelivery> {
        let mut state = self.queue.state.lock().expect("subscriber queue poisoned");
        state.queue.pop_front().map(|event| {
            let lossy = state.lossy;
            state.lossy = false;
            EventDelivery { event, lossy }
        })
    }

    /// Workflow this subscription observes.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Callback-style observer over the event stream.
///
/// The default implementation is a no-op, so handlers only override what they
/// care about. Register with [`EventBus::attach_handler`]; the handler is
/// shared as `Arc<dyn EventHandler>` across tasks, so internal state must use
/// appropriate synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event delivered from the subscribed workflow.
    async fn on_event(&self, _event: &WorkflowEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(workflow_id: &str, seq: u64) -> WorkflowEvent {
        WorkflowEvent::new(workflow_id, EventType::Progress, format!("step {}", seq))
            .with_seq(seq)
    }

    #[tokio::test]
    async fn test_duplicate_seq_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("wf");
        bus.publish(event("wf", 1));
        bus.publish(event("wf", 1));
        bus.publish(event("wf", 2));

        assert_eq!(sub.recv().await.unwrap().event.seq, 1);
        assert_eq!(sub.recv().await.unwrap().event.seq, 2);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_marks_lossy_before_next_delivery() {
        let bus = EventBus::with_capacity(2, 16);
        let mut sub = bus.subscribe("wf");
        for seq in 1..=4 {
            bus.publish(event("wf", seq));
        }
        // Capacity 2: events 1 and 2 were dropped.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.event.seq, 3);
        assert!(first.lossy);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.event.seq, 4);
        assert!(!second.lossy);
    }

    #[tokio::test]
    async fn test_subscribe_from_cursor() {
        let bus = EventBus::new();
        for seq in 1..=5 {
            bus.publish(event("wf", seq));
        }
        let mut sub = bus.subscribe_from("wf", 3);
        assert_eq!(sub.recv().await.unwrap().event.seq, 3);
        assert_eq!(sub.recv().await.unwrap().event.seq, 4);
        assert_eq!(sub.recv().await.unwrap().event.seq, 5);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_remove_workflow_closes_subscribers() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("wf");
        bus.publish(event("wf", 1));
        bus.remove_workflow("wf");
        assert_eq!(sub.recv().await.unwrap().event.seq, 1);
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::LlmPrompt).unwrap();
        assert_eq!(json, "\"LLM_PROMPT\"");
        let json = serde_json::to_string(&EventType::WorkflowStarted).unwrap();
        assert_eq!(json, "\"WORKFLOW_STARTED\"");
        let json = serde_json::to_string(&EventType::ApprovalRequested).unwrap();
        assert_eq!(json, "\"APPROVAL_REQUESTED\"");
    }
}

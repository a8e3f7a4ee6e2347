//! Write-behind persistence for execution records.
//!
//! Agent and tool execution records are persisted asynchronously through a
//! bounded queue so that recording never blocks — and never fails — a
//! workflow step. Enqueue returns immediately; the commit outcome is
//! delivered to an optional callback. When the queue is full the enqueue
//! returns an error, the caller logs a warning, and the step still succeeds.
//!
//! Producer-supplied ids are respected (they correlate an agent execution
//! with its tool executions); otherwise a fresh id is assigned at enqueue
//! time so the caller can observe it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::taskweave::error::{Error, Result};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Persisted row for one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionRow {
    /// Correlation id; producer-supplied values are respected.
    pub id: String,
    pub workflow_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub response_excerpt: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted row for one tool execution, linked to its agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRow {
    pub id: String,
    /// Id of the owning agent execution row.
    pub agent_execution_id: String,
    pub workflow_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Typed write requests accepted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteRequest {
    AgentExecution(AgentExecutionRow),
    ToolExecution(ToolExecutionRow),
}

impl WriteRequest {
    /// Correlation id of the wrapped row.
    pub fn id(&self) -> &str {
        match self {
            WriteRequest::AgentExecution(row) => &row.id,
            WriteRequest::ToolExecution(row) => &row.id,
        }
    }

    fn assign_id_if_missing(&mut self) {
        let id = match self {
            WriteRequest::AgentExecution(row) => &mut row.id,
            WriteRequest::ToolExecution(row) => &mut row.id,
        };
        if id.trim().is_empty() {
            *id = Uuid::new_v4().to_string();
        }
    }
}

/// The relational store consumed by the write-behind queue.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Commit one write request.
    async fn write(&self, request: &WriteRequest) -> Result<()>;

    /// Look up the agent execution rows recorded for a workflow.
    async fn task_executions(&self, workflow_id: &str) -> Result<Vec<AgentExecutionRow>>;
}

/// Callback invoked with the commit outcome of one write.
pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct Job {
    request: WriteRequest,
    callback: Option<CommitCallback>,
}

/// Bounded write-behind queue in front of a [`RelationalStore`].
///
/// Dropping the queue stops the worker after it drains outstanding jobs.
pub struct PersistenceQueue {
    tx: mpsc::Sender<Job>,
}

impl PersistenceQueue {
    /// Spawn the queue worker against `store` with the default capacity.
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self::with_capacity(store, DEFAULT_QUEUE_CAPACITY)
    }

    /// Spawn the queue worker with an explicit capacity bound.
    pub fn with_capacity(store: Arc<dyn RelationalStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = store.write(&job.request).await;
                if let Err(ref err) = outcome {
                    log::warn!(
                        "write-behind commit failed for {}: {}",
                        job.request.id(),
                        err
                    );
                }
                if let Some(callback) = job.callback {
                    callback(outcome);
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a write. Returns the correlation id of the request on
    /// success; a full queue returns [`Error::Persistence`] and the caller
    /// proceeds (persistence is non-critical).
    pub fn enqueue(
        &self,
        mut request: WriteRequest,
        callback: Option<CommitCallback>,
    ) -> Result<String> {
        request.assign_id_if_missing();
        let id = request.id().to_string();
        self.tx
            .try_send(Job { request, callback })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    Error::persistence("write-behind queue full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::persistence("write-behind queue stopped")
                }
            })?;
        Ok(id)
    }
}

/// In-memory [`RelationalStore`] for tests and local runs.
#[derive(Default)]
pub struct InMemoryRelationalStore {
    agent_rows: std::sync::Mutex<Vec<AgentExecutionRow>>,
    tool_rows: std::sync::Mutex<Vec<ToolExecutionRow>>,
}

impl InMemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the tool execution rows, for tests.
    pub fn tool_rows(&self) -> Vec<ToolExecutionRow> {
        self.tool_rows.lock().expect("store poisoned").clone()
    }

    /// Number of committed agent execution rows.
    pub fn agent_row_count(&self) -> usize {
        self.agent_rows.lock().expect("store poisoned").len()
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn write(&self, request: &WriteRequest) -> Result<()> {
        match request {
            WriteRequest::AgentExecution(row) => {
                self.agent_rows.lock().expect("store poisoned").push(row.clone());
            }
            WriteRequest::ToolExecution(row) => {
                self.tool_rows.lock().expect("store poisoned").push(row.clone());
            }
        }
        Ok(())
    }

    async fn task_executions(&self, workflow_id: &str) -> Result<Vec<AgentExecutionRow>> {
        Ok(self
            .agent_rows
            .lock()
            .expect("store poisoned")
            .iter()
            .filter(|row| row.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn agent_row(id: &str, workflow_id: &str) -> AgentExecutionRow {
        AgentExecutionRow {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            agent_id: "agent-1".into(),
            task_id: "task-1".into(),
            response_excerpt: String::new(),
            input_tokens: 10,
            output_tokens: 20,
            model: "gpt-4o".into(),
            provider: "openai".into(),
            duration_ms: 5,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_commits_and_calls_back() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let queue = PersistenceQueue::new(store.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();

        queue
            .enqueue(
                WriteRequest::AgentExecution(agent_row("row-1", "wf-1")),
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome.is_ok());
                })),
            )
            .unwrap();

        assert!(rx.await.unwrap());
        assert_eq!(store.task_executions("wf-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_id_assigned() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let queue = PersistenceQueue::new(store);
        let id = queue
            .enqueue(WriteRequest::AgentExecution(agent_row("", "wf-1")), None)
            .unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_producer_id_respected() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let queue = PersistenceQueue::new(store);
        let id = queue
            .enqueue(
                WriteRequest::AgentExecution(agent_row("given-id", "wf-1")),
                None,
            )
            .unwrap();
        assert_eq!(id, "given-id");
    }

    #[tokio::test]
    async fn test_full_queue_errors_without_failing_caller() {
        // A store that never completes keeps the worker busy so the queue
        // fills up.
        struct StallingStore;
        #[async_trait]
        impl RelationalStore for StallingStore {
            async fn write(&self, _request: &WriteRequest) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            async fn task_executions(&self, _workflow_id: &str) -> Result<Vec<AgentExecutionRow>> {
                Ok(Vec::new())
            }
        }

        let queue = PersistenceQueue::with_capacity(Arc::new(StallingStore), 1);
        // First job is picked up by the worker, the next fills the queue.
        let mut saw_full = false;
        for n in 0..4 {
            let outcome = queue.enqueue(
                WriteRequest::AgentExecution(agent_row(&format!("row-{}", n), "wf-1")),
                None,
            );
            if let Err(err) = outcome {
                assert!(matches!(err, Error::Persistence(_)));
                saw_full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_full);
    }
}

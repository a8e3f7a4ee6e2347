//! Contracts consumed from external collaborators.
//!
//! The orchestrator core does not own the LLM inference backend, the vector
//! store, the session store, or the key-value store — it consumes them
//! through the traits in this module. Implementations must be thread-safe
//! (`Send + Sync`) so they can be shared between workflows and activity
//! workers.
//!
//! Two families of implementations ship with the crate:
//!
//! - [`http`]: `reqwest`-backed clients for the LLM agent service and a
//!   vector store with a REST points API, with correlation headers injected
//!   from the ambient workflow context.
//! - [`in_memory`]: reference implementations used by tests and local runs.

pub mod http;
pub mod in_memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::taskweave::context::CorrelationContext;
use crate::taskweave::error::Result;
use crate::taskweave::types::{
    AgentLoopStepInput, AgentLoopStepResult, Citation, DecompositionResult, VerificationResult,
    VerifyBatchResult,
};

// ---------------------------------------------------------------------------
// LLM agent service
// ---------------------------------------------------------------------------

/// Body of `POST /agent/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueryRequest {
    pub query: String,
    /// Open context map; well-known keys include `system_prompt`,
    /// `parent_workflow_id`, `role`, and `model_tier`.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Provider metadata block of an agent query response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentQueryMetadata {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub finish_reason: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

/// Response of `POST /agent/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueryResponse {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub metadata: AgentQueryMetadata,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub model_used: String,
    #[serde(default)]
    pub provider: String,
    /// Tools the agent actually used, when the service reports them.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Detailed tool execution records, when the service reports them.
    #[serde(default)]
    pub tool_executions: Vec<crate::taskweave::types::ToolExecutionRecord>,
}

/// Body of `POST /agent/decompose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeRequest {
    pub query: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mode: String,
}

/// Body of `POST /agent/research-plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlanRequest {
    pub query: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub conversation: Vec<Value>,
}

/// Response of `POST /agent/research-plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlanResponse {
    pub message: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Body of `POST /api/verify_claims`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyClaimsRequest {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Always `true`: V2 three-category classification.
    pub use_v2: bool,
}

/// Body of `POST /api/verify_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyBatchRequest {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Body of `POST /context/compress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressRequest {
    pub messages: Vec<Value>,
    pub target_tokens: u64,
}

/// Response of `POST /context/compress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressResponse {
    pub summary: String,
}

/// The LLM agent service consumed over HTTP.
///
/// One method per endpoint; each takes the ambient [`CorrelationContext`]
/// so implementations can inject the correlation headers.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn query(
        &self,
        request: &AgentQueryRequest,
        correlation: &CorrelationContext,
    ) -> Result<AgentQueryResponse>;

    async fn decompose(
        &self,
        request: &DecomposeRequest,
        correlation: &CorrelationContext,
    ) -> Result<DecompositionResult>;

    async fn loop_step(
        &self,
        request: &AgentLoopStepInput,
        correlation: &CorrelationContext,
    ) -> Result<AgentLoopStepResult>;

    async fn research_plan(
        &self,
        request: &ResearchPlanRequest,
        correlation: &CorrelationContext,
    ) -> Result<ResearchPlanResponse>;

    async fn verify_claims(
        &self,
        request: &VerifyClaimsRequest,
        correlation: &CorrelationContext,
    ) -> Result<VerificationResult>;

    async fn verify_batch(
        &self,
        request: &VerifyBatchRequest,
        correlation: &CorrelationContext,
    ) -> Result<VerifyBatchResult>;

    async fn compress(
        &self,
        request: &CompressRequest,
        correlation: &CorrelationContext,
    ) -> Result<CompressResponse>;
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// One stored vector with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Value,
}

/// Filter applied to vector searches. `None` fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Payload `type` discriminator (e.g. `"qa"`, `"qa_chunk"`, `"summary"`).
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub doc_type: Option<String>,
}

impl SearchFilter {
    /// Filter scoped to a session and tenant.
    pub fn scoped(session_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            tenant_id: Some(tenant_id.into()),
            agent_id: None,
            doc_type: None,
        }
    }

    /// Builder: constrain the payload `type`.
    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    /// Whether a payload satisfies every set constraint.
    pub fn matches(&self, payload: &Value) -> bool {
        let check = |field: &Option<String>, key: &str| match field {
            Some(expected) => payload.get(key).and_then(Value::as_str) == Some(expected.as_str()),
            None => true,
        };
        check(&self.session_id, "session_id")
            && check(&self.tenant_id, "tenant_id")
            && check(&self.agent_id, "agent_id")
            && check(&self.doc_type, "type")
    }
}

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// The vector store consumed by the memory layer.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace points by id. Idempotent.
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Top-k cosine search above `threshold`, constrained by `filter`.
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredPoint>>;
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// The embeddings service consumed by the memory layer.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text into the store's vector space.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// One message in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl SessionMessage {
    /// Create a message timestamped now.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

/// A conversational session with its metadata bag.
///
/// The metadata bag carries compression state and other conversational
/// context under well-known keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            messages: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// The session store consumed by memory retrieval and workflows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Replace the stored session wholesale.
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// Append a message, creating the session when it does not exist yet.
    async fn add_message(&self, session_id: &str, message: SessionMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Key-value store (review state)
// ---------------------------------------------------------------------------

/// Minimal key-value contract used for HITL review state
/// (`review:<workflow_id>` keys with a bounded TTL).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

//! Core data model of the orchestrator.
//!
//! These are the semantic types that flow between workflows, activities, and
//! the control plane: subtask plans, agent execution results, token ledgers,
//! usage records, and the review/compression state machines. Everything here
//! is plain data — behaviour lives in the owning subsystems.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one workflow execution. One workflow ↔ one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    /// Stable workflow identifier, shared across retries of the same task.
    pub workflow_id: String,
    /// Identifier of this particular run of the workflow.
    pub run_id: String,
}

impl WorkflowIdentity {
    /// Create an identity from its two components.
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// One node of the decomposition DAG.
///
/// Subtasks reference each other through [`dependencies`](Subtask::dependencies);
/// independent subtasks may be fanned out in parallel up to the plan's
/// concurrency limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier within the plan.
    pub id: String,
    /// What the agent executing this subtask is asked to do.
    pub description: String,
    /// Ids of subtasks that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Planner's token estimate for this subtask.
    #[serde(default)]
    pub estimated_tokens: u64,
    /// Optional task type hint (e.g. `"research"`, `"calculation"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Artifacts this subtask produces, by name.
    #[serde(default)]
    pub produces: Vec<String>,
    /// Artifacts this subtask consumes, by name.
    #[serde(default)]
    pub consumes: Vec<String>,
    /// Tools the planner suggests for this subtask.
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    /// Parameters keyed by tool name.
    #[serde(default)]
    pub tool_parameters: HashMap<String, Value>,
    /// Persona the agent should adopt, when the planner suggests one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_persona: Option<String>,
    /// Requested output format, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Guidance on which sources to prefer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_guidance: Option<String>,
    /// Search budget (number of queries) for research subtasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_budget: Option<u32>,
    /// Scope boundaries the agent must respect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundaries: Option<String>,
}

impl Subtask {
    /// Create a minimal subtask with an id and description.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            estimated_tokens: 0,
            task_type: None,
            produces: Vec::new(),
            consumes: Vec::new(),
            suggested_tools: Vec::new(),
            tool_parameters: HashMap::new(),
            suggested_persona: None,
            output_format: None,
            source_guidance: None,
            search_budget: None,
            boundaries: None,
        }
    }

    /// Builder: add a dependency on another subtask id.
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Builder: set the token estimate.
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Builder: add a suggested tool.
    pub fn with_suggested_tool(mut self, tool: impl Into<String>) -> Self {
        self.suggested_tools.push(tool.into());
        self
    }
}

/// Result of the decomposition activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionResult {
    /// Planner mode (e.g. `"standard"`, `"deep_research"`).
    pub mode: String,
    /// Planner-assessed complexity in `[0,1]`.
    #[serde(default)]
    pub complexity_score: f64,
    /// Ordered subtask plan; a DAG via each subtask's dependencies.
    pub subtasks: Vec<Subtask>,
    /// Sum of the per-subtask token estimates.
    #[serde(default)]
    pub total_estimated_tokens: u64,
    /// How the plan should be executed (e.g. `"sequential"`, `"parallel"`).
    #[serde(default)]
    pub execution_strategy: String,
    /// Cognitive strategy label from the planner.
    #[serde(default)]
    pub cognitive_strategy: String,
    /// Planner confidence in `[0,1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Strategy to fall back to when the plan fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_strategy: Option<String>,
    /// Per-subtask token estimates keyed by subtask id.
    #[serde(default)]
    pub token_estimates: HashMap<String, u64>,
    /// Maximum number of subtasks the workflow may run concurrently.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
}

fn default_concurrency_limit() -> usize {
    1
}

/// One executed tool call inside an agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// Correlation id; producer-supplied ids are respected on persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool name.
    pub tool_name: String,
    /// JSON parameters the tool was invoked with.
    #[serde(default)]
    pub parameters: Value,
    /// Tool output, when the tool succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Whether the tool call succeeded.
    pub success: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the call in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

/// Result of executing one subtask through the agent service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    /// Agent that produced this result.
    pub agent_id: String,
    /// Final response text.
    pub response: String,
    /// Total tokens billed for this execution.
    pub tokens_used: u64,
    /// Prompt-side tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion-side tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Model that served the request.
    #[serde(default)]
    pub model_used: String,
    /// Provider that served the request.
    #[serde(default)]
    pub provider: String,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Names of tools the agent used.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Detailed tool execution records.
    #[serde(default)]
    pub tool_executions: Vec<ToolExecutionRecord>,
}

impl AgentExecutionResult {
    /// A failed result carrying only the error, for partial-failure reports.
    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            response: String::new(),
            tokens_used: 0,
            input_tokens: 0,
            output_tokens: 0,
            model_used: String::new(),
            provider: String::new(),
            duration_ms: 0,
            success: false,
            error: Some(error.into()),
            tools_used: Vec::new(),
            tool_executions: Vec::new(),
        }
    }
}

/// One integer token ledger with its limit semantics.
///
/// Invariants: `used >= 0` (enforced by the unsigned type) and, when
/// `hard_limit` is set, any recording that would push `used` past `budget`
/// is clamped by the budget manager's admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Total tokens granted to this scope.
    pub budget: u64,
    /// Tokens consumed so far.
    pub used: u64,
    /// Whether exceeding `budget` blocks further steps.
    pub hard_limit: bool,
    /// Fraction of `budget` at which warnings are recorded.
    pub warning_threshold: f64,
}

impl TokenBudget {
    /// Create a ledger with nothing used yet.
    pub fn new(budget: u64, hard_limit: bool, warning_threshold: f64) -> Self {
        Self {
            budget,
            used: 0,
            hard_limit,
            warning_threshold,
        }
    }

    /// Tokens still available, saturating at zero.
    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.used)
    }

    /// Utilisation that admitting `estimated` additional tokens would reach.
    ///
    /// ```
    /// use taskweave::types::TokenBudget;
    ///
    /// let mut ledger = TokenBudget::new(1000, true, 0.8);
    /// ledger.used = 700;
    /// assert!((ledger.projected_utilization(100) - 0.8).abs() < 1e-9);
    /// ```
    pub fn projected_utilization(&self, estimated: u64) -> f64 {
        if self.budget == 0 {
            return 1.0;
        }
        (self.used + estimated) as f64 / self.budget as f64
    }

    /// Whether admitting `estimated` tokens would exceed a hard limit.
    pub fn would_exceed(&self, estimated: u64) -> bool {
        self.hard_limit && self.used + estimated > self.budget
    }
}

/// A usage row recorded after an agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub session_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub model: String,
    /// Provider; derived from the model name when empty.
    #[serde(default)]
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `workflow_id + activity_id + attempt`. Duplicate keys MUST NOT
    /// double-count on any ledger.
    pub idempotency_key: String,
}

impl UsageRecord {
    /// Total tokens in this record.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Build the canonical idempotency key for a usage record.
///
/// ```
/// use taskweave::types::usage_idempotency_key;
///
/// let key = usage_idempotency_key("wf-1", "agent-step-2", 1);
/// assert_eq!(key, "wf-1:agent-step-2:1");
/// ```
pub fn usage_idempotency_key(workflow_id: &str, activity_id: &str, attempt: u32) -> String {
    format!("{}:{}:{}", workflow_id, activity_id, attempt)
}

/// Per-session compression bookkeeping, stored in session metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionState {
    /// When the session history was last compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compressed_at: Option<DateTime<Utc>>,
    /// Message count at the time of the last compression.
    #[serde(default)]
    pub last_message_count: usize,
    /// How many compressions have run for this session.
    #[serde(default)]
    pub total_compressions: u32,
}

/// Status of a human-in-the-loop review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for human feedback on the current plan.
    AwaitingFeedback,
    /// The human approved the plan.
    Approved,
    /// The human abandoned the review.
    Abandoned,
    /// The review state expired before a decision was made.
    Expired,
}

/// One turn of the review conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRound {
    /// `"assistant"` for generated plans, `"user"` for feedback.
    pub role: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// Review state for one workflow's HITL loop, persisted with a bounded TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewState {
    pub status: ReviewStatus,
    /// 1-based feedback round.
    pub round: u32,
    /// Version counter bumped on every persisted update.
    pub version: u32,
    pub owner_user_id: String,
    pub owner_tenant_id: String,
    /// Full conversation so far.
    pub rounds: Vec<ReviewRound>,
    /// The plan currently proposed to the human.
    pub current_plan: String,
}

/// Single action returned by the agent loop step activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    /// Invoke a tool with parameters.
    ToolCall {
        tool: String,
        #[serde(default)]
        parameters: Value,
    },
    /// Send a message to another agent on the roster.
    SendMessage { to: String, content: String },
    /// Publish data into the shared workspace.
    PublishData { key: String, data: Value },
    /// Ask the team for help.
    RequestHelp { reason: String },
    /// The agent considers its task finished.
    Done {
        #[serde(default)]
        summary: String,
    },
}

/// Input to the agent loop step activity for persistent autonomous agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopStepInput {
    pub agent_id: String,
    pub workflow_id: String,
    pub task: String,
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub team_roster: Vec<String>,
    #[serde(default)]
    pub workspace_data: Vec<Value>,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    #[serde(default)]
    pub session_id: String,
}

/// Result of one agent loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopStepResult {
    #[serde(flatten)]
    pub action: AgentAction,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub model_used: String,
}

/// Three-category claim verdict from V2 verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimCategory {
    Supported,
    Unsupported,
    InsufficientEvidence,
}

/// One verified claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimVerdict {
    pub claim: String,
    pub category: ClaimCategory,
    /// Indexes into the citation list that support or contradict the claim.
    #[serde(default)]
    pub evidence_refs: Vec<usize>,
}

/// Result of verifying a synthesized answer against its citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Aggregate confidence in `[0,1]`.
    pub overall_confidence: f64,
    /// Fraction of claims with supporting evidence.
    pub evidence_coverage: f64,
    /// Mean retrieval score of the cited evidence.
    #[serde(default)]
    pub avg_retrieval_score: f64,
    #[serde(default)]
    pub claims: Vec<ClaimVerdict>,
    /// Descriptions of contradictions between claims and evidence.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

/// Result of batch verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyBatchResult {
    pub verified: usize,
    pub failed: usize,
    #[serde(default)]
    pub results: Vec<VerificationResult>,
}

/// Recommended next move from coverage evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageAction {
    Continue,
    Complete,
    Pivot,
}

/// Coverage evaluation over an iterative research loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Overall coverage in `[0,1]`.
    pub overall_coverage: f64,
    /// Per-dimension coverage scores.
    #[serde(default)]
    pub dimensions: HashMap<String, f64>,
    /// Gaps that must be filled before completing.
    #[serde(default)]
    pub critical_gaps: Vec<String>,
    /// Gaps that are nice to fill.
    #[serde(default)]
    pub optional_gaps: Vec<String>,
    pub should_continue: bool,
    pub recommended_action: CoverageAction,
}

/// A single citation available to synthesis and verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
}

/// One merged search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
    /// Source type the route that produced this result belongs to.
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Stage labels for structured failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    MemoryFetch,
    Decompose,
    Approval,
    Budget,
    Subtasks,
    Synthesis,
    Verification,
    SessionUpdate,
}

/// Structured failure produced when a workflow cannot complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailureReport {
    /// The stage at which the workflow stopped.
    pub stage: WorkflowStage,
    /// Results of subtasks that completed before the failure.
    #[serde(default)]
    pub partial_results: Vec<AgentExecutionResult>,
    /// Tokens consumed up to the failure.
    #[serde(default)]
    pub tokens_used: u64,
    /// Stable error-kind label (see `Error::kind`).
    pub error_kind: String,
    /// Human-readable detail.
    #[serde(default)]
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_budget_invariants() {
        let mut ledger = TokenBudget::new(1000, true, 0.8);
        assert_eq!(ledger.remaining(), 1000);
        ledger.used = 700;
        assert_eq!(ledger.remaining(), 300);
        assert!(!ledger.would_exceed(300));
        assert!(ledger.would_exceed(301));
        let soft = TokenBudget {
            hard_limit: false,
            ..ledger.clone()
        };
        assert!(!soft.would_exceed(100_000));
    }

    #[test]
    fn test_zero_budget_is_fully_utilized() {
        let ledger = TokenBudget::new(0, true, 0.8);
        assert!((ledger.projected_utilization(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_agent_action_wire_format() {
        let json = serde_json::json!({
            "action": "tool_call",
            "tool": "web_search",
            "parameters": {"query": "rust"}
        });
        let action: AgentAction = serde_json::from_value(json).unwrap();
        match action {
            AgentAction::ToolCall { tool, parameters } => {
                assert_eq!(tool, "web_search");
                assert_eq!(parameters["query"], "rust");
            }
            _ => panic!("wrong action variant"),
        }

        let done: AgentAction = serde_json::from_value(serde_json::json!({
            "action": "done", "summary": "finished"
        }))
        .unwrap();
        assert!(matches!(done, AgentAction::Done { .. }));
    }

    #[test]
    fn test_decomposition_concurrency_default() {
        let result: DecompositionResult = serde_json::from_value(serde_json::json!({
            "mode": "standard",
            "subtasks": []
        }))
        .unwrap();
        assert_eq!(result.concurrency_limit, 1);
    }

    #[test]
    fn test_subtask_builder() {
        let subtask = Subtask::new("s1", "Collect prior art")
            .with_dependency("s0")
            .with_estimated_tokens(150)
            .with_suggested_tool("web_search");
        assert_eq!(subtask.dependencies, vec!["s0"]);
        assert_eq!(subtask.estimated_tokens, 150);
        assert_eq!(subtask.suggested_tools, vec!["web_search"]);
    }
}

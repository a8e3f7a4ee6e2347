//! HITL research-plan activities.
//!
//! Generates a research plan for human review, strips the machine-only
//! markers from the display copy, and initialises the review state in the
//! key-value store under `review:<workflow_id>` with a bounded TTL.
//!
//! A key-value store failure here is **fatal**: without the stored review
//! state the user has no way to interact with the plan, so the error
//! surfaces instead of being retried into a half-initialised loop.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::error::{Error, Result};
use crate::taskweave::stores::ResearchPlanRequest;
use crate::taskweave::types::{ReviewRound, ReviewState, ReviewStatus};

/// Buffer added to the caller-specified review TTL.
pub const REVIEW_TTL_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Default caller TTL when none is specified (total 20 minutes with buffer).
pub const DEFAULT_REVIEW_TTL: Duration = Duration::from_secs(15 * 60);

/// Key under which a workflow's review state is stored.
pub fn review_key(workflow_id: &str) -> String {
    format!("review:{}", workflow_id)
}

/// Strip machine-only markers from a plan for display.
///
/// Removes `[RESEARCH_BRIEF]…[/RESEARCH_BRIEF]` blocks wholesale and
/// `[INTENT:…]` tags, then collapses the leftover blank runs.
///
/// ```
/// use taskweave::activities::review::strip_plan_markers;
///
/// let raw = "Plan:\n[RESEARCH_BRIEF]machine only[/RESEARCH_BRIEF]\n[INTENT:research]\nStep 1";
/// assert_eq!(strip_plan_markers(raw), "Plan:\nStep 1");
/// ```
pub fn strip_plan_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[RESEARCH_BRIEF]") {
        out.push_str(&rest[..start]);
        match rest[start..].find("[/RESEARCH_BRIEF]") {
            Some(end) => rest = &rest[start + end + "[/RESEARCH_BRIEF]".len()..],
            None => {
                // Unterminated block: drop everything after the marker.
                rest = "";
            }
        }
    }
    out.push_str(rest);

    let mut cleaned = String::with_capacity(out.len());
    let mut rest = out.as_str();
    while let Some(start) = rest.find("[INTENT:") {
        cleaned.push_str(&rest[..start]);
        match rest[start..].find(']') {
            Some(end) => rest = &rest[start + end + 1..],
            None => rest = "",
        }
    }
    cleaned.push_str(rest);

    let lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    lines.join("\n")
}

/// Input to [`ActivityRegistry::generate_research_plan`].
#[derive(Debug, Clone)]
pub struct ResearchPlanInput {
    pub query: String,
    pub context: Map<String, Value>,
    /// Prior review conversation, for revision rounds.
    pub conversation: Vec<Value>,
    pub user_id: String,
    pub tenant_id: String,
    /// Caller-specified review TTL; the 5-minute buffer is added on top.
    pub ttl: Option<Duration>,
    /// 1-based revision round; `1` for the initial plan.
    pub round: u32,
}

/// Output of plan generation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResearchPlanOutput {
    /// Plan with machine markers stripped, for display.
    pub display_plan: String,
    /// Raw plan as returned by the service.
    pub raw_plan: String,
    pub intent: String,
    pub state: ReviewState,
    pub tokens_used: u64,
}

impl ActivityRegistry {
    /// Generate (or revise) a research plan and persist the review state.
    pub async fn generate_research_plan(
        &self,
        ctx: &ActivityContext,
        input: &ResearchPlanInput,
    ) -> Result<ResearchPlanOutput> {
        ctx.heartbeat("research-plan:pre-call");
        let request = ResearchPlanRequest {
            query: input.query.clone(),
            context: input.context.clone(),
            conversation: input.conversation.clone(),
        };
        let correlation = ctx.correlation(None);
        let deadline = self.config.timeouts.research_plan;
        let response = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.research_plan(&request, &correlation))
        })
        .await?;
        ctx.heartbeat("research-plan:post-call");

        let display_plan = strip_plan_markers(&response.message);
        let state = ReviewState {
            status: ReviewStatus::AwaitingFeedback,
            round: input.round,
            version: 1,
            owner_user_id: input.user_id.clone(),
            owner_tenant_id: input.tenant_id.clone(),
            rounds: vec![ReviewRound {
                role: "assistant".into(),
                message: display_plan.clone(),
                ts: Utc::now(),
            }],
            current_plan: display_plan.clone(),
        };

        self.save_review_state(&ctx.identity.workflow_id, &state, input.ttl)
            .await?;

        Ok(ResearchPlanOutput {
            display_plan,
            raw_plan: response.message,
            intent: response.intent,
            state,
            tokens_used: response.input_tokens + response.output_tokens,
        })
    }

    /// Persist a review state with TTL = caller-specified + buffer. Store
    /// failure is fatal for the review loop.
    pub async fn save_review_state(
        &self,
        workflow_id: &str,
        state: &ReviewState,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        let ttl = ttl.unwrap_or(DEFAULT_REVIEW_TTL) + REVIEW_TTL_BUFFER;
        self.kv
            .set_with_ttl(&review_key(workflow_id), payload, ttl)
            .await
            .map_err(|err| Error::store(format!("review state not persisted: {}", err)))
    }

    /// Load a workflow's review state, when present and unexpired.
    pub async fn load_review_state(&self, workflow_id: &str) -> Result<Option<ReviewState>> {
        match self.kv.get(&review_key(workflow_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

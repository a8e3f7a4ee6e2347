//! Human-in-the-loop review workflow.
//!
//! Generates a research plan, waits for the human's feedback signal, and
//! iterates: approval ends the loop with the accepted plan, a revision
//! request feeds the feedback into the next plan generation, abandonment
//! (or running out of rounds) ends the loop without a plan.
//!
//! Feedback arrives as a `plan-feedback` signal with payload
//! `{"action": "approve" | "revise" | "abandon", "message"?: "..."}`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::taskweave::activities::review::{ResearchPlanInput, ResearchPlanOutput};
use crate::taskweave::activities::ActivityRegistry;
use crate::taskweave::error::{Error, Result};
use crate::taskweave::event_bus::EventType;
use crate::taskweave::types::{ReviewRound, ReviewStatus};
use crate::taskweave::workflows::runtime::WorkflowCtx;

/// Input to one review loop run.
#[derive(Debug, Clone)]
pub struct ReviewLoopInput {
    pub query: String,
    pub context: Map<String, Value>,
    pub user_id: String,
    pub tenant_id: String,
    /// Review TTL per round; the store buffer is added on top.
    pub ttl: Option<Duration>,
    /// Bound on feedback rounds. Default callers use `5`.
    pub max_rounds: u32,
}

/// Terminal outcome of the review loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReviewOutcome {
    /// The human approved this plan.
    Approved { plan: String, rounds: u32 },
    /// The human abandoned the review, or rounds ran out.
    Abandoned { rounds: u32 },
}

/// Drives the plan → feedback → revise loop.
pub struct ReviewWorkflow {
    registry: Arc<ActivityRegistry>,
}

impl ReviewWorkflow {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, ctx: &WorkflowCtx, input: &ReviewLoopInput) -> Result<ReviewOutcome> {
        ctx.emit(
            EventType::WorkflowStarted,
            format!("plan review: {}", input.query),
        );

        let mut conversation: Vec<Value> = Vec::new();
        let max_rounds = input.max_rounds.max(1);

        for round in 1..=max_rounds {
            let plan_input = ResearchPlanInput {
                query: input.query.clone(),
                context: input.context.clone(),
                conversation: conversation.clone(),
                user_id: input.user_id.clone(),
                tenant_id: input.tenant_id.clone(),
                ttl: input.ttl,
                round,
            };
            // A store failure inside plan generation is fatal: without the
            // persisted review state the human cannot interact.
            let plan: ResearchPlanOutput = ctx
                .activity(&format!("plan-{}", round), |actx| async move {
                    self.registry.generate_research_plan(&actx, &plan_input).await
                })
                .await?;

            ctx.emit_with(
                EventType::ApprovalRequested,
                plan.display_plan.clone(),
                None,
                Some(json!({"round": round, "intent": plan.intent})),
            );

            let feedback = ctx
                .await_signal_keyed(&format!("plan-feedback-{}", round), "plan-feedback")
                .await?;
            let action = feedback
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or("abandon")
                .to_string();
            let message = feedback
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            ctx.emit_with(
                EventType::ApprovalDecision,
                action.clone(),
                None,
                Some(feedback),
            );

            match action.as_str() {
                "approve" => {
                    let approved_plan = plan.display_plan.clone();
                    let mut state = plan.state.clone();
                    let ttl = input.ttl;
                    ctx.activity(&format!("approve-{}", round), |actx| async move {
                        actx.heartbeat("review:approve");
                        state.status = ReviewStatus::Approved;
                        state.version += 1;
                        self.registry
                            .save_review_state(&actx.identity.workflow_id, &state, ttl)
                            .await
                    })
                    .await?;
                    ctx.emit(EventType::WorkflowCompleted, "plan approved");
                    return Ok(ReviewOutcome::Approved {
                        plan: approved_plan,
                        rounds: round,
                    });
                }
                "revise" => {
                    conversation.push(json!({"role": "assistant", "content": plan.display_plan}));
                    conversation.push(json!({"role": "user", "content": message}));
                    let mut state = plan.state.clone();
                    let revision = message.clone();
                    let ttl = input.ttl;
                    let ts = ctx.wall_time(&format!("revise-ts-{}", round));
                    ctx.activity(&format!("revise-{}", round), |actx| async move {
                        actx.heartbeat("review:revise");
                        state.rounds.push(ReviewRound {
                            role: "user".into(),
                            message: revision,
                            ts: ts.parse().map_err(|_| Error::invalid_input("bad timestamp"))?,
                        });
                        state.version += 1;
                        self.registry
                            .save_review_state(&actx.identity.workflow_id, &state, ttl)
                            .await
                    })
                    .await?;
                }
                _ => {
                    let mut state = plan.state.clone();
                    let ttl = input.ttl;
                    ctx.activity(&format!("abandon-{}", round), |actx| async move {
                        actx.heartbeat("review:abandon");
                        state.status = ReviewStatus::Abandoned;
                        state.version += 1;
                        self.registry
                            .save_review_state(&actx.identity.workflow_id, &state, ttl)
                            .await
                    })
                    .await?;
                    ctx.emit(EventType::WorkflowCompleted, "plan abandoned");
                    return Ok(ReviewOutcome::Abandoned { rounds: round });
                }
            }
        }

        ctx.emit(EventType::WorkflowCompleted, "review rounds exhausted");
        Ok(ReviewOutcome::Abandoned { rounds: max_rounds })
    }
}

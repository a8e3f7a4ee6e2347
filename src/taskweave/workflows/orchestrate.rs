//! The main task workflow.
//!
//! `memory fetch → decompose → ordered subtask loop → synthesize →
//! verify? → session update`, with a budget gate at every subtask boundary:
//!
//! - backpressure delays are applied as *workflow* sleeps — the activity
//!   returned only the value;
//! - an open per-user circuit breaker skips the subtask and the plan
//!   continues without it;
//! - a hard budget denial stops the plan with a structured failure.
//!
//! Subtasks form a DAG; independent ready subtasks are fanned out in
//! parallel up to the plan's concurrency limit. Fan-in classifies failures:
//! retryable errors are retried with bounded attempts, fatal ones are
//! captured into the partial-failure report, and the plan aborts only when
//! the failure rate crosses the configured threshold.
//!
//! Every run ends in either a final answer or a structured
//! [`TaskFailureReport`] naming the stage, the partial results, the tokens
//! spent, and the triggering error kind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::taskweave::activities::agent::AgentExecutionInput;
use crate::taskweave::activities::compress::CompressInput;
use crate::taskweave::activities::decompose::DecomposeInput;
use crate::taskweave::activities::synthesis::{SynthesisInput, SynthesisStrategy};
use crate::taskweave::activities::ActivityRegistry;
use crate::taskweave::budget::BudgetCheckRequest;
use crate::taskweave::error::{Error, Result};
use crate::taskweave::event_bus::EventType;
use crate::taskweave::memory::{
    compression_due, estimate_tokens, load_compression_state, MemoryHit, RetrievalRequest,
};
use crate::taskweave::types::{
    AgentExecutionResult, Citation, DecompositionResult, Subtask, TaskFailureReport, UsageRecord,
    VerificationResult, WorkflowStage,
};
use crate::taskweave::workflows::approval::{evaluate, ApprovalContext, ApprovalPolicy};
use crate::taskweave::workflows::runtime::WorkflowCtx;

/// Input to one task workflow run.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub query: String,
    pub user_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub task_id: String,
    /// Open context forwarded to decomposition and agents.
    pub context: Map<String, Value>,
    pub available_tools: Vec<String>,
    /// Citations available to synthesis and verification.
    pub citations: Vec<Citation>,
    pub require_verification: bool,
    /// Planner mode; empty selects the service default.
    pub mode: String,
}

/// One subtask that did not produce a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskFailure {
    pub subtask_id: String,
    pub error_kind: String,
    pub message: String,
}

/// Successful workflow output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub answer: String,
    pub tokens_used: u64,
    pub subtask_results: Vec<AgentExecutionResult>,
    /// Subtasks that failed without sinking the plan.
    pub failures: Vec<SubtaskFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
}

/// Terminal outcome of a run: an answer or a structured failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed(TaskFailureReport),
}

enum GateOutcome {
    Proceed,
    CircuitOpen,
    Denied(String),
}

/// Drives the task workflow against an activity registry.
pub struct TaskOrchestrator {
    registry: Arc<ActivityRegistry>,
    policy: ApprovalPolicy,
    /// Attempts per subtask, including the first. Default: `3`.
    max_subtask_attempts: u32,
    /// Fraction of failed subtasks that aborts the plan. Default: `0.5`.
    failure_rate_threshold: f64,
    /// Backpressure sleep-and-recheck rounds per gate. Default: `3`.
    backpressure_rechecks: u32,
}

impl TaskOrchestrator {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self {
            registry,
            policy: ApprovalPolicy::default(),
            max_subtask_attempts: 3,
            failure_rate_threshold: 0.5,
            backpressure_rechecks: 3,
        }
    }

    /// Builder: set the approval policy.
    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder: set per-subtask attempts.
    pub fn with_max_subtask_attempts(mut self, attempts: u32) -> Self {
        self.max_subtask_attempts = attempts.max(1);
        self
    }

    /// Builder: set the abort threshold on the subtask failure rate.
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Run the workflow. Returns `Ok` with either outcome; `Err` only for
    /// cancellation and runtime-level faults.
    pub async fn run(&self, ctx: &WorkflowCtx, input: &TaskInput) -> Result<TaskOutcome> {
        ctx.emit(EventType::WorkflowStarted, format!("task: {}", input.query));

        // Memory fetch conditions decomposition and agents.
        let retrieval = RetrievalRequest {
            query: input.query.clone(),
            session_id: input.session_id.clone(),
            tenant_id: input.tenant_id.clone(),
        };
        let memory: Vec<MemoryHit> = match ctx
            .activity("memory-fetch", |actx| async move {
                self.registry.fetch_memory(&actx, &retrieval).await
            })
            .await
        {
            Ok(hits) => hits,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(err) => {
                // Memory is conditioning, not ground truth; continue without.
                log::warn!("memory fetch failed: {}", err);
                ctx.emit(EventType::ErrorRecovery, "continuing without memory context");
                Vec::new()
            }
        };

        let mut decompose_context = input.context.clone();
        if !memory.is_empty() {
            let digest: Vec<&str> = memory.iter().map(|hit| hit.answer.as_str()).collect();
            decompose_context.insert("memory".into(), json!(digest));
        }

        // Decompose.
        let decompose_input = DecomposeInput {
            query: input.query.clone(),
            context: decompose_context.clone(),
            available_tools: input.available_tools.clone(),
            mode: input.mode.clone(),
        };
        let plan: DecompositionResult = match ctx
            .activity("decompose", |actx| async move {
                self.registry.decompose_task(&actx, &decompose_input).await
            })
            .await
        {
            Ok(plan) => plan,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(err) => {
                return Ok(self.failure(
                    ctx,
                    WorkflowStage::Decompose,
                    &err,
                    Vec::new(),
                    0,
                ))
            }
        };
        ctx.emit_with(
            EventType::Progress,
            format!("plan ready: {} subtasks", plan.subtasks.len()),
            None,
            Some(json!({
                "subtasks": plan.subtasks.len(),
                "estimated_tokens": plan.total_estimated_tokens,
                "concurrency_limit": plan.concurrency_limit,
            })),
        );

        // Approval gate, once per plan.
        let approval_context = ApprovalContext::from_plan(&plan);
        let check = evaluate(&self.policy, &approval_context);
        if check.required {
            let reason = check.reason.clone().unwrap_or_else(|| "policy".into());
            ctx.emit_with(
                EventType::ApprovalRequested,
                reason.clone(),
                None,
                Some(serde_json::to_value(&approval_context)?),
            );
            let payload = ctx.await_signal("approval").await?;
            let approved = payload.get("approved").and_then(Value::as_bool).unwrap_or(false);
            ctx.emit_with(
                EventType::ApprovalDecision,
                if approved { "approved" } else { "denied" },
                None,
                Some(payload),
            );
            if !approved {
                return Ok(self.failure(
                    ctx,
                    WorkflowStage::Approval,
                    &Error::budget_denied(format!("plan rejected: {}", reason)),
                    Vec::new(),
                    0,
                ));
            }
        }

        // Ordered subtask loop over the dependency DAG.
        let total = plan.subtasks.len().max(1);
        let concurrency = plan.concurrency_limit.max(1);
        let mut pending: Vec<Subtask> = plan.subtasks.clone();
        let mut completed_ids: HashSet<String> = HashSet::new();
        let mut failed_ids: HashSet<String> = HashSet::new();
        let mut results: Vec<AgentExecutionResult> = Vec::new();
        let mut failures: Vec<SubtaskFailure> = Vec::new();
        let mut tokens_used: u64 = 0;

        while !pending.is_empty() {
            // Subtasks whose dependencies already failed cannot run.
            let mut runnable = Vec::new();
            for subtask in pending.drain(..) {
                if let Some(dep) = subtask.dependencies.iter().find(|d| failed_ids.contains(*d)) {
                    failed_ids.insert(subtask.id.clone());
                    failures.push(SubtaskFailure {
                        subtask_id: subtask.id.clone(),
                        error_kind: "dependency_failed".into(),
                        message: format!("dependency {} failed", dep),
                    });
                } else {
                    runnable.push(subtask);
                }
            }
            if runnable.is_empty() {
                break;
            }

            let (ready, blocked): (Vec<Subtask>, Vec<Subtask>) = runnable
                .into_iter()
                .partition(|s| s.dependencies.iter().all(|d| completed_ids.contains(d)));
            pending = blocked;
            if ready.is_empty() {
                for subtask in pending.drain(..) {
                    failed_ids.insert(subtask.id.clone());
                    failures.push(SubtaskFailure {
                        subtask_id: subtask.id,
                        error_kind: "dependency_cycle".into(),
                        message: "unsatisfiable dependencies".into(),
                    });
                }
                break;
            }

            for chunk in ready.chunks(concurrency) {
                // Budget gate per subtask, before fan-out.
                let mut admitted: Vec<&Subtask> = Vec::new();
                for subtask in chunk {
                    match self.budget_gate(ctx, input, subtask).await? {
                        GateOutcome::Proceed => admitted.push(subtask),
                        GateOutcome::CircuitOpen => {
                            failed_ids.insert(subtask.id.clone());
                            failures.push(SubtaskFailure {
                                subtask_id: subtask.id.clone(),
                                error_kind: "circuit_open".into(),
                                message: format!("circuit breaker open for {}", input.user_id),
                            });
                        }
                        GateOutcome::Denied(reason) => {
                            return Ok(self.failure(
                                ctx,
                                WorkflowStage::Budget,
                                &Error::budget_denied(reason),
                                results,
                                tokens_used,
                            ));
                        }
                    }
                }

                // Fan out the admitted subtasks; fan in and classify.
                let outcomes = join_all(
                    admitted
                        .iter()
                        .map(|subtask| self.run_subtask(ctx, input, subtask)),
                )
                .await;
                for (subtask, outcome) in admitted.iter().zip(outcomes) {
                    match outcome {
                        Ok(result) => {
                            tokens_used += result.tokens_used;
                            completed_ids.insert(subtask.id.clone());
                            results.push(result);
                            ctx.emit_with(
                                EventType::DependencySatisfied,
                                format!("subtask {} complete", subtask.id),
                                None,
                                None,
                            );
                            ctx.emit(
                                EventType::Progress,
                                format!(
                                    "subtasks {}/{} complete",
                                    completed_ids.len(),
                                    total
                                ),
                            );
                        }
                        Err(Error::Canceled) => return Err(Error::Canceled),
                        Err(err) => {
                            failed_ids.insert(subtask.id.clone());
                            failures.push(SubtaskFailure {
                                subtask_id: subtask.id.clone(),
                                error_kind: err.kind().to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                }

                if failures.len() as f64 / total as f64 > self.failure_rate_threshold {
                    return Ok(self.failure(
                        ctx,
                        WorkflowStage::Subtasks,
                        &Error::other(format!(
                            "{} of {} subtasks failed",
                            failures.len(),
                            total
                        )),
                        results,
                        tokens_used,
                    ));
                }
            }
        }

        // Compression gate: checked in an activity (it reads the session
        // store and the clock); a closed gate or a failed compression never
        // stops the plan.
        self.maybe_compress(ctx, input).await?;

        // Synthesize.
        let synthesis_input = SynthesisInput {
            query: input.query.clone(),
            results: results.clone(),
            citations: input.citations.clone(),
            role: input
                .context
                .get("role")
                .and_then(Value::as_str)
                .map(str::to_string),
            strategy: SynthesisStrategy::Llm,
        };
        let synthesis = match ctx
            .activity("synthesize", |actx| async move {
                self.registry.synthesize(&actx, &synthesis_input).await
            })
            .await
        {
            Ok(synthesis) => synthesis,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(err) => {
                return Ok(self.failure(
                    ctx,
                    WorkflowStage::Synthesis,
                    &err,
                    results,
                    tokens_used,
                ))
            }
        };
        tokens_used += synthesis.tokens_used;

        // Optional verification; failure here degrades, it does not abort.
        let verification = if input.require_verification {
            let answer = synthesis.text.clone();
            let citations = input.citations.clone();
            match ctx
                .activity("verify", |actx| async move {
                    self.registry.verify_claims(&actx, &answer, &citations).await
                })
                .await
            {
                Ok(verification) => Some(verification),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) => {
                    log::warn!("verification failed: {}", err);
                    ctx.emit(EventType::ErrorRecovery, "verification unavailable");
                    None
                }
            }
        } else {
            None
        };

        // Session update: append the turn and persist it to memory.
        let update_outcome: Result<()> = {
            let query = input.query.clone();
            let answer = synthesis.text.clone();
            let session_id = input.session_id.clone();
            let tenant_id = input.tenant_id.clone();
            ctx.activity("session-update", |actx| async move {
                actx.heartbeat("session-update");
                let sessions = self.registry.memory().sessions().clone();
                sessions
                    .add_message(
                        &session_id,
                        crate::taskweave::stores::SessionMessage::new("user", &query),
                    )
                    .await?;
                sessions
                    .add_message(
                        &session_id,
                        crate::taskweave::stores::SessionMessage::new("assistant", &answer),
                    )
                    .await?;
                self.registry
                    .memory()
                    .record_query(&crate::taskweave::memory::RecordQueryRequest {
                        session_id,
                        tenant_id,
                        query,
                        answer,
                        agent_id: None,
                        redact_pii: self.registry.memory().config().redact_pii,
                    })
                    .await?;
                Ok(())
            })
            .await
        };
        if let Err(err) = update_outcome {
            if matches!(err, Error::Canceled) {
                return Err(Error::Canceled);
            }
            return Ok(self.failure(
                ctx,
                WorkflowStage::SessionUpdate,
                &err,
                results,
                tokens_used,
            ));
        }

        ctx.emit_with(
            EventType::WorkflowCompleted,
            "task complete",
            None,
            Some(json!({"tokens_used": tokens_used, "failures": failures.len()})),
        );

        Ok(TaskOutcome::Completed(TaskOutput {
            answer: synthesis.text,
            tokens_used,
            subtask_results: results,
            failures,
            verification,
        }))
    }

    /// Budget check → optional workflow-timer delay → recheck cycle for one
    /// subtask.
    async fn budget_gate(
        &self,
        ctx: &WorkflowCtx,
        input: &TaskInput,
        subtask: &Subtask,
    ) -> Result<GateOutcome> {
        let request = BudgetCheckRequest {
            user_id: input.user_id.clone(),
            session_id: input.session_id.clone(),
            task_id: input.task_id.clone(),
            estimated_tokens: subtask.estimated_tokens,
        };

        for round in 1..=self.backpressure_rechecks.max(1) {
            let key = if round == 1 {
                format!("budget-{}", subtask.id)
            } else {
                format!("budget-{}-r{}", subtask.id, round)
            };
            let check_request = request.clone();
            let decision = ctx
                .activity(&key, |actx| async move {
                    actx.heartbeat("budget-check");
                    Ok(self.registry.budget().check_with_breaker(&check_request).await)
                })
                .await?;

            if decision.circuit_breaker_open {
                return Ok(GateOutcome::CircuitOpen);
            }
            if !decision.backpressure.decision.can_proceed {
                return Ok(GateOutcome::Denied(
                    decision
                        .backpressure
                        .decision
                        .reason
                        .unwrap_or_else(|| "budget denied".into()),
                ));
            }
            if decision.backpressure.backpressure_active
                && round < self.backpressure_rechecks.max(1)
            {
                // The activity computed the delay; the workflow applies it.
                let delay = Duration::from_millis(decision.backpressure.backpressure_delay_ms);
                ctx.emit_with(
                    EventType::Waiting,
                    format!("backpressure: sleeping {:?} before {}", delay, subtask.id),
                    None,
                    Some(json!({
                        "delay_ms": decision.backpressure.backpressure_delay_ms,
                        "pressure": decision.backpressure.budget_pressure,
                    })),
                );
                ctx.sleep(&format!("backpressure-{}-r{}", subtask.id, round), delay)
                    .await?;
                continue;
            }
            return Ok(GateOutcome::Proceed);
        }
        Ok(GateOutcome::Proceed)
    }

    /// Execute one subtask with bounded retries; usage is recorded inside
    /// each attempt under that attempt's idempotency key.
    async fn run_subtask(
        &self,
        ctx: &WorkflowCtx,
        input: &TaskInput,
        subtask: &Subtask,
    ) -> Result<AgentExecutionResult> {
        let key = format!("agent-{}", subtask.id);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.max_subtask_attempts {
            let execution_input = AgentExecutionInput {
                query: subtask.description.clone(),
                agent_id: format!("agent-{}", subtask.id),
                context: input.context.clone(),
                suggested_tools: subtask.suggested_tools.clone(),
                tool_parameters: subtask.tool_parameters.clone(),
                persona_id: subtask.suggested_persona.clone(),
                session_id: input.session_id.clone(),
                task_id: input.task_id.clone(),
                max_tokens: None,
            };
            let user_id = input.user_id.clone();
            let session_id = input.session_id.clone();
            let task_id = input.task_id.clone();

            let outcome = ctx
                .activity_attempt(&key, attempt, |actx| async move {
                    let result = self.registry.execute_agent(&actx, &execution_input).await?;
                    self.registry.record_usage(&UsageRecord {
                        user_id,
                        session_id,
                        task_id,
                        agent_id: result.agent_id.clone(),
                        model: result.model_used.clone(),
                        provider: result.provider.clone(),
                        input_tokens: result.input_tokens,
                        output_tokens: result.output_tokens,
                        idempotency_key: actx.idempotency_key(),
                    });
                    Ok(result)
                })
                .await;

            match outcome {
                Ok(result) => return Ok(result),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) if err.is_retryable() && attempt < self.max_subtask_attempts => {
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::other("subtask retries exhausted")))
    }

    /// Check the compression gate and compress when due. Never fails the
    /// workflow.
    async fn maybe_compress(&self, ctx: &WorkflowCtx, input: &TaskInput) -> Result<()> {
        let session_id = input.session_id.clone();
        let due = ctx
            .activity("compress-gate", |actx| async move {
                actx.heartbeat("compress-gate");
                let sessions = self.registry.memory().sessions().clone();
                let Some(session) = sessions.get_session(&session_id).await? else {
                    return Ok(false);
                };
                let state = load_compression_state(&session);
                let history_tokens: usize = session
                    .messages
                    .iter()
                    .map(|message| estimate_tokens(&message.content))
                    .sum();
                Ok(compression_due(
                    self.registry.memory().config(),
                    &state,
                    history_tokens,
                    session.messages.len(),
                    chrono::Utc::now(),
                ))
            })
            .await;

        match due {
            Ok(true) => {
                let compress_input = CompressInput {
                    session_id: input.session_id.clone(),
                    tenant_id: input.tenant_id.clone(),
                    target_tokens: (self.registry.memory().config().model_window / 4) as u64,
                };
                if let Err(err) = ctx
                    .activity("compress", |actx| async move {
                        self.registry.compress_session(&actx, &compress_input).await
                    })
                    .await
                {
                    if matches!(err, Error::Canceled) {
                        return Err(Error::Canceled);
                    }
                    log::warn!("compression failed: {}", err);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(err) => {
                log::warn!("compression gate unavailable: {}", err);
                Ok(())
            }
        }
    }

    /// Build a structured failure, emitting the terminal events.
    fn failure(
        &self,
        ctx: &WorkflowCtx,
        stage: WorkflowStage,
        err: &Error,
        partial_results: Vec<AgentExecutionResult>,
        tokens_used: u64,
    ) -> TaskOutcome {
        ctx.emit_with(
            EventType::ErrorOccurred,
            format!("workflow stopped at {:?}: {}", stage, err),
            None,
            Some(json!({"error_kind": err.kind()})),
        );
        ctx.emit_with(
            EventType::WorkflowCompleted,
            "task failed",
            None,
            Some(json!({"stage": stage, "tokens_used": tokens_used})),
        );
        TaskOutcome::Failed(TaskFailureReport {
            stage,
            partial_results,
            tokens_used,
            error_kind: err.kind().to_string(),
            detail: err.to_string(),
        })
    }
}

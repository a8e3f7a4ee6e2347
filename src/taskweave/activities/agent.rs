//! Agent execution activities.
//!
//! [`execute_agent`](ActivityRegistry::execute_agent) runs one subtask
//! through the agent service and persists its execution records through the
//! write-behind queue. [`agent_loop_step`](ActivityRegistry::agent_loop_step)
//! advances a persistent autonomous agent by exactly one action.
//!
//! Context handling follows strict merge rules: `session_id` and `agent_id`
//! are filled only when missing or invalid — a valid caller value is never
//! overridden — and request body fields are mirrored into `prompt_params`
//! without clobbering pre-existing keys.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::context::{ensure_context_value, mirror_prompt_params};
use crate::taskweave::error::Result;
use crate::taskweave::event_bus::EventType;
use crate::taskweave::persistence::{AgentExecutionRow, ToolExecutionRow, WriteRequest};
use crate::taskweave::stores::AgentQueryRequest;
use crate::taskweave::types::{
    AgentAction, AgentExecutionResult, AgentLoopStepInput, AgentLoopStepResult,
};

/// Characters of a response kept in the persisted excerpt.
const RESPONSE_EXCERPT_LEN: usize = 500;

/// Input to [`ActivityRegistry::execute_agent`].
#[derive(Debug, Clone)]
pub struct AgentExecutionInput {
    pub query: String,
    pub agent_id: String,
    /// Open context map forwarded to the agent service.
    pub context: Map<String, Value>,
    pub suggested_tools: Vec<String>,
    pub tool_parameters: HashMap<String, Value>,
    pub persona_id: Option<String>,
    pub session_id: String,
    pub task_id: String,
    pub max_tokens: Option<u64>,
}

impl ActivityRegistry {
    /// Execute one subtask through `POST /agent/query`.
    ///
    /// Emits `AGENT_STARTED` / `LLM_PROMPT` before the call and
    /// `AGENT_COMPLETED` (or `ERROR_OCCURRED`) after it; enqueues the agent
    /// and tool execution rows on success. Persistence failures are logged
    /// and never fail the step.
    pub async fn execute_agent(
        &self,
        ctx: &ActivityContext,
        input: &AgentExecutionInput,
    ) -> Result<AgentExecutionResult> {
        ctx.heartbeat("agent:pre-call");
        let started = Instant::now();

        let mut context = input.context.clone();
        ensure_context_value(&mut context, "session_id", &input.session_id);
        ensure_context_value(&mut context, "agent_id", &input.agent_id);

        // Mirror body fields into prompt_params without overriding keys the
        // caller set explicitly.
        let mut body = Map::new();
        body.insert("query".into(), json!(input.query));
        body.insert("agent_id".into(), json!(input.agent_id));
        if let Some(persona) = &input.persona_id {
            body.insert("persona_id".into(), json!(persona));
        }
        if !input.tool_parameters.is_empty() {
            body.insert("tool_parameters".into(), json!(input.tool_parameters));
        }
        let mut prompt_params = match context.remove("prompt_params") {
            Some(Value::Object(params)) => params,
            _ => Map::new(),
        };
        mirror_prompt_params(&body, &mut prompt_params);
        context.insert("prompt_params".into(), Value::Object(prompt_params));

        let request = AgentQueryRequest {
            query: input.query.clone(),
            context,
            allowed_tools: input.suggested_tools.clone(),
            agent_id: input.agent_id.clone(),
            max_tokens: input.max_tokens,
        };
        let correlation = ctx.correlation(Some(&input.agent_id));
        let deadline = self.config.timeouts.agent_step;

        ctx.events.emit_with(
            EventType::AgentStarted,
            format!("agent {} started", input.agent_id),
            Some(&input.agent_id),
            None,
        );
        ctx.events.emit_with(
            EventType::LlmPrompt,
            preview(&input.query),
            Some(&input.agent_id),
            None,
        );

        let outcome = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.query(&request, &correlation))
        })
        .await;
        ctx.heartbeat("agent:post-call");

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                ctx.events.emit_with(
                    EventType::ErrorOccurred,
                    format!("agent {} failed: {}", input.agent_id, err),
                    Some(&input.agent_id),
                    Some(json!({"error_kind": err.kind()})),
                );
                return Err(err);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let tokens_used = if response.tokens_used > 0 {
            response.tokens_used
        } else {
            response.metadata.input_tokens + response.metadata.output_tokens
        };
        let result = AgentExecutionResult {
            agent_id: input.agent_id.clone(),
            response: response.response,
            tokens_used,
            input_tokens: response.metadata.input_tokens,
            output_tokens: response.metadata.output_tokens,
            model_used: or_fallback(&response.model_used, &response.metadata.model),
            provider: or_fallback(&response.provider, &response.metadata.provider),
            duration_ms,
            success: response.success,
            error: None,
            tools_used: response.tools_used,
            tool_executions: response.tool_executions,
        };

        ctx.events.emit_with(
            EventType::AgentCompleted,
            format!("agent {} completed", input.agent_id),
            Some(&input.agent_id),
            Some(json!({
                "tokens_used": result.tokens_used,
                "duration_ms": result.duration_ms,
            })),
        );

        self.persist_execution(ctx, input, &result);
        Ok(result)
    }

    /// Enqueue the agent execution row plus one row per tool execution.
    /// Producer-supplied tool record ids are respected.
    fn persist_execution(
        &self,
        ctx: &ActivityContext,
        input: &AgentExecutionInput,
        result: &AgentExecutionResult,
    ) {
        let agent_row = AgentExecutionRow {
            id: String::new(),
            workflow_id: ctx.identity.workflow_id.clone(),
            agent_id: result.agent_id.clone(),
            task_id: input.task_id.clone(),
            response_excerpt: preview_n(&result.response, RESPONSE_EXCERPT_LEN),
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            model: result.model_used.clone(),
            provider: result.provider.clone(),
            duration_ms: result.duration_ms,
            success: result.success,
            error: result.error.clone(),
            created_at: Utc::now(),
        };
        let agent_row_id = match self
            .persistence
            .enqueue(WriteRequest::AgentExecution(agent_row), None)
        {
            Ok(id) => id,
            Err(err) => {
                log::warn!("agent execution not persisted: {}", err);
                return;
            }
        };

        for tool in &result.tool_executions {
            let row = ToolExecutionRow {
                id: tool.id.clone().unwrap_or_default(),
                agent_execution_id: agent_row_id.clone(),
                workflow_id: ctx.identity.workflow_id.clone(),
                tool_name: tool.tool_name.clone(),
                parameters: tool.parameters.clone(),
                success: tool.success,
                error: tool.error.clone(),
                duration_ms: tool.duration_ms,
                created_at: Utc::now(),
            };
            if let Err(err) = self.persistence.enqueue(WriteRequest::ToolExecution(row), None) {
                log::warn!("tool execution not persisted: {}", err);
            }
        }
    }

    /// Advance a persistent autonomous agent by one action via
    /// `POST /agent/loop`.
    pub async fn agent_loop_step(
        &self,
        ctx: &ActivityContext,
        input: &AgentLoopStepInput,
    ) -> Result<AgentLoopStepResult> {
        ctx.heartbeat("loop:pre-call");
        let mut request = input.clone();
        ensure_context_value(&mut request.context, "session_id", &input.session_id);
        ensure_context_value(&mut request.context, "agent_id", &input.agent_id);

        ctx.events.emit_with(
            EventType::AgentThinking,
            format!(
                "agent {} iteration {}/{}",
                input.agent_id, input.iteration, input.max_iterations
            ),
            Some(&input.agent_id),
            None,
        );

        let correlation = ctx.correlation(Some(&input.agent_id));
        let deadline = self.config.timeouts.agent_step;
        let result = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.loop_step(&request, &correlation))
        })
        .await?;
        ctx.heartbeat("loop:post-call");

        if let AgentAction::ToolCall { tool, .. } = &result.action {
            ctx.events.emit_with(
                EventType::ToolInvoked,
                format!("agent {} invoking {}", input.agent_id, tool),
                Some(&input.agent_id),
                None,
            );
        }
        Ok(result)
    }
}

fn or_fallback(primary: &str, fallback: &str) -> String {
    if primary.trim().is_empty() {
        fallback.to_string()
    } else {
        primary.to_string()
    }
}

fn preview(text: &str) -> String {
    preview_n(text, 120)
}

fn preview_n(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

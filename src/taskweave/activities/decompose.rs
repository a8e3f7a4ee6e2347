//! Task decomposition activity.

use std::sync::atomic::Ordering;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::error::Result;
use crate::taskweave::stores::DecomposeRequest;
use crate::taskweave::types::DecompositionResult;

/// Input to [`ActivityRegistry::decompose_task`].
#[derive(Debug, Clone)]
pub struct DecomposeInput {
    pub query: String,
    pub context: Map<String, Value>,
    pub available_tools: Vec<String>,
    /// Planner mode; empty selects the service default.
    pub mode: String,
}

impl ActivityRegistry {
    /// Decompose a query into an ordered subtask plan.
    ///
    /// One bounded HTTP call (with retries on transient failures) to
    /// `POST /agent/decompose`. The returned plan is normalised: the
    /// concurrency limit is at least 1 and the total token estimate falls
    /// back to the sum of the per-subtask estimates.
    pub async fn decompose_task(
        &self,
        ctx: &ActivityContext,
        input: &DecomposeInput,
    ) -> Result<DecompositionResult> {
        ctx.heartbeat("decompose:pre-call");
        let started = Instant::now();

        let request = DecomposeRequest {
            query: input.query.clone(),
            context: input.context.clone(),
            tools: input.available_tools.clone(),
            mode: input.mode.clone(),
        };
        let correlation = ctx.correlation(None);
        let deadline = self.config.timeouts.decompose;

        let outcome = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.decompose(&request, &correlation))
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.decomposition_latency_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.decomposition_count.fetch_add(1, Ordering::Relaxed);
        ctx.heartbeat("decompose:post-call");

        match outcome {
            Ok(mut result) => {
                if result.concurrency_limit == 0 {
                    result.concurrency_limit = 1;
                }
                if result.total_estimated_tokens == 0 {
                    result.total_estimated_tokens =
                        result.subtasks.iter().map(|s| s.estimated_tokens).sum();
                }
                Ok(result)
            }
            Err(err) => {
                self.decomposition_errors_total.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

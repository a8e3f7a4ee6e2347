//! Session history compression.
//!
//! Called by the workflow only when the compression gate
//! ([`compression_due`](crate::taskweave::memory::compression_due)) is open.
//! One call to `POST /context/compress`, then the summary is persisted to
//! the summary collection and the session's compression state is advanced.

use chrono::Utc;
use serde_json::json;

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::error::{Error, Result};
use crate::taskweave::event_bus::EventType;
use crate::taskweave::memory::{estimate_tokens, load_compression_state, store_compression_state};
use crate::taskweave::stores::CompressRequest;

/// Input to [`ActivityRegistry::compress_session`].
#[derive(Debug, Clone)]
pub struct CompressInput {
    pub session_id: String,
    pub tenant_id: String,
    pub target_tokens: u64,
}

/// Outcome of a compression run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompressionOutcome {
    pub summary: String,
    pub summary_id: String,
    /// `original_tokens / compressed_tokens`.
    pub compression_ratio: f64,
    pub total_compressions: u32,
}

impl ActivityRegistry {
    /// Compress a session's history into a summary.
    pub async fn compress_session(
        &self,
        ctx: &ActivityContext,
        input: &CompressInput,
    ) -> Result<CompressionOutcome> {
        ctx.heartbeat("compress:pre-call");
        let sessions = self.memory.sessions().clone();
        let mut session = sessions
            .get_session(&input.session_id)
            .await?
            .ok_or_else(|| Error::invalid_input(format!("unknown session {}", input.session_id)))?;

        let messages: Vec<_> = session
            .messages
            .iter()
            .map(|message| json!({"role": message.role, "content": message.content}))
            .collect();
        let original_tokens: usize = session
            .messages
            .iter()
            .map(|message| estimate_tokens(&message.content))
            .sum();

        let request = CompressRequest {
            messages,
            target_tokens: input.target_tokens,
        };
        let correlation = ctx.correlation(None);
        let deadline = self.config.timeouts.compress;
        let response = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.compress(&request, &correlation))
        })
        .await?;
        ctx.heartbeat("compress:post-call");

        let summary_id = self
            .memory
            .record_summary(&input.session_id, &input.tenant_id, &response.summary)
            .await?;

        let compressed_tokens = estimate_tokens(&response.summary).max(1);
        let compression_ratio = original_tokens as f64 / compressed_tokens as f64;

        let mut state = load_compression_state(&session);
        state.last_compressed_at = Some(Utc::now());
        state.last_message_count = session.messages.len();
        state.total_compressions += 1;
        let total_compressions = state.total_compressions;
        store_compression_state(&mut session, &state);
        sessions.update_session(&session).await?;

        ctx.events.emit_with(
            EventType::DataProcessing,
            format!(
                "session {} compressed ({:.1}x)",
                input.session_id, compression_ratio
            ),
            None,
            Some(json!({
                "compression_ratio": compression_ratio,
                "total_compressions": total_compressions,
            })),
        );

        Ok(CompressionOutcome {
            summary: response.summary,
            summary_id,
            compression_ratio,
            total_compressions,
        })
    }
}

//! Claim verification activities.

use crate::taskweave::activities::{bounded, retry_with_backoff, ActivityContext, ActivityRegistry};
use crate::taskweave::error::Result;
use crate::taskweave::stores::{VerifyBatchRequest, VerifyClaimsRequest};
use crate::taskweave::types::{Citation, VerificationResult, VerifyBatchResult};

impl ActivityRegistry {
    /// Verify a synthesized answer against its citations with the V2
    /// three-category classifier (`supported`, `unsupported`,
    /// `insufficient_evidence`).
    pub async fn verify_claims(
        &self,
        ctx: &ActivityContext,
        answer: &str,
        citations: &[Citation],
    ) -> Result<VerificationResult> {
        ctx.heartbeat("verify:pre-call");
        let request = VerifyClaimsRequest {
            answer: answer.to_string(),
            citations: citations.to_vec(),
            use_v2: true,
        };
        let correlation = ctx.correlation(None);
        let deadline = self.config.timeouts.verify;
        let result = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.verify_claims(&request, &correlation))
        })
        .await;
        ctx.heartbeat("verify:post-call");
        result
    }

    /// Batch verification, with its longer deadline.
    pub async fn verify_batch(
        &self,
        ctx: &ActivityContext,
        answer: &str,
        citations: &[Citation],
    ) -> Result<VerifyBatchResult> {
        ctx.heartbeat("verify-batch:pre-call");
        let request = VerifyBatchRequest {
            answer: answer.to_string(),
            citations: citations.to_vec(),
        };
        let correlation = ctx.correlation(None);
        let deadline = self.config.timeouts.verify_batch;
        let result = retry_with_backoff(&self.retry, |_| {
            bounded(ctx, deadline, self.llm.verify_batch(&request, &correlation))
        })
        .await;
        ctx.heartbeat("verify-batch:post-call");
        result
    }
}

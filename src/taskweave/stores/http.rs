//! HTTP-backed store implementations.
//!
//! [`HttpLlmService`] speaks the agent service's JSON contract;
//! [`HttpVectorStore`] speaks a REST points API (`PUT
//! /collections/{name}/points`, `POST /collections/{name}/points/search`).
//! Both share one pooled [`reqwest::Client`] so TLS sessions and DNS lookups
//! stay warm across concurrent requests, and both inject the correlation
//! headers from the ambient workflow context.
//!
//! Status handling follows the crate's error taxonomy: non-success statuses
//! become [`Error::UpstreamStatus`] (5xx/429 retryable, other 4xx surfaced
//! with a body excerpt) and undecodable bodies become [`Error::Decode`] so
//! callers can fall back to simpler paths.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::taskweave::context::CorrelationContext;
use crate::taskweave::error::{Error, Result};
use crate::taskweave::stores::{
    AgentQueryRequest, AgentQueryResponse, CompressRequest, CompressResponse, DecomposeRequest,
    LlmService, ResearchPlanRequest, ResearchPlanResponse, ScoredPoint, SearchFilter, VectorPoint,
    VectorStore, VerifyBatchRequest, VerifyClaimsRequest,
};
use crate::taskweave::types::{
    AgentLoopStepInput, AgentLoopStepResult, DecompositionResult, VerificationResult,
    VerifyBatchResult,
};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    body: &B,
    correlation: &CorrelationContext,
) -> Result<T> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let response = client
        .post(&url)
        .headers(correlation.headers())
        .json(body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(Error::upstream(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|err| {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!("undecodable response from {}: {}", path, err);
        }
        Error::decode(path, &text)
    })
}

/// `reqwest`-backed [`LlmService`].
pub struct HttpLlmService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLlmService {
    /// Create a client against the given base URL, sharing the pooled
    /// connection client.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: get_shared_http_client().clone(),
        }
    }

    /// Create a client with an explicit [`reqwest::Client`] (e.g. with custom
    /// timeouts in tests).
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl LlmService for HttpLlmService {
    async fn query(
        &self,
        request: &AgentQueryRequest,
        correlation: &CorrelationContext,
    ) -> Result<AgentQueryResponse> {
        post_json(&self.client, &self.base_url, "/agent/query", request, correlation).await
    }

    async fn decompose(
        &self,
        request: &DecomposeRequest,
        correlation: &CorrelationContext,
    ) -> Result<DecompositionResult> {
        post_json(&self.client, &self.base_url, "/agent/decompose", request, correlation).await
    }

    async fn loop_step(
        &self,
        request: &AgentLoopStepInput,
        correlation: &CorrelationContext,
    ) -> Result<AgentLoopStepResult> {
        post_json(&self.client, &self.base_url, "/agent/loop", request, correlation).await
    }

    async fn research_plan(
        &self,
        request: &ResearchPlanRequest,
        correlation: &CorrelationContext,
    ) -> Result<ResearchPlanResponse> {
        post_json(
            &self.client,
            &self.base_url,
            "/agent/research-plan",
            request,
            correlation,
        )
        .await
    }

    async fn verify_claims(
        &self,
        request: &VerifyClaimsRequest,
        correlation: &CorrelationContext,
    ) -> Result<VerificationResult> {
        post_json(
            &self.client,
            &self.base_url,
            "/api/verify_claims",
            request,
            correlation,
        )
        .await
    }

    async fn verify_batch(
        &self,
        request: &VerifyBatchRequest,
        correlation: &CorrelationContext,
    ) -> Result<VerifyBatchResult> {
        post_json(
            &self.client,
            &self.base_url,
            "/api/verify_batch",
            request,
            correlation,
        )
        .await
    }

    async fn compress(
        &self,
        request: &CompressRequest,
        correlation: &CorrelationContext,
    ) -> Result<CompressResponse> {
        post_json(
            &self.client,
            &self.base_url,
            "/context/compress",
            request,
            correlation,
        )
        .await
    }
}

/// `reqwest`-backed [`VectorStore`] speaking a REST points API.
pub struct HttpVectorStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpVectorStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: get_shared_http_client().clone(),
        }
    }

    fn filter_conditions(filter: &SearchFilter) -> Vec<Value> {
        let mut must = Vec::new();
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                must.push(json!({"key": key, "match": {"value": value}}));
            }
        };
        push("session_id", &filter.session_id);
        push("tenant_id", &filter.tenant_id);
        push("agent_id", &filter.agent_id);
        push("type", &filter.doc_type);
        must
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let url = format!(
            "{}/collections/{}/points",
            self.base_url.trim_end_matches('/'),
            collection
        );
        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({"id": p.id, "vector": p.vector, "payload": p.payload}))
                .collect::<Vec<_>>()
        });
        let response = self.client.put(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status.as_u16(), &text));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredPoint>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url.trim_end_matches('/'),
            collection
        );
        let body = json!({
            "vector": query_vector,
            "filter": {"must": Self::filter_conditions(filter)},
            "limit": top_k,
            "score_threshold": threshold,
            "with_payload": true,
            "with_vector": true,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::upstream(status.as_u16(), &text));
        }

        #[derive(serde::Deserialize)]
        struct SearchEnvelope {
            #[serde(default)]
            result: Vec<RawHit>,
        }
        #[derive(serde::Deserialize)]
        struct RawHit {
            id: Value,
            score: f64,
            #[serde(default)]
            payload: Value,
            #[serde(default)]
            vector: Option<Vec<f32>>,
        }

        let envelope: SearchEnvelope =
            serde_json::from_str(&text).map_err(|_| Error::decode("points/search", &text))?;
        Ok(envelope
            .result
            .into_iter()
            .map(|hit| ScoredPoint {
                id: match hit.id {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                score: hit.score,
                payload: hit.payload,
                vector: hit.vector,
            })
            .collect())
    }
}

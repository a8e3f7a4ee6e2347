use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskweave::activities::review::review_key;
use taskweave::activities::ActivityRegistry;
use taskweave::budget::BudgetManager;
use taskweave::config::TaskweaveConfig;
use taskweave::context::CorrelationContext;
use taskweave::error::{Error, Result};
use taskweave::event_bus::EventBus;
use taskweave::memory::MemoryService;
use taskweave::persistence::{InMemoryRelationalStore, PersistenceQueue};
use taskweave::stores::in_memory::{
    FailingKvStore, HashEmbedder, InMemoryKvStore, InMemorySessionStore, InMemoryVectorStore,
};
use taskweave::stores::{
    AgentQueryRequest, AgentQueryResponse, CompressRequest, CompressResponse, DecomposeRequest,
    KvStore, LlmService, ResearchPlanRequest, ResearchPlanResponse, VerifyBatchRequest,
    VerifyClaimsRequest,
};
use taskweave::types::{
    AgentLoopStepInput, AgentLoopStepResult, DecompositionResult, ReviewStatus,
    VerificationResult, VerifyBatchResult, WorkflowIdentity,
};
use taskweave::workflows::{ReviewLoopInput, ReviewOutcome, ReviewWorkflow, WorkflowCtx};

/// Plan service: first round emits machine markers, revisions incorporate
/// the feedback round number.
struct PlanLlm {
    plan_calls: AtomicUsize,
}

#[async_trait]
impl LlmService for PlanLlm {
    async fn query(
        &self,
        _request: &AgentQueryRequest,
        _correlation: &CorrelationContext,
    ) -> Result<AgentQueryResponse> {
        Err(Error::other("not used in this test"))
    }

    async fn decompose(
        &self,
        _request: &DecomposeRequest,
        _correlation: &CorrelationContext,
    ) -> Result<DecompositionResult> {
        Err(Error::other("not used in this test"))
    }

    async fn loop_step(
        &self,
        _request: &AgentLoopStepInput,
        _correlation: &CorrelationContext,
    ) -> Result<AgentLoopStepResult> {
        Err(Error::other("not used in this test"))
    }

    async fn research_plan(
        &self,
        request: &ResearchPlanRequest,
        _correlation: &CorrelationContext,
    ) -> Result<ResearchPlanResponse> {
        let round = self.plan_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ResearchPlanResponse {
            message: format!(
                "[RESEARCH_BRIEF]scope=internal round {}[/RESEARCH_BRIEF]\n\
                 [INTENT:research]\nPlan v{} for: {}\n(revisions: {})",
                round,
                round,
                request.query,
                request.conversation.len() / 2
            ),
            intent: "research".into(),
            round: round as u32,
            model: "gpt-4o".into(),
            provider: "openai".into(),
            input_tokens: 50,
            output_tokens: 100,
        })
    }

    async fn verify_claims(
        &self,
        _request: &VerifyClaimsRequest,
        _correlation: &CorrelationContext,
    ) -> Result<VerificationResult> {
        Err(Error::other("not used in this test"))
    }

    async fn verify_batch(
        &self,
        _request: &VerifyBatchRequest,
        _correlation: &CorrelationContext,
    ) -> Result<VerifyBatchResult> {
        Err(Error::other("not used in this test"))
    }

    async fn compress(
        &self,
        _request: &CompressRequest,
        _correlation: &CorrelationContext,
    ) -> Result<CompressResponse> {
        Err(Error::other("not used in this test"))
    }
}

fn build_registry(kv: Arc<dyn KvStore>) -> Arc<ActivityRegistry> {
    let config = TaskweaveConfig::default();
    let memory = Arc::new(MemoryService::new(
        Arc::new(InMemoryVectorStore::new()),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(HashEmbedder::default()),
        config.memory.clone(),
    ));
    let budget = Arc::new(BudgetManager::new(
        config.budget.clone(),
        config.backpressure.clone(),
        config.breaker.clone(),
    ));
    let bus = Arc::new(EventBus::new());
    let persistence = Arc::new(PersistenceQueue::new(Arc::new(InMemoryRelationalStore::new())));
    Arc::new(ActivityRegistry::new(
        config,
        Arc::new(PlanLlm {
            plan_calls: AtomicUsize::new(0),
        }),
        memory,
        budget,
        bus,
        persistence,
        kv,
    ))
}

fn loop_input() -> ReviewLoopInput {
    ReviewLoopInput {
        query: "map the competitive landscape".into(),
        context: serde_json::Map::new(),
        user_id: "user-1".into(),
        tenant_id: "tenant-1".into(),
        ttl: Some(Duration::from_secs(600)),
        max_rounds: 5,
    }
}

#[tokio::test]
async fn test_plan_approved_first_round() {
    let kv: Arc<InMemoryKvStore> = Arc::new(InMemoryKvStore::new());
    let registry = build_registry(Arc::clone(&kv) as Arc<dyn KvStore>);
    let workflow = ReviewWorkflow::new(Arc::clone(&registry));
    let ctx = WorkflowCtx::new(
        WorkflowIdentity::new("wf-review", "run-1"),
        Arc::clone(registry.bus()),
    );

    ctx.signals()
        .send("plan-feedback", serde_json::json!({"action": "approve"}));

    let outcome = workflow.run(&ctx, &loop_input()).await.unwrap();
    match outcome {
        ReviewOutcome::Approved { plan, rounds } => {
            assert_eq!(rounds, 1);
            // Machine markers never reach the display plan.
            assert!(!plan.contains("RESEARCH_BRIEF"));
            assert!(!plan.contains("INTENT"));
            assert!(plan.contains("Plan v1"));
        }
        other => panic!("expected approval, got {:?}", other),
    }

    // The persisted state reflects the approval.
    let raw = kv.get(&review_key("wf-review")).await.unwrap().unwrap();
    let state: taskweave::types::ReviewState = serde_json::from_str(&raw).unwrap();
    assert_eq!(state.status, ReviewStatus::Approved);
    assert_eq!(state.owner_user_id, "user-1");
}

#[tokio::test]
async fn test_revision_feeds_next_round() {
    let kv: Arc<InMemoryKvStore> = Arc::new(InMemoryKvStore::new());
    let registry = build_registry(Arc::clone(&kv) as Arc<dyn KvStore>);
    let workflow = ReviewWorkflow::new(Arc::clone(&registry));
    let ctx = WorkflowCtx::new(
        WorkflowIdentity::new("wf-revise", "run-1"),
        Arc::clone(registry.bus()),
    );

    let signals = ctx.signals();
    signals.send(
        "plan-feedback",
        serde_json::json!({"action": "revise", "message": "narrow to Europe"}),
    );
    signals.send("plan-feedback", serde_json::json!({"action": "approve"}));

    let outcome = workflow.run(&ctx, &loop_input()).await.unwrap();
    match outcome {
        ReviewOutcome::Approved { plan, rounds } => {
            assert_eq!(rounds, 2);
            // The second plan saw one prior feedback exchange.
            assert!(plan.contains("Plan v2"));
            assert!(plan.contains("revisions: 1"));
        }
        other => panic!("expected approval after revision, got {:?}", other),
    }
}

#[tokio::test]
async fn test_abandon_ends_loop() {
    let kv: Arc<InMemoryKvStore> = Arc::new(InMemoryKvStore::new());
    let registry = build_registry(Arc::clone(&kv) as Arc<dyn KvStore>);
    let workflow = ReviewWorkflow::new(Arc::clone(&registry));
    let ctx = WorkflowCtx::new(
        WorkflowIdentity::new("wf-abandon", "run-1"),
        Arc::clone(registry.bus()),
    );
    ctx.signals()
        .send("plan-feedback", serde_json::json!({"action": "abandon"}));

    let outcome = workflow.run(&ctx, &loop_input()).await.unwrap();
    assert!(matches!(outcome, ReviewOutcome::Abandoned { rounds: 1 }));

    let raw = kv.get(&review_key("wf-abandon")).await.unwrap().unwrap();
    let state: taskweave::types::ReviewState = serde_json::from_str(&raw).unwrap();
    assert_eq!(state.status, ReviewStatus::Abandoned);
}

// The review state store is the only interaction channel; its failure is
// fatal rather than silently continuing.
#[tokio::test]
async fn test_kv_failure_is_fatal() {
    let registry = build_registry(Arc::new(FailingKvStore));
    let workflow = ReviewWorkflow::new(Arc::clone(&registry));
    let ctx = WorkflowCtx::new(
        WorkflowIdentity::new("wf-kvfail", "run-1"),
        Arc::clone(registry.bus()),
    );

    let outcome = workflow.run(&ctx, &loop_input()).await;
    match outcome {
        Err(Error::Store(message)) => assert!(message.contains("review state")),
        other => panic!("expected fatal store error, got {:?}", other),
    }
}

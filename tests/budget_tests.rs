use std::time::Instant;

use taskweave::budget::{BudgetCheckRequest, BudgetManager, BudgetPressure};
use taskweave::config::{BackpressureConfig, BreakerConfig, BudgetConfig};
use taskweave::types::{usage_idempotency_key, TokenBudget, UsageRecord};

fn manager_with(backpressure: BackpressureConfig) -> BudgetManager {
    BudgetManager::new(BudgetConfig::default(), backpressure, BreakerConfig::default())
}

fn request(estimated_tokens: u64) -> BudgetCheckRequest {
    BudgetCheckRequest {
        user_id: "user-1".into(),
        session_id: "session-1".into(),
        task_id: "task-1".into(),
        estimated_tokens,
    }
}

fn session_ledger(budget: u64, used: u64) -> TokenBudget {
    let mut ledger = TokenBudget::new(budget, true, 0.8);
    ledger.used = used;
    ledger
}

// Scenario: session_budget=1000, used=700, estimated=100 ⇒ backpressure is
// active with a 50 ms suggested delay, and the check itself returns without
// sleeping.
#[tokio::test]
async fn test_backpressure_value_only() {
    let manager = manager_with(BackpressureConfig::default());
    manager.set_session_budget("user-1", "session-1", session_ledger(1000, 700));

    let started = Instant::now();
    let decision = manager.check_with_backpressure(&request(100)).await;
    let elapsed = started.elapsed();

    assert!(decision.decision.can_proceed);
    assert!(decision.backpressure_active);
    assert_eq!(decision.backpressure_delay_ms, 50);
    assert_eq!(decision.budget_pressure, BudgetPressure::Low);
    // The delay is a value for the workflow timeline, never applied here.
    assert!(
        elapsed.as_millis() < 50,
        "check must not sleep, took {:?}",
        elapsed
    );
}

// Scenario: failure_threshold=1, one recorded failure ⇒ the breaker check
// fails fast with the circuit-open flag and no suggested delay.
#[tokio::test]
async fn test_breaker_open_check() {
    let manager = BudgetManager::new(
        BudgetConfig::default(),
        BackpressureConfig::default(),
        BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        },
    );

    manager.breaker_for("user-1").record_failure();

    let decision = manager.check_with_breaker(&request(10)).await;
    assert!(!decision.backpressure.decision.can_proceed);
    assert!(decision.circuit_breaker_open);
    assert_eq!(decision.backpressure.backpressure_delay_ms, 0);
    assert_eq!(decision.backpressure.budget_pressure, BudgetPressure::None);
}

// Scenario: BACKPRESSURE_THRESHOLD=0.9 and MAX_BACKPRESSURE_DELAY_MS=120 ⇒
// 85% projected utilisation sees no backpressure, 100% sees a 120 ms delay.
#[tokio::test]
async fn test_env_overrides() {
    std::env::set_var("BACKPRESSURE_THRESHOLD", "0.9");
    std::env::set_var("MAX_BACKPRESSURE_DELAY_MS", "120");
    let config = BackpressureConfig::from_env();
    std::env::remove_var("BACKPRESSURE_THRESHOLD");
    std::env::remove_var("MAX_BACKPRESSURE_DELAY_MS");

    assert!((config.threshold - 0.9).abs() < f64::EPSILON);
    assert_eq!(config.max_delay_ms, 120);

    // 85% projected utilisation: below the overridden threshold.
    let manager = manager_with(config.clone());
    manager.set_session_budget("user-1", "session-1", session_ledger(1000, 750));
    let decision = manager.check_with_backpressure(&request(100)).await;
    assert!(!decision.backpressure_active);
    assert_eq!(decision.backpressure_delay_ms, 0);

    // 100% projected utilisation: high band, capped at the overridden max.
    let manager = manager_with(config);
    manager.set_session_budget("user-1", "session-1", session_ledger(1000, 900));
    let decision = manager.check_with_backpressure(&request(100)).await;
    assert!(decision.backpressure_active);
    assert_eq!(decision.backpressure_delay_ms, 120);
}

// Property: for any number of record_usage calls sharing an idempotency key,
// every ledger moves by the delta of a single application.
#[tokio::test]
async fn test_record_usage_idempotency_property() {
    let manager = manager_with(BackpressureConfig::default());
    let key = usage_idempotency_key("wf-1", "agent-s1", 1);
    let record = UsageRecord {
        user_id: "user-1".into(),
        session_id: "session-1".into(),
        task_id: "task-1".into(),
        agent_id: "agent-s1".into(),
        model: "claude-sonnet-4".into(),
        provider: String::new(),
        input_tokens: 120,
        output_tokens: 80,
        idempotency_key: key,
    };

    for _ in 0..5 {
        manager.record_usage(&record);
    }
    assert_eq!(manager.session_tokens_used("user-1", "session-1"), 200);

    // A different attempt gets a different key and counts again.
    let retry = UsageRecord {
        idempotency_key: usage_idempotency_key("wf-1", "agent-s1", 2),
        ..record
    };
    manager.record_usage(&retry);
    assert_eq!(manager.session_tokens_used("user-1", "session-1"), 400);
}

// Hard limits reject before any tokens are spent; remaining budgets are
// reported for the caller's failure message.
#[tokio::test]
async fn test_hard_limit_rejection_reports_remaining() {
    let manager = manager_with(BackpressureConfig::default());
    manager.set_session_budget("user-1", "session-1", session_ledger(1000, 980));
    manager.set_task_budget("user-1", "task-1", session_ledger(500, 0));

    let decision = manager.check(&request(100)).await;
    assert!(!decision.can_proceed);
    assert_eq!(decision.remaining_session_budget, 20);
    assert_eq!(decision.remaining_task_budget, 500);
}

// Below the threshold there is never a delay, across the whole band.
#[tokio::test]
async fn test_no_backpressure_below_threshold_property() {
    for used in [0u64, 100, 300, 500, 699] {
        let manager = manager_with(BackpressureConfig::default());
        manager.set_session_budget("user-1", "session-1", session_ledger(1000, used));
        let decision = manager.check_with_backpressure(&request(100)).await;
        assert!(!decision.backpressure_active, "used={}", used);
        assert_eq!(decision.backpressure_delay_ms, 0, "used={}", used);
    }
}

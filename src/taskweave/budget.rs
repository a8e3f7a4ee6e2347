//! Token-budget control plane.
//!
//! The [`BudgetManager`] owns per-user, per-session, and per-task token
//! ledgers plus one circuit breaker per user, and answers three questions at
//! every step boundary — all non-blocking:
//!
//! 1. [`check`](BudgetManager::check): may the step proceed at all?
//! 2. [`check_with_backpressure`](BudgetManager::check_with_backpressure):
//!    additionally, should the workflow slow down? The suggested delay is a
//!    *value*; the manager never sleeps. The workflow applies it on its own
//!    timeline so activity workers stay unblocked.
//! 3. [`check_with_breaker`](BudgetManager::check_with_breaker): the same,
//!    wrapped in the caller's per-user circuit breaker.
//!
//! The in-process ledgers are a write-through cache over the durable ledger;
//! an optional [`LedgerReader`] loads budgets on first touch. A ledger read
//! failure fails closed by default, or open (proceed with a recorded
//! warning) when [`BudgetConfig::fail_open`] is set.
//!
//! Ledgers are sharded by user id with one lock per shard, so checks for
//! different users never contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::taskweave::circuit_breaker::CircuitBreaker;
use crate::taskweave::config::{BackpressureConfig, BreakerConfig, BudgetConfig};
use crate::taskweave::error::Result;
use crate::taskweave::types::{TokenBudget, UsageRecord};

/// Inputs to a budget check.
#[derive(Debug, Clone)]
pub struct BudgetCheckRequest {
    pub user_id: String,
    pub session_id: String,
    pub task_id: String,
    pub estimated_tokens: u64,
}

/// Outcome of a basic budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub can_proceed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub remaining_task_budget: u64,
    pub remaining_session_budget: u64,
    /// Warning recorded when a ledger read failed and the manager is
    /// configured to fail open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_warning: Option<String>,
}

/// Utilisation band of the backpressure curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPressure {
    None,
    Low,
    Medium,
    High,
}

/// Outcome of a backpressure-aware budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureDecision {
    #[serde(flatten)]
    pub decision: BudgetDecision,
    pub backpressure_active: bool,
    /// Suggested delay, to be applied by the workflow timeline — never here.
    pub backpressure_delay_ms: u64,
    pub budget_pressure: BudgetPressure,
}

/// Outcome of a breaker-wrapped budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerDecision {
    #[serde(flatten)]
    pub backpressure: BackpressureDecision,
    pub circuit_breaker_open: bool,
}

/// Durable-ledger read-through used to seed the in-process cache.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn load_user(&self, user_id: &str) -> Result<Option<TokenBudget>>;
    async fn load_session(&self, session_id: &str) -> Result<Option<TokenBudget>>;
    async fn load_task(&self, task_id: &str) -> Result<Option<TokenBudget>>;
}

#[derive(Default)]
struct Shard {
    users: HashMap<String, TokenBudget>,
    sessions: HashMap<String, TokenBudget>,
    tasks: HashMap<String, TokenBudget>,
    /// Idempotency keys already applied to the ledgers.
    seen_keys: HashSet<String>,
    usage_rows: Vec<UsageRecord>,
}

/// Per-user/session/task token accounting with backpressure and per-user
/// circuit breakers.
pub struct BudgetManager {
    config: BudgetConfig,
    backpressure: BackpressureConfig,
    breaker_config: BreakerConfig,
    shards: Vec<Mutex<Shard>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    ledger_reader: Option<Arc<dyn LedgerReader>>,
}

impl BudgetManager {
    /// Create a manager with the given configuration and no durable reader.
    pub fn new(
        config: BudgetConfig,
        backpressure: BackpressureConfig,
        breaker_config: BreakerConfig,
    ) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            config,
            backpressure,
            breaker_config,
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            breakers: Mutex::new(HashMap::new()),
            ledger_reader: None,
        }
    }

    /// Builder: attach a durable-ledger read-through.
    pub fn with_ledger_reader(mut self, reader: Arc<dyn LedgerReader>) -> Self {
        self.ledger_reader = Some(reader);
        self
    }

    fn shard_for(&self, user_id: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn default_budget(&self, scope_budget: u64) -> TokenBudget {
        TokenBudget::new(scope_budget, self.config.hard_limit, self.config.warning_threshold)
    }

    /// Pin an explicit session ledger (write-through from configuration).
    pub fn set_session_budget(&self, user_id: &str, session_id: &str, budget: TokenBudget) {
        let mut shard = self.shard_for(user_id).lock().expect("budget shard poisoned");
        shard.sessions.insert(session_id.to_string(), budget);
    }

    /// Pin an explicit task ledger.
    pub fn set_task_budget(&self, user_id: &str, task_id: &str, budget: TokenBudget) {
        let mut shard = self.shard_for(user_id).lock().expect("budget shard poisoned");
        shard.tasks.insert(task_id.to_string(), budget);
    }

    /// Pin an explicit user ledger.
    pub fn set_user_budget(&self, user_id: &str, budget: TokenBudget) {
        let mut shard = self.shard_for(user_id).lock().expect("budget shard poisoned");
        shard.users.insert(user_id.to_string(), budget);
    }

    /// Load missing ledgers from the durable reader, outside any shard lock.
    /// Returns a warning string when a read failed.
    async fn seed_ledgers(&self, request: &BudgetCheckRequest) -> Option<String> {
        let Some(reader) = &self.ledger_reader else {
            return None;
        };

        let (need_user, need_session, need_task) = {
            let shard = self.shard_for(&request.user_id).lock().expect("budget shard poisoned");
            (
                !shard.users.contains_key(&request.user_id),
                !shard.sessions.contains_key(&request.session_id),
                !shard.tasks.contains_key(&request.task_id),
            )
        };

        let mut warning = None;
        let mut loaded: Vec<(Ledger, String, TokenBudget)> = Vec::new();

        if need_user {
            match reader.load_user(&request.user_id).await {
                Ok(Some(budget)) => loaded.push((Ledger::User, request.user_id.clone(), budget)),
                Ok(None) => {}
                Err(err) => warning = Some(format!("user ledger read failed: {}", err)),
            }
        }
        if warning.is_none() && need_session {
            match reader.load_session(&request.session_id).await {
                Ok(Some(budget)) => {
                    loaded.push((Ledger::Session, request.session_id.clone(), budget))
                }
                Ok(None) => {}
                Err(err) => warning = Some(format!("session ledger read failed: {}", err)),
            }
        }
        if warning.is_none() && need_task {
            match reader.load_task(&request.task_id).await {
                Ok(Some(budget)) => loaded.push((Ledger::Task, request.task_id.clone(), budget)),
                Ok(None) => {}
                Err(err) => warning = Some(format!("task ledger read failed: {}", err)),
            }
        }

        if !loaded.is_empty() {
            let mut shard = self.shard_for(&request.user_id).lock().expect("budget shard poisoned");
            for (ledger, key, budget) in loaded {
                let map = match ledger {
                    Ledger::User => &mut shard.users,
                    Ledger::Session => &mut shard.sessions,
                    Ledger::Task => &mut shard.tasks,
                };
                map.entry(key).or_insert(budget);
            }
        }

        warning
    }

    /// Basic budget check: rejects when admitting `estimated_tokens` would
    /// exceed any hard limit.
    pub async fn check(&self, request: &BudgetCheckRequest) -> BudgetDecision {
        self.check_inner(request).await.0
    }

    async fn check_inner(&self, request: &BudgetCheckRequest) -> (BudgetDecision, f64, bool) {
        let warning = self.seed_ledgers(request).await;
        if let Some(warning) = warning {
            log::warn!("{}", warning);
            if self.config.fail_open {
                return (
                    BudgetDecision {
                        can_proceed: true,
                        reason: None,
                        remaining_task_budget: self.config.default_task_budget,
                        remaining_session_budget: self.config.default_session_budget,
                        ledger_warning: Some(warning),
                    },
                    0.0,
                    true,
                );
            }
            return (
                BudgetDecision {
                    can_proceed: false,
                    reason: Some(warning.clone()),
                    remaining_task_budget: 0,
                    remaining_session_budget: 0,
                    ledger_warning: Some(warning),
                },
                0.0,
                true,
            );
        }

        let shard = self.shard_for(&request.user_id).lock().expect("budget shard poisoned");
        let user = shard
            .users
            .get(&request.user_id)
            .cloned()
            .unwrap_or_else(|| self.default_budget(self.config.default_user_budget));
        let session = shard
            .sessions
            .get(&request.session_id)
            .cloned()
            .unwrap_or_else(|| self.default_budget(self.config.default_session_budget));
        let task = shard
            .tasks
            .get(&request.task_id)
            .cloned()
            .unwrap_or_else(|| self.default_budget(self.config.default_task_budget));
        drop(shard);

        let estimated = request.estimated_tokens;
        let mut reason = None;
        if user.would_exceed(estimated) {
            reason = Some(format!(
                "user budget exceeded: {} used of {}, requested {}",
                user.used, user.budget, estimated
            ));
        } else if session.would_exceed(estimated) {
            reason = Some(format!(
                "session budget exceeded: {} used of {}, requested {}",
                session.used, session.budget, estimated
            ));
        } else if task.would_exceed(estimated) {
            reason = Some(format!(
                "task budget exceeded: {} used of {}, requested {}",
                task.used, task.budget, estimated
            ));
        }

        let projected = user
            .projected_utilization(estimated)
            .max(session.projected_utilization(estimated))
            .max(task.projected_utilization(estimated));

        (
            BudgetDecision {
                can_proceed: reason.is_none(),
                reason,
                remaining_task_budget: task.remaining(),
                remaining_session_budget: session.remaining(),
                ledger_warning: None,
            },
            projected,
            false,
        )
    }

    /// Backpressure-aware check. The suggested delay is computed from the
    /// projected-utilisation band and is never applied here.
    pub async fn check_with_backpressure(
        &self,
        request: &BudgetCheckRequest,
    ) -> BackpressureDecision {
        self.check_with_backpressure_inner(request).await.0
    }

    async fn check_with_backpressure_inner(
        &self,
        request: &BudgetCheckRequest,
    ) -> (BackpressureDecision, bool) {
        let (decision, projected, ledger_failed) = self.check_inner(request).await;

        let (pressure, delay_ms) = if !decision.can_proceed {
            (BudgetPressure::None, 0)
        } else {
            pressure_band(&self.backpressure, projected)
        };

        (
            BackpressureDecision {
                decision,
                backpressure_active: pressure != BudgetPressure::None,
                backpressure_delay_ms: delay_ms,
                budget_pressure: pressure,
            },
            ledger_failed,
        )
    }

    /// Breaker-wrapped check. When the user's breaker is open the check
    /// fails fast: `can_proceed = false`, no delay suggested.
    pub async fn check_with_breaker(&self, request: &BudgetCheckRequest) -> BreakerDecision {
        let breaker = self.breaker_for(&request.user_id);
        if breaker.try_acquire(&request.user_id).is_err() {
            return BreakerDecision {
                backpressure: BackpressureDecision {
                    decision: BudgetDecision {
                        can_proceed: false,
                        reason: Some(format!("circuit breaker open for {}", request.user_id)),
                        remaining_task_budget: 0,
                        remaining_session_budget: 0,
                        ledger_warning: None,
                    },
                    backpressure_active: false,
                    backpressure_delay_ms: 0,
                    budget_pressure: BudgetPressure::None,
                },
                circuit_breaker_open: true,
            };
        }

        let (backpressure, ledger_failed) = self.check_with_backpressure_inner(request).await;
        if ledger_failed {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
        BreakerDecision {
            backpressure,
            circuit_breaker_open: false,
        }
    }

    /// The per-user breaker, creating it on first use. Activities record the
    /// outcomes of downstream calls on this breaker.
    pub fn breaker_for(&self, user_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        breakers
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }

    /// Record usage against every ledger and append a usage row.
    ///
    /// Duplicate idempotency keys are a ledger no-op: for any sequence of
    /// `record_usage` calls sharing a key, the ledger delta equals the delta
    /// of a single application.
    pub fn record_usage(&self, record: &UsageRecord) {
        let mut record = record.clone();
        if record.provider.trim().is_empty() {
            record.provider = provider_from_model(&record.model).to_string();
        }

        let total = record.total_tokens();
        let mut shard = self.shard_for(&record.user_id).lock().expect("budget shard poisoned");
        if !shard.seen_keys.insert(record.idempotency_key.clone()) {
            log::debug!(
                "duplicate usage record ignored: {}",
                record.idempotency_key
            );
            return;
        }

        let default_user = self.default_budget(self.config.default_user_budget);
        let default_session = self.default_budget(self.config.default_session_budget);
        let default_task = self.default_budget(self.config.default_task_budget);

        let user = shard
            .users
            .entry(record.user_id.clone())
            .or_insert(default_user);
        user.used = user.used.saturating_add(total);
        warn_if_past_threshold("user", &record.user_id, user);

        let session = shard
            .sessions
            .entry(record.session_id.clone())
            .or_insert(default_session);
        session.used = session.used.saturating_add(total);
        warn_if_past_threshold("session", &record.session_id, session);

        let task = shard
            .tasks
            .entry(record.task_id.clone())
            .or_insert(default_task);
        task.used = task.used.saturating_add(total);
        warn_if_past_threshold("task", &record.task_id, task);

        shard.usage_rows.push(record);
    }

    /// Tokens recorded so far for a session, for tests and reporting.
    pub fn session_tokens_used(&self, user_id: &str, session_id: &str) -> u64 {
        let shard = self.shard_for(user_id).lock().expect("budget shard poisoned");
        shard.sessions.get(session_id).map(|b| b.used).unwrap_or(0)
    }

    /// Number of usage rows appended for a user's shard, for tests.
    pub fn usage_row_count(&self, user_id: &str) -> usize {
        let shard = self.shard_for(user_id).lock().expect("budget shard poisoned");
        shard.usage_rows.len()
    }
}

enum Ledger {
    User,
    Session,
    Task,
}

fn warn_if_past_threshold(scope: &str, id: &str, budget: &TokenBudget) {
    if budget.budget > 0 {
        let utilization = budget.used as f64 / budget.budget as f64;
        if utilization >= budget.warning_threshold && log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "{} {} at {:.0}% of token budget ({} of {})",
                scope,
                id,
                utilization * 100.0,
                budget.used,
                budget.budget
            );
        }
    }
}

/// Map a projected utilisation to its pressure band and suggested delay.
///
/// Below the configured threshold there is no backpressure and the delay is
/// zero. Above it, the delay escalates by band and is always capped at the
/// configured maximum.
pub fn pressure_band(config: &BackpressureConfig, projected: f64) -> (BudgetPressure, u64) {
    if projected < config.threshold {
        return (BudgetPressure::None, 0);
    }
    if projected >= config.high_threshold {
        return (BudgetPressure::High, config.max_delay_ms);
    }
    if projected >= config.medium_threshold {
        return (
            BudgetPressure::Medium,
            config.medium_delay_ms.min(config.max_delay_ms),
        );
    }
    (
        BudgetPressure::Low,
        config.low_delay_ms.min(config.max_delay_ms),
    )
}

/// Derive a provider name from a model name, for records that omit it.
///
/// ```
/// use taskweave::budget::provider_from_model;
///
/// assert_eq!(provider_from_model("gpt-4o"), "openai");
/// assert_eq!(provider_from_model("o3-mini"), "openai");
/// assert_eq!(provider_from_model("claude-sonnet-4"), "anthropic");
/// assert_eq!(provider_from_model("gemini-2.0-flash"), "google");
/// assert_eq!(provider_from_model("deepseek-chat"), "deepseek");
/// assert_eq!(provider_from_model("mystery-model"), "unknown");
/// ```
pub fn provider_from_model(model: &str) -> &'static str {
    let model = model.to_ascii_lowercase();
    if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4") {
        "openai"
    } else if model.starts_with("claude") {
        "anthropic"
    } else if model.starts_with("gemini") {
        "google"
    } else if model.starts_with("deepseek") {
        "deepseek"
    } else if model.starts_with("llama") {
        "meta"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskweave::error::Error;

    fn manager() -> BudgetManager {
        BudgetManager::new(
            BudgetConfig::default(),
            BackpressureConfig::default(),
            BreakerConfig::default(),
        )
    }

    fn request(estimated: u64) -> BudgetCheckRequest {
        BudgetCheckRequest {
            user_id: "user-1".into(),
            session_id: "session-1".into(),
            task_id: "task-1".into(),
            estimated_tokens: estimated,
        }
    }

    #[tokio::test]
    async fn test_record_usage_idempotent() {
        let manager = manager();
        let record = UsageRecord {
            user_id: "user-1".into(),
            session_id: "session-1".into(),
            task_id: "task-1".into(),
            agent_id: "agent-1".into(),
            model: "gpt-4o".into(),
            provider: String::new(),
            input_tokens: 100,
            output_tokens: 50,
            idempotency_key: "wf-1:agent-step-1:1".into(),
        };
        manager.record_usage(&record);
        manager.record_usage(&record);
        manager.record_usage(&record);
        assert_eq!(manager.session_tokens_used("user-1", "session-1"), 150);
        assert_eq!(manager.usage_row_count("user-1"), 1);
    }

    #[tokio::test]
    async fn test_hard_limit_rejects() {
        let manager = manager();
        let mut budget = TokenBudget::new(1000, true, 0.8);
        budget.used = 950;
        manager.set_session_budget("user-1", "session-1", budget);

        let decision = manager.check(&request(100)).await;
        assert!(!decision.can_proceed);
        assert!(decision.reason.as_deref().unwrap().contains("session budget"));
        assert_eq!(decision.remaining_session_budget, 50);
    }

    #[tokio::test]
    async fn test_below_threshold_no_backpressure() {
        let manager = manager();
        let mut budget = TokenBudget::new(1000, true, 0.8);
        budget.used = 100;
        manager.set_session_budget("user-1", "session-1", budget);

        let decision = manager.check_with_backpressure(&request(100)).await;
        assert!(decision.decision.can_proceed);
        assert!(!decision.backpressure_active);
        assert_eq!(decision.backpressure_delay_ms, 0);
        assert_eq!(decision.budget_pressure, BudgetPressure::None);
    }

    #[test]
    fn test_pressure_band_table() {
        let config = BackpressureConfig::default();
        assert_eq!(pressure_band(&config, 0.79), (BudgetPressure::None, 0));
        assert_eq!(pressure_band(&config, 0.80), (BudgetPressure::Low, 50));
        assert_eq!(pressure_band(&config, 0.86), (BudgetPressure::Medium, 150));
        assert_eq!(pressure_band(&config, 0.95), (BudgetPressure::High, 500));
        assert_eq!(pressure_band(&config, 1.5), (BudgetPressure::High, 500));
    }

    #[test]
    fn test_pressure_delay_capped() {
        let config = BackpressureConfig {
            max_delay_ms: 120,
            ..BackpressureConfig::default()
        };
        for projected in [0.95, 0.97, 1.0] {
            let (_, delay) = pressure_band(&config, projected);
            assert!(delay <= 120);
        }
    }

    struct FailingReader;

    #[async_trait]
    impl LedgerReader for FailingReader {
        async fn load_user(&self, _user_id: &str) -> Result<Option<TokenBudget>> {
            Err(Error::store("ledger unavailable"))
        }
        async fn load_session(&self, _session_id: &str) -> Result<Option<TokenBudget>> {
            Err(Error::store("ledger unavailable"))
        }
        async fn load_task(&self, _task_id: &str) -> Result<Option<TokenBudget>> {
            Err(Error::store("ledger unavailable"))
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_closed_by_default() {
        let manager = BudgetManager::new(
            BudgetConfig::default(),
            BackpressureConfig::default(),
            BreakerConfig::default(),
        )
        .with_ledger_reader(Arc::new(FailingReader));

        let decision = manager.check(&request(10)).await;
        assert!(!decision.can_proceed);
        assert!(decision.ledger_warning.is_some());
    }

    #[tokio::test]
    async fn test_ledger_failure_fail_open_when_configured() {
        let manager = BudgetManager::new(
            BudgetConfig {
                fail_open: true,
                ..BudgetConfig::default()
            },
            BackpressureConfig::default(),
            BreakerConfig::default(),
        )
        .with_ledger_reader(Arc::new(FailingReader));

        let decision = manager.check(&request(10)).await;
        assert!(decision.can_proceed);
        assert!(decision.ledger_warning.is_some());
    }
}

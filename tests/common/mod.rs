//! Shared test helpers for integration tests.
//!
//! Fixtures build accounts whose metrics produce a known health class, and
//! fake collaborators record what the engine sent them.

#![allow(dead_code)]

use adpilot::collector::AdPlatform;
use adpilot::config::EngineConfig;
use adpilot::dispatcher::{ExecutionResult, Executor};
use adpilot::llm::{LlmClient, LlmPrompt};
use adpilot::health::HealthScore;
use adpilot::model::{
    Account, AccountStructure, ActionHistoryEntry, AdGroupMode, AdGroupState, AdState, BudgetAuditRecord,
    CampaignState, Creative, Direction, EntityLevel, EntityStatus, LearningStage, QualityRanking, Tolerance, Window,
    WindowedMetrics,
};
use adpilot::notify::{Notification, Notifier};
use adpilot::pipeline::{Collaborators, Engine};
use adpilot::planner::Action;
use adpilot::prom_metrics::Metrics;
use adpilot::retry::{ProviderError, RetryPolicy};
use adpilot::store::{AccountRun, BatchLockInfo, DispatchClaim, LedgerStatus, MemoryStore, Store};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

// ── Database ────────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: Once = Once::new();

/// Apply the schema once per test binary. Runs on its own thread so it can be
/// called from inside `#[tokio::test]`.
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        std::thread::spawn(|| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let db = adpilot::db::Database::connect(&test_db_url()).await.unwrap();
                db.migrate().await.unwrap();
            });
        })
        .join()
        .unwrap();
    });
}

/// Connect to the test database with every table emptied.
pub async fn setup_test_db() -> adpilot::db::Database {
    ensure_schema();
    let db = adpilot::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE health_snapshots, account_runs, batch_lock, dispatch_ledger,
                        action_history, budget_audit, creatives, direction_adgroup_pool,
                        directions, accounts
         RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}

// ── Fixtures ────────────────────────────────────────────────────

/// 06:00 UTC on a fixed day, so every run in a test shares one local date.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 12, 6, 0, 0).unwrap()
}

pub fn account(id: i64, target_cpl_cents: i64) -> Account {
    Account {
        id,
        name: format!("account {id}"),
        platform_account_id: format!("act_{id}"),
        access_token: None,
        daily_budget_cap_cents: 100_000,
        target_cpl_cents,
        utc_offset_minutes: 0,
        adgroup_mode: AdGroupMode::CreateViaApi,
        tolerance: Tolerance::Balanced,
        risk_overrides: None,
        active: true,
    }
}

pub fn direction(id: i64, account_id: i64, budget_cents: i64, target_cpl_cents: i64) -> Direction {
    Direction {
        id,
        account_id,
        name: format!("direction {id}"),
        daily_budget_cents: budget_cents,
        target_cpl_cents,
        platform_campaign_id: Some(format!("c{id}")),
        pre_provisioned: Vec::new(),
        risk_overrides: None,
        active: true,
    }
}

pub fn creative(id: &str, account_id: i64, direction_id: i64) -> Creative {
    Creative {
        id: id.to_string(),
        account_id,
        direction_id: Some(direction_id),
        name: id.to_string(),
        historical_impressions: 20_000,
        historical_leads: 25,
        historical_spend_cents: 20_000,
        active: true,
    }
}

pub fn adgroup(id: &str, campaign_id: &str, budget_cents: i64) -> AdGroupState {
    AdGroupState {
        id: id.to_string(),
        campaign_id: campaign_id.to_string(),
        name: id.to_string(),
        status: EntityStatus::Active,
        daily_budget_cents: budget_cents,
        learning_stage: LearningStage::Stable,
        created_at: None,
        quality_ranking: QualityRanking::Unknown,
        previous_quality_ranking: QualityRanking::Unknown,
    }
}

pub fn ad(id: &str, adgroup_id: &str) -> AdState {
    AdState {
        id: id.to_string(),
        adgroup_id: adgroup_id.to_string(),
        name: format!("Spring offer - {id}"),
        status: EntityStatus::Active,
        creative_id: Some(format!("cr_{id}")),
    }
}

pub fn structure(campaign_ids: &[&str], adgroups: Vec<AdGroupState>, ads: Vec<AdState>) -> AccountStructure {
    AccountStructure {
        campaigns: campaign_ids
            .iter()
            .map(|id| CampaignState {
                id: id.to_string(),
                name: id.to_string(),
                status: EntityStatus::Active,
            })
            .collect(),
        adgroups,
        ads,
    }
}

/// Identical rows for yesterday and every multi-day window, so ratios are
/// stable and no trend or CTR/CPM change shows up. Today has no row.
pub fn steady_rows(
    entity_id: &str,
    level: EntityLevel,
    spend_cents: i64,
    impressions: i64,
    clicks: i64,
    leads: i64,
) -> Vec<WindowedMetrics> {
    [Window::Yesterday, Window::Last3d, Window::Last7d, Window::Last30d]
        .into_iter()
        .map(|window| WindowedMetrics {
            entity_id: entity_id.to_string(),
            level,
            window,
            spend_cents,
            impressions,
            clicks,
            leads,
            quality_leads: None,
            frequency: 1.2,
        })
        .collect()
}

/// One direction with one ad-group `ag1` (one ad) whose CPL is `ratio` ×
/// the 1000-cent target on every window, with plenty of impressions.
pub fn single_adgroup_fixture(ratio: f64, direction_budget: i64, adgroup_budget: i64) -> Fixture {
    let leads = 10;
    let spend = (ratio * 1_000.0 * leads as f64).round() as i64;
    let mut rows = steady_rows("ag1", EntityLevel::AdGroup, spend, 20_000, 300, leads);
    rows.extend(steady_rows("ad1", EntityLevel::Ad, spend, 20_000, 300, leads));
    Fixture {
        account: account(1, 1_000),
        directions: vec![direction(1, 1, direction_budget, 1_000)],
        creatives: Vec::new(),
        platform: FakePlatform::new(
            structure(&["c1"], vec![adgroup("ag1", "c1", adgroup_budget)], vec![ad("ad1", "ag1")]),
            rows,
        ),
    }
}

pub struct Fixture {
    pub account: Account,
    pub directions: Vec<Direction>,
    pub creatives: Vec<Creative>,
    pub platform: FakePlatform,
}

impl Fixture {
    pub async fn store(&self) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_account(self.account.clone(), self.directions.clone(), self.creatives.clone())
            .await;
        store
    }
}

// ── Fakes ───────────────────────────────────────────────────────

/// Serves a fixed structure and metric rows.
pub struct FakePlatform {
    pub structure: AccountStructure,
    pub rows: Vec<WindowedMetrics>,
    pub structure_error: Option<ProviderError>,
    pub structure_calls: AtomicU32,
}

impl FakePlatform {
    pub fn new(structure: AccountStructure, rows: Vec<WindowedMetrics>) -> Self {
        Self {
            structure,
            rows,
            structure_error: None,
            structure_calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            structure_error: Some(error),
            ..Self::new(AccountStructure::default(), Vec::new())
        }
    }
}

#[async_trait]
impl AdPlatform for FakePlatform {
    async fn fetch_structure(&self, _account: &Account) -> Result<AccountStructure, ProviderError> {
        self.structure_calls.fetch_add(1, Ordering::SeqCst);
        match &self.structure_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.structure.clone()),
        }
    }

    async fn fetch_insights(
        &self,
        _account: &Account,
        level: EntityLevel,
        window: Window,
        _today: NaiveDate,
    ) -> Result<Vec<WindowedMetrics>, ProviderError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.level == level && r.window == window)
            .cloned()
            .collect())
    }
}

/// Accepts every action and remembers each batch.
#[derive(Default)]
pub struct RecordingExecutor {
    pub calls: AtomicU32,
    pub batches: Mutex<Vec<(String, Vec<Action>)>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(
        &self,
        _account: &Account,
        idempotency_key: &str,
        actions: &[Action],
    ) -> Result<Vec<ExecutionResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .unwrap()
            .push((idempotency_key.to_string(), actions.to_vec()));
        Ok(actions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let mut r = ExecutionResult::success(i, a.clone());
                if matches!(a, Action::CreateAdGroup { .. } | Action::DuplicateAdGroup { .. }) {
                    r.created_id = Some(format!("created_{i}"));
                }
                r
            })
            .collect())
    }
}

/// Answers every prompt with the same text.
pub struct CannedLlm {
    pub reply: String,
    pub calls: AtomicU32,
}

impl CannedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for CannedLlm {
    async fn complete(&self, _prompt: &LlmPrompt) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ProviderError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(ProviderError::Unavailable("webhook down".into()));
        }
        Ok(())
    }
}

/// Delegates to a [`MemoryStore`] but fails `list_directions` for the listed accounts.
pub struct FailingDirectionsStore {
    pub inner: Arc<MemoryStore>,
    pub failing: Vec<i64>,
}

#[async_trait]
impl Store for FailingDirectionsStore {
    async fn health_check(&self) -> anyhow::Result<()> {
        self.inner.health_check().await
    }
    async fn list_active_accounts(&self) -> anyhow::Result<Vec<Account>> {
        self.inner.list_active_accounts().await
    }
    async fn get_account(&self, account_id: i64) -> anyhow::Result<Option<Account>> {
        self.inner.get_account(account_id).await
    }
    async fn list_directions(&self, account_id: i64) -> anyhow::Result<Vec<Direction>> {
        if self.failing.contains(&account_id) {
            anyhow::bail!("directions for account {account_id} unreadable");
        }
        self.inner.list_directions(account_id).await
    }
    async fn list_creatives(&self, account_id: i64) -> anyhow::Result<Vec<Creative>> {
        self.inner.list_creatives(account_id).await
    }
    async fn budget_audit_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<BudgetAuditRecord>> {
        self.inner.budget_audit_since(account_id, since).await
    }
    async fn append_budget_audit(&self, records: &[BudgetAuditRecord]) -> anyhow::Result<()> {
        self.inner.append_budget_audit(records).await
    }
    async fn recent_actions(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ActionHistoryEntry>> {
        self.inner.recent_actions(account_id, since).await
    }
    async fn record_actions(&self, entries: &[ActionHistoryEntry]) -> anyhow::Result<()> {
        self.inner.record_actions(entries).await
    }
    async fn save_health_snapshot(&self, account_id: i64, run_id: Uuid, scores: &[HealthScore]) -> anyhow::Result<()> {
        self.inner.save_health_snapshot(account_id, run_id, scores).await
    }
    async fn claim_dispatch(&self, key: &str, account_id: i64, run_id: Uuid) -> anyhow::Result<DispatchClaim> {
        self.inner.claim_dispatch(key, account_id, run_id).await
    }
    async fn complete_dispatch(
        &self,
        key: &str,
        status: LedgerStatus,
        results: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.inner.complete_dispatch(key, status, results).await
    }
    async fn try_acquire_batch_lock(&self, owner: &str, ttl_secs: i64) -> anyhow::Result<bool> {
        self.inner.try_acquire_batch_lock(owner, ttl_secs).await
    }
    async fn refresh_batch_lock(&self, owner: &str, ttl_secs: i64) -> anyhow::Result<bool> {
        self.inner.refresh_batch_lock(owner, ttl_secs).await
    }
    async fn release_batch_lock(&self, owner: &str) -> anyhow::Result<()> {
        self.inner.release_batch_lock(owner).await
    }
    async fn batch_lock(&self) -> anyhow::Result<Option<BatchLockInfo>> {
        self.inner.batch_lock().await
    }
    async fn insert_run(&self, run: &AccountRun) -> anyhow::Result<()> {
        self.inner.insert_run(run).await
    }
    async fn list_runs(&self, account_id: Option<i64>, limit: i64) -> anyhow::Result<Vec<AccountRun>> {
        self.inner.list_runs(account_id, limit).await
    }
}

// ── Engine assembly ─────────────────────────────────────────────

/// Retries without real sleeps.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.collector.retry = fast_retry();
    config.dispatcher.retry = fast_retry();
    config.llm.retry = fast_retry();
    config.notify.retry = fast_retry();
    config
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<RecordingExecutor>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(
    config: EngineConfig,
    store: Arc<MemoryStore>,
    platform: Arc<dyn AdPlatform>,
    llm: Option<Arc<dyn LlmClient>>,
    notifier: RecordingNotifier,
) -> Harness {
    let executor = Arc::new(RecordingExecutor::default());
    let notifier = Arc::new(notifier);
    let engine = engine_over(
        config,
        store.clone(),
        platform,
        executor.clone(),
        llm,
        notifier.clone(),
    );
    Harness {
        engine,
        store,
        executor,
        notifier,
    }
}

/// Engine over any [`Store`], for tests that wrap the in-memory one.
pub fn engine_over(
    config: EngineConfig,
    store: Arc<dyn Store>,
    platform: Arc<dyn AdPlatform>,
    executor: Arc<RecordingExecutor>,
    llm: Option<Arc<dyn LlmClient>>,
    notifier: Arc<RecordingNotifier>,
) -> Arc<Engine> {
    Arc::new(Engine::new(
        config,
        Collaborators {
            store,
            platform,
            executor,
            llm,
            notifier,
            metrics: Arc::new(Metrics::new()),
        },
    ))
}

/// Engine over the fixture's store and platform, rules planner only.
pub async fn fixture_harness(fixture: Fixture, config: EngineConfig) -> (Harness, Account) {
    let store = fixture.store().await;
    let account = fixture.account.clone();
    let h = harness(
        config,
        store,
        Arc::new(fixture.platform),
        None,
        RecordingNotifier::default(),
    );
    (h, account)
}

/// Budget of every ad-group after applying `actions` to `structure`.
pub fn budgets_after(structure: &AccountStructure, actions: &[Action]) -> Vec<(String, i64)> {
    let mut out: Vec<(String, i64)> = structure
        .adgroups
        .iter()
        .filter(|g| g.is_active())
        .map(|g| (g.id.clone(), g.daily_budget_cents))
        .collect();
    for action in actions {
        match action {
            Action::UpdateAdGroupBudget {
                adgroup_id,
                new_budget_cents,
                ..
            } => {
                if let Some(e) = out.iter_mut().find(|(id, _)| id == adgroup_id) {
                    e.1 = *new_budget_cents;
                }
            }
            Action::PauseAdGroup { adgroup_id, .. } => out.retain(|(id, _)| id != adgroup_id),
            Action::CreateAdGroup {
                daily_budget_cents, ..
            }
            | Action::DuplicateAdGroup {
                daily_budget_cents, ..
            } => out.push(("new".to_string(), *daily_budget_cents)),
            Action::ActivateAdGroup {
                adgroup_id,
                daily_budget_cents,
                ..
            } => out.push((adgroup_id.clone(), daily_budget_cents.unwrap_or_default())),
            Action::PauseAd { .. } => {}
        }
    }
    out
}

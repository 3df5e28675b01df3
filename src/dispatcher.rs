//! # Dispatcher: Idempotent Hand-off to the Execution Collaborator
//!
//! Validated actions go out as one batch tagged with an idempotency key. The
//! collaborator owns entity-level ordering and answers with one
//! [`ExecutionResult`] per action; a failed action never blocks the others.
//!
//! ## Flow
//!
//! 1. Empty plan: nothing to do.
//! 2. Dry run: every action reported `skipped`, the ledger is not touched.
//! 3. Claim the key in the dispatch ledger. A completed key replays the stored
//!    results without calling the collaborator; an in-flight key is a
//!    duplicate with no results.
//! 4. Actions beyond `max_actions_per_run` are `skipped`.
//! 5. Send with bounded retry. Results are aligned by index; an action the
//!    collaborator did not report on is `failed` with kind `unknown`.
//! 6. Successes append to the budget audit log and the action history. Store
//!    errors after the send are logged and the results still returned.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Account, AccountStructure, ActionHistoryEntry, BudgetAuditRecord};
use crate::planner::Action;
use crate::retry::{with_retry, ErrorKind, ProviderError, RetryPolicy};
use crate::store::{DispatchClaim, LedgerStatus, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one action, as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Position of the action in the dispatched batch.
    pub index: usize,
    pub action: Action,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub message: Option<String>,
    /// Platform id of an entity the action created.
    #[serde(default)]
    pub created_id: Option<String>,
}

impl ExecutionResult {
    pub fn success(index: usize, action: Action) -> Self {
        Self {
            index,
            action,
            status: ExecutionStatus::Success,
            error_kind: None,
            message: None,
            created_id: None,
        }
    }

    pub fn failed(index: usize, action: Action, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            index,
            action,
            status: ExecutionStatus::Failed,
            error_kind: Some(kind),
            message: Some(message.into()),
            created_id: None,
        }
    }

    pub fn skipped(index: usize, action: Action, message: impl Into<String>) -> Self {
        Self {
            index,
            action,
            status: ExecutionStatus::Skipped,
            error_kind: None,
            message: Some(message.into()),
            created_id: None,
        }
    }
}

/// Write side of the advertising platform.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        account: &Account,
        idempotency_key: &str,
        actions: &[Action],
    ) -> Result<Vec<ExecutionResult>, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Safety valve on real-world changes per account run.
    pub max_actions_per_run: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_actions_per_run: 25,
            retry: RetryPolicy::default(),
        }
    }
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `{account_id}:{YYYY-MM-DD}:{plan hash}`. The hash covers the serialized
/// action list, so the same plan on the same local day maps to the same key.
pub fn idempotency_key(account_id: i64, local_date: NaiveDate, actions: &[Action]) -> String {
    let canonical = serde_json::to_string(actions).unwrap_or_default();
    let hash = sha256_hex(&canonical);
    format!("{account_id}:{}:{}", local_date.format("%Y-%m-%d"), &hash[..16])
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Empty,
    DryRun { key: String, results: Vec<ExecutionResult> },
    /// The key was already used; results are the stored ones, if any.
    Duplicate { key: String, results: Vec<ExecutionResult> },
    Dispatched { key: String, results: Vec<ExecutionResult> },
}

impl DispatchOutcome {
    pub fn results(&self) -> &[ExecutionResult] {
        match self {
            DispatchOutcome::Empty => &[],
            DispatchOutcome::DryRun { results, .. }
            | DispatchOutcome::Duplicate { results, .. }
            | DispatchOutcome::Dispatched { results, .. } => results,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Empty => None,
            DispatchOutcome::DryRun { key, .. }
            | DispatchOutcome::Duplicate { key, .. }
            | DispatchOutcome::Dispatched { key, .. } => Some(key),
        }
    }

    pub fn note(&self) -> String {
        match self {
            DispatchOutcome::Empty => "no actions to dispatch".to_string(),
            DispatchOutcome::DryRun { results, .. } => {
                format!("dry run, {} action(s) not sent", results.len())
            }
            DispatchOutcome::Duplicate { key, .. } => {
                format!("duplicate of an earlier dispatch (key {key}), nothing sent")
            }
            DispatchOutcome::Dispatched { key, results } => {
                format!("{} action(s) sent (key {key})", results.len())
            }
        }
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.results().iter().filter(|r| r.status == status).count()
    }
}

pub struct DispatchRequest<'a> {
    pub account: &'a Account,
    pub local_date: NaiveDate,
    pub run_id: Uuid,
    pub actions: &'a [Action],
    /// Pre-dispatch structure, for the old side of budget audit records.
    pub structure: &'a AccountStructure,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, executor: Arc<dyn Executor>, config: DispatcherConfig) -> Self {
        Self { store, executor, config }
    }

    pub async fn dispatch(&self, req: &DispatchRequest<'_>) -> Result<DispatchOutcome> {
        if req.actions.is_empty() {
            return Ok(DispatchOutcome::Empty);
        }
        let key = idempotency_key(req.account.id, req.local_date, req.actions);

        if req.dry_run {
            let results = req
                .actions
                .iter()
                .enumerate()
                .map(|(i, a)| ExecutionResult::skipped(i, a.clone(), "dry run"))
                .collect();
            return Ok(DispatchOutcome::DryRun { key, results });
        }

        match self.store.claim_dispatch(&key, req.account.id, req.run_id).await? {
            DispatchClaim::Claimed => {}
            DispatchClaim::Completed(stored) => {
                info!(account_id = req.account.id, key = %key, "plan already dispatched, replaying stored results");
                let results = serde_json::from_value(stored).unwrap_or_default();
                return Ok(DispatchOutcome::Duplicate { key, results });
            }
            DispatchClaim::InFlight => {
                info!(account_id = req.account.id, key = %key, "dispatch already in flight");
                return Ok(DispatchOutcome::Duplicate { key, results: Vec::new() });
            }
        }

        let limit = self.config.max_actions_per_run.min(req.actions.len());
        let (send, overflow) = req.actions.split_at(limit);
        if !overflow.is_empty() {
            warn!(
                account_id = req.account.id,
                sent = send.len(),
                skipped = overflow.len(),
                "per-run action limit reached"
            );
        }

        let reply = with_retry(&self.config.retry, "executor.execute", || {
            self.executor.execute(req.account, &key, send)
        })
        .await;

        let mut results = match reply {
            Ok(reported) => align_results(send, reported),
            Err(e) => {
                warn!(account_id = req.account.id, key = %key, error = %e, "dispatch failed");
                let results: Vec<ExecutionResult> = send
                    .iter()
                    .enumerate()
                    .map(|(i, a)| ExecutionResult::failed(i, a.clone(), e.kind(), e.to_string()))
                    .collect();
                let stored = serde_json::to_value(&results)?;
                if let Err(e) = self.store.complete_dispatch(&key, LedgerStatus::Failed, &stored).await {
                    warn!(account_id = req.account.id, key = %key, error = %e, "ledger not updated");
                }
                return Ok(DispatchOutcome::Dispatched { key, results });
            }
        };
        results.extend(
            overflow
                .iter()
                .enumerate()
                .map(|(i, a)| ExecutionResult::skipped(limit + i, a.clone(), "per-run action limit reached")),
        );

        // Sent actions are reported even when the bookkeeping below fails.
        let stored = serde_json::to_value(&results)?;
        if let Err(e) = self.store.complete_dispatch(&key, LedgerStatus::Complete, &stored).await {
            warn!(account_id = req.account.id, key = %key, error = %e, "ledger not updated");
        }
        if let Err(e) = self.record_history(req, &results).await {
            warn!(account_id = req.account.id, key = %key, error = %e, "action history not recorded");
        }

        info!(
            account_id = req.account.id,
            key = %key,
            succeeded = results.iter().filter(|r| r.status == ExecutionStatus::Success).count(),
            failed = results.iter().filter(|r| r.status == ExecutionStatus::Failed).count(),
            "dispatch complete"
        );
        Ok(DispatchOutcome::Dispatched { key, results })
    }

    async fn record_history(&self, req: &DispatchRequest<'_>, results: &[ExecutionResult]) -> Result<()> {
        let succeeded: Vec<&ExecutionResult> = results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Success)
            .collect();
        if succeeded.is_empty() {
            return Ok(());
        }
        let audit: Vec<BudgetAuditRecord> = succeeded
            .iter()
            .filter_map(|r| audit_record(req, r))
            .collect();
        let history: Vec<ActionHistoryEntry> = succeeded
            .iter()
            .map(|r| ActionHistoryEntry {
                account_id: req.account.id,
                entity_id: r.action.entity_id(),
                action_type: r.action.kind().to_string(),
                run_id: Some(req.run_id),
                executed_at: req.now,
            })
            .collect();
        if !audit.is_empty() {
            self.store.append_budget_audit(&audit).await?;
        }
        self.store.record_actions(&history).await
    }
}

/// Order the collaborator's results by action index, filling gaps.
fn align_results(sent: &[Action], reported: Vec<ExecutionResult>) -> Vec<ExecutionResult> {
    let mut slots: Vec<Option<ExecutionResult>> = vec![None; sent.len()];
    for r in reported {
        let i = r.index;
        if i < sent.len() && slots[i].is_none() {
            slots[i] = Some(r);
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.unwrap_or_else(|| {
                ExecutionResult::failed(i, sent[i].clone(), ErrorKind::Unknown, "no result reported")
            })
        })
        .collect()
}

fn audit_record(req: &DispatchRequest<'_>, r: &ExecutionResult) -> Option<BudgetAuditRecord> {
    let current = |id: &str| {
        req.structure
            .adgroup(id)
            .map(|g| if g.is_active() { g.daily_budget_cents } else { 0 })
            .unwrap_or(0)
    };
    let (adgroup_id, direction_id, old, new) = match &r.action {
        Action::UpdateAdGroupBudget {
            adgroup_id,
            direction_id,
            new_budget_cents,
            ..
        } => (adgroup_id.clone(), *direction_id, current(adgroup_id), *new_budget_cents),
        Action::PauseAdGroup {
            adgroup_id,
            direction_id,
            ..
        } => (adgroup_id.clone(), *direction_id, current(adgroup_id), 0),
        Action::ActivateAdGroup {
            adgroup_id,
            direction_id,
            daily_budget_cents,
            ..
        } => {
            let budget = daily_budget_cents
                .or_else(|| req.structure.adgroup(adgroup_id).map(|g| g.daily_budget_cents))?;
            (adgroup_id.clone(), Some(*direction_id), 0, budget)
        }
        Action::CreateAdGroup {
            direction_id,
            daily_budget_cents,
            ..
        }
        | Action::DuplicateAdGroup {
            direction_id,
            daily_budget_cents,
            ..
        } => (r.created_id.clone()?, Some(*direction_id), 0, *daily_budget_cents),
        Action::PauseAd { .. } => return None,
    };
    Some(BudgetAuditRecord {
        account_id: req.account.id,
        adgroup_id,
        direction_id,
        old_budget_cents: old,
        new_budget_cents: new,
        action_type: r.action.kind().to_string(),
        run_id: Some(req.run_id),
        changed_at: req.now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdGroupMode, EntityStatus, Tolerance};
    use crate::planner::tests_support::adgroup_state;
    use crate::health::HealthScore;
    use crate::model::{Creative, Direction};
    use crate::store::{AccountRun, BatchLockInfo, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeExecutor {
        calls: AtomicU32,
        fail_with: Option<ProviderError>,
        drop_last: bool,
        seen: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: None,
                drop_last: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn execute(
            &self,
            _account: &Account,
            key: &str,
            actions: &[Action],
        ) -> Result<Vec<ExecutionResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(key.to_string());
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let mut out: Vec<ExecutionResult> = actions
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    let mut r = ExecutionResult::success(i, a.clone());
                    if matches!(a, Action::CreateAdGroup { .. }) {
                        r.created_id = Some(format!("new{i}"));
                    }
                    r
                })
                .collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    /// Claims work; every write after the send fails.
    #[derive(Default)]
    struct WriteFailingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for WriteFailingStore {
        async fn health_check(&self) -> Result<()> {
            self.inner.health_check().await
        }
        async fn list_active_accounts(&self) -> Result<Vec<Account>> {
            self.inner.list_active_accounts().await
        }
        async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
            self.inner.get_account(account_id).await
        }
        async fn list_directions(&self, account_id: i64) -> Result<Vec<Direction>> {
            self.inner.list_directions(account_id).await
        }
        async fn list_creatives(&self, account_id: i64) -> Result<Vec<Creative>> {
            self.inner.list_creatives(account_id).await
        }
        async fn budget_audit_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<BudgetAuditRecord>> {
            self.inner.budget_audit_since(account_id, since).await
        }
        async fn append_budget_audit(&self, _records: &[BudgetAuditRecord]) -> Result<()> {
            anyhow::bail!("audit table unavailable")
        }
        async fn recent_actions(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<ActionHistoryEntry>> {
            self.inner.recent_actions(account_id, since).await
        }
        async fn record_actions(&self, _entries: &[ActionHistoryEntry]) -> Result<()> {
            anyhow::bail!("history table unavailable")
        }
        async fn save_health_snapshot(&self, account_id: i64, run_id: Uuid, scores: &[HealthScore]) -> Result<()> {
            self.inner.save_health_snapshot(account_id, run_id, scores).await
        }
        async fn claim_dispatch(&self, key: &str, account_id: i64, run_id: Uuid) -> Result<DispatchClaim> {
            self.inner.claim_dispatch(key, account_id, run_id).await
        }
        async fn complete_dispatch(&self, _key: &str, _status: LedgerStatus, _results: &serde_json::Value) -> Result<()> {
            anyhow::bail!("connection reset")
        }
        async fn try_acquire_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
            self.inner.try_acquire_batch_lock(owner, ttl_secs).await
        }
        async fn refresh_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
            self.inner.refresh_batch_lock(owner, ttl_secs).await
        }
        async fn release_batch_lock(&self, owner: &str) -> Result<()> {
            self.inner.release_batch_lock(owner).await
        }
        async fn batch_lock(&self) -> Result<Option<BatchLockInfo>> {
            self.inner.batch_lock().await
        }
        async fn insert_run(&self, run: &AccountRun) -> Result<()> {
            self.inner.insert_run(run).await
        }
        async fn list_runs(&self, account_id: Option<i64>, limit: i64) -> Result<Vec<AccountRun>> {
            self.inner.list_runs(account_id, limit).await
        }
    }

    fn account() -> Account {
        Account {
            id: 7,
            name: "acme".into(),
            platform_account_id: "act_7".into(),
            access_token: None,
            daily_budget_cap_cents: 100_000,
            target_cpl_cents: 1_000,
            utc_offset_minutes: 0,
            adgroup_mode: AdGroupMode::CreateViaApi,
            tolerance: Tolerance::Balanced,
            risk_overrides: None,
            active: true,
        }
    }

    fn structure() -> AccountStructure {
        AccountStructure {
            campaigns: vec![],
            adgroups: vec![adgroup_state("g1", 4_000, EntityStatus::Active)],
            ads: vec![],
        }
    }

    fn actions() -> Vec<Action> {
        vec![
            Action::UpdateAdGroupBudget {
                adgroup_id: "g1".into(),
                direction_id: Some(1),
                new_budget_cents: 2_000,
                reason: "expensive".into(),
            },
            Action::CreateAdGroup {
                direction_id: 1,
                campaign_id: "c1".into(),
                daily_budget_cents: 2_000,
                creative_ids: vec!["cr1".into()],
                reason: "expand".into(),
            },
        ]
    }

    fn fast() -> DispatcherConfig {
        DispatcherConfig {
            max_actions_per_run: 25,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        }
    }

    fn request<'a>(
        account: &'a Account,
        actions: &'a [Action],
        structure: &'a AccountStructure,
        dry_run: bool,
    ) -> DispatchRequest<'a> {
        DispatchRequest {
            account,
            local_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            run_id: Uuid::new_v4(),
            actions,
            structure,
            dry_run,
            now: Utc::now(),
        }
    }

    #[test]
    fn key_is_stable_and_plan_sensitive() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let a = idempotency_key(7, date, &actions());
        assert_eq!(a, idempotency_key(7, date, &actions()));
        assert!(a.starts_with("7:2026-03-01:"));
        assert_eq!(a.rsplit(':').next().unwrap().len(), 16);
        assert_ne!(a, idempotency_key(7, date, &actions()[..1]));
        assert_ne!(a, idempotency_key(7, date.succ_opt().unwrap(), &actions()));
    }

    #[tokio::test]
    async fn replay_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let exec = Arc::new(FakeExecutor::ok());
        let d = Dispatcher::new(store.clone(), exec.clone(), fast());
        let (acct, acts, st) = (account(), actions(), structure());

        let first = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        let second = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();

        assert!(matches!(first, DispatchOutcome::Dispatched { .. }));
        assert!(matches!(second, DispatchOutcome::Duplicate { .. }));
        assert_eq!(second.results(), first.results());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.action_history().await.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_sends_nothing() {
        let store = Arc::new(MemoryStore::new());
        let exec = Arc::new(FakeExecutor::ok());
        let d = Dispatcher::new(store.clone(), exec.clone(), fast());
        let (acct, acts, st) = (account(), actions(), structure());

        let out = d.dispatch(&request(&acct, &acts, &st, true)).await.unwrap();
        assert_eq!(out.count(ExecutionStatus::Skipped), 2);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(store.ledger_entry(out.key().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn audit_records_budget_changes() {
        let store = Arc::new(MemoryStore::new());
        let d = Dispatcher::new(store.clone(), Arc::new(FakeExecutor::ok()), fast());
        let (acct, acts, st) = (account(), actions(), structure());
        d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();

        let audit = store.audit_records().await;
        assert_eq!(audit.len(), 2);
        assert_eq!((audit[0].old_budget_cents, audit[0].new_budget_cents), (4_000, 2_000));
        assert!(audit[0].is_decrease());
        assert_eq!(audit[1].adgroup_id, "new1");
        assert!(audit[1].is_increase());
    }

    #[tokio::test]
    async fn unreported_action_fails_with_unknown_kind() {
        let store = Arc::new(MemoryStore::new());
        let exec = Arc::new(FakeExecutor {
            drop_last: true,
            ..FakeExecutor::ok()
        });
        let d = Dispatcher::new(store, exec, fast());
        let (acct, acts, st) = (account(), actions(), structure());
        let out = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        let last = &out.results()[1];
        assert_eq!(last.status, ExecutionStatus::Failed);
        assert_eq!(last.error_kind, Some(ErrorKind::Unknown));
        assert_eq!(out.results()[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn transient_failure_is_bounded_and_reclaimable() {
        let store = Arc::new(MemoryStore::new());
        let exec = Arc::new(FakeExecutor {
            fail_with: Some(ProviderError::Server {
                status: 503,
                message: "down".into(),
            }),
            ..FakeExecutor::ok()
        });
        let d = Dispatcher::new(store.clone(), exec.clone(), fast());
        let (acct, acts, st) = (account(), actions(), structure());

        let out = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.count(ExecutionStatus::Failed), 2);
        assert_eq!(out.results()[0].error_kind, Some(ErrorKind::Transient));
        let entry = store.ledger_entry(out.key().unwrap()).await.unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert!(store.audit_records().await.is_empty());

        let again = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        assert!(matches!(again, DispatchOutcome::Dispatched { .. }), "failed key is claimable again");
    }

    #[tokio::test]
    async fn overflow_beyond_limit_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let exec = Arc::new(FakeExecutor::ok());
        let mut cfg = fast();
        cfg.max_actions_per_run = 1;
        let d = Dispatcher::new(store, exec, cfg);
        let (acct, acts, st) = (account(), actions(), structure());
        let out = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        assert_eq!(out.results()[0].status, ExecutionStatus::Success);
        assert_eq!(out.results()[1].status, ExecutionStatus::Skipped);
        assert_eq!(out.results()[1].index, 1);
    }

    #[tokio::test]
    async fn store_failure_after_send_still_reports_results() {
        let store = Arc::new(WriteFailingStore::default());
        let exec = Arc::new(FakeExecutor::ok());
        let d = Dispatcher::new(store.clone(), exec.clone(), fast());
        let (acct, acts, st) = (account(), actions(), structure());

        let out = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();

        assert!(matches!(out, DispatchOutcome::Dispatched { .. }));
        assert_eq!(out.count(ExecutionStatus::Success), 2);
        assert_eq!(out.results()[1].created_id.as_deref(), Some("new1"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_failure_after_executor_error_still_reports_results() {
        let store = Arc::new(WriteFailingStore::default());
        let exec = Arc::new(FakeExecutor {
            fail_with: Some(ProviderError::Client {
                status: 400,
                message: "bad budget".into(),
            }),
            ..FakeExecutor::ok()
        });
        let d = Dispatcher::new(store, exec, fast());
        let (acct, acts, st) = (account(), actions(), structure());

        let out = d.dispatch(&request(&acct, &acts, &st, false)).await.unwrap();
        assert_eq!(out.count(ExecutionStatus::Failed), 2);
    }

    #[test]
    fn align_ignores_stray_and_repeated_indices() {
        let sent = actions();
        let mut stray = ExecutionResult::success(5, sent[0].clone());
        stray.created_id = Some("stray".into());
        let mut repeat = ExecutionResult::failed(0, sent[0].clone(), ErrorKind::Client, "late");
        repeat.created_id = Some("repeat".into());
        let reported = vec![ExecutionResult::success(0, sent[0].clone()), stray, repeat];

        let aligned = align_results(&sent, reported);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].status, ExecutionStatus::Success, "first report for an index wins");
        assert_eq!(aligned[1].status, ExecutionStatus::Failed);
        assert_eq!(aligned[1].error_kind, Some(ErrorKind::Unknown));
    }
}

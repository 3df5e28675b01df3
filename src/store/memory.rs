//! In-process [`Store`] backed by `tokio::sync::Mutex`ed collections.
//!
//! Semantics match the PostgreSQL store: the lock expires by wall clock, a
//! `failed` ledger row can be claimed again, runs list newest first.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AccountRun, BatchLockInfo, DispatchClaim, LedgerStatus, Store};
use crate::health::HealthScore;
use crate::model::{Account, ActionHistoryEntry, BudgetAuditRecord, Creative, Direction};

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: i64,
    pub run_id: Uuid,
    pub status: LedgerStatus,
    pub results: Option<serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    accounts: Vec<Account>,
    directions: Vec<Direction>,
    creatives: Vec<Creative>,
    audit: Vec<BudgetAuditRecord>,
    actions: Vec<ActionHistoryEntry>,
    snapshots: Vec<(i64, Uuid, HealthScore)>,
    ledger: HashMap<String, LedgerEntry>,
    lock: Option<BatchLockInfo>,
    runs: Vec<AccountRun>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account together with its directions and creatives.
    pub async fn upsert_account(&self, account: Account, directions: Vec<Direction>, creatives: Vec<Creative>) {
        let mut inner = self.inner.lock().await;
        let id = account.id;
        inner.accounts.retain(|a| a.id != id);
        inner.accounts.push(account);
        inner.directions.retain(|d| d.account_id != id);
        inner.directions.extend(directions);
        inner.creatives.retain(|c| c.account_id != id);
        inner.creatives.extend(creatives);
    }

    pub async fn audit_records(&self) -> Vec<BudgetAuditRecord> {
        self.inner.lock().await.audit.clone()
    }

    pub async fn action_history(&self) -> Vec<ActionHistoryEntry> {
        self.inner.lock().await.actions.clone()
    }

    pub async fn ledger_entry(&self, key: &str) -> Option<LedgerEntry> {
        self.inner.lock().await.ledger.get(key).cloned()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }

    /// Plant a lock held by `owner` until `expires_at`.
    pub async fn set_lock(&self, owner: &str, expires_at: DateTime<Utc>) {
        self.inner.lock().await.lock = Some(BatchLockInfo {
            owner: owner.to_string(),
            acquired_at: Utc::now(),
            expires_at,
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Account> = inner.accounts.iter().filter(|a| a.active).cloned().collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self.inner.lock().await.accounts.iter().find(|a| a.id == account_id).cloned())
    }

    async fn list_directions(&self, account_id: i64) -> Result<Vec<Direction>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Direction> = inner
            .directions
            .iter()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    async fn list_creatives(&self, account_id: i64) -> Result<Vec<Creative>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .creatives
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn budget_audit_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<BudgetAuditRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audit
            .iter()
            .filter(|r| r.account_id == account_id && r.changed_at >= since)
            .cloned()
            .collect())
    }

    async fn append_budget_audit(&self, records: &[BudgetAuditRecord]) -> Result<()> {
        self.inner.lock().await.audit.extend_from_slice(records);
        Ok(())
    }

    async fn recent_actions(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<ActionHistoryEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.account_id == account_id && a.executed_at >= since)
            .cloned()
            .collect())
    }

    async fn record_actions(&self, entries: &[ActionHistoryEntry]) -> Result<()> {
        self.inner.lock().await.actions.extend_from_slice(entries);
        Ok(())
    }

    async fn save_health_snapshot(&self, account_id: i64, run_id: Uuid, scores: &[HealthScore]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .snapshots
            .extend(scores.iter().map(|s| (account_id, run_id, s.clone())));
        Ok(())
    }

    async fn claim_dispatch(&self, key: &str, account_id: i64, run_id: Uuid) -> Result<DispatchClaim> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.ledger.get(key) {
            match entry.status {
                LedgerStatus::Complete => {
                    return Ok(DispatchClaim::Completed(
                        entry.results.clone().unwrap_or(serde_json::Value::Null),
                    ))
                }
                LedgerStatus::Pending => return Ok(DispatchClaim::InFlight),
                LedgerStatus::Failed => {}
            }
        }
        inner.ledger.insert(
            key.to_string(),
            LedgerEntry {
                account_id,
                run_id,
                status: LedgerStatus::Pending,
                results: None,
            },
        );
        Ok(DispatchClaim::Claimed)
    }

    async fn complete_dispatch(&self, key: &str, status: LedgerStatus, results: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.ledger.get_mut(key) {
            entry.status = status;
            entry.results = Some(results.clone());
        }
        Ok(())
    }

    async fn try_acquire_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let free = match &inner.lock {
            None => true,
            Some(l) => l.owner == owner || l.expires_at < now,
        };
        if free {
            inner.lock = Some(BatchLockInfo {
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(ttl_secs),
            });
        }
        Ok(free)
    }

    async fn refresh_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.lock.as_mut() {
            Some(l) if l.owner == owner => {
                l.expires_at = Utc::now() + Duration::seconds(ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_batch_lock(&self, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.owner == owner) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn batch_lock(&self) -> Result<Option<BatchLockInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner.lock.clone().filter(|l| l.expires_at >= Utc::now()))
    }

    async fn insert_run(&self, run: &AccountRun) -> Result<()> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, account_id: Option<i64>, limit: i64) -> Result<Vec<AccountRun>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<AccountRun> = inner
            .runs
            .iter()
            .filter(|r| account_id.map_or(true, |id| r.account_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}

//! # Database: PostgreSQL Store
//!
//! [`Database`] implements [`Store`] over `sqlx::PgPool`. Schema lives in
//! `migrations/001_init.sql`.
//!
//! ## Module Structure
//!
//! Operations are split into submodules by table group:
//!
//! - [`accounts`]: accounts, directions, the pre-provisioned pool, creatives
//! - [`audit`]: budget audit, action history, health snapshots, run records
//! - [`dispatch`]: idempotency ledger
//! - [`batch`]: the single-row batch lock
//!
//! The [`Store`] impl at the bottom delegates to those inherent methods.

mod accounts;
mod audit;
mod batch;
mod dispatch;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::health::HealthScore;
use crate::model::{Account, ActionHistoryEntry, BudgetAuditRecord, Creative, Direction};
use crate::store::{AccountRun, BatchLockInfo, DispatchClaim, LedgerStatus, Store};

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Username and password are percent-decoded by hand so that pooler
    /// usernames with dots survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply `migrations/001_init.sql`. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Execute `SELECT 1`. Backs the `/readyz` probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        self.active_accounts().await
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        self.account_by_id(account_id).await
    }

    async fn list_directions(&self, account_id: i64) -> Result<Vec<Direction>> {
        self.directions_for(account_id).await
    }

    async fn list_creatives(&self, account_id: i64) -> Result<Vec<Creative>> {
        self.creatives_for(account_id).await
    }

    async fn budget_audit_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<BudgetAuditRecord>> {
        self.audit_since(account_id, since).await
    }

    async fn append_budget_audit(&self, records: &[BudgetAuditRecord]) -> Result<()> {
        self.insert_audit(records).await
    }

    async fn recent_actions(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<ActionHistoryEntry>> {
        self.actions_since(account_id, since).await
    }

    async fn record_actions(&self, entries: &[ActionHistoryEntry]) -> Result<()> {
        self.insert_actions(entries).await
    }

    async fn save_health_snapshot(&self, account_id: i64, run_id: Uuid, scores: &[HealthScore]) -> Result<()> {
        self.insert_health_snapshot(account_id, run_id, scores).await
    }

    async fn claim_dispatch(&self, key: &str, account_id: i64, run_id: Uuid) -> Result<DispatchClaim> {
        self.claim_key(key, account_id, run_id).await
    }

    async fn complete_dispatch(&self, key: &str, status: LedgerStatus, results: &serde_json::Value) -> Result<()> {
        self.finish_key(key, status, results).await
    }

    async fn try_acquire_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        self.acquire_lock(owner, ttl_secs).await
    }

    async fn refresh_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        self.extend_lock(owner, ttl_secs).await
    }

    async fn release_batch_lock(&self, owner: &str) -> Result<()> {
        self.drop_lock(owner).await
    }

    async fn batch_lock(&self) -> Result<Option<BatchLockInfo>> {
        self.current_lock().await
    }

    async fn insert_run(&self, run: &AccountRun) -> Result<()> {
        self.insert_account_run(run).await
    }

    async fn list_runs(&self, account_id: Option<i64>, limit: i64) -> Result<Vec<AccountRun>> {
        self.account_runs(account_id, limit).await
    }
}

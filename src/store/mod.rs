//! # Store: Persistence Collaborator
//!
//! Configuration (accounts, directions, creatives), append-only history
//! (budget audit, executed actions, health snapshots, run records), the
//! dispatch ledger that makes execution idempotent, and the single batch lock
//! row.
//!
//! Two implementations:
//!
//! - [`crate::db::Database`]: PostgreSQL through sqlx.
//! - [`MemoryStore`]: process-local, for tests and dry local runs.
//!
//! ## Dispatch ledger
//!
//! ```text
//! (none) ──claim──► pending ──complete──► complete   (replay returns stored results)
//!                      └─────fail──────► failed     (may be claimed again)
//! ```
//!
//! ## Batch lock
//!
//! One row. Acquire succeeds when the row is free, already ours, or expired.
//! The holder refreshes the expiry between accounts and releases on exit.

pub mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health::HealthScore;
use crate::model::{Account, ActionHistoryEntry, BudgetAuditRecord, Creative, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Complete,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Complete => "complete",
            LedgerStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LedgerStatus::Pending),
            "complete" => Some(LedgerStatus::Complete),
            "failed" => Some(LedgerStatus::Failed),
            _ => None,
        }
    }
}

/// Result of trying to claim an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchClaim {
    /// The caller owns the key and must dispatch.
    Claimed,
    /// Already executed; carries the stored results.
    Completed(serde_json::Value),
    /// Another run holds the key right now.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLockInfo {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    DryRun,
    Duplicate,
    NoAction,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::DryRun => "dry_run",
            RunStatus::Duplicate => "duplicate",
            RunStatus::NoAction => "no_action",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(RunStatus::Completed),
            "dry_run" => Some(RunStatus::DryRun),
            "duplicate" => Some(RunStatus::Duplicate),
            "no_action" => Some(RunStatus::NoAction),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One pipeline execution for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRun {
    pub id: Uuid,
    pub account_id: i64,
    pub status: RunStatus,
    pub dry_run: bool,
    pub plan_source: Option<String>,
    pub fallback: bool,
    pub planned: i32,
    pub dispatched: i32,
    pub failed: i32,
    pub rejected: i32,
    pub idempotency_key: Option<String>,
    pub report: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    // ── Configuration ───────────────────────────────────────────
    async fn list_active_accounts(&self) -> Result<Vec<Account>>;
    async fn get_account(&self, account_id: i64) -> Result<Option<Account>>;
    async fn list_directions(&self, account_id: i64) -> Result<Vec<Direction>>;
    async fn list_creatives(&self, account_id: i64) -> Result<Vec<Creative>>;

    // ── History ─────────────────────────────────────────────────
    async fn budget_audit_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<BudgetAuditRecord>>;
    async fn append_budget_audit(&self, records: &[BudgetAuditRecord]) -> Result<()>;
    async fn recent_actions(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<ActionHistoryEntry>>;
    async fn record_actions(&self, entries: &[ActionHistoryEntry]) -> Result<()>;
    async fn save_health_snapshot(&self, account_id: i64, run_id: Uuid, scores: &[HealthScore]) -> Result<()>;

    // ── Dispatch ledger ─────────────────────────────────────────
    async fn claim_dispatch(&self, key: &str, account_id: i64, run_id: Uuid) -> Result<DispatchClaim>;
    async fn complete_dispatch(&self, key: &str, status: LedgerStatus, results: &serde_json::Value) -> Result<()>;

    // ── Batch lock ──────────────────────────────────────────────
    async fn try_acquire_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool>;
    async fn refresh_batch_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool>;
    async fn release_batch_lock(&self, owner: &str) -> Result<()>;
    async fn batch_lock(&self) -> Result<Option<BatchLockInfo>>;

    // ── Runs ────────────────────────────────────────────────────
    async fn insert_run(&self, run: &AccountRun) -> Result<()>;
    async fn list_runs(&self, account_id: Option<i64>, limit: i64) -> Result<Vec<AccountRun>>;
}

//! # Scheduler: Daily Batch Across All Accounts
//!
//! ```text
//! idle ─► lock_attempt ─┬─► locked ─► run accounts one by one ─► release ─► idle
//!                       └─► lock held elsewhere ─► idle
//! ```
//!
//! The lock is a persisted row, so several scheduler instances can run side by
//! side and at most one processes the batch. The holder refreshes the lock
//! after every account; if a refresh finds the lock gone (expired and taken by
//! another instance) the batch stops early rather than run concurrently.
//!
//! Accounts run sequentially. One account failing never stops the batch; the
//! [`BatchSummary`] lists every account's outcome.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::Engine;
use crate::store::RunStatus;

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: i64,
    pub name: String,
    pub run_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub instance: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    /// The lock was lost mid-batch; remaining accounts were left for the next run.
    pub lock_lost: bool,
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed(BatchSummary),
    AlreadyRunning { holder: Option<String> },
}

pub struct BatchScheduler {
    engine: Arc<Engine>,
    instance_id: String,
    last: RwLock<Option<BatchSummary>>,
}

/// `hostname-xxxxxxxx`, unique per process.
pub fn instance_id() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "adpilot".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

impl BatchScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_instance(engine, instance_id())
    }

    pub fn with_instance(engine: Arc<Engine>, instance_id: String) -> Self {
        Self {
            engine,
            instance_id,
            last: RwLock::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn last_summary(&self) -> Option<BatchSummary> {
        self.last.read().await.clone()
    }

    fn ttl(&self) -> i64 {
        self.engine.config().scheduler.lock_ttl_secs
    }

    async fn acquire(&self) -> Result<bool> {
        let store = self.engine.store();
        if store.try_acquire_batch_lock(&self.instance_id, self.ttl()).await? {
            return Ok(true);
        }
        let holder = store.batch_lock().await?.map(|l| l.owner);
        info!(instance = %self.instance_id, holder = ?holder, "batch lock held elsewhere, skipping");
        self.engine.metrics().lock_contention.inc();
        Ok(false)
    }

    async fn holder(&self) -> Option<String> {
        self.engine.store().batch_lock().await.ok().flatten().map(|l| l.owner)
    }

    /// Run the whole batch in the caller's task.
    pub async fn run_batch(&self, dry_run: bool) -> Result<BatchOutcome> {
        if !self.acquire().await? {
            return Ok(BatchOutcome::AlreadyRunning {
                holder: self.holder().await,
            });
        }
        Ok(BatchOutcome::Completed(self.run_locked(dry_run).await?))
    }

    /// Take the lock now and run the batch in the background. Returns false
    /// when another run holds the lock.
    pub async fn try_start(self: &Arc<Self>, dry_run: bool) -> Result<bool> {
        if !self.acquire().await? {
            return Ok(false);
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_locked(dry_run).await {
                error!(error = %e, "batch aborted");
            }
        });
        Ok(true)
    }

    async fn run_locked(&self, dry_run: bool) -> Result<BatchSummary> {
        let metrics = self.engine.metrics();
        metrics.batch_running.set(1);
        let result = self.process_accounts(dry_run).await;
        metrics.batch_running.set(0);

        if let Err(e) = self.engine.store().release_batch_lock(&self.instance_id).await {
            warn!(error = %e, "batch lock release failed; it will expire");
        }
        let summary = result?;
        info!(
            batch_id = %summary.batch_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            lock_lost = summary.lock_lost,
            "batch finished"
        );
        *self.last.write().await = Some(summary.clone());
        Ok(summary)
    }

    async fn process_accounts(&self, dry_run: bool) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let batch_id = Uuid::new_v4();
        let store = self.engine.store();
        let accounts = store.list_active_accounts().await?;
        info!(batch_id = %batch_id, accounts = accounts.len(), dry_run, "batch started");

        let mut summaries = Vec::with_capacity(accounts.len());
        let mut lock_lost = false;
        for account in &accounts {
            let summary = match self.engine.run_account(account, dry_run, Utc::now()).await {
                Ok(outcome) => AccountSummary {
                    account_id: account.id,
                    name: account.name.clone(),
                    run_id: Some(outcome.run.id),
                    status: Some(outcome.run.status),
                    error: None,
                },
                Err(e) => {
                    error!(account_id = account.id, error = %e, "account run failed");
                    self.engine.metrics().account_run("error");
                    AccountSummary {
                        account_id: account.id,
                        name: account.name.clone(),
                        run_id: None,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            summaries.push(summary);

            match store.refresh_batch_lock(&self.instance_id, self.ttl()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(instance = %self.instance_id, "batch lock lost, stopping early");
                    lock_lost = true;
                    break;
                }
                Err(e) => warn!(error = %e, "batch lock refresh failed"),
            }
        }

        let failed = summaries
            .iter()
            .filter(|s| s.error.is_some() || s.status == Some(RunStatus::Failed))
            .count();
        Ok(BatchSummary {
            batch_id,
            instance: self.instance_id.clone(),
            dry_run,
            started_at,
            finished_at: Utc::now(),
            succeeded: summaries.len() - failed,
            failed,
            lock_lost,
            accounts: summaries,
        })
    }

    /// Register the daily batch with a cron scheduler and start it.
    pub async fn start_cron(self: Arc<Self>) -> Result<JobScheduler> {
        let cron = self.engine.config().scheduler.cron.clone();
        let sched = JobScheduler::new().await?;
        let this = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                match this.run_batch(false).await {
                    Ok(BatchOutcome::Completed(_)) => {}
                    Ok(BatchOutcome::AlreadyRunning { .. }) => {}
                    Err(e) => error!(error = %e, "scheduled batch failed"),
                }
            })
        })?;
        sched.add(job).await?;
        sched.start().await?;
        info!(cron = %cron, instance = %self.instance_id, "batch schedule registered");
        Ok(sched)
    }
}

//! Append-only history: budget audit, executed actions, health snapshots and
//! account run records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::Database;
use crate::health::HealthScore;
use crate::model::{ActionHistoryEntry, BudgetAuditRecord};
use crate::store::{AccountRun, RunStatus};

#[derive(sqlx::FromRow)]
struct AuditRow {
    account_id: i64,
    adgroup_id: String,
    direction_id: Option<i64>,
    old_budget_cents: i64,
    new_budget_cents: i64,
    action_type: String,
    run_id: Option<Uuid>,
    changed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    account_id: i64,
    entity_id: String,
    action_type: String,
    run_id: Option<Uuid>,
    executed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    account_id: i64,
    status: String,
    dry_run: bool,
    plan_source: Option<String>,
    fallback: bool,
    planned: i32,
    dispatched: i32,
    failed: i32,
    rejected: i32,
    idempotency_key: Option<String>,
    report: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Database {
    pub(super) async fn audit_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<BudgetAuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT account_id, adgroup_id, direction_id, old_budget_cents, new_budget_cents,
                    action_type, run_id, changed_at
             FROM budget_audit WHERE account_id = $1 AND changed_at >= $2
             ORDER BY changed_at",
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| BudgetAuditRecord {
                account_id: r.account_id,
                adgroup_id: r.adgroup_id,
                direction_id: r.direction_id,
                old_budget_cents: r.old_budget_cents,
                new_budget_cents: r.new_budget_cents,
                action_type: r.action_type,
                run_id: r.run_id,
                changed_at: r.changed_at,
            })
            .collect())
    }

    pub(super) async fn insert_audit(&self, records: &[BudgetAuditRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "INSERT INTO budget_audit (account_id, adgroup_id, direction_id, old_budget_cents,
                                           new_budget_cents, action_type, run_id, changed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(r.account_id)
            .bind(&r.adgroup_id)
            .bind(r.direction_id)
            .bind(r.old_budget_cents)
            .bind(r.new_budget_cents)
            .bind(&r.action_type)
            .bind(r.run_id)
            .bind(r.changed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn actions_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<Vec<ActionHistoryEntry>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT account_id, entity_id, action_type, run_id, executed_at
             FROM action_history WHERE account_id = $1 AND executed_at >= $2
             ORDER BY executed_at",
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ActionHistoryEntry {
                account_id: r.account_id,
                entity_id: r.entity_id,
                action_type: r.action_type,
                run_id: r.run_id,
                executed_at: r.executed_at,
            })
            .collect())
    }

    pub(super) async fn insert_actions(&self, entries: &[ActionHistoryEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for e in entries {
            sqlx::query(
                "INSERT INTO action_history (account_id, entity_id, action_type, run_id, executed_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(e.account_id)
            .bind(&e.entity_id)
            .bind(&e.action_type)
            .bind(e.run_id)
            .bind(e.executed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn insert_health_snapshot(
        &self,
        account_id: i64,
        run_id: Uuid,
        scores: &[HealthScore],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in scores {
            sqlx::query(
                "INSERT INTO health_snapshots (account_id, run_id, adgroup_id, score, class,
                                               cpl_ratio, trend, data_sufficient, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(account_id)
            .bind(run_id)
            .bind(&s.adgroup_id)
            .bind(s.score)
            .bind(s.class.as_str())
            .bind(s.decision_ratio())
            .bind(s.trend.as_str())
            .bind(s.data_sufficient)
            .bind(serde_json::to_value(s)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn insert_account_run(&self, run: &AccountRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_runs (id, account_id, status, dry_run, plan_source, fallback,
                                       planned, dispatched, failed, rejected, idempotency_key,
                                       report, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(run.id)
        .bind(run.account_id)
        .bind(run.status.as_str())
        .bind(run.dry_run)
        .bind(&run.plan_source)
        .bind(run.fallback)
        .bind(run.planned)
        .bind(run.dispatched)
        .bind(run.failed)
        .bind(run.rejected)
        .bind(&run.idempotency_key)
        .bind(&run.report)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs first, optionally for one account.
    pub(super) async fn account_runs(&self, account_id: Option<i64>, limit: i64) -> Result<Vec<AccountRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT id, account_id, status, dry_run, plan_source, fallback, planned, dispatched,
                    failed, rejected, idempotency_key, report, started_at, finished_at
             FROM account_runs
             WHERE ($1::BIGINT IS NULL OR account_id = $1)
             ORDER BY started_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| AccountRun {
                status: RunStatus::parse(&r.status).unwrap_or_else(|| {
                    warn!(run_id = %r.id, value = %r.status, "unknown run status");
                    RunStatus::Failed
                }),
                id: r.id,
                account_id: r.account_id,
                dry_run: r.dry_run,
                plan_source: r.plan_source,
                fallback: r.fallback,
                planned: r.planned,
                dispatched: r.dispatched,
                failed: r.failed,
                rejected: r.rejected,
                idempotency_key: r.idempotency_key,
                report: r.report,
                started_at: r.started_at,
                finished_at: r.finished_at,
            })
            .collect())
    }
}

//! Dispatch ledger keyed by idempotency key.
//!
//! The claim is one statement: insert a `pending` row, or flip a `failed` row
//! back to `pending`. When neither happens the existing row decides between a
//! replay and an in-flight duplicate.

use anyhow::Result;
use uuid::Uuid;

use super::Database;
use crate::store::{DispatchClaim, LedgerStatus};

impl Database {
    pub(super) async fn claim_key(&self, key: &str, account_id: i64, run_id: Uuid) -> Result<DispatchClaim> {
        let claimed = sqlx::query(
            "INSERT INTO dispatch_ledger (idempotency_key, account_id, run_id, status)
             VALUES ($1, $2, $3, 'pending')
             ON CONFLICT (idempotency_key) DO UPDATE SET
               run_id = EXCLUDED.run_id, status = 'pending', results = NULL, updated_at = NOW()
             WHERE dispatch_ledger.status = 'failed'",
        )
        .bind(key)
        .bind(account_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        if claimed {
            return Ok(DispatchClaim::Claimed);
        }

        let (status, results): (String, Option<serde_json::Value>) =
            sqlx::query_as("SELECT status, results FROM dispatch_ledger WHERE idempotency_key = $1")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(match LedgerStatus::parse(&status) {
            Some(LedgerStatus::Complete) => DispatchClaim::Completed(results.unwrap_or(serde_json::Value::Null)),
            _ => DispatchClaim::InFlight,
        })
    }

    pub(super) async fn finish_key(&self, key: &str, status: LedgerStatus, results: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE dispatch_ledger SET status = $2, results = $3, updated_at = NOW()
             WHERE idempotency_key = $1",
        )
        .bind(key)
        .bind(status.as_str())
        .bind(results)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Single-row batch lock (`batch_lock.id = 1`).
//!
//! Acquire is an upsert guarded by "free, mine, or expired", so two scheduler
//! instances racing for the row get exactly one winner.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::Database;
use crate::store::BatchLockInfo;

impl Database {
    pub(super) async fn acquire_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO batch_lock (id, owner, acquired_at, expires_at)
             VALUES (1, $1, NOW(), NOW() + make_interval(secs => $2))
             ON CONFLICT (id) DO UPDATE SET
               owner = EXCLUDED.owner, acquired_at = EXCLUDED.acquired_at,
               expires_at = EXCLUDED.expires_at
             WHERE batch_lock.owner = EXCLUDED.owner OR batch_lock.expires_at < NOW()",
        )
        .bind(owner)
        .bind(ttl_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn extend_lock(&self, owner: &str, ttl_secs: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batch_lock SET expires_at = NOW() + make_interval(secs => $2)
             WHERE id = 1 AND owner = $1",
        )
        .bind(owner)
        .bind(ttl_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn drop_lock(&self, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM batch_lock WHERE id = 1 AND owner = $1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The current holder, unless the lock has expired.
    pub(super) async fn current_lock(&self) -> Result<Option<BatchLockInfo>> {
        let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT owner, acquired_at, expires_at FROM batch_lock WHERE id = 1 AND expires_at >= NOW()",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(owner, acquired_at, expires_at)| BatchLockInfo {
            owner,
            acquired_at,
            expires_at,
        }))
    }
}

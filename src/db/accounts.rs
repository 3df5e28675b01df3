//! Account configuration: accounts, directions with their pre-provisioned
//! ad-group pool, and the creative library.
//!
//! Enum columns are stored as their snake_case text; unknown values fall back
//! to the type's default with a warning rather than failing the whole account.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use super::Database;
use crate::model::{Account, AdGroupMode, Creative, Direction, Tolerance};
use crate::risk::RiskOverrides;

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    platform_account_id: String,
    access_token: Option<String>,
    daily_budget_cap_cents: i64,
    target_cpl_cents: i64,
    utc_offset_minutes: i32,
    adgroup_mode: String,
    tolerance: String,
    risk_overrides: Option<Value>,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct DirectionRow {
    id: i64,
    account_id: i64,
    name: String,
    daily_budget_cents: i64,
    target_cpl_cents: i64,
    platform_campaign_id: Option<String>,
    risk_overrides: Option<Value>,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct CreativeRow {
    id: String,
    account_id: i64,
    direction_id: Option<i64>,
    name: String,
    historical_impressions: i64,
    historical_leads: i64,
    historical_spend_cents: i64,
    active: bool,
}

fn overrides(raw: Option<Value>, owner: &str) -> Option<RiskOverrides> {
    let raw = raw?;
    match serde_json::from_value(raw) {
        Ok(o) => Some(o),
        Err(e) => {
            warn!(owner, error = %e, "ignoring malformed risk overrides");
            None
        }
    }
}

impl From<AccountRow> for Account {
    fn from(r: AccountRow) -> Self {
        let adgroup_mode = AdGroupMode::parse(&r.adgroup_mode).unwrap_or_else(|| {
            warn!(account_id = r.id, value = %r.adgroup_mode, "unknown adgroup_mode");
            AdGroupMode::default()
        });
        let tolerance = Tolerance::parse(&r.tolerance).unwrap_or_else(|| {
            warn!(account_id = r.id, value = %r.tolerance, "unknown tolerance");
            Tolerance::default()
        });
        Account {
            risk_overrides: overrides(r.risk_overrides, "account"),
            id: r.id,
            name: r.name,
            platform_account_id: r.platform_account_id,
            access_token: r.access_token,
            daily_budget_cap_cents: r.daily_budget_cap_cents,
            target_cpl_cents: r.target_cpl_cents,
            utc_offset_minutes: r.utc_offset_minutes,
            adgroup_mode,
            tolerance,
            active: r.active,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, platform_account_id, access_token, daily_budget_cap_cents,
     target_cpl_cents, utc_offset_minutes, adgroup_mode, tolerance, risk_overrides, active";

impl Database {
    pub(super) async fn active_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    pub(super) async fn account_by_id(&self, account_id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Account::from))
    }

    /// Directions with their pre-provisioned pool attached, ordered by id.
    pub(super) async fn directions_for(&self, account_id: i64) -> Result<Vec<Direction>> {
        let rows = sqlx::query_as::<_, DirectionRow>(
            "SELECT id, account_id, name, daily_budget_cents, target_cpl_cents,
                    platform_campaign_id, risk_overrides, active
             FROM directions WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let pool_rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT p.direction_id, p.adgroup_id
             FROM direction_adgroup_pool p JOIN directions d ON d.id = p.direction_id
             WHERE d.account_id = $1 ORDER BY p.direction_id, p.adgroup_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        let mut pools: HashMap<i64, Vec<String>> = HashMap::new();
        for (direction_id, adgroup_id) in pool_rows {
            pools.entry(direction_id).or_default().push(adgroup_id);
        }

        Ok(rows
            .into_iter()
            .map(|r| Direction {
                pre_provisioned: pools.remove(&r.id).unwrap_or_default(),
                risk_overrides: overrides(r.risk_overrides, "direction"),
                id: r.id,
                account_id: r.account_id,
                name: r.name,
                daily_budget_cents: r.daily_budget_cents,
                target_cpl_cents: r.target_cpl_cents,
                platform_campaign_id: r.platform_campaign_id,
                active: r.active,
            })
            .collect())
    }

    pub(super) async fn creatives_for(&self, account_id: i64) -> Result<Vec<Creative>> {
        let rows = sqlx::query_as::<_, CreativeRow>(
            "SELECT id, account_id, direction_id, name, historical_impressions,
                    historical_leads, historical_spend_cents, active
             FROM creatives WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Creative {
                id: r.id,
                account_id: r.account_id,
                direction_id: r.direction_id,
                name: r.name,
                historical_impressions: r.historical_impressions,
                historical_leads: r.historical_leads,
                historical_spend_cents: r.historical_spend_cents,
                active: r.active,
            })
            .collect())
    }

    /// Insert or update an account keyed by its platform id. Returns the row id.
    pub async fn upsert_account(&self, account: &Account) -> Result<i64> {
        let overrides = account
            .risk_overrides
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO accounts (name, platform_account_id, access_token, daily_budget_cap_cents,
                                   target_cpl_cents, utc_offset_minutes, adgroup_mode, tolerance,
                                   risk_overrides, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (platform_account_id) DO UPDATE SET
               name = EXCLUDED.name, access_token = EXCLUDED.access_token,
               daily_budget_cap_cents = EXCLUDED.daily_budget_cap_cents,
               target_cpl_cents = EXCLUDED.target_cpl_cents,
               utc_offset_minutes = EXCLUDED.utc_offset_minutes,
               adgroup_mode = EXCLUDED.adgroup_mode, tolerance = EXCLUDED.tolerance,
               risk_overrides = EXCLUDED.risk_overrides, active = EXCLUDED.active,
               updated_at = NOW()
             RETURNING id",
        )
        .bind(&account.name)
        .bind(&account.platform_account_id)
        .bind(&account.access_token)
        .bind(account.daily_budget_cap_cents)
        .bind(account.target_cpl_cents)
        .bind(account.utc_offset_minutes)
        .bind(account.adgroup_mode.as_str())
        .bind(account.tolerance.as_str())
        .bind(overrides)
        .bind(account.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Insert or update a direction keyed by (account, name) and replace its pool.
    pub async fn upsert_direction(&self, direction: &Direction) -> Result<i64> {
        let overrides = direction
            .risk_overrides
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO directions (account_id, name, daily_budget_cents, target_cpl_cents,
                                     platform_campaign_id, risk_overrides, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (account_id, name) DO UPDATE SET
               daily_budget_cents = EXCLUDED.daily_budget_cents,
               target_cpl_cents = EXCLUDED.target_cpl_cents,
               platform_campaign_id = EXCLUDED.platform_campaign_id,
               risk_overrides = EXCLUDED.risk_overrides, active = EXCLUDED.active
             RETURNING id",
        )
        .bind(direction.account_id)
        .bind(&direction.name)
        .bind(direction.daily_budget_cents)
        .bind(direction.target_cpl_cents)
        .bind(&direction.platform_campaign_id)
        .bind(overrides)
        .bind(direction.active)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM direction_adgroup_pool WHERE direction_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for adgroup_id in &direction.pre_provisioned {
            sqlx::query("INSERT INTO direction_adgroup_pool (direction_id, adgroup_id) VALUES ($1, $2)")
                .bind(id)
                .bind(adgroup_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    pub async fn upsert_creative(&self, creative: &Creative) -> Result<()> {
        sqlx::query(
            "INSERT INTO creatives (account_id, id, direction_id, name, historical_impressions,
                                    historical_leads, historical_spend_cents, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (account_id, id) DO UPDATE SET
               direction_id = EXCLUDED.direction_id, name = EXCLUDED.name,
               historical_impressions = EXCLUDED.historical_impressions,
               historical_leads = EXCLUDED.historical_leads,
               historical_spend_cents = EXCLUDED.historical_spend_cents,
               active = EXCLUDED.active",
        )
        .bind(creative.account_id)
        .bind(&creative.id)
        .bind(creative.direction_id)
        .bind(&creative.name)
        .bind(creative.historical_impressions)
        .bind(creative.historical_leads)
        .bind(creative.historical_spend_cents)
        .bind(creative.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

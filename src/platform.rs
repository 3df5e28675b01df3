//! # Platform: HTTP Ad Platform Gateway
//!
//! One client implements both sides of the advertising collaborator:
//! [`AdPlatform`] for reads and [`Executor`] for writes.
//!
//! ## Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/accounts/{id}/structure` | campaigns, ad-groups, ads |
//! | GET | `/accounts/{id}/insights?level=&window=&since=&until=` | windowed metrics rows |
//! | POST | `/accounts/{id}/actions` | batch execution, `Idempotency-Key` header |
//!
//! Insights rows carry spend in currency units and a list of conversion
//! actions. Leads are the maximum over the lead action aliases, so one lead
//! reported under two aliases counts once.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::collector::AdPlatform;
use crate::dispatcher::{ExecutionResult, Executor};
use crate::llm::retry_after_ms;
use crate::model::{Account, AccountStructure, EntityLevel, Window, WindowedMetrics};
use crate::planner::Action;
use crate::retry::ProviderError;

/// Conversion action types counted as leads.
pub const LEAD_ACTION_TYPES: [&str; 3] = [
    "lead",
    "onsite_conversion.lead_grouped",
    "offsite_conversion.fb_pixel_lead",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

pub struct HttpAdPlatform {
    http: reqwest::Client,
    base: String,
    /// Used when the account carries no token of its own.
    default_token: Option<String>,
}

impl HttpAdPlatform {
    pub fn new(config: &PlatformConfig, default_token: Option<String>) -> anyhow::Result<Self> {
        url::Url::parse(&config.base_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.base_url.trim_end_matches('/').to_string(),
            default_token,
        })
    }

    fn account_url(&self, account: &Account, tail: &str) -> String {
        format!(
            "{}/accounts/{}/{tail}",
            self.base,
            urlencoding::encode(&account.platform_account_id)
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder, account: &Account) -> reqwest::RequestBuilder {
        match account.access_token.as_ref().or(self.default_token.as_ref()) {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ProviderError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body, retry_after));
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

// ── Wire types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    data: Vec<InsightRow>,
}

#[derive(Debug, Deserialize)]
pub struct ActionValue {
    pub action_type: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct InsightRow {
    pub entity_id: String,
    /// Currency units, as a number or a decimal string.
    #[serde(default)]
    pub spend: serde_json::Value,
    #[serde(default)]
    pub impressions: serde_json::Value,
    #[serde(default)]
    pub clicks: serde_json::Value,
    #[serde(default)]
    pub frequency: serde_json::Value,
    #[serde(default)]
    pub quality_leads: Option<i64>,
    #[serde(default)]
    pub actions: Vec<ActionValue>,
}

fn number(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl InsightRow {
    pub fn leads(&self) -> i64 {
        self.actions
            .iter()
            .filter(|a| LEAD_ACTION_TYPES.contains(&a.action_type.as_str()))
            .map(|a| number(&a.value).round() as i64)
            .max()
            .unwrap_or(0)
    }

    pub fn into_metrics(self, level: EntityLevel, window: Window) -> WindowedMetrics {
        let leads = self.leads();
        WindowedMetrics {
            spend_cents: (number(&self.spend) * 100.0).round() as i64,
            impressions: number(&self.impressions).round() as i64,
            clicks: number(&self.clicks).round() as i64,
            frequency: number(&self.frequency),
            leads,
            quality_leads: self.quality_leads,
            level,
            window,
            entity_id: self.entity_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    actions: &'a [Action],
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    results: Vec<ExecutionResult>,
}

// ── Collaborator impls ──────────────────────────────────────────

#[async_trait]
impl AdPlatform for HttpAdPlatform {
    async fn fetch_structure(&self, account: &Account) -> Result<AccountStructure, ProviderError> {
        let req = self.http.get(self.account_url(account, "structure"));
        self.send(self.authorize(req, account)).await
    }

    async fn fetch_insights(
        &self,
        account: &Account,
        level: EntityLevel,
        window: Window,
        today: NaiveDate,
    ) -> Result<Vec<WindowedMetrics>, ProviderError> {
        let (since, until) = window.date_range(today);
        let url = format!(
            "{}?level={}&window={}&since={}&until={}",
            self.account_url(account, "insights"),
            level.as_str(),
            window.as_str(),
            since.format("%Y-%m-%d"),
            until.format("%Y-%m-%d"),
        );
        let resp: InsightsResponse = self.send(self.authorize(self.http.get(url), account)).await?;
        Ok(resp
            .data
            .into_iter()
            .map(|row| row.into_metrics(level, window))
            .collect())
    }
}

#[async_trait]
impl Executor for HttpAdPlatform {
    async fn execute(
        &self,
        account: &Account,
        idempotency_key: &str,
        actions: &[Action],
    ) -> Result<Vec<ExecutionResult>, ProviderError> {
        let req = self
            .http
            .post(self.account_url(account, "actions"))
            .header("Idempotency-Key", idempotency_key)
            .json(&ExecuteRequest { actions });
        let resp: ExecuteResponse = self.send(self.authorize(req, account)).await?;
        Ok(resp.results)
    }
}

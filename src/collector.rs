//! # Collector: Windowed Metrics from the Ad Platform
//!
//! Reads the account's entity tree, then one insights report per
//! (level, window) pair. Calls are made one after another; the pipeline for a
//! single account never fans out against the platform.
//!
//! ## Failure model
//!
//! - Structure fetch failure is fatal for the account: without entity ids
//!   there is nothing to score or plan.
//! - An insights fetch that still fails after retries is recorded in
//!   [`MetricsBundle::missing`] and the remaining windows are collected anyway.
//!   Downstream components treat a missing window as lower confidence.
//! - Rows without spend are dropped at the door.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::{Account, AccountStructure, EntityLevel, EntityMetrics, Window, WindowedMetrics};
use crate::retry::{with_retry, ProviderError, RetryPolicy};

/// Read side of the advertising platform.
#[async_trait]
pub trait AdPlatform: Send + Sync {
    async fn fetch_structure(&self, account: &Account) -> Result<AccountStructure, ProviderError>;

    async fn fetch_insights(
        &self,
        account: &Account,
        level: EntityLevel,
        window: Window,
        today: NaiveDate,
    ) -> Result<Vec<WindowedMetrics>, ProviderError>;
}

/// A window that could not be fetched.
#[derive(Debug, Clone, Serialize)]
pub struct MissingWindow {
    pub level: EntityLevel,
    pub window: Window,
    pub error: String,
}

/// Everything the collector learned about one account in one run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsBundle {
    pub structure: AccountStructure,
    pub campaigns: HashMap<String, EntityMetrics>,
    pub adgroups: HashMap<String, EntityMetrics>,
    pub ads: HashMap<String, EntityMetrics>,
    pub missing: Vec<MissingWindow>,
    pub local_date: NaiveDate,
    pub collected_at: DateTime<Utc>,
}

impl MetricsBundle {
    pub fn new(structure: AccountStructure, local_date: NaiveDate, collected_at: DateTime<Utc>) -> Self {
        Self {
            structure,
            campaigns: HashMap::new(),
            adgroups: HashMap::new(),
            ads: HashMap::new(),
            missing: Vec::new(),
            local_date,
            collected_at,
        }
    }

    pub fn insert(&mut self, row: WindowedMetrics) {
        let map = match row.level {
            EntityLevel::Campaign => &mut self.campaigns,
            EntityLevel::AdGroup => &mut self.adgroups,
            EntityLevel::Ad => &mut self.ads,
        };
        map.entry(row.entity_id.clone()).or_default().insert(row);
    }

    pub fn adgroup(&self, id: &str) -> Option<&EntityMetrics> {
        self.adgroups.get(id)
    }

    pub fn ad(&self, id: &str) -> Option<&EntityMetrics> {
        self.ads.get(id)
    }

    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty()
    }

    pub fn is_missing(&self, level: EntityLevel, window: Window) -> bool {
        self.missing.iter().any(|m| m.level == level && m.window == window)
    }

    /// True when every ad-group window failed, leaving nothing to score.
    pub fn adgroup_data_unavailable(&self) -> bool {
        Window::ALL
            .iter()
            .all(|w| self.is_missing(EntityLevel::AdGroup, *w))
    }
}

pub struct Collector {
    platform: Arc<dyn AdPlatform>,
    retry: RetryPolicy,
}

impl Collector {
    const LEVELS: [EntityLevel; 3] = [EntityLevel::Campaign, EntityLevel::AdGroup, EntityLevel::Ad];

    pub fn new(platform: Arc<dyn AdPlatform>, retry: RetryPolicy) -> Self {
        Self { platform, retry }
    }

    /// Collect structure and all windows for `account`, best effort.
    pub async fn collect(&self, account: &Account, now: DateTime<Utc>) -> Result<MetricsBundle, ProviderError> {
        let structure = with_retry(&self.retry, "platform.structure", || {
            self.platform.fetch_structure(account)
        })
        .await?;

        let today = account.local_date(now);
        let mut bundle = MetricsBundle::new(structure, today, now);

        for level in Self::LEVELS {
            for window in Window::ALL {
                let label = format!("platform.insights.{}.{}", level.as_str(), window.as_str());
                let fetched = with_retry(&self.retry, &label, || {
                    self.platform.fetch_insights(account, level, window, today)
                })
                .await;
                match fetched {
                    Ok(rows) => {
                        let total = rows.len();
                        let mut kept = 0usize;
                        for row in rows.into_iter().filter(|r| r.has_spend()) {
                            bundle.insert(WindowedMetrics { level, window, ..row });
                            kept += 1;
                        }
                        debug!(
                            account_id = account.id,
                            level = level.as_str(),
                            window = window.as_str(),
                            total,
                            kept,
                            "collected insights"
                        );
                    }
                    Err(e) => {
                        warn!(
                            account_id = account.id,
                            level = level.as_str(),
                            window = window.as_str(),
                            error = %e,
                            "insights window unavailable, continuing with reduced confidence"
                        );
                        bundle.missing.push(MissingWindow {
                            level,
                            window,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(bundle)
    }
}

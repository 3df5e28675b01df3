//! TOML engine configuration: one section per component, every section
//! optional with defaults.
//!
//! ```toml
//! [scheduler]
//! cron = "0 0 6 * * *"
//!
//! [planner]
//! cooldown_hours = 20
//!
//! [llm]
//! enabled = true
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::creative::CreativeConfig;
use crate::dispatcher::DispatcherConfig;
use crate::health::HealthConfig;
use crate::llm::LlmConfig;
use crate::notify::NotifyConfig;
use crate::planner::rules::PlannerConfig;
use crate::platform::PlatformConfig;
use crate::retry::RetryPolicy;
use crate::risk::RiskConfig;
use crate::validator::ValidatorConfig;

/// The `[collector]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub retry: RetryPolicy,
}

/// The `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Register the daily cron job when serving.
    pub enabled: bool,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub cron: String,
    /// Lock expiry; refreshed after every account.
    pub lock_ttl_secs: i64,
    /// Days of budget audit history read for health and risk.
    pub audit_lookback_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 0 6 * * *".to_string(),
            lock_ttl_secs: 1_800,
            audit_lookback_days: 14,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub collector: CollectorConfig,
    pub health: HealthConfig,
    pub creative: CreativeConfig,
    pub risk: RiskConfig,
    pub planner: PlannerConfig,
    pub validator: ValidatorConfig,
    pub dispatcher: DispatcherConfig,
    pub llm: LlmConfig,
    pub platform: PlatformConfig,
    pub notify: NotifyConfig,
}

impl EngineConfig {
    pub fn parse_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_toml_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Reject values that would make a component misbehave silently.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.cron.split_whitespace().count() != 6 {
            bail!(
                "scheduler.cron must have 6 fields (sec min hour day month weekday), got '{}'",
                self.scheduler.cron
            );
        }
        if self.scheduler.lock_ttl_secs <= 0 {
            bail!("scheduler.lock_ttl_secs must be positive");
        }

        for (name, retry) in [
            ("collector.retry", &self.collector.retry),
            ("dispatcher.retry", &self.dispatcher.retry),
            ("llm.retry", &self.llm.retry),
            ("notify.retry", &self.notify.retry),
        ] {
            if retry.max_attempts == 0 {
                bail!("{name}.max_attempts must be at least 1");
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                bail!("{name}.base_delay_ms exceeds max_delay_ms");
            }
        }

        if !self.health.class_bounds.is_ordered() {
            bail!("health.class_bounds must satisfy good_min > neutral_min > slightly_bad_min");
        }
        let levels = &self.risk.levels;
        if !(0 < levels.medium_min && levels.medium_min < levels.high_min && levels.high_min <= 100) {
            bail!("risk.levels must satisfy 0 < medium_min < high_min <= 100");
        }

        let p = &self.planner;
        let v = &self.validator;
        if v.min_budget_cents <= 0 || v.min_budget_cents > v.max_budget_cents {
            bail!("validator budget bounds are inverted or non-positive");
        }
        if p.min_budget_cents < v.min_budget_cents {
            bail!(
                "planner.min_budget_cents ({}) is below validator.min_budget_cents ({})",
                p.min_budget_cents,
                v.min_budget_cents
            );
        }
        if p.dup_budget_floor_cents > p.dup_budget_ceiling_cents {
            bail!("planner.dup_budget_floor_cents exceeds dup_budget_ceiling_cents");
        }
        if p.new_adgroup_floor_cents > p.new_adgroup_ceiling_cents {
            bail!("planner.new_adgroup_floor_cents exceeds new_adgroup_ceiling_cents");
        }
        if !(0.0 < p.reduce_step && p.reduce_step < 1.0) || !(0.0 < p.conservative_reduce_step && p.conservative_reduce_step < 1.0) {
            bail!("planner reduce steps must lie strictly between 0 and 1");
        }
        if p.cooldown_hours < 0 || p.duplicate_cooldown_hours < 0 {
            bail!("planner cooldowns must not be negative");
        }
        if p.max_creatives_per_batch > v.max_creatives_per_batch {
            bail!("planner.max_creatives_per_batch exceeds validator.max_creatives_per_batch");
        }
        if self.dispatcher.max_actions_per_run == 0 {
            bail!("dispatcher.max_actions_per_run must be at least 1");
        }
        if self.llm.enabled && self.llm.model.trim().is_empty() {
            bail!("llm.model is required when llm.enabled = true");
        }
        Ok(())
    }
}

//! # Model: Accounts, Directions, Entities and Windowed Metrics
//!
//! Shared vocabulary for the optimization pipeline. Everything here is plain
//! data: the collector fills it, the scorers read it, the planner reasons over
//! it. Monetary values are integer cents; ratios and rates are `f64`.
//!
//! ## Ownership
//!
//! - [`Account`] owns its [`Direction`]s (named sub-budgets).
//! - A direction optionally maps to one platform campaign and a pool of
//!   pre-provisioned (paused) ad-groups.
//! - [`WindowedMetrics`] is immutable: one record per entity per [`Window`],
//!   replaced on every run, never patched.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::risk::RiskOverrides;

// ── Windows ─────────────────────────────────────────────────────

/// Named reporting window. Dates are resolved in the account's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "today")]
    Today,
    #[serde(rename = "yesterday")]
    Yesterday,
    #[serde(rename = "last_3d")]
    Last3d,
    #[serde(rename = "last_7d")]
    Last7d,
    #[serde(rename = "last_30d")]
    Last30d,
}

impl Window {
    pub const ALL: [Window; 5] = [
        Window::Today,
        Window::Yesterday,
        Window::Last3d,
        Window::Last7d,
        Window::Last30d,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Today => "today",
            Window::Yesterday => "yesterday",
            Window::Last3d => "last_3d",
            Window::Last7d => "last_7d",
            Window::Last30d => "last_30d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|w| w.as_str() == s)
    }

    /// Inclusive date range for this window relative to the account-local `today`.
    ///
    /// Multi-day windows end yesterday so that a partial day never dilutes them.
    pub fn date_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let yesterday = today - Duration::days(1);
        match self {
            Window::Today => (today, today),
            Window::Yesterday => (yesterday, yesterday),
            Window::Last3d => (today - Duration::days(3), yesterday),
            Window::Last7d => (today - Duration::days(7), yesterday),
            Window::Last30d => (today - Duration::days(30), yesterday),
        }
    }
}

/// Level of an advertising entity in the platform hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLevel {
    Campaign,
    AdGroup,
    Ad,
}

impl EntityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityLevel::Campaign => "campaign",
            EntityLevel::AdGroup => "ad_group",
            EntityLevel::Ad => "ad",
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────

/// Performance snapshot of one entity over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedMetrics {
    pub entity_id: String,
    pub level: EntityLevel,
    pub window: Window,
    pub spend_cents: i64,
    pub impressions: i64,
    pub clicks: i64,
    pub leads: i64,
    /// Leads the CRM side marked as qualified. `None` when the platform has no signal.
    #[serde(default)]
    pub quality_leads: Option<i64>,
    #[serde(default)]
    pub frequency: f64,
}

impl WindowedMetrics {
    pub fn has_spend(&self) -> bool {
        self.spend_cents > 0
    }

    /// Cost per lead in cents. `None` without leads.
    pub fn cpl_cents(&self) -> Option<f64> {
        (self.leads > 0).then(|| self.spend_cents as f64 / self.leads as f64)
    }

    /// Cost per qualified lead in cents. `None` without a quality signal or qualified leads.
    pub fn qcpl_cents(&self) -> Option<f64> {
        match self.quality_leads {
            Some(q) if q > 0 => Some(self.spend_cents as f64 / q as f64),
            _ => None,
        }
    }

    /// Share of leads that were qualified, in [0, 1].
    pub fn quality_share(&self) -> Option<f64> {
        match self.quality_leads {
            Some(q) if self.leads > 0 => Some((q as f64 / self.leads as f64).clamp(0.0, 1.0)),
            _ => None,
        }
    }

    /// Click-through rate in percent.
    pub fn ctr_pct(&self) -> Option<f64> {
        (self.impressions > 0).then(|| self.clicks as f64 / self.impressions as f64 * 100.0)
    }

    /// Cost per thousand impressions in cents.
    pub fn cpm_cents(&self) -> Option<f64> {
        (self.impressions > 0).then(|| self.spend_cents as f64 / self.impressions as f64 * 1000.0)
    }
}

/// All windows collected for one entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMetrics {
    pub windows: HashMap<Window, WindowedMetrics>,
}

impl EntityMetrics {
    pub fn get(&self, window: Window) -> Option<&WindowedMetrics> {
        self.windows.get(&window)
    }

    pub fn insert(&mut self, metrics: WindowedMetrics) {
        self.windows.insert(metrics.window, metrics);
    }

    /// True when no window recorded any spend.
    pub fn is_empty(&self) -> bool {
        self.windows.values().all(|m| !m.has_spend())
    }

    /// First window in `order` that has spend.
    pub fn first_with_spend(&self, order: &[Window]) -> Option<&WindowedMetrics> {
        order
            .iter()
            .filter_map(|w| self.windows.get(w))
            .find(|m| m.has_spend())
    }
}

// ── Accounts & Directions ───────────────────────────────────────

/// How new ad-groups come into existence for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdGroupMode {
    #[default]
    CreateViaApi,
    UsePreProvisioned,
}

impl AdGroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdGroupMode::CreateViaApi => "create_via_api",
            AdGroupMode::UsePreProvisioned => "use_pre_provisioned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_via_api" => Some(AdGroupMode::CreateViaApi),
            "use_pre_provisioned" => Some(AdGroupMode::UsePreProvisioned),
            _ => None,
        }
    }
}

/// How readily the planner pauses instead of trimming budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl Tolerance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tolerance::Conservative => "conservative",
            Tolerance::Balanced => "balanced",
            Tolerance::Aggressive => "aggressive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conservative" => Some(Tolerance::Conservative),
            "balanced" => Some(Tolerance::Balanced),
            "aggressive" => Some(Tolerance::Aggressive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform_account_id: String,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    pub daily_budget_cap_cents: i64,
    pub target_cpl_cents: i64,
    /// Account timezone as a fixed offset from UTC.
    pub utc_offset_minutes: i32,
    pub adgroup_mode: AdGroupMode,
    pub tolerance: Tolerance,
    #[serde(default)]
    pub risk_overrides: Option<RiskOverrides>,
    pub active: bool,
}

impl Account {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Calendar date in the account's timezone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Direction {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub daily_budget_cents: i64,
    pub target_cpl_cents: i64,
    /// Platform campaign this direction spends through.
    #[serde(default)]
    pub platform_campaign_id: Option<String>,
    /// Paused ad-groups reserved for this direction, activated on demand.
    #[serde(default)]
    pub pre_provisioned: Vec<String>,
    #[serde(default)]
    pub risk_overrides: Option<RiskOverrides>,
    pub active: bool,
}

// ── Platform entities ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Paused,
    Archived,
}

/// Platform delivery-optimization stage of an ad-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearningStage {
    Learning,
    LearningLimited,
    Stable,
    #[default]
    Unknown,
}

impl LearningStage {
    pub fn is_learning(&self) -> bool {
        matches!(self, LearningStage::Learning | LearningStage::LearningLimited)
    }
}

/// Platform relevance ranking, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityRanking {
    #[default]
    Unknown,
    BelowAverage,
    Average,
    AboveAverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignState {
    pub id: String,
    pub name: String,
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdGroupState {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub status: EntityStatus,
    pub daily_budget_cents: i64,
    #[serde(default)]
    pub learning_stage: LearningStage,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quality_ranking: QualityRanking,
    #[serde(default)]
    pub previous_quality_ranking: QualityRanking,
}

impl AdGroupState {
    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }

    /// A known ranking that got worse since the previous reading.
    pub fn quality_dropped(&self) -> bool {
        self.quality_ranking != QualityRanking::Unknown
            && self.previous_quality_ranking != QualityRanking::Unknown
            && self.quality_ranking < self.previous_quality_ranking
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> Option<i64> {
        self.created_at.map(|c| (now - c).num_hours())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdState {
    pub id: String,
    pub adgroup_id: String,
    pub name: String,
    pub status: EntityStatus,
    #[serde(default)]
    pub creative_id: Option<String>,
}

/// Entity tree of one advertising account as the platform reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStructure {
    pub campaigns: Vec<CampaignState>,
    pub adgroups: Vec<AdGroupState>,
    pub ads: Vec<AdState>,
}

impl AccountStructure {
    pub fn adgroup(&self, id: &str) -> Option<&AdGroupState> {
        self.adgroups.iter().find(|g| g.id == id)
    }

    pub fn ads_in<'a>(&'a self, adgroup_id: &'a str) -> impl Iterator<Item = &'a AdState> + 'a {
        self.ads.iter().filter(move |a| a.adgroup_id == adgroup_id)
    }

    pub fn active_ads_in<'a>(&'a self, adgroup_id: &'a str) -> impl Iterator<Item = &'a AdState> + 'a {
        self.ads_in(adgroup_id)
            .filter(|a| a.status == EntityStatus::Active)
    }

    /// Creative ids currently delivering through an active ad in an active ad-group.
    pub fn running_creatives(&self) -> std::collections::HashSet<&str> {
        self.ads
            .iter()
            .filter(|a| a.status == EntityStatus::Active)
            .filter(|a| self.adgroup(&a.adgroup_id).is_some_and(|g| g.is_active()))
            .filter_map(|a| a.creative_id.as_deref())
            .collect()
    }

    /// Map every known ad-group to the direction that owns it.
    ///
    /// Pool membership wins over campaign binding so that a pre-provisioned
    /// ad-group parked under a shared campaign still lands in its own direction.
    pub fn assign_directions(&self, directions: &[Direction]) -> HashMap<String, i64> {
        let mut owners = HashMap::new();
        for group in &self.adgroups {
            let owner = directions
                .iter()
                .find(|d| d.pre_provisioned.iter().any(|p| p == &group.id))
                .or_else(|| {
                    directions
                        .iter()
                        .find(|d| d.platform_campaign_id.as_deref() == Some(group.campaign_id.as_str()))
                });
            if let Some(d) = owner {
                owners.insert(group.id.clone(), d.id);
            }
        }
        owners
    }
}

// ── Creatives & audit ───────────────────────────────────────────

/// A creative from the account's library with its lifetime delivery totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creative {
    pub id: String,
    pub account_id: i64,
    #[serde(default)]
    pub direction_id: Option<i64>,
    pub name: String,
    pub historical_impressions: i64,
    pub historical_leads: i64,
    pub historical_spend_cents: i64,
    pub active: bool,
}

impl Creative {
    pub fn historical_cpl_cents(&self) -> Option<f64> {
        (self.historical_leads > 0)
            .then(|| self.historical_spend_cents as f64 / self.historical_leads as f64)
    }
}

/// Append-only record of an ad-group budget change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAuditRecord {
    pub account_id: i64,
    pub adgroup_id: String,
    pub direction_id: Option<i64>,
    pub old_budget_cents: i64,
    pub new_budget_cents: i64,
    pub action_type: String,
    pub run_id: Option<uuid::Uuid>,
    pub changed_at: DateTime<Utc>,
}

impl BudgetAuditRecord {
    pub fn is_increase(&self) -> bool {
        self.new_budget_cents > self.old_budget_cents
    }

    pub fn is_decrease(&self) -> bool {
        self.new_budget_cents < self.old_budget_cents
    }
}

/// A successfully executed action, used for cooldown checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionHistoryEntry {
    pub account_id: i64,
    pub entity_id: String,
    pub action_type: String,
    pub run_id: Option<uuid::Uuid>,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(spend: i64, impressions: i64, clicks: i64, leads: i64) -> WindowedMetrics {
        WindowedMetrics {
            entity_id: "ag1".into(),
            level: EntityLevel::AdGroup,
            window: Window::Yesterday,
            spend_cents: spend,
            impressions,
            clicks,
            leads,
            quality_leads: None,
            frequency: 1.0,
        }
    }

    #[test]
    fn derived_rates() {
        let m = metrics(10_000, 20_000, 300, 10);
        assert_eq!(m.cpl_cents(), Some(1000.0));
        assert_eq!(m.ctr_pct(), Some(1.5));
        assert_eq!(m.cpm_cents(), Some(500.0));
    }

    #[test]
    fn derived_rates_without_denominator() {
        let m = metrics(500, 0, 0, 0);
        assert!(m.cpl_cents().is_none(), "No leads means no CPL");
        assert!(m.ctr_pct().is_none());
        assert!(m.cpm_cents().is_none());
    }

    #[test]
    fn window_ranges_end_yesterday() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let (from, to) = Window::Last7d.date_range(today);
        assert_eq!(from, NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(Window::Today.date_range(today), (today, today));
    }

    #[test]
    fn window_names_round_trip() {
        for w in Window::ALL {
            assert_eq!(Window::parse(w.as_str()), Some(w));
        }
        assert_eq!(Window::parse("last_90d"), None);
    }

    #[test]
    fn local_date_uses_offset() {
        let account = Account {
            id: 1,
            name: "a".into(),
            platform_account_id: "act_1".into(),
            access_token: None,
            daily_budget_cap_cents: 10_000,
            target_cpl_cents: 1_000,
            utc_offset_minutes: 180,
            adgroup_mode: AdGroupMode::CreateViaApi,
            tolerance: Tolerance::Balanced,
            risk_overrides: None,
            active: true,
        };
        let now = "2026-03-10T22:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            account.local_date(now),
            NaiveDate::from_ymd_opt(2026, 3, 11).unwrap(),
            "UTC+3 is already past midnight"
        );
    }

    #[test]
    fn quality_drop_needs_known_rankings() {
        let mut g = AdGroupState {
            id: "g".into(),
            campaign_id: "c".into(),
            name: "g".into(),
            status: EntityStatus::Active,
            daily_budget_cents: 1000,
            learning_stage: LearningStage::Stable,
            created_at: None,
            quality_ranking: QualityRanking::BelowAverage,
            previous_quality_ranking: QualityRanking::Average,
        };
        assert!(g.quality_dropped());
        g.previous_quality_ranking = QualityRanking::Unknown;
        assert!(!g.quality_dropped());
    }

    #[test]
    fn pool_membership_wins_over_campaign() {
        let structure = AccountStructure {
            campaigns: vec![],
            adgroups: vec![
                AdGroupState {
                    id: "g1".into(),
                    campaign_id: "c1".into(),
                    name: "g1".into(),
                    status: EntityStatus::Active,
                    daily_budget_cents: 1000,
                    learning_stage: LearningStage::Stable,
                    created_at: None,
                    quality_ranking: QualityRanking::Unknown,
                    previous_quality_ranking: QualityRanking::Unknown,
                },
                AdGroupState {
                    id: "g2".into(),
                    campaign_id: "c1".into(),
                    name: "g2".into(),
                    status: EntityStatus::Paused,
                    daily_budget_cents: 1000,
                    learning_stage: LearningStage::Unknown,
                    created_at: None,
                    quality_ranking: QualityRanking::Unknown,
                    previous_quality_ranking: QualityRanking::Unknown,
                },
            ],
            ads: vec![],
        };
        let dir = |id: i64, campaign: Option<&str>, pool: Vec<&str>| Direction {
            id,
            account_id: 1,
            name: format!("d{id}"),
            daily_budget_cents: 5000,
            target_cpl_cents: 1000,
            platform_campaign_id: campaign.map(String::from),
            pre_provisioned: pool.into_iter().map(String::from).collect(),
            risk_overrides: None,
            active: true,
        };
        let owners = structure.assign_directions(&[dir(1, Some("c1"), vec![]), dir(2, None, vec!["g2"])]);
        assert_eq!(owners.get("g1"), Some(&1));
        assert_eq!(owners.get("g2"), Some(&2));
    }
}

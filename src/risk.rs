//! # Risk: Forward-Looking CPL Risk
//!
//! Scores every active ad-group (and every ready creative with recent delivery)
//! for the chance that its CPL degrades over the next few days. The score is
//! deterministic; an optional LLM pass adds a qualitative trend, a CPL
//! projection and recommendations, but never changes the score or level.
//!
//! ```text
//! risk = w_cpm  × max(0, CPM_short/CPM_medium − 1)
//!      + w_ctr  × max(0, 1 − CTR_short/CTR_medium)
//!      + w_freq × max(0, (frequency − freq_baseline)/freq_span)
//!      + w_jump × [budget jumped recently]
//!      + w_qual × [quality ranking dropped]
//! ```
//!
//! Clamped to [0, 100]; Low < 20 ≤ Medium < 40 ≤ High.
//!
//! ## Configuration layers
//!
//! Weights and baselines resolve global → account → campaign through
//! [`resolve_risk_config`]; the most specific layer that sets a field wins.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::collector::MetricsBundle;
use crate::health::Trend;
use crate::llm::{extract_json, LlmClient, LlmPrompt};
use crate::model::{AdGroupState, BudgetAuditRecord, Creative, Direction, EntityMetrics, Window, WindowedMetrics};
use crate::retry::{with_retry, RetryPolicy};

const SHORT: [Window; 2] = [Window::Yesterday, Window::Today];
const MEDIUM: [Window; 3] = [Window::Last7d, Window::Last3d, Window::Last30d];

// ── Configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub cpm_growth: f64,
    pub ctr_decline: f64,
    pub frequency: f64,
    pub budget_jump: f64,
    pub quality_drop: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            cpm_growth: 60.0,
            ctr_decline: 60.0,
            frequency: 25.0,
            budget_jump: 20.0,
            quality_drop: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLevelBounds {
    pub medium_min: i32,
    pub high_min: i32,
}

impl Default for RiskLevelBounds {
    fn default() -> Self {
        Self {
            medium_min: 20,
            high_min: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub freq_baseline: f64,
    pub freq_span: f64,
    /// Budget increase (percent) that counts as a jump.
    pub budget_jump_pct: f64,
    pub budget_jump_lookback_hours: i64,
    pub horizon_days: u32,
    pub levels: RiskLevelBounds,
    /// Lifetime impressions a creative needs to count as ready.
    pub ready_min_impressions: i64,
    pub ready_min_leads: i64,
    pub max_recommendations: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            freq_baseline: 2.0,
            freq_span: 2.0,
            budget_jump_pct: 30.0,
            budget_jump_lookback_hours: 72,
            horizon_days: 3,
            levels: RiskLevelBounds::default(),
            ready_min_impressions: 1_000,
            ready_min_leads: 3,
            max_recommendations: 5,
        }
    }
}

/// Partial risk configuration stored on an account or a direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskOverrides {
    pub cpm_growth_weight: Option<f64>,
    pub ctr_decline_weight: Option<f64>,
    pub frequency_weight: Option<f64>,
    pub budget_jump_weight: Option<f64>,
    pub quality_drop_weight: Option<f64>,
    pub freq_baseline: Option<f64>,
    pub freq_span: Option<f64>,
    pub budget_jump_pct: Option<f64>,
    pub horizon_days: Option<u32>,
}

impl RiskOverrides {
    fn apply(&self, c: &mut RiskConfig) {
        if let Some(v) = self.cpm_growth_weight {
            c.weights.cpm_growth = v;
        }
        if let Some(v) = self.ctr_decline_weight {
            c.weights.ctr_decline = v;
        }
        if let Some(v) = self.frequency_weight {
            c.weights.frequency = v;
        }
        if let Some(v) = self.budget_jump_weight {
            c.weights.budget_jump = v;
        }
        if let Some(v) = self.quality_drop_weight {
            c.weights.quality_drop = v;
        }
        if let Some(v) = self.freq_baseline {
            c.freq_baseline = v;
        }
        if let Some(v) = self.freq_span {
            c.freq_span = v;
        }
        if let Some(v) = self.budget_jump_pct {
            c.budget_jump_pct = v;
        }
        if let Some(v) = self.horizon_days {
            c.horizon_days = v;
        }
    }
}

/// Resolve the effective risk configuration. Pure; later layers win.
pub fn resolve_risk_config(
    global: &RiskConfig,
    account: Option<&RiskOverrides>,
    campaign: Option<&RiskOverrides>,
) -> RiskConfig {
    let mut resolved = global.clone();
    for layer in [account, campaign].into_iter().flatten() {
        layer.apply(&mut resolved);
    }
    resolved
}

// ── Output ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: i32, bounds: &RiskLevelBounds) -> Self {
        if score >= bounds.high_min {
            RiskLevel::High
        } else if score >= bounds.medium_min {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEntity {
    AdGroup,
    Creative,
}

/// Per-factor contributions before clamping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub cpm_growth: f64,
    pub ctr_decline: f64,
    pub frequency: f64,
    pub budget_jump: f64,
    pub quality_drop: f64,
}

impl RiskFactors {
    fn total(&self) -> f64 {
        self.cpm_growth + self.ctr_decline + self.frequency + self.budget_jump + self.quality_drop
    }

    fn dominant(&self) -> Option<&'static str> {
        [
            (self.cpm_growth, "rising CPM"),
            (self.ctr_decline, "falling CTR"),
            (self.frequency, "high frequency"),
            (self.budget_jump, "recent budget jump"),
            (self.quality_drop, "quality ranking drop"),
        ]
        .into_iter()
        .filter(|(v, _)| *v > 0.0)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, name)| name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScoreItem {
    pub entity_id: String,
    pub entity_kind: RiskEntity,
    pub direction_id: Option<i64>,
    pub risk_score: i32,
    pub risk_level: RiskLevel,
    pub trend: Trend,
    pub current_cpl_cents: Option<f64>,
    pub predicted_cpl_cents: Option<f64>,
    pub recommendations: Vec<String>,
    pub factors: RiskFactors,
}

/// A library creative with enough history that is not delivering anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCreative {
    pub creative_id: String,
    pub name: String,
    pub direction_id: Option<i64>,
    pub historical_impressions: i64,
    pub historical_cpl_cents: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AdvisoryStatus {
    Applied,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub items: Vec<RiskScoreItem>,
    pub ready_creatives: Vec<ReadyCreative>,
    /// Ranked, short natural-language recommendations for the planner.
    pub recommendations: Vec<String>,
    pub advisory: AdvisoryStatus,
}

impl RiskAssessment {
    pub fn item(&self, entity_id: &str) -> Option<&RiskScoreItem> {
        self.items.iter().find(|i| i.entity_id == entity_id)
    }
}

// ── Deterministic core ──────────────────────────────────────────

/// Everything the deterministic scorer reads for one account.
pub struct RiskContext<'a> {
    pub bundle: &'a MetricsBundle,
    pub directions: &'a [Direction],
    pub owners: &'a HashMap<String, i64>,
    pub creatives: &'a [Creative],
    pub audit: &'a [BudgetAuditRecord],
    pub account_overrides: Option<&'a RiskOverrides>,
    pub now: DateTime<Utc>,
}

pub fn score_factors(
    short: Option<&WindowedMetrics>,
    medium: Option<&WindowedMetrics>,
    budget_jumped: bool,
    quality_dropped: bool,
    config: &RiskConfig,
) -> RiskFactors {
    let w = &config.weights;
    let ratio = |f: fn(&WindowedMetrics) -> Option<f64>| -> Option<f64> {
        let s = short.and_then(f)?;
        let m = medium.and_then(f).filter(|m| *m > 0.0)?;
        Some(s / m)
    };
    let frequency = short.map(|s| s.frequency).unwrap_or(0.0);
    let span = if config.freq_span > 0.0 { config.freq_span } else { 1.0 };

    RiskFactors {
        cpm_growth: w.cpm_growth * ratio(WindowedMetrics::cpm_cents).map(|r| (r - 1.0).max(0.0)).unwrap_or(0.0),
        ctr_decline: w.ctr_decline * ratio(WindowedMetrics::ctr_pct).map(|r| (1.0 - r).max(0.0)).unwrap_or(0.0),
        frequency: w.frequency * ((frequency - config.freq_baseline) / span).max(0.0),
        budget_jump: if budget_jumped { w.budget_jump } else { 0.0 },
        quality_drop: if quality_dropped { w.quality_drop } else { 0.0 },
    }
}

pub fn clamp_score(factors: &RiskFactors) -> i32 {
    let total = factors.total();
    if total.is_finite() {
        (total.round() as i32).clamp(0, 100)
    } else {
        100
    }
}

fn budget_jumped(adgroup_id: &str, audit: &[BudgetAuditRecord], now: DateTime<Utc>, config: &RiskConfig) -> bool {
    let cutoff = now - Duration::hours(config.budget_jump_lookback_hours);
    audit.iter().any(|r| {
        r.adgroup_id == adgroup_id
            && r.changed_at >= cutoff
            && r.old_budget_cents > 0
            && (r.new_budget_cents - r.old_budget_cents) as f64 / r.old_budget_cents as f64 * 100.0
                >= config.budget_jump_pct
    })
}

fn cpl_trend(short: Option<&WindowedMetrics>, medium: Option<&WindowedMetrics>) -> Trend {
    match (short.and_then(|s| s.cpl_cents()), medium.and_then(|m| m.cpl_cents())) {
        (Some(s), Some(m)) if m > 0.0 => Trend::from_change_pct((s - m) / m * 100.0),
        _ => Trend::Unknown,
    }
}

fn adgroup_item(
    group: &AdGroupState,
    metrics: Option<&EntityMetrics>,
    direction_id: Option<i64>,
    ctx: &RiskContext<'_>,
    config: &RiskConfig,
) -> RiskScoreItem {
    let short = metrics.and_then(|m| m.first_with_spend(&SHORT));
    let medium = metrics.and_then(|m| m.first_with_spend(&MEDIUM));
    let factors = score_factors(
        short,
        medium,
        budget_jumped(&group.id, ctx.audit, ctx.now, config),
        group.quality_dropped(),
        config,
    );
    let risk_score = clamp_score(&factors);
    RiskScoreItem {
        entity_id: group.id.clone(),
        entity_kind: RiskEntity::AdGroup,
        direction_id,
        risk_score,
        risk_level: RiskLevel::from_score(risk_score, &config.levels),
        trend: cpl_trend(short, medium),
        current_cpl_cents: short.and_then(|s| s.cpl_cents()),
        predicted_cpl_cents: None,
        recommendations: Vec::new(),
        factors,
    }
}

/// Sum ad-level rows per creative into one synthetic row per window.
fn creative_metrics(bundle: &MetricsBundle) -> HashMap<String, EntityMetrics> {
    let mut out: HashMap<String, EntityMetrics> = HashMap::new();
    for ad in &bundle.structure.ads {
        let (Some(creative), Some(metrics)) = (ad.creative_id.as_deref(), bundle.ad(&ad.id)) else {
            continue;
        };
        let entry = out.entry(creative.to_string()).or_default();
        for row in metrics.windows.values() {
            let merged = match entry.get(row.window) {
                Some(prev) => WindowedMetrics {
                    entity_id: creative.to_string(),
                    spend_cents: prev.spend_cents + row.spend_cents,
                    impressions: prev.impressions + row.impressions,
                    clicks: prev.clicks + row.clicks,
                    leads: prev.leads + row.leads,
                    quality_leads: match (prev.quality_leads, row.quality_leads) {
                        (Some(a), Some(b)) => Some(a + b),
                        (a, b) => a.or(b),
                    },
                    frequency: prev.frequency.max(row.frequency),
                    ..prev.clone()
                },
                None => WindowedMetrics {
                    entity_id: creative.to_string(),
                    ..row.clone()
                },
            };
            entry.insert(merged);
        }
    }
    out
}

/// Creatives with enough lifetime volume that no active ad is running.
pub fn ready_creatives(ctx: &RiskContext<'_>, config: &RiskConfig) -> Vec<ReadyCreative> {
    let running: HashSet<&str> = ctx.bundle.structure.running_creatives();
    let mut ready: Vec<ReadyCreative> = ctx
        .creatives
        .iter()
        .filter(|c| c.active)
        .filter(|c| c.historical_impressions >= config.ready_min_impressions)
        .filter(|c| c.historical_leads >= config.ready_min_leads)
        .filter(|c| !running.contains(c.id.as_str()))
        .map(|c| ReadyCreative {
            creative_id: c.id.clone(),
            name: c.name.clone(),
            direction_id: c.direction_id,
            historical_impressions: c.historical_impressions,
            historical_cpl_cents: c.historical_cpl_cents(),
        })
        .collect();
    // Cheapest history first; unknown CPL last.
    ready.sort_by(|a, b| {
        let ka = a.historical_cpl_cents.unwrap_or(f64::MAX);
        let kb = b.historical_cpl_cents.unwrap_or(f64::MAX);
        ka.total_cmp(&kb).then_with(|| a.creative_id.cmp(&b.creative_id))
    });
    ready
}

/// Deterministic risk items for active ad-groups and ready creatives.
pub fn score_risks(ctx: &RiskContext<'_>, global: &RiskConfig) -> Vec<RiskScoreItem> {
    let account_layer = resolve_risk_config(global, ctx.account_overrides, None);
    let config_for = |direction_id: Option<i64>| -> RiskConfig {
        let campaign = direction_id
            .and_then(|id| ctx.directions.iter().find(|d| d.id == id))
            .and_then(|d| d.risk_overrides.as_ref());
        resolve_risk_config(global, ctx.account_overrides, campaign)
    };

    let mut items: Vec<RiskScoreItem> = ctx
        .bundle
        .structure
        .adgroups
        .iter()
        .filter(|g| g.is_active())
        .map(|g| {
            let direction_id = ctx.owners.get(&g.id).copied();
            adgroup_item(g, ctx.bundle.adgroup(&g.id), direction_id, ctx, &config_for(direction_id))
        })
        .collect();

    let by_creative = creative_metrics(ctx.bundle);
    for ready in ready_creatives(ctx, &account_layer) {
        let config = config_for(ready.direction_id);
        let metrics = by_creative.get(&ready.creative_id);
        let short = metrics.and_then(|m| m.first_with_spend(&SHORT));
        let medium = metrics.and_then(|m| m.first_with_spend(&MEDIUM));
        let factors = score_factors(short, medium, false, false, &config);
        let risk_score = clamp_score(&factors);
        items.push(RiskScoreItem {
            entity_id: ready.creative_id.clone(),
            entity_kind: RiskEntity::Creative,
            direction_id: ready.direction_id,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score, &config.levels),
            trend: cpl_trend(short, medium),
            current_cpl_cents: short.and_then(|s| s.cpl_cents()).or(ready.historical_cpl_cents),
            predicted_cpl_cents: None,
            recommendations: Vec::new(),
            factors,
        });
    }

    items.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then_with(|| a.entity_id.cmp(&b.entity_id)));
    items
}

/// Ranked recommendations derived from the scores alone.
pub fn deterministic_recommendations(
    items: &[RiskScoreItem],
    ready: &[ReadyCreative],
    limit: usize,
) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .filter(|i| i.entity_kind == RiskEntity::AdGroup && i.risk_level != RiskLevel::Low)
        .map(|i| {
            let driver = i.factors.dominant().unwrap_or("combined signals");
            format!(
                "ad-group {}: {} risk ({}) driven by {}",
                i.entity_id,
                i.risk_level.as_str(),
                i.risk_score,
                driver
            )
        })
        .collect();
    if !ready.is_empty() {
        out.push(format!(
            "{} ready creative(s) unused: {}",
            ready.len(),
            ready
                .iter()
                .take(5)
                .map(|r| r.creative_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    out.truncate(limit);
    out
}

// ── Advisory LLM pass ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AdviceItem {
    entity_id: String,
    #[serde(default)]
    trend: Option<String>,
    #[serde(default)]
    predicted_cpl_cents: Option<f64>,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Advice {
    #[serde(default)]
    items: Vec<AdviceItem>,
    #[serde(default)]
    recommendations: Vec<String>,
}

fn advice_prompt(items: &[RiskScoreItem], horizon_days: u32) -> LlmPrompt {
    let payload: Vec<serde_json::Value> = items
        .iter()
        .map(|i| {
            serde_json::json!({
                "entity_id": i.entity_id,
                "kind": i.entity_kind,
                "risk_score": i.risk_score,
                "risk_level": i.risk_level,
                "trend": i.trend,
                "current_cpl_cents": i.current_cpl_cents,
                "factors": i.factors,
            })
        })
        .collect();
    LlmPrompt {
        system: format!(
            "You assess advertising CPL risk. For each entity give a trend \
             (improving, stable or declining), a CPL projection in cents {horizon_days} days ahead \
             based on the trend and recent slope, and at most two short recommendations. \
             Then give up to five ranked account-level recommendations. \
             Reply with one JSON object only: \
             {{\"items\":[{{\"entity_id\":\"...\",\"trend\":\"...\",\"predicted_cpl_cents\":0,\"recommendations\":[\"...\"]}}],\
             \"recommendations\":[\"...\"]}}"
        ),
        user: serde_json::Value::Array(payload).to_string(),
    }
}

/// Merge parsed advice into the items. Returns false when nothing usable came back.
fn apply_advice(items: &mut [RiskScoreItem], advice: Advice) -> (bool, Vec<String>) {
    let mut touched = false;
    for a in advice.items {
        let Some(item) = items.iter_mut().find(|i| i.entity_id == a.entity_id) else {
            continue;
        };
        if let Some(trend) = a.trend.as_deref().and_then(Trend::parse) {
            item.trend = trend;
            touched = true;
        }
        if let Some(p) = a.predicted_cpl_cents.filter(|p| p.is_finite() && *p > 0.0) {
            item.predicted_cpl_cents = Some(p);
            touched = true;
        }
        let recs: Vec<String> = a
            .recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .take(2)
            .collect();
        if !recs.is_empty() {
            item.recommendations = recs;
            touched = true;
        }
    }
    let account_recs: Vec<String> = advice
        .recommendations
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    (touched || !account_recs.is_empty(), account_recs)
}

/// Deterministic scoring plus the optional advisory pass.
pub struct RiskAgent {
    llm: Option<Arc<dyn LlmClient>>,
    retry: RetryPolicy,
    config: RiskConfig,
}

impl RiskAgent {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, retry: RetryPolicy, config: RiskConfig) -> Self {
        Self { llm, retry, config }
    }

    pub async fn assess(&self, ctx: &RiskContext<'_>) -> RiskAssessment {
        let account_config = resolve_risk_config(&self.config, ctx.account_overrides, None);
        let mut items = score_risks(ctx, &self.config);
        let ready = ready_creatives(ctx, &account_config);
        let limit = account_config.max_recommendations;

        let Some(llm) = &self.llm else {
            let recommendations = deterministic_recommendations(&items, &ready, limit);
            return RiskAssessment {
                items,
                ready_creatives: ready,
                recommendations,
                advisory: AdvisoryStatus::Skipped,
            };
        };

        let prompt = advice_prompt(&items, account_config.horizon_days);
        let response = with_retry(&self.retry, "llm.risk", || llm.complete(&prompt)).await;
        let parsed = match response {
            Ok(text) => extract_json(&text)
                .ok_or_else(|| "no JSON object in response".to_string())
                .and_then(|v| serde_json::from_value::<Advice>(v).map_err(|e| e.to_string())),
            Err(e) => Err(e.to_string()),
        };

        let (advisory, llm_recs) = match parsed {
            Ok(advice) => {
                // Work on a copy so a half-usable answer never leaves partial edits.
                let mut enriched = items.clone();
                let (usable, recs) = apply_advice(&mut enriched, advice);
                if usable {
                    items = enriched;
                    info!(items = items.len(), "risk advisory applied");
                    (AdvisoryStatus::Applied, recs)
                } else {
                    warn!("risk advisory returned nothing usable");
                    (AdvisoryStatus::Failed("empty advice".to_string()), Vec::new())
                }
            }
            Err(reason) => {
                warn!(reason = %reason, "risk advisory failed, keeping deterministic scores");
                (AdvisoryStatus::Failed(reason), Vec::new())
            }
        };

        let mut recommendations = if llm_recs.is_empty() {
            deterministic_recommendations(&items, &ready, limit)
        } else {
            llm_recs
        };
        recommendations.truncate(limit);

        RiskAssessment {
            items,
            ready_creatives: ready,
            recommendations,
            advisory,
        }
    }
}

//! # Health: Bounded Ad-Group Health Score
//!
//! Turns one ad-group's windowed metrics into a score in [-100, 100] and a
//! class label that drives the planner's decision matrix.
//!
//! ```text
//! HS = clamp(round((cpl_gap + trend + diagnostics + today) × volume_factor), -100, 100)
//! ```
//!
//! ## Components
//!
//! | Component | Range | Source |
//! |-----------|-------|--------|
//! | CPL gap | ±50 | short-window CPL (or QCPL) ratio to target, piecewise-linear |
//! | Trend | ±20 | short ratio vs medium ratio, percent change |
//! | Diagnostics | 0..−30 | frequency, CTR level/decline, CPM rise or above account median |
//! | Today | 0..+20 | today's CPL beating yesterday's with enough impressions |
//!
//! The volume factor shrinks scores toward 0 when the short window has few
//! impressions, and further while the platform still reports a learning stage.
//!
//! An ad-group without spend in any window gets [`HealthClass::NoData`] and is
//! never eligible for actions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{AdGroupState, BudgetAuditRecord, EntityMetrics, LearningStage, Window, WindowedMetrics};

const SHORT: [Window; 2] = [Window::Yesterday, Window::Today];
const MEDIUM: [Window; 3] = [Window::Last7d, Window::Last3d, Window::Last30d];

// ── Configuration ───────────────────────────────────────────────

/// Lower bounds of each class. Scores below `slightly_bad_min` are bad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassBounds {
    pub good_min: i32,
    pub neutral_min: i32,
    pub slightly_bad_min: i32,
}

impl Default for ClassBounds {
    fn default() -> Self {
        Self {
            good_min: 40,
            neutral_min: -10,
            slightly_bad_min: -40,
        }
    }
}

impl ClassBounds {
    pub fn is_ordered(&self) -> bool {
        self.good_min > self.neutral_min && self.neutral_min > self.slightly_bad_min
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeTier {
    /// Applies while short-window impressions are below this value.
    pub below_impressions: i64,
    pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub class_bounds: ClassBounds,
    pub volume_tiers: Vec<VolumeTier>,
    /// Impressions at which a verdict is considered data-sufficient.
    pub min_impressions: i64,
    pub learning_factor: f64,
    pub frequency_threshold: f64,
    pub min_ctr_pct: f64,
    pub ctr_decline_pct: f64,
    pub cpm_rise_pct: f64,
    pub median_cpm_multiplier: f64,
    pub today_min_impressions: i64,
    pub today_bonus_cap: f64,
    /// Expected qualified share of leads; QCPL is measured against it.
    pub baseline_quality_share: f64,
    pub new_adgroup_hours: i64,
    /// Window in which a budget change counts as "recent".
    pub recent_change_hours: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            class_bounds: ClassBounds::default(),
            volume_tiers: vec![
                VolumeTier {
                    below_impressions: 500,
                    factor: 0.6,
                },
                VolumeTier {
                    below_impressions: 1_000,
                    factor: 0.8,
                },
            ],
            min_impressions: 1_000,
            learning_factor: 0.8,
            frequency_threshold: 2.0,
            min_ctr_pct: 1.0,
            ctr_decline_pct: 20.0,
            cpm_rise_pct: 30.0,
            median_cpm_multiplier: 1.3,
            today_min_impressions: 500,
            today_bonus_cap: 20.0,
            baseline_quality_share: 0.6,
            new_adgroup_hours: 48,
            recent_change_hours: 36,
        }
    }
}

// ── Output ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    Good,
    Neutral,
    SlightlyBad,
    Bad,
    NoData,
}

impl HealthClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthClass::Good => "good",
            HealthClass::Neutral => "neutral",
            HealthClass::SlightlyBad => "slightly_bad",
            HealthClass::Bad => "bad",
            HealthClass::NoData => "no_data",
        }
    }

    pub fn from_score(score: i32, bounds: &ClassBounds) -> Self {
        if score >= bounds.good_min {
            HealthClass::Good
        } else if score >= bounds.neutral_min {
            HealthClass::Neutral
        } else if score >= bounds.slightly_bad_min {
            HealthClass::SlightlyBad
        } else {
            HealthClass::Bad
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
    Unknown,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Declining => "declining",
            Trend::Unknown => "unknown",
        }
    }

    /// Classify a percent change where negative means cheaper.
    pub fn from_change_pct(pct: f64) -> Self {
        if pct <= -10.0 {
            Trend::Improving
        } else if pct >= 10.0 {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "improving" => Some(Trend::Improving),
            "stable" => Some(Trend::Stable),
            "declining" | "worsening" => Some(Trend::Declining),
            _ => None,
        }
    }
}

/// Budget history of one ad-group, derived from the audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFlags {
    pub is_new: bool,
    pub was_decreased_recently: bool,
    pub was_increased_recently: bool,
    pub consecutive_decreases: u32,
}

impl HistoryFlags {
    pub fn from_audit(
        adgroup: &AdGroupState,
        records: &[BudgetAuditRecord],
        now: DateTime<Utc>,
        config: &HealthConfig,
    ) -> Self {
        let mut own: Vec<&BudgetAuditRecord> =
            records.iter().filter(|r| r.adgroup_id == adgroup.id).collect();
        own.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));

        let recent_cutoff = now - Duration::hours(config.recent_change_hours);
        let latest_recent = own.first().filter(|r| r.changed_at >= recent_cutoff);

        Self {
            is_new: adgroup
                .age_hours(now)
                .is_some_and(|h| h < config.new_adgroup_hours),
            was_decreased_recently: latest_recent.is_some_and(|r| r.is_decrease()),
            was_increased_recently: latest_recent.is_some_and(|r| r.is_increase()),
            consecutive_decreases: own.iter().take_while(|r| r.is_decrease()).count() as u32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthComponents {
    pub cpl_gap: f64,
    pub trend: f64,
    pub diagnostics: f64,
    pub today: f64,
    pub volume_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScore {
    pub adgroup_id: String,
    pub score: i32,
    pub class: HealthClass,
    pub cpl_ratio_short: Option<f64>,
    pub cpl_ratio_medium: Option<f64>,
    pub used_qcpl: bool,
    pub trend: Trend,
    pub learning_stage: LearningStage,
    pub data_sufficient: bool,
    pub impressions: i64,
    pub components: HealthComponents,
    pub history: HistoryFlags,
    /// Human-readable reasons behind diagnostic penalties.
    pub signals: Vec<String>,
}

impl HealthScore {
    pub fn is_actionable(&self) -> bool {
        self.class != HealthClass::NoData
    }

    /// Ratio the decision matrix compares against its multipliers.
    pub fn decision_ratio(&self) -> Option<f64> {
        self.cpl_ratio_short.or(self.cpl_ratio_medium)
    }

    fn no_data(adgroup: &AdGroupState, history: HistoryFlags) -> Self {
        Self {
            adgroup_id: adgroup.id.clone(),
            score: 0,
            class: HealthClass::NoData,
            cpl_ratio_short: None,
            cpl_ratio_medium: None,
            used_qcpl: false,
            trend: Trend::Unknown,
            learning_stage: adgroup.learning_stage,
            data_sufficient: false,
            impressions: 0,
            components: HealthComponents::default(),
            history,
            signals: vec!["no spend in any window".to_string()],
        }
    }
}

// ── Calculator ──────────────────────────────────────────────────

pub struct HealthInput<'a> {
    pub adgroup: &'a AdGroupState,
    pub metrics: Option<&'a EntityMetrics>,
    pub target_cpl_cents: i64,
    pub history: HistoryFlags,
    pub median_cpm_cents: Option<f64>,
}

/// Score one ad-group. Pure.
pub fn score_adgroup(input: &HealthInput<'_>, config: &HealthConfig) -> HealthScore {
    let metrics = match input.metrics {
        Some(m) if !m.is_empty() => m,
        _ => return HealthScore::no_data(input.adgroup, input.history.clone()),
    };

    let short = metrics.first_with_spend(&SHORT);
    let medium = metrics.first_with_spend(&MEDIUM);
    let target = input.target_cpl_cents.max(1) as f64;

    let (ratio_short, q_short) = short.map(|m| cpl_ratio(m, target, config)).unwrap_or((None, false));
    let (ratio_medium, q_medium) = medium.map(|m| cpl_ratio(m, target, config)).unwrap_or((None, false));

    let mut signals = Vec::new();
    let cpl_gap = ratio_short.or(ratio_medium).map(cpl_gap_points).unwrap_or(0.0);

    let (trend, trend_points) = match (ratio_short, ratio_medium) {
        (Some(s), Some(m)) if m > 0.0 => {
            let pct = ((s - m) / m * 100.0).clamp(-20.0, 20.0);
            (Trend::from_change_pct(pct), -pct)
        }
        _ => (Trend::Unknown, 0.0),
    };

    let diagnostics = match short {
        Some(s) => diagnostic_points(s, medium, input.median_cpm_cents, config, &mut signals),
        None => 0.0,
    };

    let today = today_points(metrics, config);
    if today > 0.0 {
        signals.push(format!("today's CPL improving (+{today:.0})"));
    }

    let impressions: i64 = SHORT
        .iter()
        .filter_map(|w| metrics.get(*w))
        .map(|m| m.impressions)
        .sum();
    let mut volume_factor = volume_factor(impressions, config);
    if input.adgroup.learning_stage.is_learning() {
        volume_factor *= config.learning_factor;
    }

    let raw = (cpl_gap + trend_points + diagnostics + today) * volume_factor;
    let score = (raw.round() as i32).clamp(-100, 100);

    HealthScore {
        adgroup_id: input.adgroup.id.clone(),
        score,
        class: HealthClass::from_score(score, &config.class_bounds),
        cpl_ratio_short: ratio_short,
        cpl_ratio_medium: ratio_medium,
        used_qcpl: q_short || q_medium,
        trend,
        learning_stage: input.adgroup.learning_stage,
        data_sufficient: impressions >= config.min_impressions,
        impressions,
        components: HealthComponents {
            cpl_gap,
            trend: trend_points,
            diagnostics,
            today,
            volume_factor,
        },
        history: input.history.clone(),
        signals,
    }
}

/// Observed-to-target CPL ratio, quality-adjusted when a quality signal exists.
///
/// A window with spend but no leads is only judged once it has spent at least
/// one target CPL; the ratio is then spend over target.
fn cpl_ratio(m: &WindowedMetrics, target: f64, config: &HealthConfig) -> (Option<f64>, bool) {
    let base = match m.cpl_cents() {
        Some(cpl) => cpl / target,
        None if m.spend_cents as f64 >= target => m.spend_cents as f64 / target,
        None => return (None, false),
    };
    match m.quality_share() {
        Some(share) if config.baseline_quality_share > 0.0 => {
            let multiplier = (share / config.baseline_quality_share).clamp(0.5, 2.0);
            (Some(base / multiplier), true)
        }
        _ => (Some(base), false),
    }
}

/// Piecewise-linear CPL gap points.
pub fn cpl_gap_points(ratio: f64) -> f64 {
    const KNOTS: [(f64, f64); 5] = [(0.5, 50.0), (0.7, 33.0), (1.0, 0.0), (1.5, -33.0), (2.0, -50.0)];
    if ratio <= KNOTS[0].0 {
        return KNOTS[0].1;
    }
    for pair in KNOTS.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if ratio <= x1 {
            return y0 + (ratio - x0) / (x1 - x0) * (y1 - y0);
        }
    }
    KNOTS[KNOTS.len() - 1].1
}

fn diagnostic_points(
    short: &WindowedMetrics,
    medium: Option<&WindowedMetrics>,
    median_cpm: Option<f64>,
    config: &HealthConfig,
    signals: &mut Vec<String>,
) -> f64 {
    let mut points = 0.0;

    if short.frequency > config.frequency_threshold {
        points -= 10.0;
        signals.push(format!("frequency {:.1} above {:.1}", short.frequency, config.frequency_threshold));
    }

    if let Some(ctr) = short.ctr_pct() {
        let declined = medium
            .and_then(|m| m.ctr_pct())
            .filter(|base| *base > 0.0)
            .map(|base| (base - ctr) / base * 100.0)
            .filter(|drop| *drop >= config.ctr_decline_pct);
        if ctr < config.min_ctr_pct {
            points -= 8.0;
            signals.push(format!("CTR {ctr:.2}% below {:.1}%", config.min_ctr_pct));
        } else if let Some(drop) = declined {
            points -= 8.0;
            signals.push(format!("CTR down {drop:.0}% vs medium window"));
        }
    }

    if let Some(cpm) = short.cpm_cents() {
        let rise = medium
            .and_then(|m| m.cpm_cents())
            .filter(|base| *base > 0.0)
            .map(|base| (cpm - base) / base * 100.0)
            .filter(|r| *r >= config.cpm_rise_pct);
        let above_median = median_cpm
            .filter(|med| *med > 0.0 && cpm > med * config.median_cpm_multiplier)
            .is_some();
        if let Some(r) = rise {
            points -= 12.0;
            signals.push(format!("CPM up {r:.0}% vs medium window"));
        } else if above_median {
            points -= 12.0;
            signals.push("CPM above account median".to_string());
        }
    }

    points
}

fn today_points(metrics: &EntityMetrics, config: &HealthConfig) -> f64 {
    let (Some(today), Some(yesterday)) = (metrics.get(Window::Today), metrics.get(Window::Yesterday)) else {
        return 0.0;
    };
    if today.impressions < config.today_min_impressions {
        return 0.0;
    }
    match (today.cpl_cents(), yesterday.cpl_cents()) {
        (Some(t), Some(y)) if y > 0.0 && t < y => ((y - t) / y * 100.0).min(config.today_bonus_cap),
        _ => 0.0,
    }
}

pub fn volume_factor(impressions: i64, config: &HealthConfig) -> f64 {
    let mut tiers: Vec<&VolumeTier> = config.volume_tiers.iter().collect();
    tiers.sort_by_key(|t| t.below_impressions);
    tiers
        .into_iter()
        .find(|t| impressions < t.below_impressions)
        .map(|t| t.factor.clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

/// Median short-window CPM across ad-groups with impressions.
pub fn median_cpm(metrics: &HashMap<String, EntityMetrics>) -> Option<f64> {
    let mut cpms: Vec<f64> = metrics
        .values()
        .filter_map(|m| m.first_with_spend(&SHORT))
        .filter_map(|m| m.cpm_cents())
        .collect();
    if cpms.is_empty() {
        return None;
    }
    cpms.sort_by(|a, b| a.total_cmp(b));
    let mid = cpms.len() / 2;
    Some(if cpms.len() % 2 == 0 {
        (cpms[mid - 1] + cpms[mid]) / 2.0
    } else {
        cpms[mid]
    })
}

/// Count of ad-groups per class, in class order.
pub fn class_distribution(scores: &[HealthScore]) -> Vec<(HealthClass, usize)> {
    [
        HealthClass::Good,
        HealthClass::Neutral,
        HealthClass::SlightlyBad,
        HealthClass::Bad,
        HealthClass::NoData,
    ]
    .into_iter()
    .map(|c| (c, scores.iter().filter(|s| s.class == c).count()))
    .filter(|(_, n)| *n > 0)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityLevel, EntityStatus, QualityRanking};

    fn group(stage: LearningStage) -> AdGroupState {
        AdGroupState {
            id: "ag".into(),
            campaign_id: "c".into(),
            name: "ag".into(),
            status: EntityStatus::Active,
            daily_budget_cents: 3_000,
            learning_stage: stage,
            created_at: None,
            quality_ranking: QualityRanking::Unknown,
            previous_quality_ranking: QualityRanking::Unknown,
        }
    }

    fn row(window: Window, spend: i64, impressions: i64, clicks: i64, leads: i64) -> WindowedMetrics {
        WindowedMetrics {
            entity_id: "ag".into(),
            level: EntityLevel::AdGroup,
            window,
            spend_cents: spend,
            impressions,
            clicks,
            leads,
            quality_leads: None,
            frequency: 1.2,
        }
    }

    fn metrics(rows: Vec<WindowedMetrics>) -> EntityMetrics {
        let mut m = EntityMetrics::default();
        for r in rows {
            m.insert(r);
        }
        m
    }

    fn score(m: &EntityMetrics, stage: LearningStage) -> HealthScore {
        let g = group(stage);
        score_adgroup(
            &HealthInput {
                adgroup: &g,
                metrics: Some(m),
                target_cpl_cents: 1_000,
                history: HistoryFlags::default(),
                median_cpm_cents: None,
            },
            &HealthConfig::default(),
        )
    }

    #[test]
    fn gap_points_follow_knots() {
        assert_eq!(cpl_gap_points(0.3), 50.0);
        assert_eq!(cpl_gap_points(1.0), 0.0);
        assert_eq!(cpl_gap_points(2.0), -50.0);
        assert_eq!(cpl_gap_points(3.0), -50.0);
        let mid = cpl_gap_points(1.25);
        assert!((mid + 16.5).abs() < 1e-9, "halfway between 1.0 and 1.5, got {}", mid);
    }

    #[test]
    fn expensive_ad_group_is_bad() {
        let m = metrics(vec![
            row(Window::Yesterday, 30_000, 5_000, 100, 10),
            row(Window::Last7d, 210_000, 35_000, 700, 70),
        ]);
        let hs = score(&m, LearningStage::Stable);
        assert_eq!(hs.cpl_ratio_short, Some(3.0));
        assert_eq!(hs.class, HealthClass::Bad, "ratio 3.0 should be bad, score {}", hs.score);
        assert!(hs.data_sufficient);
        assert_eq!(hs.trend, Trend::Stable);
    }

    #[test]
    fn cheap_ad_group_is_good() {
        let m = metrics(vec![
            row(Window::Yesterday, 4_000, 5_000, 100, 10),
            row(Window::Last7d, 35_000, 35_000, 700, 70),
        ]);
        let hs = score(&m, LearningStage::Stable);
        assert_eq!(hs.class, HealthClass::Good, "score {}", hs.score);
        assert_eq!(hs.trend, Trend::Improving);
    }

    #[test]
    fn no_spend_is_no_data() {
        let g = group(LearningStage::Stable);
        let hs = score_adgroup(
            &HealthInput {
                adgroup: &g,
                metrics: None,
                target_cpl_cents: 1_000,
                history: HistoryFlags::default(),
                median_cpm_cents: None,
            },
            &HealthConfig::default(),
        );
        assert_eq!(hs.class, HealthClass::NoData);
        assert!(!hs.is_actionable());
    }

    #[test]
    fn low_volume_is_dampened() {
        let rich = metrics(vec![row(Window::Yesterday, 30_000, 5_000, 100, 10)]);
        let thin = metrics(vec![row(Window::Yesterday, 30_000, 400, 8, 10)]);
        let a = score(&rich, LearningStage::Stable);
        let b = score(&thin, LearningStage::Stable);
        assert!(b.score.abs() < a.score.abs(), "thin {} vs rich {}", b.score, a.score);
        assert!(!b.data_sufficient);
    }

    #[test]
    fn learning_stage_dampens_further() {
        let m = metrics(vec![row(Window::Yesterday, 30_000, 5_000, 100, 10)]);
        let stable = score(&m, LearningStage::Stable);
        let learning = score(&m, LearningStage::Learning);
        assert!(learning.score > stable.score);
        assert!((learning.components.volume_factor - 0.8).abs() < 1e-9);
    }

    #[test]
    fn quality_signal_adjusts_ratio() {
        let mut y = row(Window::Yesterday, 10_000, 5_000, 100, 10);
        y.quality_leads = Some(3);
        let hs = score(&metrics(vec![y]), LearningStage::Stable);
        assert!(hs.used_qcpl);
        // share 0.3 against baseline 0.6 halves the multiplier
        assert_eq!(hs.cpl_ratio_short, Some(2.0));
    }

    #[test]
    fn zero_leads_after_full_target_counts_as_expensive() {
        let m = metrics(vec![row(Window::Yesterday, 2_500, 3_000, 30, 0)]);
        let hs = score(&m, LearningStage::Stable);
        assert_eq!(hs.cpl_ratio_short, Some(2.5));
    }

    #[test]
    fn diagnostics_penalise_frequency_ctr_and_cpm() {
        let mut y = row(Window::Yesterday, 10_000, 5_000, 20, 10);
        y.frequency = 3.5;
        let week = row(Window::Last7d, 35_000, 35_000, 700, 35);
        let hs = score(&metrics(vec![y, week]), LearningStage::Stable);
        assert_eq!(hs.components.diagnostics, -30.0, "signals: {:?}", hs.signals);
    }

    #[test]
    fn class_bounds_are_configurable() {
        let strict = ClassBounds {
            good_min: 60,
            neutral_min: 0,
            slightly_bad_min: -20,
        };
        assert_eq!(HealthClass::from_score(45, &ClassBounds::default()), HealthClass::Good);
        assert_eq!(HealthClass::from_score(45, &strict), HealthClass::Neutral);
        assert_eq!(HealthClass::from_score(-40, &ClassBounds::default()), HealthClass::SlightlyBad);
        assert_eq!(HealthClass::from_score(-41, &ClassBounds::default()), HealthClass::Bad);
    }

    #[test]
    fn history_counts_consecutive_decreases() {
        let now = Utc::now();
        let rec = |hours_ago: i64, old: i64, new: i64| BudgetAuditRecord {
            account_id: 1,
            adgroup_id: "ag".into(),
            direction_id: None,
            old_budget_cents: old,
            new_budget_cents: new,
            action_type: "update_ad_group_budget".into(),
            run_id: None,
            changed_at: now - Duration::hours(hours_ago),
        };
        let records = vec![rec(100, 2_000, 4_000), rec(50, 4_000, 3_000), rec(20, 3_000, 2_000)];
        let flags = HistoryFlags::from_audit(&group(LearningStage::Stable), &records, now, &HealthConfig::default());
        assert_eq!(flags.consecutive_decreases, 2);
        assert!(flags.was_decreased_recently);
        assert!(!flags.was_increased_recently);
    }

    #[test]
    fn median_of_even_count() {
        let mut all = HashMap::new();
        for (id, spend) in [("a", 1_000), ("b", 3_000)] {
            let mut m = EntityMetrics::default();
            m.insert(WindowedMetrics {
                entity_id: id.into(),
                ..row(Window::Yesterday, spend, 1_000, 10, 1)
            });
            all.insert(id.to_string(), m);
        }
        assert_eq!(median_cpm(&all), Some(2_000.0));
    }
}

//! # Creative: Per-Ad Efficiency, Fatigue and Tags
//!
//! Looks inside each ad-group at the ads delivering through it. The planner's
//! budget-eater rule reads [`AdAnalysis::spend_share`] and
//! [`AdAnalysis::decision_ratio`]; the report reads the eater priorities,
//! fatigue flags and per-tag totals.
//!
//! ## Eater priorities
//!
//! | Priority | Condition |
//! |----------|-----------|
//! | Critical | CPL above 3× target |
//! | High | no leads while spending at least 2× the ad-group's average per ad |
//! | Medium | CPL above 1.5× target and more than half of the ad-group's spend |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::collector::MetricsBundle;
use crate::health::Trend;
use crate::model::{EntityStatus, Window};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreativeConfig {
    pub critical_ratio: f64,
    pub medium_ratio: f64,
    pub medium_share: f64,
    pub high_spend_multiple: f64,
    pub fatigue_frequency: f64,
    pub fatigue_ctr_decline_pct: f64,
    pub urgent_multiplier: f64,
    pub baseline_quality_share: f64,
}

impl Default for CreativeConfig {
    fn default() -> Self {
        Self {
            critical_ratio: 3.0,
            medium_ratio: 1.5,
            medium_share: 0.5,
            high_spend_multiple: 2.0,
            fatigue_frequency: 3.0,
            fatigue_ctr_decline_pct: 20.0,
            urgent_multiplier: 1.5,
            baseline_quality_share: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EaterPriority {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fatigue {
    Fresh,
    Fatigued,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdRecommendation {
    Scale,
    Monitor,
    Reduce,
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdAnalysis {
    pub ad_id: String,
    pub adgroup_id: String,
    pub creative_id: Option<String>,
    pub tag: String,
    pub spend_cents: i64,
    pub leads: i64,
    /// Share of the ad-group's yesterday spend, in [0, 1].
    pub spend_share: f64,
    pub cpl_ratio: Option<f64>,
    pub qcpl_ratio: Option<f64>,
    pub eater: Option<EaterPriority>,
    pub fatigue: Fatigue,
    pub trend: Trend,
    pub recommendation: AdRecommendation,
    /// Pausing this ad would leave its ad-group with nothing active.
    pub last_active_in_adgroup: bool,
}

impl AdAnalysis {
    /// QCPL ratio when the quality signal exists, plain CPL ratio otherwise.
    pub fn decision_ratio(&self) -> Option<f64> {
        self.qcpl_ratio.or(self.cpl_ratio)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSummary {
    pub tag: String,
    pub ads: usize,
    pub spend_cents: i64,
    pub leads: i64,
    pub cpl_cents: Option<f64>,
}

/// Tag from an ad name: text after the last " - ", else the first `[...]`,
/// else the name with non-alphanumerics collapsed to `_`.
pub fn extract_tag(name: &str) -> String {
    if let Some((_, tail)) = name.rsplit_once(" - ") {
        let tail = tail.trim();
        if !tail.is_empty() {
            return tail.to_string();
        }
    }
    if let (Some(open), Some(close)) = (name.find('['), name.find(']')) {
        if close > open + 1 {
            return name[open + 1..close].trim().to_string();
        }
    }
    let mut out = String::new();
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        "untagged".to_string()
    } else {
        out
    }
}

/// Analyze every ad with yesterday spend. `target_for` maps an ad-group id to
/// its target CPL in cents.
pub fn analyze_ads(
    bundle: &MetricsBundle,
    target_for: impl Fn(&str) -> i64,
    config: &CreativeConfig,
) -> Vec<AdAnalysis> {
    let mut out = Vec::new();
    for group in &bundle.structure.adgroups {
        let ads: Vec<_> = bundle.structure.ads_in(&group.id).collect();
        let yesterday: Vec<_> = ads
            .iter()
            .map(|a| bundle.ad(&a.id).and_then(|m| m.get(Window::Yesterday)))
            .collect();
        let group_spend: i64 = yesterday.iter().flatten().map(|m| m.spend_cents).sum();
        if group_spend <= 0 {
            continue;
        }
        let spending = yesterday.iter().flatten().count().max(1);
        let avg_spend = group_spend as f64 / spending as f64;
        let active_count = ads.iter().filter(|a| a.status == EntityStatus::Active).count();
        let target = target_for(&group.id).max(1) as f64;

        for (ad, row) in ads.iter().zip(yesterday.iter()) {
            let Some(row) = row else { continue };
            let share = row.spend_cents as f64 / group_spend as f64;
            let cpl_ratio = match row.cpl_cents() {
                Some(cpl) => Some(cpl / target),
                None if row.spend_cents as f64 >= target => Some(row.spend_cents as f64 / target),
                None => None,
            };
            let qcpl_ratio = row
                .qcpl_cents()
                .filter(|_| config.baseline_quality_share > 0.0)
                .map(|q| q / (target / config.baseline_quality_share));

            let eater = match cpl_ratio {
                Some(r) if row.leads > 0 && r > config.critical_ratio => Some(EaterPriority::Critical),
                _ if row.leads == 0 && row.spend_cents as f64 >= config.high_spend_multiple * avg_spend && ads.len() > 1 => {
                    Some(EaterPriority::High)
                }
                Some(r) if r > config.medium_ratio && share > config.medium_share => Some(EaterPriority::Medium),
                _ => None,
            };

            let metrics = bundle.ad(&ad.id);
            let week = metrics.and_then(|m| m.get(Window::Last7d));
            let ctr_decline = match (row.ctr_pct(), week.and_then(|w| w.ctr_pct())) {
                (Some(now), Some(base)) if base > 0.0 => (base - now) / base * 100.0,
                _ => 0.0,
            };
            let fatigue = if row.frequency > config.fatigue_frequency * config.urgent_multiplier
                || ctr_decline >= config.fatigue_ctr_decline_pct * config.urgent_multiplier
            {
                Fatigue::Urgent
            } else if row.frequency > config.fatigue_frequency || ctr_decline >= config.fatigue_ctr_decline_pct {
                Fatigue::Fatigued
            } else {
                Fatigue::Fresh
            };

            let trend = match (
                metrics.and_then(|m| m.get(Window::Last3d)).and_then(|m| m.cpl_cents()),
                week.and_then(|m| m.cpl_cents()),
            ) {
                (Some(short), Some(base)) if base > 0.0 => Trend::from_change_pct((short - base) / base * 100.0),
                _ => Trend::Unknown,
            };

            let ratio = qcpl_ratio.or(cpl_ratio);
            let recommendation = match (eater, ratio) {
                (Some(EaterPriority::Critical), _) => AdRecommendation::Pause,
                (Some(_), _) => AdRecommendation::Reduce,
                (None, Some(r)) if r > config.critical_ratio => AdRecommendation::Pause,
                (None, Some(r)) if r > config.medium_ratio => AdRecommendation::Reduce,
                (None, Some(r)) if r > 1.0 => AdRecommendation::Monitor,
                (None, Some(_)) if trend == Trend::Declining || fatigue != Fatigue::Fresh => AdRecommendation::Monitor,
                (None, Some(_)) => AdRecommendation::Scale,
                (None, None) => AdRecommendation::Monitor,
            };
            let last_active = ad.status == EntityStatus::Active && active_count <= 1;
            // Never advise pausing the only active ad of an ad-group.
            let recommendation = if recommendation == AdRecommendation::Pause && last_active {
                AdRecommendation::Reduce
            } else {
                recommendation
            };

            out.push(AdAnalysis {
                ad_id: ad.id.clone(),
                adgroup_id: group.id.clone(),
                creative_id: ad.creative_id.clone(),
                tag: extract_tag(&ad.name),
                spend_cents: row.spend_cents,
                leads: row.leads,
                spend_share: share,
                cpl_ratio,
                qcpl_ratio,
                eater,
                fatigue,
                trend,
                recommendation,
                last_active_in_adgroup: last_active,
            });
        }
    }
    out
}

/// Spend, leads and CPL per creative tag, most spend first.
pub fn summarize_by_tag(analyses: &[AdAnalysis]) -> Vec<TagSummary> {
    let mut by_tag: BTreeMap<&str, (usize, i64, i64)> = BTreeMap::new();
    for a in analyses {
        let e = by_tag.entry(a.tag.as_str()).or_default();
        e.0 += 1;
        e.1 += a.spend_cents;
        e.2 += a.leads;
    }
    let mut out: Vec<TagSummary> = by_tag
        .into_iter()
        .map(|(tag, (ads, spend, leads))| TagSummary {
            tag: tag.to_string(),
            ads,
            spend_cents: spend,
            leads,
            cpl_cents: (leads > 0).then(|| spend as f64 / leads as f64),
        })
        .collect();
    out.sort_by(|a, b| b.spend_cents.cmp(&a.spend_cents));
    out
}

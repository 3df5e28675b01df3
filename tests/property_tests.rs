//! Property-based tests for adpilot's scoring and validation primitives.
//!
//! These tests use the `proptest` framework to check invariants across many
//! randomly generated inputs: scores stay in range, classifications are
//! monotone in the score, and the validator never lets a budget outside the
//! configured bounds or two actions on the same entity through.
//!
//! # Prerequisites
//!
//! - No database or network access required.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use adpilot::health::{cpl_gap_points, volume_factor, ClassBounds, HealthClass, HealthConfig};
use adpilot::model::{EntityLevel, Window, WindowedMetrics};
use adpilot::risk::{clamp_score, score_factors, RiskConfig, RiskFactors, RiskLevel, RiskLevelBounds};
use adpilot::validator::{KnownEntities, Validator, ValidatorConfig};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn row(window: Window, spend: i64, impressions: i64, clicks: i64, frequency: f64) -> WindowedMetrics {
    WindowedMetrics {
        entity_id: "ag1".into(),
        level: EntityLevel::AdGroup,
        window,
        spend_cents: spend,
        impressions,
        clicks,
        leads: 0,
        quality_leads: None,
        frequency,
    }
}

fn known() -> KnownEntities {
    KnownEntities {
        adgroups: ["ag1", "ag2", "ag3"].into_iter().map(String::from).collect(),
        ads: HashSet::new(),
        directions: [1].into_iter().collect(),
    }
}

fn health_rank(class: HealthClass) -> i32 {
    match class {
        HealthClass::Bad => 0,
        HealthClass::SlightlyBad => 1,
        HealthClass::Neutral => 2,
        HealthClass::Good => 3,
        HealthClass::NoData => -1,
    }
}

// ── Health ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_cpl_gap_points_bounded(ratio in 0.0f64..20.0) {
        let p = cpl_gap_points(ratio);
        prop_assert!((-50.0..=50.0).contains(&p), "ratio {} gave {}", ratio, p);
    }

    #[test]
    fn prop_cpl_gap_points_non_increasing(a in 0.0f64..5.0, b in 0.0f64..5.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(cpl_gap_points(lo) >= cpl_gap_points(hi) - 1e-9);
    }

    #[test]
    fn prop_volume_factor_in_unit_range(impressions in 0i64..1_000_000) {
        let f = volume_factor(impressions, &HealthConfig::default());
        prop_assert!((0.0..=1.0).contains(&f));
    }

    #[test]
    fn prop_volume_factor_non_decreasing(a in 0i64..5_000, b in 0i64..5_000) {
        let config = HealthConfig::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(volume_factor(lo, &config) <= volume_factor(hi, &config));
    }

    #[test]
    fn prop_health_class_monotone_in_score(a in -100i32..=100, b in -100i32..=100) {
        let bounds = ClassBounds::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            health_rank(HealthClass::from_score(lo, &bounds)) <= health_rank(HealthClass::from_score(hi, &bounds))
        );
    }
}

// ── Risk ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_clamp_score_in_range(
        cpm in -1_000.0f64..1_000.0,
        ctr in -1_000.0f64..1_000.0,
        freq in -1_000.0f64..1_000.0,
        jump in 0.0f64..100.0,
        quality in 0.0f64..100.0,
    ) {
        let score = clamp_score(&RiskFactors {
            cpm_growth: cpm,
            ctr_decline: ctr,
            frequency: freq,
            budget_jump: jump,
            quality_drop: quality,
        });
        prop_assert!((0..=100).contains(&score));
    }

    #[test]
    fn prop_score_factors_non_negative(
        short_spend in 0i64..1_000_000,
        short_imps in 0i64..1_000_000,
        short_clicks in 0i64..10_000,
        medium_spend in 0i64..1_000_000,
        medium_imps in 0i64..1_000_000,
        medium_clicks in 0i64..10_000,
        frequency in 0.0f64..10.0,
        jumped: bool,
        dropped: bool,
    ) {
        let short = row(Window::Yesterday, short_spend, short_imps, short_clicks, frequency);
        let medium = row(Window::Last7d, medium_spend, medium_imps, medium_clicks, 1.0);
        let f = score_factors(Some(&short), Some(&medium), jumped, dropped, &RiskConfig::default());
        for v in [f.cpm_growth, f.ctr_decline, f.frequency, f.budget_jump, f.quality_drop] {
            prop_assert!(v >= 0.0, "negative factor in {:?}", f);
        }
        prop_assert!((0..=100).contains(&clamp_score(&f)));
    }

    #[test]
    fn prop_risk_level_monotone(a in 0i32..=100, b in 0i32..=100) {
        let bounds = RiskLevelBounds::default();
        let rank = |l: RiskLevel| match l {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
        };
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(rank(RiskLevel::from_score(lo, &bounds)) <= rank(RiskLevel::from_score(hi, &bounds)));
    }
}

// ── Validator ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_validator_clamps_budgets(budget in -1_000_000i64..10_000_000) {
        let config = ValidatorConfig::default();
        let (min, max) = (config.min_budget_cents, config.max_budget_cents);
        let raw = vec![json!({
            "type": "update_ad_group_budget",
            "adgroup_id": "ag1",
            "new_budget_cents": budget,
        })];
        let out = Validator::new(config).validate(&raw, &known());
        prop_assert_eq!(out.actions.len(), 1);
        let accepted = out.actions[0].to_raw();
        let cents = accepted["new_budget_cents"].as_i64().unwrap();
        prop_assert!((min..=max).contains(&cents));
        prop_assert_eq!(out.adjustments.is_empty(), (min..=max).contains(&budget));
    }

    #[test]
    fn prop_validator_one_action_per_entity(targets in prop::collection::vec(0usize..3, 1..12)) {
        let ids = ["ag1", "ag2", "ag3"];
        let raw: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                if i % 2 == 0 {
                    json!({"type": "pause_ad_group", "adgroup_id": ids[*t]})
                } else {
                    json!({"type": "update_ad_group_budget", "adgroup_id": ids[*t], "new_budget_cents": 1_000})
                }
            })
            .collect();
        let out = Validator::new(ValidatorConfig::default()).validate(&raw, &known());

        let mut keys = HashSet::new();
        for action in &out.actions {
            prop_assert!(keys.insert(action.conflict_key()));
        }
        let distinct: HashSet<_> = targets.iter().collect();
        prop_assert_eq!(out.actions.len(), distinct.len());
        prop_assert_eq!(out.actions.len() + out.rejected.len(), raw.len());
    }
}

//! # Rules: Deterministic Decision Matrix
//!
//! Evaluated per direction, in this order:
//!
//! 1. **Budget eaters.** An ad with at least `eater_share` of its ad-group's
//!    spend and a CPL/QCPL at least `eater_cpl_ratio` × target is paused. The
//!    ad-group and its other ads are left alone for the rest of the run.
//! 2. **Duplicate candidates.** Non-good ad-groups with High risk, a ratio of
//!    at least `dup_cpl_ratio` and enough impressions get an
//!    audience-diversified copy. A bad original is trimmed, or paused when its
//!    budget was already cut recently.
//! 3. **Bad rule.** Bad ad-groups at `bad_cpl_multiplier` or worse with
//!    sufficient data are reduced by `reduce_step`, or paused (see
//!    [`RulePlanner::bad_decision`]).
//! 4. **Caps.** Directions and the account are brought under their caps by
//!    trimming the largest budgets, then pausing the weakest ad-groups.
//! 5. **New spend.** Remaining headroom funds duplicates, then ready
//!    creatives in a new or pre-provisioned ad-group, at most
//!    `max_new_adgroups_per_direction` per direction.
//!
//! Ad-groups younger than `new_adgroup_hours`, with no data, or acted on within
//! the cooldown are skipped by steps 1 to 3. Cap enforcement ignores cooldowns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::budget::BudgetLedger;
use super::report::plan_report;
use super::{Action, ActionPlan, AdGroupView, DirectionView, PlanError, PlanSource, Planner, PlannerOutput, PlanningInput};
use crate::creative::AdAnalysis;
use crate::health::HealthClass;
use crate::model::{AdGroupMode, Tolerance};
use crate::risk::RiskLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Minimum CPL ratio for the bad rule.
    pub bad_cpl_multiplier: f64,
    pub eater_share: f64,
    pub eater_cpl_ratio: f64,
    pub dup_cpl_ratio: f64,
    pub dup_min_impressions: i64,
    pub dup_budget_floor_cents: i64,
    pub dup_budget_ceiling_cents: i64,
    pub duplicate_audience: String,
    pub new_adgroup_floor_cents: i64,
    pub new_adgroup_ceiling_cents: i64,
    pub reduce_step: f64,
    pub conservative_reduce_step: f64,
    pub min_budget_cents: i64,
    pub pause_cpl_ratio: f64,
    pub max_consecutive_decreases: u32,
    pub cooldown_hours: i64,
    pub duplicate_cooldown_hours: i64,
    pub max_new_adgroups_per_direction: usize,
    pub max_creatives_per_batch: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            bad_cpl_multiplier: 1.5,
            eater_share: 0.5,
            eater_cpl_ratio: 1.3,
            dup_cpl_ratio: 2.0,
            dup_min_impressions: 1_000,
            dup_budget_floor_cents: 1_000,
            dup_budget_ceiling_cents: 2_500,
            duplicate_audience: "broad".to_string(),
            new_adgroup_floor_cents: 1_000,
            new_adgroup_ceiling_cents: 2_500,
            reduce_step: 0.5,
            conservative_reduce_step: 0.25,
            min_budget_cents: 500,
            pause_cpl_ratio: 2.5,
            max_consecutive_decreases: 2,
            cooldown_hours: 20,
            duplicate_cooldown_hours: 72,
            max_new_adgroups_per_direction: 1,
            max_creatives_per_batch: 5,
        }
    }
}

/// Outcome of the bad rule for one ad-group.
#[derive(Debug, Clone, PartialEq)]
pub enum BadDecision {
    Reduce { new_budget_cents: i64, reason: String },
    Pause { reason: String },
}

/// Planned end state of one existing ad-group.
#[derive(Debug, Clone)]
struct Draft {
    adgroup_id: String,
    direction_id: i64,
    score: i32,
    original_cents: i64,
    budget_cents: i64,
    active: bool,
    reason: String,
}

impl Draft {
    fn effective(&self) -> i64 {
        if self.active {
            self.budget_cents
        } else {
            0
        }
    }

    fn into_action(self) -> Option<Action> {
        if !self.active {
            Some(Action::PauseAdGroup {
                adgroup_id: self.adgroup_id,
                direction_id: Some(self.direction_id),
                reason: self.reason,
            })
        } else if self.budget_cents != self.original_cents {
            Some(Action::UpdateAdGroupBudget {
                adgroup_id: self.adgroup_id,
                direction_id: Some(self.direction_id),
                new_budget_cents: self.budget_cents,
                reason: self.reason,
            })
        } else {
            None
        }
    }
}

pub struct RulePlanner {
    config: PlannerConfig,
}

impl RulePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Build the deterministic plan. Pure: same input, same plan.
    pub fn build(&self, input: &PlanningInput) -> Result<ActionPlan, PlanError> {
        input.check()?;
        let cfg = &self.config;
        let mut ledger = BudgetLedger::from_input(input);
        let mut drafts: Vec<Draft> = Vec::new();
        let mut eater_pauses: Vec<Action> = Vec::new();
        let mut dup_candidates: Vec<(i64, &AdGroupView)> = Vec::new();
        let mut notes: Vec<String> = Vec::new();

        let mut directions: Vec<&DirectionView> = input.directions.iter().collect();
        directions.sort_by_key(|d| d.direction.id);

        for dv in &directions {
            let dir_id = dv.direction.id;
            for g in dv.adgroups.iter().filter(|g| g.state.is_active()) {
                let mut draft = Draft {
                    adgroup_id: g.state.id.clone(),
                    direction_id: dir_id,
                    score: g.health.score,
                    original_cents: g.state.daily_budget_cents,
                    budget_cents: g.state.daily_budget_cents,
                    active: true,
                    reason: String::new(),
                };

                if let Some(eater) = self.budget_eater(g, input) {
                    eater_pauses.push(Action::PauseAd {
                        ad_id: eater.ad_id.clone(),
                        adgroup_id: g.state.id.clone(),
                        reason: format!(
                            "budget eater: {:.0}% of ad-group spend at {:.2}× target CPL",
                            eater.spend_share * 100.0,
                            eater.decision_ratio().unwrap_or_default()
                        ),
                    });
                    drafts.push(draft);
                    continue;
                }

                if input.cooldown.contains(&g.state.id) {
                    notes.push(format!("ad-group {} skipped: acted on within cooldown", g.state.id));
                    drafts.push(draft);
                    continue;
                }
                if g.health.history.is_new || !g.health.is_actionable() {
                    drafts.push(draft);
                    continue;
                }

                let ratio = g.health.decision_ratio();
                let duplicate = self.is_duplicate_candidate(g, input);
                if duplicate {
                    dup_candidates.push((dir_id, g));
                }

                let bad = g.health.class == HealthClass::Bad
                    && g.health.data_sufficient
                    && ratio.is_some_and(|r| r >= cfg.bad_cpl_multiplier);
                if bad || (duplicate && g.health.class == HealthClass::Bad) {
                    let decision = if duplicate && g.health.history.was_decreased_recently {
                        BadDecision::Pause {
                            reason: "duplicated with a new audience; budget already cut recently".to_string(),
                        }
                    } else {
                        self.bad_decision(g, input.account.tolerance)
                    };
                    match decision {
                        BadDecision::Reduce {
                            new_budget_cents,
                            reason,
                        } => {
                            draft.budget_cents = new_budget_cents;
                            draft.reason = reason;
                        }
                        BadDecision::Pause { reason } => {
                            draft.active = false;
                            draft.reason = reason;
                        }
                    }
                    ledger.adjust(dir_id, draft.effective() - draft.original_cents);
                }
                drafts.push(draft);
            }
        }

        for dv in &directions {
            let excess = ledger.direction_excess(dv.direction.id);
            if excess > 0 {
                notes.push(format!(
                    "direction {} over its cap by {excess} cents",
                    dv.direction.name
                ));
                self.shed(excess, &mut drafts, &mut ledger, Some(dv.direction.id), "direction budget cap");
            }
        }
        let excess = ledger.account_excess();
        if excess > 0 {
            notes.push(format!("account over its daily cap by {excess} cents"));
            self.shed(excess, &mut drafts, &mut ledger, None, "account daily cap");
        }

        let mut new_spend: Vec<Action> = Vec::new();
        for dv in &directions {
            self.allocate(dv, input, &dup_candidates, &mut ledger, &mut new_spend, &mut notes);
        }

        let mut actions = eater_pauses;
        actions.extend(drafts.into_iter().filter_map(Draft::into_action));
        actions.extend(new_spend);

        let report_text = plan_report(input, &actions, &notes);
        Ok(ActionPlan {
            plan_note: format!(
                "rules: {} action(s) across {} direction(s)",
                actions.len(),
                directions.len()
            ),
            actions: actions.iter().map(Action::to_raw).collect(),
            report_text,
        })
    }

    /// The ad to pause inside `g`, if one qualifies as a budget eater.
    pub fn budget_eater<'a>(&self, g: &'a AdGroupView, input: &PlanningInput) -> Option<&'a AdAnalysis> {
        if g.active_ads < 2 {
            return None;
        }
        g.ads
            .iter()
            .filter(|a| !a.last_active_in_adgroup)
            .filter(|a| !input.cooldown.contains(&a.ad_id))
            .filter(|a| a.spend_share >= self.config.eater_share)
            .filter(|a| a.decision_ratio().is_some_and(|r| r >= self.config.eater_cpl_ratio))
            .max_by(|a, b| a.spend_share.total_cmp(&b.spend_share))
    }

    fn is_duplicate_candidate(&self, g: &AdGroupView, input: &PlanningInput) -> bool {
        let cfg = &self.config;
        matches!(
            g.health.class,
            HealthClass::Neutral | HealthClass::SlightlyBad | HealthClass::Bad
        ) && g.risk.as_ref().is_some_and(|r| r.risk_level == RiskLevel::High)
            && g.health.decision_ratio().is_some_and(|r| r >= cfg.dup_cpl_ratio)
            && g.health.impressions >= cfg.dup_min_impressions
            && !input.duplicate_cooldown.contains(&g.state.id)
    }

    /// Reduce or pause a bad ad-group.
    ///
    /// Pauses when the budget is already at the floor, after
    /// `max_consecutive_decreases` cuts in a row, or under aggressive
    /// tolerance once the ratio reaches `pause_cpl_ratio`.
    pub fn bad_decision(&self, g: &AdGroupView, tolerance: Tolerance) -> BadDecision {
        let cfg = &self.config;
        let budget = g.state.daily_budget_cents;
        let ratio = g.health.decision_ratio().unwrap_or_default();

        if budget <= cfg.min_budget_cents {
            return BadDecision::Pause {
                reason: format!("CPL {ratio:.2}× target with budget already at the minimum"),
            };
        }
        if g.health.history.consecutive_decreases >= cfg.max_consecutive_decreases {
            return BadDecision::Pause {
                reason: format!(
                    "CPL {ratio:.2}× target after {} consecutive budget cuts",
                    g.health.history.consecutive_decreases
                ),
            };
        }
        if tolerance == Tolerance::Aggressive && ratio >= cfg.pause_cpl_ratio {
            return BadDecision::Pause {
                reason: format!("CPL {ratio:.2}× target"),
            };
        }

        let step = match tolerance {
            Tolerance::Conservative => cfg.conservative_reduce_step,
            Tolerance::Balanced | Tolerance::Aggressive => cfg.reduce_step,
        }
        .clamp(0.0, 1.0);
        let reduced = ((budget as f64) * (1.0 - step)).round() as i64;
        let new_budget_cents = reduced.max(cfg.min_budget_cents);
        if new_budget_cents >= budget {
            return BadDecision::Pause {
                reason: format!("CPL {ratio:.2}× target and no room to reduce"),
            };
        }
        BadDecision::Reduce {
            new_budget_cents,
            reason: format!("CPL {ratio:.2}× target, budget cut by {:.0}%", step * 100.0),
        }
    }

    /// Remove `excess` cents from active drafts, largest budgets first, then
    /// pause the weakest ad-groups if floors block further cuts.
    fn shed(
        &self,
        mut excess: i64,
        drafts: &mut [Draft],
        ledger: &mut BudgetLedger,
        direction: Option<i64>,
        label: &str,
    ) {
        let in_scope = |d: &Draft| d.active && direction.map_or(true, |id| d.direction_id == id);

        let mut by_budget: Vec<usize> = (0..drafts.len()).filter(|i| in_scope(&drafts[*i])).collect();
        by_budget.sort_by(|a, b| drafts[*b].budget_cents.cmp(&drafts[*a].budget_cents));
        for i in by_budget {
            if excess <= 0 {
                break;
            }
            let d = &mut drafts[i];
            let cut = excess.min(d.budget_cents - self.config.min_budget_cents);
            if cut > 0 {
                d.budget_cents -= cut;
                d.reason = format!("trimmed to fit the {label}");
                ledger.adjust(d.direction_id, -cut);
                excess -= cut;
            }
        }

        let mut by_score: Vec<usize> = (0..drafts.len()).filter(|i| in_scope(&drafts[*i])).collect();
        by_score.sort_by_key(|i| drafts[*i].score);
        for i in by_score {
            if excess <= 0 {
                break;
            }
            let d = &mut drafts[i];
            ledger.adjust(d.direction_id, -d.budget_cents);
            excess -= d.budget_cents;
            d.active = false;
            d.reason = format!("paused to fit the {label}");
        }
    }

    fn allocate(
        &self,
        dv: &DirectionView,
        input: &PlanningInput,
        dup_candidates: &[(i64, &AdGroupView)],
        ledger: &mut BudgetLedger,
        out: &mut Vec<Action>,
        notes: &mut Vec<String>,
    ) {
        let cfg = &self.config;
        let dir_id = dv.direction.id;
        let mut created = 0usize;

        for (_, g) in dup_candidates.iter().filter(|(d, _)| *d == dir_id) {
            if created >= cfg.max_new_adgroups_per_direction {
                break;
            }
            let budget = g
                .state
                .daily_budget_cents
                .min(cfg.dup_budget_ceiling_cents)
                .max(cfg.dup_budget_floor_cents);
            if !ledger.fits(dir_id, budget) {
                notes.push(format!(
                    "ad-group {} qualifies for duplication but direction {} has no headroom",
                    g.state.id, dv.direction.name
                ));
                continue;
            }
            ledger.adjust(dir_id, budget);
            created += 1;
            out.push(Action::DuplicateAdGroup {
                source_adgroup_id: g.state.id.clone(),
                direction_id: dir_id,
                daily_budget_cents: budget,
                audience: Some(cfg.duplicate_audience.clone()),
                reason: format!(
                    "High risk at {:.2}× target CPL, diversifying audience",
                    g.health.decision_ratio().unwrap_or_default()
                ),
            });
        }

        if dv.ready_creatives.is_empty() {
            return;
        }
        let batch = cfg.max_creatives_per_batch.max(1);
        let mut chunks = dv.ready_creatives.chunks(batch);
        let mut pool = dv.pool.iter();
        while created < cfg.max_new_adgroups_per_direction {
            let headroom = ledger.headroom(dir_id);
            let budget = headroom.min(cfg.new_adgroup_ceiling_cents);
            if budget < cfg.new_adgroup_floor_cents {
                notes.push(format!(
                    "direction {}: {} ready creative(s) waiting, headroom {headroom} cents below the {} floor",
                    dv.direction.name,
                    dv.ready_creatives.len(),
                    cfg.new_adgroup_floor_cents
                ));
                return;
            }
            let Some(chunk) = chunks.next() else { return };
            let creative_ids: Vec<String> = chunk.iter().map(|c| c.creative_id.clone()).collect();
            let reason = format!("{} ready creative(s) with spare budget", creative_ids.len());
            let action = match input.account.adgroup_mode {
                AdGroupMode::CreateViaApi => match &dv.direction.platform_campaign_id {
                    Some(campaign_id) => Action::CreateAdGroup {
                        direction_id: dir_id,
                        campaign_id: campaign_id.clone(),
                        daily_budget_cents: budget,
                        creative_ids,
                        reason,
                    },
                    None => {
                        notes.push(format!(
                            "direction {} has ready creatives but no campaign to create in",
                            dv.direction.name
                        ));
                        return;
                    }
                },
                AdGroupMode::UsePreProvisioned => match pool.next() {
                    Some(g) => Action::ActivateAdGroup {
                        adgroup_id: g.id.clone(),
                        direction_id: dir_id,
                        daily_budget_cents: Some(budget),
                        creative_ids,
                        reason,
                    },
                    None => {
                        notes.push(format!(
                            "direction {} has ready creatives but no pre-provisioned ad-group left",
                            dv.direction.name
                        ));
                        return;
                    }
                },
            };
            ledger.adjust(dir_id, budget);
            created += 1;
            out.push(action);
        }
    }
}

#[async_trait]
impl Planner for RulePlanner {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn plan(&self, input: &PlanningInput) -> Result<PlannerOutput, PlanError> {
        Ok(PlannerOutput {
            plan: self.build(input)?,
            source: PlanSource::Rules,
            fallback_reason: None,
            provider_failed: false,
        })
    }
}

/// Typed view of a rule plan, for callers that built it themselves.
pub fn typed_actions(plan: &ActionPlan) -> Vec<Action> {
    plan.actions
        .iter()
        .filter_map(|v| serde_json::from_value(v.clone()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creative::{AdRecommendation, Fatigue};
    use crate::health::Trend;
    use crate::model::{EntityStatus, Tolerance};
    use crate::planner::tests_support::*;
    use crate::risk::{ReadyCreative, RiskEntity, RiskFactors, RiskScoreItem};

    fn bad_view(id: &str, budget: i64, ratio: f64) -> AdGroupView {
        let mut g = adgroup_view(id, budget);
        g.health = health(id, HealthClass::Bad, -70, Some(ratio));
        g
    }

    fn ready(id: &str) -> ReadyCreative {
        ReadyCreative {
            creative_id: id.into(),
            name: id.into(),
            direction_id: Some(1),
            historical_impressions: 10_000,
            historical_cpl_cents: Some(800.0),
        }
    }

    fn high_risk(id: &str) -> RiskScoreItem {
        RiskScoreItem {
            entity_id: id.into(),
            entity_kind: RiskEntity::AdGroup,
            direction_id: Some(1),
            risk_score: 70,
            risk_level: RiskLevel::High,
            trend: Trend::Declining,
            current_cpl_cents: Some(2_500.0),
            predicted_cpl_cents: None,
            recommendations: Vec::new(),
            factors: RiskFactors::default(),
        }
    }

    fn ad(id: &str, share: f64, ratio: f64) -> AdAnalysis {
        AdAnalysis {
            ad_id: id.into(),
            adgroup_id: "g1".into(),
            creative_id: None,
            tag: id.into(),
            spend_cents: (share * 10_000.0) as i64,
            leads: 4,
            spend_share: share,
            cpl_ratio: Some(ratio),
            qcpl_ratio: None,
            eater: None,
            fatigue: Fatigue::Fresh,
            trend: Trend::Unknown,
            recommendation: AdRecommendation::Monitor,
            last_active_in_adgroup: false,
        }
    }

    fn planned(input: &PlanningInput) -> Vec<Action> {
        typed_actions(&RulePlanner::new(PlannerConfig::default()).build(input).unwrap())
    }

    #[test]
    fn bad_ad_group_is_halved() {
        let input = planning_input(vec![direction_view(1, 10_000, vec![bad_view("g1", 4_000, 3.0)])]);
        let actions = planned(&input);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::UpdateAdGroupBudget { new_budget_cents, .. } => assert_eq!(*new_budget_cents, 2_000),
            other => panic!("expected budget cut, got {other:?}"),
        }
    }

    #[test]
    fn aggressive_tolerance_pauses_on_ratio() {
        let mut input = planning_input(vec![direction_view(1, 10_000, vec![bad_view("g1", 4_000, 3.0)])]);
        input.account.tolerance = Tolerance::Aggressive;
        assert!(matches!(planned(&input)[0], Action::PauseAdGroup { .. }));
    }

    #[test]
    fn conservative_tolerance_trims_less() {
        let mut input = planning_input(vec![direction_view(1, 10_000, vec![bad_view("g1", 4_000, 3.0)])]);
        input.account.tolerance = Tolerance::Conservative;
        match &planned(&input)[0] {
            Action::UpdateAdGroupBudget { new_budget_cents, .. } => assert_eq!(*new_budget_cents, 3_000),
            other => panic!("expected budget cut, got {other:?}"),
        }
    }

    #[test]
    fn repeated_cuts_turn_into_pause() {
        let mut g = bad_view("g1", 4_000, 2.0);
        g.health.history.consecutive_decreases = 2;
        let input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        assert!(matches!(planned(&input)[0], Action::PauseAdGroup { .. }));
    }

    #[test]
    fn new_and_cooling_ad_groups_are_left_alone() {
        let mut young = bad_view("young", 4_000, 3.0);
        young.health.history.is_new = true;
        let cooling = bad_view("cooling", 4_000, 3.0);
        let mut input = planning_input(vec![direction_view(1, 10_000, vec![young, cooling])]);
        input.cooldown.insert("cooling".into());
        assert!(planned(&input).is_empty());
    }

    #[test]
    fn thin_data_blocks_bad_rule() {
        let mut g = bad_view("g1", 4_000, 3.0);
        g.health.data_sufficient = false;
        let input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        assert!(planned(&input).is_empty());
    }

    #[test]
    fn budget_eater_paused_alone() {
        let mut g = adgroup_view("g1", 5_000);
        g.active_ads = 2;
        g.ads = vec![ad("ad1", 0.6, 1.5), ad("ad2", 0.4, 0.9)];
        g.health = health("g1", HealthClass::Bad, -60, Some(1.6));
        let input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        let actions = planned(&input);
        assert_eq!(actions.len(), 1, "{actions:?}");
        match &actions[0] {
            Action::PauseAd { ad_id, .. } => assert_eq!(ad_id, "ad1"),
            other => panic!("expected ad pause, got {other:?}"),
        }
    }

    #[test]
    fn single_ad_group_never_gets_eater_pause() {
        let mut g = adgroup_view("g1", 5_000);
        g.active_ads = 1;
        g.ads = vec![ad("ad1", 1.0, 3.0)];
        let input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        assert!(planned(&input).iter().all(|a| !matches!(a, Action::PauseAd { .. })));
    }

    #[test]
    fn freed_budget_funds_one_new_ad_group() {
        let mut dv = direction_view(1, 5_000, vec![bad_view("g1", 4_500, 3.0)]);
        dv.ready_creatives = vec![ready("cr1"), ready("cr2")];
        let mut cfg = PlannerConfig::default();
        cfg.max_creatives_per_batch = 1;
        let input = planning_input(vec![dv]);
        let actions = typed_actions(&RulePlanner::new(cfg).build(&input).unwrap());
        let creates: Vec<_> = actions.iter().filter(|a| a.adds_spend()).collect();
        assert_eq!(creates.len(), 1, "{actions:?}");
        match creates[0] {
            Action::CreateAdGroup { daily_budget_cents, .. } => assert_eq!(*daily_budget_cents, 2_500),
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn pre_provisioned_mode_activates_pool() {
        let mut dv = direction_view(1, 5_000, vec![adgroup_view("g1", 2_000)]);
        dv.ready_creatives = vec![ready("cr1")];
        dv.pool = vec![adgroup_state("pool1", 800, EntityStatus::Paused)];
        let mut input = planning_input(vec![dv]);
        input.account.adgroup_mode = AdGroupMode::UsePreProvisioned;
        let actions = planned(&input);
        match &actions[0] {
            Action::ActivateAdGroup {
                adgroup_id,
                daily_budget_cents,
                creative_ids,
                ..
            } => {
                assert_eq!(adgroup_id, "pool1");
                assert_eq!(*daily_budget_cents, Some(2_500));
                assert_eq!(creative_ids, &vec!["cr1".to_string()]);
            }
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[test]
    fn high_risk_expensive_ad_group_is_duplicated() {
        let mut g = bad_view("g1", 4_000, 2.4);
        g.risk = Some(high_risk("g1"));
        let input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        let actions = planned(&input);
        assert!(actions.iter().any(|a| matches!(a,
            Action::DuplicateAdGroup { daily_budget_cents, .. } if *daily_budget_cents == 2_500)));
        assert!(actions.iter().any(|a| matches!(a, Action::UpdateAdGroupBudget { .. })));
    }

    #[test]
    fn duplicate_cooldown_blocks_copy() {
        let mut g = bad_view("g1", 4_000, 2.4);
        g.risk = Some(high_risk("g1"));
        let mut input = planning_input(vec![direction_view(1, 10_000, vec![g])]);
        input.duplicate_cooldown.insert("g1".into());
        assert!(planned(&input)
            .iter()
            .all(|a| !matches!(a, Action::DuplicateAdGroup { .. })));
    }

    #[test]
    fn over_cap_direction_is_trimmed() {
        let dv = direction_view(1, 5_000, vec![adgroup_view("g1", 4_000), adgroup_view("g2", 3_000)]);
        let input = planning_input(vec![dv]);
        let actions = planned(&input);
        let total: i64 = ["g1", "g2"]
            .iter()
            .map(|id| {
                actions
                    .iter()
                    .find_map(|a| match a {
                        Action::UpdateAdGroupBudget {
                            adgroup_id,
                            new_budget_cents,
                            ..
                        } if adgroup_id == id => Some(*new_budget_cents),
                        Action::PauseAdGroup { adgroup_id, .. } if adgroup_id == id => Some(0),
                        _ => None,
                    })
                    .unwrap_or(if *id == "g1" { 4_000 } else { 3_000 })
            })
            .sum();
        assert!(total <= 5_000, "total {total}");
    }

    #[test]
    fn unusable_input_is_an_error() {
        let input = planning_input(vec![]);
        assert_eq!(
            RulePlanner::new(PlannerConfig::default()).build(&input),
            Err(PlanError::NoDirections(1))
        );
    }

    /// Active budget per direction once `actions` are applied to `input`.
    fn active_after(input: &PlanningInput, actions: &[Action]) -> std::collections::BTreeMap<i64, i64> {
        let mut groups: Vec<(String, i64, i64, bool)> = input
            .directions
            .iter()
            .flat_map(|d| {
                d.adgroups
                    .iter()
                    .map(move |g| (g.state.id.clone(), d.direction.id, g.state.daily_budget_cents, g.state.is_active()))
            })
            .collect();
        for action in actions {
            match action {
                Action::UpdateAdGroupBudget {
                    adgroup_id,
                    new_budget_cents,
                    ..
                } => {
                    if let Some(g) = groups.iter_mut().find(|g| &g.0 == adgroup_id) {
                        g.2 = *new_budget_cents;
                    }
                }
                Action::PauseAdGroup { adgroup_id, .. } => {
                    if let Some(g) = groups.iter_mut().find(|g| &g.0 == adgroup_id) {
                        g.3 = false;
                    }
                }
                Action::CreateAdGroup {
                    direction_id,
                    daily_budget_cents,
                    ..
                }
                | Action::DuplicateAdGroup {
                    direction_id,
                    daily_budget_cents,
                    ..
                } => groups.push((String::new(), *direction_id, *daily_budget_cents, true)),
                Action::ActivateAdGroup {
                    direction_id,
                    daily_budget_cents,
                    ..
                } => groups.push((String::new(), *direction_id, daily_budget_cents.unwrap_or_default(), true)),
                Action::PauseAd { .. } => {}
            }
        }
        let mut totals = std::collections::BTreeMap::new();
        for (_, direction_id, budget, active) in groups {
            if active {
                *totals.entry(direction_id).or_insert(0) += budget;
            }
        }
        totals
    }

    const CLASSES: [(HealthClass, i32); 5] = [
        (HealthClass::Good, 60),
        (HealthClass::Neutral, 0),
        (HealthClass::SlightlyBad, -30),
        (HealthClass::Bad, -70),
        (HealthClass::NoData, 0),
    ];

    proptest::proptest! {
        #[test]
        fn rule_plans_keep_every_cap(
            groups in proptest::collection::vec(
                (0usize..2, 500i64..6_000, 0usize..5, 0.5f64..4.0, proptest::bool::ANY, proptest::bool::ANY),
                1..8,
            ),
            caps in (1_000i64..15_000, 1_000i64..15_000),
            account_cap in 1_000i64..25_000,
            creatives in (0usize..4, 0usize..4),
            tolerance in 0usize..3,
        ) {
            let mut directions = vec![direction_view(1, caps.0, Vec::new()), direction_view(2, caps.1, Vec::new())];
            for (i, (dir, budget, class, ratio, risky, new)) in groups.iter().enumerate() {
                let id = format!("g{i}");
                let (class, score) = CLASSES[*class];
                let mut g = adgroup_view(&id, *budget);
                g.health = health(&id, class, score, (class != HealthClass::NoData).then_some(*ratio));
                g.health.history.is_new = *new && i % 3 == 0;
                if *risky {
                    g.risk = Some(high_risk(&id));
                }
                directions[*dir].adgroups.push(g);
            }
            directions[0].ready_creatives = (0..creatives.0).map(|i| ready(&format!("a{i}"))).collect();
            directions[1].ready_creatives = (0..creatives.1).map(|i| ready(&format!("b{i}"))).collect();
            let mut input = planning_input(directions);
            input.account.daily_budget_cap_cents = account_cap;
            input.account.tolerance = [Tolerance::Conservative, Tolerance::Balanced, Tolerance::Aggressive][tolerance];

            let actions = planned(&input);
            let totals = active_after(&input, &actions);
            for dv in &input.directions {
                let total = totals.get(&dv.direction.id).copied().unwrap_or(0);
                proptest::prop_assert!(
                    total <= dv.direction.daily_budget_cents,
                    "direction {} at {} over cap {}: {:?}", dv.direction.id, total, dv.direction.daily_budget_cents, actions
                );
            }
            let account_total: i64 = totals.values().sum();
            proptest::prop_assert!(
                account_total <= account_cap,
                "account at {} over cap {}: {:?}", account_total, account_cap, actions
            );
        }
    }
}

//! Budget headroom bookkeeping and the pre-dispatch cap check.
//!
//! [`BudgetLedger`] tracks the projected active daily budget per direction
//! while a plan is being built. [`BudgetGuard`] replays a finished action list
//! against a fresh ledger and rejects anything that would push a direction or
//! the account over its cap. Reductions and pauses are replayed first so
//! that budget freed in the same plan can fund new spend.

use std::collections::{BTreeMap, HashMap};

use super::{Action, PlanningInput};
use crate::validator::RejectedAction;

#[derive(Debug, Clone)]
pub struct BudgetLedger {
    account_cap: i64,
    fixed_cents: i64,
    caps: BTreeMap<i64, i64>,
    totals: BTreeMap<i64, i64>,
}

impl BudgetLedger {
    pub fn from_input(input: &PlanningInput) -> Self {
        let mut caps = BTreeMap::new();
        let mut totals = BTreeMap::new();
        for d in &input.directions {
            caps.insert(d.direction.id, d.direction.daily_budget_cents);
            totals.insert(d.direction.id, d.active_budget_cents());
        }
        Self {
            account_cap: input.account.daily_budget_cap_cents,
            fixed_cents: input.unassigned_active_cents,
            caps,
            totals,
        }
    }

    pub fn direction_total(&self, direction_id: i64) -> i64 {
        self.totals.get(&direction_id).copied().unwrap_or(0)
    }

    pub fn direction_cap(&self, direction_id: i64) -> i64 {
        self.caps.get(&direction_id).copied().unwrap_or(0)
    }

    pub fn account_total(&self) -> i64 {
        self.fixed_cents + self.totals.values().sum::<i64>()
    }

    pub fn account_cap(&self) -> i64 {
        self.account_cap
    }

    /// Spend that can still be added to `direction_id` without breaching either cap.
    pub fn headroom(&self, direction_id: i64) -> i64 {
        if !self.caps.contains_key(&direction_id) {
            return 0;
        }
        let direction = self.direction_cap(direction_id) - self.direction_total(direction_id);
        let account = self.account_cap - self.account_total();
        direction.min(account).max(0)
    }

    pub fn fits(&self, direction_id: i64, amount_cents: i64) -> bool {
        amount_cents <= self.headroom(direction_id)
    }

    pub fn adjust(&mut self, direction_id: i64, delta_cents: i64) {
        *self.totals.entry(direction_id).or_insert(0) += delta_cents;
    }

    pub fn direction_excess(&self, direction_id: i64) -> i64 {
        (self.direction_total(direction_id) - self.direction_cap(direction_id)).max(0)
    }

    pub fn account_excess(&self) -> i64 {
        (self.account_total() - self.account_cap).max(0)
    }
}

#[derive(Debug, Clone)]
struct GroupState {
    direction_id: Option<i64>,
    budget_cents: i64,
    active: bool,
}

/// Final cap check applied to every validated plan, whichever planner produced it.
pub struct BudgetGuard {
    ledger: BudgetLedger,
    groups: HashMap<String, GroupState>,
}

impl BudgetGuard {
    pub fn new(input: &PlanningInput) -> Self {
        let mut groups = HashMap::new();
        for d in &input.directions {
            let owned = d.adgroups.iter().map(|g| &g.state).chain(d.pool.iter());
            for g in owned {
                groups.insert(
                    g.id.clone(),
                    GroupState {
                        direction_id: Some(d.direction.id),
                        budget_cents: g.daily_budget_cents,
                        active: g.is_active(),
                    },
                );
            }
        }
        Self {
            ledger: BudgetLedger::from_input(input),
            groups,
        }
    }

    /// Split `actions` into the ones that keep both caps and the rejected rest.
    /// Accepted actions keep their original order.
    pub fn check(&self, actions: Vec<Action>) -> (Vec<Action>, Vec<RejectedAction>) {
        let mut ledger = self.ledger.clone();
        let mut groups = self.groups.clone();
        let mut verdicts: Vec<Option<String>> = vec![None; actions.len()];

        let (freeing, adding): (Vec<usize>, Vec<usize>) =
            (0..actions.len()).partition(|i| !self.increases(&actions[*i]));

        for i in freeing.into_iter().chain(adding) {
            if let Err(reason) = Self::apply(&actions[i], &mut ledger, &mut groups) {
                verdicts[i] = Some(reason);
            }
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (action, verdict) in actions.into_iter().zip(verdicts) {
            match verdict {
                None => accepted.push(action),
                Some(reason) => rejected.push(RejectedAction {
                    action: action.to_raw(),
                    reason,
                }),
            }
        }
        (accepted, rejected)
    }

    fn increases(&self, action: &Action) -> bool {
        match action {
            Action::UpdateAdGroupBudget {
                adgroup_id,
                new_budget_cents,
                ..
            } => self
                .groups
                .get(adgroup_id)
                .map_or(true, |g| *new_budget_cents > g.budget_cents),
            Action::PauseAdGroup { .. } | Action::PauseAd { .. } => false,
            _ => action.adds_spend(),
        }
    }

    fn apply(
        action: &Action,
        ledger: &mut BudgetLedger,
        groups: &mut HashMap<String, GroupState>,
    ) -> Result<(), String> {
        let charge = |ledger: &mut BudgetLedger, direction_id: i64, delta: i64| -> Result<(), String> {
            if delta > 0 && !ledger.fits(direction_id, delta) {
                return Err(format!(
                    "would exceed budget caps: direction {direction_id} at {}/{} cents, account at {}/{} cents, adding {delta}",
                    ledger.direction_total(direction_id),
                    ledger.direction_cap(direction_id),
                    ledger.account_total(),
                    ledger.account_cap(),
                ));
            }
            ledger.adjust(direction_id, delta);
            Ok(())
        };

        match action {
            Action::UpdateAdGroupBudget {
                adgroup_id,
                new_budget_cents,
                ..
            } => {
                let Some(g) = groups.get_mut(adgroup_id) else {
                    return Err(format!("ad-group {adgroup_id} is not owned by any direction"));
                };
                if g.active {
                    match g.direction_id {
                        Some(d) => charge(ledger, d, new_budget_cents - g.budget_cents)?,
                        None => return Err(format!("ad-group {adgroup_id} is not owned by any direction")),
                    }
                }
                g.budget_cents = *new_budget_cents;
                Ok(())
            }
            Action::PauseAdGroup { adgroup_id, .. } => {
                if let Some(g) = groups.get_mut(adgroup_id) {
                    if g.active {
                        if let Some(d) = g.direction_id {
                            ledger.adjust(d, -g.budget_cents);
                        }
                        g.active = false;
                    }
                }
                Ok(())
            }
            Action::PauseAd { .. } => Ok(()),
            Action::ActivateAdGroup {
                adgroup_id,
                direction_id,
                daily_budget_cents,
                ..
            } => {
                let Some(g) = groups.get_mut(adgroup_id) else {
                    return Err(format!("ad-group {adgroup_id} is not in direction {direction_id}'s pool"));
                };
                if g.active {
                    return Err(format!("ad-group {adgroup_id} is already active"));
                }
                let budget = daily_budget_cents.unwrap_or(g.budget_cents);
                let owner = g.direction_id.unwrap_or(*direction_id);
                charge(ledger, owner, budget)?;
                g.budget_cents = budget;
                g.active = true;
                Ok(())
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
            } => charge(ledger, *direction_id, *daily_budget_cents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests_support::{adgroup_view, direction_view, planning_input};

    #[test]
    fn headroom_is_bounded_by_both_caps() {
        let d1 = direction_view(1, 5_000, vec![adgroup_view("g1", 4_000)]);
        let d2 = direction_view(2, 10_000, vec![adgroup_view("g2", 2_000)]);
        let mut input = planning_input(vec![d1, d2]);
        input.account.daily_budget_cap_cents = 7_000;
        let ledger = BudgetLedger::from_input(&input);
        assert_eq!(ledger.headroom(1), 1_000);
        assert_eq!(ledger.headroom(2), 1_000, "account cap leaves only 1000");
        assert_eq!(ledger.headroom(99), 0);
    }

    #[test]
    fn guard_counts_freed_budget_before_new_spend() {
        let d = direction_view(1, 5_000, vec![adgroup_view("g1", 4_500)]);
        let input = planning_input(vec![d]);
        let guard = BudgetGuard::new(&input);
        let create = Action::CreateAdGroup {
            direction_id: 1,
            campaign_id: "c1".into(),
            daily_budget_cents: 2_500,
            creative_ids: vec!["cr1".into()],
            reason: String::new(),
        };
        let reduce = Action::UpdateAdGroupBudget {
            adgroup_id: "g1".into(),
            direction_id: Some(1),
            new_budget_cents: 2_250,
            reason: String::new(),
        };
        let (ok, rejected) = guard.check(vec![create.clone(), reduce.clone()]);
        assert!(rejected.is_empty(), "{rejected:?}");
        assert_eq!(ok, vec![create, reduce], "original order kept");
    }

    #[test]
    fn guard_rejects_second_allocation() {
        let d = direction_view(1, 5_000, vec![adgroup_view("g1", 2_250)]);
        let input = planning_input(vec![d]);
        let guard = BudgetGuard::new(&input);
        let create = |c: &str| Action::CreateAdGroup {
            direction_id: 1,
            campaign_id: "c1".into(),
            daily_budget_cents: 2_500,
            creative_ids: vec![c.into()],
            reason: String::new(),
        };
        let (ok, rejected) = guard.check(vec![create("a"), create("b")]);
        assert_eq!(ok.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].reason.contains("would exceed"));
    }

    #[test]
    fn guard_rejects_increase_over_cap() {
        let d = direction_view(1, 5_000, vec![adgroup_view("g1", 4_000)]);
        let input = planning_input(vec![d]);
        let (_, rejected) = BudgetGuard::new(&input).check(vec![Action::UpdateAdGroupBudget {
            adgroup_id: "g1".into(),
            direction_id: Some(1),
            new_budget_cents: 6_000,
            reason: String::new(),
        }]);
        assert_eq!(rejected.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn guard_output_never_exceeds_caps(
            start in 0i64..6_000,
            update in proptest::option::of(0i64..8_000),
            creates in proptest::collection::vec(500i64..4_000, 0..5),
        ) {
            let d = direction_view(1, 6_000, vec![adgroup_view("g1", start)]);
            let input = planning_input(vec![d]);
            let guard = BudgetGuard::new(&input);
            let mut actions: Vec<Action> = update
                .map(|b| Action::UpdateAdGroupBudget {
                    adgroup_id: "g1".into(),
                    direction_id: Some(1),
                    new_budget_cents: b,
                    reason: String::new(),
                })
                .into_iter()
                .collect();
            actions.extend(creates.iter().map(|b| Action::CreateAdGroup {
                direction_id: 1,
                campaign_id: "c1".into(),
                daily_budget_cents: *b,
                creative_ids: vec!["cr".into()],
                reason: String::new(),
            }));

            let (ok, _) = guard.check(actions);
            let g1 = ok
                .iter()
                .find_map(|a| match a {
                    Action::UpdateAdGroupBudget { new_budget_cents, .. } => Some(*new_budget_cents),
                    _ => None,
                })
                .unwrap_or(start);
            let created: i64 = ok
                .iter()
                .filter_map(|a| match a {
                    Action::CreateAdGroup { daily_budget_cents, .. } => Some(*daily_budget_cents),
                    _ => None,
                })
                .sum();
            let cap = 6_000.min(input.account.daily_budget_cap_cents);
            proptest::prop_assert!(
                g1 + created <= cap,
                "g1 {} + created {} over cap {}", g1, created, cap
            );
        }
    }
}

//! Decision-matrix policy applied to every validated plan.
//!
//! The validator checks shape and the [`BudgetGuard`](super::BudgetGuard)
//! checks caps, but neither knows which ad-groups the matrix is allowed to
//! touch. [`PolicyGuard`] enforces that part regardless of which planner
//! produced the plan:
//!
//! | Action | Rejected when |
//! |--------|---------------|
//! | budget increase | ad-group is bad or slightly bad, new, without data, or in cooldown |
//! | budget decrease, pause | ad-group is new, without data, or in cooldown, and no cap is exceeded |
//! | pause ad | ad is in cooldown, or it is the last active ad of its ad-group |
//! | duplicate | source is in the duplicate cooldown or cooldown, new, or without data |
//!
//! Cap enforcement may trim or pause any ad-group, so a direction (or the
//! account) already over its cap lifts the cooldown, new and no-data
//! restrictions on decreases and pauses in that direction.

use std::collections::HashSet;

use super::budget::BudgetLedger;
use super::{Action, AdGroupView, PlanningInput};
use crate::health::HealthClass;
use crate::validator::RejectedAction;

pub struct PolicyGuard<'a> {
    input: &'a PlanningInput,
    over_cap: HashSet<i64>,
    account_over_cap: bool,
}

impl<'a> PolicyGuard<'a> {
    pub fn new(input: &'a PlanningInput) -> Self {
        let ledger = BudgetLedger::from_input(input);
        let over_cap = input
            .directions
            .iter()
            .map(|d| d.direction.id)
            .filter(|id| ledger.direction_excess(*id) > 0)
            .collect();
        Self {
            input,
            over_cap,
            account_over_cap: ledger.account_excess() > 0,
        }
    }

    /// Split `actions` into the ones the matrix allows and the rejected rest.
    /// Accepted actions keep their original order.
    pub fn check(&self, actions: Vec<Action>) -> (Vec<Action>, Vec<RejectedAction>) {
        let mut accepted = Vec::with_capacity(actions.len());
        let mut rejected = Vec::new();
        for action in actions {
            match self.verdict(&action) {
                None => accepted.push(action),
                Some(reason) => rejected.push(RejectedAction {
                    action: action.to_raw(),
                    reason,
                }),
            }
        }
        (accepted, rejected)
    }

    fn verdict(&self, action: &Action) -> Option<String> {
        match action {
            Action::UpdateAdGroupBudget {
                adgroup_id,
                new_budget_cents,
                ..
            } => {
                let (direction_id, g) = self.lookup(adgroup_id)?;
                if *new_budget_cents > g.state.daily_budget_cents {
                    if matches!(g.health.class, HealthClass::Bad | HealthClass::SlightlyBad) {
                        return Some(format!(
                            "budget increase on ad-group {adgroup_id} classed {}",
                            g.health.class.as_str()
                        ));
                    }
                    return self.restriction(adgroup_id, g);
                }
                self.restricted_unless_over_cap(direction_id, adgroup_id, g)
            }
            Action::PauseAdGroup { adgroup_id, .. } => {
                let (direction_id, g) = self.lookup(adgroup_id)?;
                self.restricted_unless_over_cap(direction_id, adgroup_id, g)
            }
            Action::PauseAd { ad_id, adgroup_id, .. } => {
                if self.input.cooldown.contains(ad_id) {
                    return Some(format!("ad {ad_id} acted on within cooldown"));
                }
                let (_, g) = self.lookup(adgroup_id)?;
                if g.active_ads < 2 {
                    return Some(format!("ad {ad_id} is the last active ad of ad-group {adgroup_id}"));
                }
                None
            }
            Action::DuplicateAdGroup { source_adgroup_id, .. } => {
                if self.input.duplicate_cooldown.contains(source_adgroup_id) {
                    return Some(format!(
                        "ad-group {source_adgroup_id} duplicated within duplicate cooldown"
                    ));
                }
                let (_, g) = self.lookup(source_adgroup_id)?;
                self.restriction(source_adgroup_id, g)
            }
            Action::ActivateAdGroup { .. } | Action::CreateAdGroup { .. } => None,
        }
    }

    /// Unknown ad-groups are the validator's concern.
    fn lookup(&self, adgroup_id: &str) -> Option<(i64, &'a AdGroupView)> {
        self.input.adgroup(adgroup_id).map(|(d, g)| (d.direction.id, g))
    }

    fn restricted_unless_over_cap(&self, direction_id: i64, adgroup_id: &str, g: &AdGroupView) -> Option<String> {
        if self.account_over_cap || self.over_cap.contains(&direction_id) {
            return None;
        }
        self.restriction(adgroup_id, g)
    }

    fn restriction(&self, adgroup_id: &str, g: &AdGroupView) -> Option<String> {
        if self.input.cooldown.contains(adgroup_id) {
            return Some(format!("ad-group {adgroup_id} acted on within cooldown"));
        }
        if g.health.history.is_new {
            return Some(format!("ad-group {adgroup_id} is still new"));
        }
        if !g.health.is_actionable() {
            return Some(format!("ad-group {adgroup_id} has no data"));
        }
        None
    }
}

//! # Planner: Health and Risk to an Action Plan
//!
//! Both planners implement [`Planner`] over the same [`PlanningInput`], so the
//! pipeline never branches on which one ran:
//!
//! - [`RulePlanner`]: the decision matrix, executed mechanically. Pure and
//!   deterministic; the reference for property tests.
//! - [`LlmPlanner`]: asks the LLM for a plan and falls back to the rule
//!   planner when the answer is missing or unusable.
//!
//! Planner output is untrusted either way. Actions leave the planner as raw
//! JSON values and only become typed [`Action`]s after the validator. Typed
//! actions then pass [`PolicyGuard`] (which ad-groups may be touched) and
//! [`BudgetGuard`] (caps) before dispatch.
//!
//! ## Action vocabulary
//!
//! | `type` | Target |
//! |--------|--------|
//! | `update_ad_group_budget` | existing ad-group |
//! | `pause_ad_group` | existing ad-group |
//! | `pause_ad` | one ad inside an ad-group |
//! | `activate_ad_group` | pre-provisioned (paused) ad-group |
//! | `create_ad_group` | new ad-group in the direction's campaign |
//! | `duplicate_ad_group` | copy of an ad-group with a swapped audience |

pub mod budget;
pub mod llm;
pub mod policy;
pub mod report;
pub mod rules;

pub use budget::{BudgetGuard, BudgetLedger};
pub use llm::LlmPlanner;
pub use policy::PolicyGuard;
pub use rules::RulePlanner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::creative::AdAnalysis;
use crate::health::HealthScore;
use crate::model::{Account, AdGroupState, Direction};
use crate::risk::{ReadyCreative, RiskScoreItem};

// ── Errors ──────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("account {0} has no active directions")]
    NoDirections(i64),

    #[error("direction {direction_id} has an unusable budget of {budget_cents} cents")]
    InvalidBudget { direction_id: i64, budget_cents: i64 },

    #[error("account {0} has a non-positive daily cap")]
    InvalidAccountCap(i64),
}

// ── Actions ─────────────────────────────────────────────────────

/// A validated, typed instruction for the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    UpdateAdGroupBudget {
        adgroup_id: String,
        #[serde(default)]
        direction_id: Option<i64>,
        new_budget_cents: i64,
        #[serde(default)]
        reason: String,
    },
    PauseAdGroup {
        adgroup_id: String,
        #[serde(default)]
        direction_id: Option<i64>,
        #[serde(default)]
        reason: String,
    },
    PauseAd {
        ad_id: String,
        adgroup_id: String,
        #[serde(default)]
        reason: String,
    },
    ActivateAdGroup {
        adgroup_id: String,
        direction_id: i64,
        #[serde(default)]
        daily_budget_cents: Option<i64>,
        creative_ids: Vec<String>,
        #[serde(default)]
        reason: String,
    },
    CreateAdGroup {
        direction_id: i64,
        campaign_id: String,
        daily_budget_cents: i64,
        creative_ids: Vec<String>,
        #[serde(default)]
        reason: String,
    },
    DuplicateAdGroup {
        source_adgroup_id: String,
        direction_id: i64,
        daily_budget_cents: i64,
        #[serde(default)]
        audience: Option<String>,
        #[serde(default)]
        reason: String,
    },
}

impl Action {
    pub const KINDS: [&'static str; 6] = [
        "update_ad_group_budget",
        "pause_ad_group",
        "pause_ad",
        "activate_ad_group",
        "create_ad_group",
        "duplicate_ad_group",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Action::UpdateAdGroupBudget { .. } => "update_ad_group_budget",
            Action::PauseAdGroup { .. } => "pause_ad_group",
            Action::PauseAd { .. } => "pause_ad",
            Action::ActivateAdGroup { .. } => "activate_ad_group",
            Action::CreateAdGroup { .. } => "create_ad_group",
            Action::DuplicateAdGroup { .. } => "duplicate_ad_group",
        }
    }

    /// Entity the action operates on, used for cooldowns and history.
    pub fn entity_id(&self) -> String {
        match self {
            Action::UpdateAdGroupBudget { adgroup_id, .. }
            | Action::PauseAdGroup { adgroup_id, .. }
            | Action::ActivateAdGroup { adgroup_id, .. } => adgroup_id.clone(),
            Action::PauseAd { ad_id, .. } => ad_id.clone(),
            Action::DuplicateAdGroup { source_adgroup_id, .. } => source_adgroup_id.clone(),
            Action::CreateAdGroup { direction_id, .. } => format!("direction:{direction_id}"),
        }
    }

    /// Conflict key: two actions with the same key cannot both run in one plan.
    pub fn conflict_key(&self) -> String {
        match self {
            Action::UpdateAdGroupBudget { adgroup_id, .. }
            | Action::PauseAdGroup { adgroup_id, .. }
            | Action::ActivateAdGroup { adgroup_id, .. } => format!("adgroup:{adgroup_id}"),
            Action::PauseAd { ad_id, .. } => format!("ad:{ad_id}"),
            Action::DuplicateAdGroup { source_adgroup_id, .. } => format!("duplicate:{source_adgroup_id}"),
            Action::CreateAdGroup {
                direction_id,
                creative_ids,
                ..
            } => format!("create:{direction_id}:{}", creative_ids.join(",")),
        }
    }

    pub fn direction_id(&self) -> Option<i64> {
        match self {
            Action::UpdateAdGroupBudget { direction_id, .. } | Action::PauseAdGroup { direction_id, .. } => {
                *direction_id
            }
            Action::PauseAd { .. } => None,
            Action::ActivateAdGroup { direction_id, .. }
            | Action::CreateAdGroup { direction_id, .. }
            | Action::DuplicateAdGroup { direction_id, .. } => Some(*direction_id),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Action::UpdateAdGroupBudget { reason, .. }
            | Action::PauseAdGroup { reason, .. }
            | Action::PauseAd { reason, .. }
            | Action::ActivateAdGroup { reason, .. }
            | Action::CreateAdGroup { reason, .. }
            | Action::DuplicateAdGroup { reason, .. } => reason,
        }
    }

    /// True for actions that bring new spend online.
    pub fn adds_spend(&self) -> bool {
        matches!(
            self,
            Action::ActivateAdGroup { .. } | Action::CreateAdGroup { .. } | Action::DuplicateAdGroup { .. }
        )
    }

    pub fn to_raw(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// One-line description for reports.
    pub fn describe(&self) -> String {
        let cents = |c: i64| format!("{:.2}", c as f64 / 100.0);
        match self {
            Action::UpdateAdGroupBudget {
                adgroup_id,
                new_budget_cents,
                ..
            } => format!("set ad-group {adgroup_id} budget to {}", cents(*new_budget_cents)),
            Action::PauseAdGroup { adgroup_id, .. } => format!("pause ad-group {adgroup_id}"),
            Action::PauseAd { ad_id, adgroup_id, .. } => format!("pause ad {ad_id} in ad-group {adgroup_id}"),
            Action::ActivateAdGroup {
                adgroup_id,
                daily_budget_cents,
                creative_ids,
                ..
            } => format!(
                "activate ad-group {adgroup_id}{} with {} creative(s)",
                daily_budget_cents.map(|b| format!(" at {}", cents(b))).unwrap_or_default(),
                creative_ids.len()
            ),
            Action::CreateAdGroup {
                daily_budget_cents,
                creative_ids,
                ..
            } => format!(
                "create ad-group at {} with {} creative(s)",
                cents(*daily_budget_cents),
                creative_ids.len()
            ),
            Action::DuplicateAdGroup {
                source_adgroup_id,
                daily_budget_cents,
                ..
            } => format!(
                "duplicate ad-group {source_adgroup_id} with a new audience at {}",
                cents(*daily_budget_cents)
            ),
        }
    }
}

// ── Plan ────────────────────────────────────────────────────────

/// The planner's output for one account and one run. Actions are raw until validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionPlan {
    pub plan_note: String,
    pub actions: Vec<serde_json::Value>,
    pub report_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Rules,
    Llm,
}

impl PlanSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanSource::Rules => "rules",
            PlanSource::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerOutput {
    pub plan: ActionPlan,
    pub source: PlanSource,
    /// Set when an LLM plan was requested but the rules produced this one.
    pub fallback_reason: Option<String>,
    /// The LLM call itself failed after retries, as opposed to answering with
    /// something unusable.
    pub provider_failed: bool,
}

// ── Input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AdGroupView {
    pub state: AdGroupState,
    pub health: HealthScore,
    pub risk: Option<RiskScoreItem>,
    pub ads: Vec<AdAnalysis>,
    pub active_ads: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectionView {
    pub direction: Direction,
    /// Ad-groups owned by the direction, active or not, excluding the pool.
    pub adgroups: Vec<AdGroupView>,
    /// Paused pre-provisioned ad-groups available for activation.
    pub pool: Vec<AdGroupState>,
    pub ready_creatives: Vec<ReadyCreative>,
}

impl DirectionView {
    pub fn active_budget_cents(&self) -> i64 {
        self.adgroups
            .iter()
            .filter(|g| g.state.is_active())
            .map(|g| g.state.daily_budget_cents)
            .sum()
    }
}

/// Everything a planner may look at for one account.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningInput {
    pub account: Account,
    pub directions: Vec<DirectionView>,
    /// Active budget of ad-groups that no direction owns. Counts against the account cap.
    pub unassigned_active_cents: i64,
    /// Entities acted on within the cooldown window.
    pub cooldown: HashSet<String>,
    /// Source ad-groups duplicated within the duplicate cooldown window.
    pub duplicate_cooldown: HashSet<String>,
    pub recommendations: Vec<String>,
    pub degraded: bool,
    pub now: DateTime<Utc>,
}

impl PlanningInput {
    pub fn direction(&self, id: i64) -> Option<&DirectionView> {
        self.directions.iter().find(|d| d.direction.id == id)
    }

    pub fn adgroup(&self, id: &str) -> Option<(&DirectionView, &AdGroupView)> {
        self.directions
            .iter()
            .find_map(|d| d.adgroups.iter().find(|g| g.state.id == id).map(|g| (d, g)))
    }

    pub fn check(&self) -> Result<(), PlanError> {
        if self.account.daily_budget_cap_cents <= 0 {
            return Err(PlanError::InvalidAccountCap(self.account.id));
        }
        if self.directions.is_empty() {
            return Err(PlanError::NoDirections(self.account.id));
        }
        for d in &self.directions {
            if d.direction.daily_budget_cents <= 0 {
                return Err(PlanError::InvalidBudget {
                    direction_id: d.direction.id,
                    budget_cents: d.direction.daily_budget_cents,
                });
            }
        }
        Ok(())
    }
}

// ── Strategy ────────────────────────────────────────────────────

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn plan(&self, input: &PlanningInput) -> Result<PlannerOutput, PlanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_serialize_with_type_tag() {
        let a = Action::PauseAd {
            ad_id: "ad1".into(),
            adgroup_id: "g1".into(),
            reason: "eater".into(),
        };
        let raw = a.to_raw();
        assert_eq!(raw["type"], "pause_ad");
        let back: Action = serde_json::from_value(raw).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn conflict_keys_group_adgroup_actions() {
        let budget = Action::UpdateAdGroupBudget {
            adgroup_id: "g1".into(),
            direction_id: Some(1),
            new_budget_cents: 1_000,
            reason: String::new(),
        };
        let pause = Action::PauseAdGroup {
            adgroup_id: "g1".into(),
            direction_id: Some(1),
            reason: String::new(),
        };
        let dup = Action::DuplicateAdGroup {
            source_adgroup_id: "g1".into(),
            direction_id: 1,
            daily_budget_cents: 1_000,
            audience: None,
            reason: String::new(),
        };
        assert_eq!(budget.conflict_key(), pause.conflict_key());
        assert_ne!(budget.conflict_key(), dup.conflict_key());
        assert_eq!(dup.entity_id(), "g1");
    }

    #[test]
    fn every_kind_is_listed() {
        for k in Action::KINDS {
            assert!(k.contains('_'));
        }
        assert_eq!(Action::KINDS.len(), 6);
    }
}

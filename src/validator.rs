//! # Validator: Raw Plan to Typed Actions
//!
//! Every action, whichever planner produced it, passes through
//! [`Validator::validate`] before it can reach the dispatcher. Each action is
//! judged on its own; a malformed one is dropped with a reason and never
//! sinks the rest of the plan.
//!
//! ## Checks, in order
//!
//! 1. `type` is on the allow-list.
//! 2. Required fields are present for the type. Ids may arrive as strings or
//!    numbers; numbers may arrive as numeric strings.
//! 3. Budgets are clamped into `[min_budget_cents, max_budget_cents]` and
//!    creative lists into `[1, max_creatives_per_batch]`. Clamping is
//!    recorded as an adjustment, not a rejection.
//! 4. Referenced ad-groups, ads and directions exist in the account.
//! 5. A second action on the same target is a conflict and is dropped.
//! 6. Actions beyond `max_actions_per_plan` are dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::model::{AccountStructure, Direction};
use crate::planner::Action;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub allowed_actions: Vec<String>,
    pub min_budget_cents: i64,
    pub max_budget_cents: i64,
    pub max_creatives_per_batch: usize,
    pub max_actions_per_plan: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_actions: Action::KINDS.iter().map(|k| k.to_string()).collect(),
            min_budget_cents: 500,
            max_budget_cents: 500_000,
            max_creatives_per_batch: 5,
            max_actions_per_plan: 20,
        }
    }
}

/// An action the validator or budget guard refused, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAction {
    pub action: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationOutcome {
    pub actions: Vec<Action>,
    pub rejected: Vec<RejectedAction>,
    /// Coercions applied to accepted actions.
    pub adjustments: Vec<String>,
}

/// Entity ids an action may reference.
#[derive(Debug, Clone, Default)]
pub struct KnownEntities {
    pub adgroups: HashSet<String>,
    pub ads: HashSet<String>,
    pub directions: HashSet<i64>,
}

impl KnownEntities {
    pub fn new(structure: &AccountStructure, directions: &[Direction]) -> Self {
        Self {
            adgroups: structure.adgroups.iter().map(|g| g.id.clone()).collect(),
            ads: structure.ads.iter().map(|a| a.id.clone()).collect(),
            directions: directions.iter().map(|d| d.id).collect(),
        }
    }
}

pub struct Validator {
    config: ValidatorConfig,
}

type Fields<'a> = &'a Map<String, Value>;

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, raw: &[Value], known: &KnownEntities) -> ValidationOutcome {
        let mut out = ValidationOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for value in raw {
            let mut adjustments = Vec::new();
            let verdict = self
                .parse(value, &mut adjustments)
                .and_then(|action| self.check_refs(&action, known).map(|_| action));
            let reason = match verdict {
                Ok(action) if !seen.insert(action.conflict_key()) => {
                    format!("conflicts with an earlier action on {}", action.conflict_key())
                }
                Ok(_) if out.actions.len() >= self.config.max_actions_per_plan => format!(
                    "plan exceeds {} actions",
                    self.config.max_actions_per_plan
                ),
                Ok(action) => {
                    out.adjustments.extend(adjustments);
                    out.actions.push(action);
                    continue;
                }
                Err(reason) => reason,
            };
            warn!(reason = %reason, action = %value, "action rejected");
            out.rejected.push(RejectedAction {
                action: value.clone(),
                reason,
            });
        }
        out
    }

    fn parse(&self, value: &Value, adjustments: &mut Vec<String>) -> Result<Action, String> {
        let obj = value.as_object().ok_or("action is not an object")?;
        let kind = obj
            .get("type")
            .or_else(|| obj.get("action"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
            .ok_or("missing action type")?;
        if !self.config.allowed_actions.iter().any(|a| a == &kind) {
            return Err(format!("action type {kind} not allowed"));
        }
        let reason = text(obj, &["reason"]).unwrap_or_default();

        let action = match kind.as_str() {
            "update_ad_group_budget" => {
                let adgroup_id = require_id(obj, ADGROUP_KEYS, "adgroup_id")?;
                let budget = require_number(obj, BUDGET_KEYS, "new_budget_cents")?;
                Action::UpdateAdGroupBudget {
                    new_budget_cents: self.clamp_budget(&adgroup_id, budget, adjustments),
                    adgroup_id,
                    direction_id: integer(obj, DIRECTION_KEYS),
                    reason,
                }
            }
            "pause_ad_group" => Action::PauseAdGroup {
                adgroup_id: require_id(obj, ADGROUP_KEYS, "adgroup_id")?,
                direction_id: integer(obj, DIRECTION_KEYS),
                reason,
            },
            "pause_ad" => Action::PauseAd {
                ad_id: require_id(obj, &["ad_id", "id"], "ad_id")?,
                adgroup_id: require_id(obj, ADGROUP_KEYS, "adgroup_id")?,
                reason,
            },
            "activate_ad_group" => {
                let adgroup_id = require_id(obj, ADGROUP_KEYS, "adgroup_id")?;
                let direction_id = integer(obj, DIRECTION_KEYS).ok_or("missing direction_id")?;
                let creative_ids = self.creatives(obj, adjustments)?;
                let budget = number(obj, BUDGET_KEYS).map(|b| self.clamp_budget(&adgroup_id, b, adjustments));
                Action::ActivateAdGroup {
                    adgroup_id,
                    direction_id,
                    daily_budget_cents: budget,
                    creative_ids,
                    reason,
                }
            }
            "create_ad_group" => {
                let direction_id = integer(obj, DIRECTION_KEYS).ok_or("missing direction_id")?;
                let campaign_id = require_id(obj, &["campaign_id"], "campaign_id")?;
                let budget = require_number(obj, BUDGET_KEYS, "daily_budget_cents")?;
                let creative_ids = self.creatives(obj, adjustments)?;
                Action::CreateAdGroup {
                    daily_budget_cents: self.clamp_budget("new ad-group", budget, adjustments),
                    direction_id,
                    campaign_id,
                    creative_ids,
                    reason,
                }
            }
            "duplicate_ad_group" => {
                let source = require_id(obj, &["source_adgroup_id", "adgroup_id", "source_id"], "source_adgroup_id")?;
                let direction_id = integer(obj, DIRECTION_KEYS).ok_or("missing direction_id")?;
                let budget = require_number(obj, BUDGET_KEYS, "daily_budget_cents")?;
                Action::DuplicateAdGroup {
                    daily_budget_cents: self.clamp_budget(&format!("duplicate of {source}"), budget, adjustments),
                    source_adgroup_id: source,
                    direction_id,
                    audience: text(obj, &["audience"]),
                    reason,
                }
            }
            other => return Err(format!("action type {other} has no schema")),
        };
        Ok(action)
    }

    fn clamp_budget(&self, target: &str, cents: i64, adjustments: &mut Vec<String>) -> i64 {
        let clamped = cents.clamp(self.config.min_budget_cents, self.config.max_budget_cents);
        if clamped != cents {
            adjustments.push(format!("{target}: budget {cents} clamped to {clamped} cents"));
        }
        clamped
    }

    fn creatives(&self, obj: Fields<'_>, adjustments: &mut Vec<String>) -> Result<Vec<String>, String> {
        let mut ids: Vec<String> = match obj.get("creative_ids").or_else(|| obj.get("creatives")) {
            Some(Value::Array(items)) => items.iter().filter_map(id_of).collect(),
            Some(single) => id_of(single).into_iter().collect(),
            None => Vec::new(),
        };
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        if ids.is_empty() {
            return Err("at least one creative id is required".to_string());
        }
        let max = self.config.max_creatives_per_batch.max(1);
        if ids.len() > max {
            adjustments.push(format!("creative list truncated from {} to {max}", ids.len()));
            ids.truncate(max);
        }
        Ok(ids)
    }

    fn check_refs(&self, action: &Action, known: &KnownEntities) -> Result<(), String> {
        let adgroup = |id: &str| {
            if known.adgroups.contains(id) {
                Ok(())
            } else {
                Err(format!("unknown ad-group {id}"))
            }
        };
        let direction = |id: i64| {
            if known.directions.contains(&id) {
                Ok(())
            } else {
                Err(format!("unknown direction {id}"))
            }
        };
        match action {
            Action::UpdateAdGroupBudget { adgroup_id, .. } | Action::PauseAdGroup { adgroup_id, .. } => {
                adgroup(adgroup_id)
            }
            Action::PauseAd { ad_id, adgroup_id, .. } => {
                adgroup(adgroup_id)?;
                if known.ads.contains(ad_id) {
                    Ok(())
                } else {
                    Err(format!("unknown ad {ad_id}"))
                }
            }
            Action::ActivateAdGroup {
                adgroup_id,
                direction_id,
                ..
            } => {
                adgroup(adgroup_id)?;
                direction(*direction_id)
            }
            Action::CreateAdGroup { direction_id, .. } => direction(*direction_id),
            Action::DuplicateAdGroup {
                source_adgroup_id,
                direction_id,
                ..
            } => {
                adgroup(source_adgroup_id)?;
                direction(*direction_id)
            }
        }
    }
}

// ── Field coercion ──────────────────────────────────────────────

const ADGROUP_KEYS: &[&str] = &["adgroup_id", "ad_group_id", "adset_id"];
const DIRECTION_KEYS: &[&str] = &["direction_id"];
const BUDGET_KEYS: &[&str] = &["new_budget_cents", "daily_budget_cents", "budget_cents"];

fn id_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lookup<'a>(obj: Fields<'a>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn text(obj: Fields<'_>, keys: &[&str]) -> Option<String> {
    lookup(obj, keys).and_then(id_of)
}

fn require_id(obj: Fields<'_>, keys: &[&str], name: &str) -> Result<String, String> {
    text(obj, keys).ok_or_else(|| format!("missing {name}"))
}

/// Whole cents from a number or numeric string. Fractions round to nearest.
fn number(obj: Fields<'_>, keys: &[&str]) -> Option<i64> {
    let f = match lookup(obj, keys)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace('_', "").parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then(|| f.round() as i64)
}

fn require_number(obj: Fields<'_>, keys: &[&str], name: &str) -> Result<i64, String> {
    match lookup(obj, keys) {
        None => Err(format!("missing {name}")),
        Some(_) => number(obj, keys).ok_or_else(|| format!("{name} is not a number")),
    }
}

fn integer(obj: Fields<'_>, keys: &[&str]) -> Option<i64> {
    number(obj, keys)
}

//! LLM-backed planner with a deterministic fallback.
//!
//! The model sees the same [`PlanningInput`] the rules see, summarised as
//! JSON, and answers with `{plan_note, actions, report_text}`. Anything else
//! (transport failure after retries, empty text, no JSON object, no `actions`
//! array) hands the input to the [`RulePlanner`] unchanged, so the fallback
//! plan is exactly what the rules alone would have produced.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::report::plan_report;
use super::rules::{typed_actions, RulePlanner};
use super::{Action, ActionPlan, PlanError, PlanSource, Planner, PlannerOutput, PlanningInput};
use crate::llm::{extract_json, LlmClient, LlmPrompt};
use crate::retry::{with_retry, RetryPolicy};

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    rules: RulePlanner,
    retry: RetryPolicy,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, rules: RulePlanner, retry: RetryPolicy) -> Self {
        Self { llm, rules, retry }
    }

    fn prompt(&self, input: &PlanningInput) -> LlmPrompt {
        let cfg = self.rules.config();
        let directions: Vec<Value> = input
            .directions
            .iter()
            .map(|dv| {
                json!({
                    "direction_id": dv.direction.id,
                    "name": dv.direction.name,
                    "daily_budget_cents": dv.direction.daily_budget_cents,
                    "active_budget_cents": dv.active_budget_cents(),
                    "target_cpl_cents": dv.direction.target_cpl_cents,
                    "campaign_id": dv.direction.platform_campaign_id,
                    "pre_provisioned": dv.pool.iter().map(|g| &g.id).collect::<Vec<_>>(),
                    "ready_creatives": dv.ready_creatives.iter().map(|c| &c.creative_id).collect::<Vec<_>>(),
                    "adgroups": dv.adgroups.iter().map(|g| json!({
                        "adgroup_id": g.state.id,
                        "status": g.state.status,
                        "daily_budget_cents": g.state.daily_budget_cents,
                        "health_score": g.health.score,
                        "health_class": g.health.class,
                        "cpl_ratio": g.health.decision_ratio(),
                        "trend": g.health.trend,
                        "data_sufficient": g.health.data_sufficient,
                        "is_new": g.health.history.is_new,
                        "on_cooldown": input.cooldown.contains(&g.state.id),
                        "risk_level": g.risk.as_ref().map(|r| r.risk_level),
                        "ads": g.ads.iter().map(|a| json!({
                            "ad_id": a.ad_id,
                            "spend_share": a.spend_share,
                            "cpl_ratio": a.decision_ratio(),
                        })).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        let user = json!({
            "account": {
                "account_id": input.account.id,
                "daily_budget_cap_cents": input.account.daily_budget_cap_cents,
                "tolerance": input.account.tolerance,
                "adgroup_mode": input.account.adgroup_mode,
            },
            "directions": directions,
            "risk_recommendations": input.recommendations,
            "degraded_data": input.degraded,
        });

        LlmPrompt {
            system: format!(
                "You optimise paid advertising budgets. Rules: never increase the budget of a bad ad-group; \
                 pause an ad that takes at least {share:.0}% of its ad-group's spend at {eater:.1}x target CPL or worse; \
                 reduce bad ad-groups at {bad:.1}x target CPL or worse by about {step:.0}%; \
                 leave ad-groups on cooldown or younger than 48 hours untouched; \
                 keep the active budget of every direction within its daily budget; \
                 fund at most {new} new ad-group(s) per direction with ready creatives. \
                 Allowed action types: {kinds}. \
                 Reply with one JSON object only: \
                 {{\"plan_note\":\"...\",\"actions\":[{{\"type\":\"...\",...}}],\"report_text\":\"...\"}}",
                share = cfg.eater_share * 100.0,
                eater = cfg.eater_cpl_ratio,
                bad = cfg.bad_cpl_multiplier,
                step = cfg.reduce_step * 100.0,
                new = cfg.max_new_adgroups_per_direction,
                kinds = Action::KINDS.join(", "),
            ),
            user: user.to_string(),
        }
    }

    fn fallback(
        &self,
        input: &PlanningInput,
        reason: String,
        provider_failed: bool,
    ) -> Result<PlannerOutput, PlanError> {
        warn!(
            account_id = input.account.id,
            reason = %reason,
            provider_failed,
            "LLM plan unusable, falling back to rules"
        );
        Ok(PlannerOutput {
            plan: self.rules.build(input)?,
            source: PlanSource::Rules,
            fallback_reason: Some(reason),
            provider_failed,
        })
    }
}

/// Parse model text into a raw plan. Actions stay untyped for the validator.
pub fn parse_plan(text: &str) -> Result<ActionPlan, String> {
    if text.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let value = extract_json(text).ok_or_else(|| "no JSON object in response".to_string())?;
    let actions = value
        .get("actions")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| "response has no actions array".to_string())?;
    let text_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    Ok(ActionPlan {
        plan_note: text_field("plan_note"),
        actions,
        report_text: text_field("report_text"),
    })
}

#[async_trait]
impl Planner for LlmPlanner {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn plan(&self, input: &PlanningInput) -> Result<PlannerOutput, PlanError> {
        input.check()?;
        let prompt = self.prompt(input);
        let text = match with_retry(&self.retry, "llm.plan", || self.llm.complete(&prompt)).await {
            Ok(text) => text,
            Err(e) => return self.fallback(input, e.to_string(), true),
        };
        let mut plan = match parse_plan(&text) {
            Ok(plan) => plan,
            Err(reason) => return self.fallback(input, reason, false),
        };
        if plan.report_text.is_empty() {
            plan.report_text = plan_report(input, &typed_actions(&plan), &[]);
        }
        if plan.plan_note.is_empty() {
            plan.plan_note = format!("llm: {} proposed action(s)", plan.actions.len());
        }
        info!(account_id = input.account.id, actions = plan.actions.len(), "LLM plan received");
        Ok(PlannerOutput {
            plan,
            source: PlanSource::Llm,
            fallback_reason: None,
            provider_failed: false,
        })
    }
}

//! Plain-text reports: the planner's per-direction summary and the final
//! per-account report sent to the notifier.
//!
//! The account report is the audit trail. It always states degraded or
//! missing data, whether the plan fell back to rules, what the validator or
//! budget guard rejected, and how each dispatched action ended.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

use super::{Action, PlanSource, PlanningInput};
use crate::collector::MissingWindow;
use crate::creative::TagSummary;
use crate::dispatcher::{ExecutionResult, ExecutionStatus};
use crate::health::HealthClass;
use crate::model::Account;
use crate::validator::RejectedAction;

fn money(cents: i64) -> String {
    format!("{:.2}", cents as f64 / 100.0)
}

/// Planner summary grouped by direction.
pub fn plan_report(input: &PlanningInput, actions: &[Action], notes: &[String]) -> String {
    let mut by_direction: BTreeMap<Option<i64>, Vec<&Action>> = BTreeMap::new();
    for a in actions {
        let direction = a.direction_id().or_else(|| match a {
            Action::PauseAd { adgroup_id, .. } => input.adgroup(adgroup_id).map(|(d, _)| d.direction.id),
            _ => None,
        });
        by_direction.entry(direction).or_default().push(a);
    }

    let mut out = String::new();
    for dv in &input.directions {
        let d = &dv.direction;
        let _ = writeln!(
            out,
            "[{}] budget {} / active {} / target CPL {}",
            d.name,
            money(d.daily_budget_cents),
            money(dv.active_budget_cents()),
            money(d.target_cpl_cents)
        );
        match by_direction.remove(&Some(d.id)) {
            Some(list) => {
                for a in list {
                    let _ = writeln!(out, "  - {}: {}", a.describe(), a.reason());
                }
            }
            None => {
                let _ = writeln!(out, "  - no changes");
            }
        }
    }
    for (_, list) in by_direction {
        let _ = writeln!(out, "[unassigned]");
        for a in list {
            let _ = writeln!(out, "  - {}: {}", a.describe(), a.reason());
        }
    }
    if !notes.is_empty() {
        let _ = writeln!(out, "Notes:");
        for n in notes {
            let _ = writeln!(out, "  - {n}");
        }
    }
    out
}

/// Everything that goes into the final account report.
pub struct ReportContext<'a> {
    pub account: &'a Account,
    pub run_id: Uuid,
    pub dry_run: bool,
    pub missing: &'a [MissingWindow],
    pub no_data_adgroups: Vec<String>,
    pub distribution: Vec<(HealthClass, usize)>,
    pub source: PlanSource,
    pub fallback_reason: Option<&'a str>,
    pub plan_text: &'a str,
    pub recommendations: &'a [String],
    pub adjustments: &'a [String],
    pub rejected: &'a [RejectedAction],
    pub results: &'a [ExecutionResult],
    pub dispatch_note: Option<String>,
    pub tags: &'a [TagSummary],
}

pub fn account_report(ctx: &ReportContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Account {} ({}), run {}{}",
        ctx.account.name,
        ctx.account.id,
        ctx.run_id,
        if ctx.dry_run { " [dry run]" } else { "" }
    );

    if ctx.missing.is_empty() {
        let _ = writeln!(out, "Data: complete");
    } else {
        let _ = writeln!(out, "Data: DEGRADED, {} window(s) unavailable", ctx.missing.len());
        for m in ctx.missing {
            let _ = writeln!(out, "  - {} {}: {}", m.level.as_str(), m.window.as_str(), m.error);
        }
    }
    if !ctx.no_data_adgroups.is_empty() {
        let _ = writeln!(out, "Ad-groups without data: {}", ctx.no_data_adgroups.join(", "));
    }
    if !ctx.distribution.is_empty() {
        let parts: Vec<String> = ctx
            .distribution
            .iter()
            .map(|(class, n)| format!("{} {n}", class.as_str()))
            .collect();
        let _ = writeln!(out, "Health: {}", parts.join(", "));
    }

    match ctx.fallback_reason {
        Some(reason) => {
            let _ = writeln!(out, "Planner: deterministic rules (LLM fallback: {reason})");
        }
        None => {
            let _ = writeln!(out, "Planner: {}", ctx.source.as_str());
        }
    }
    out.push_str(ctx.plan_text);
    if !ctx.plan_text.ends_with('\n') && !ctx.plan_text.is_empty() {
        out.push('\n');
    }

    if !ctx.recommendations.is_empty() {
        let _ = writeln!(out, "Risk outlook:");
        for r in ctx.recommendations {
            let _ = writeln!(out, "  - {r}");
        }
    }
    if !ctx.tags.is_empty() {
        let _ = writeln!(out, "Creative tags (yesterday):");
        for t in ctx.tags.iter().take(5) {
            let cpl = t.cpl_cents.map(|c| money(c.round() as i64)).unwrap_or_else(|| "n/a".into());
            let _ = writeln!(
                out,
                "  - {}: {} ad(s), spend {}, {} lead(s), CPL {cpl}",
                t.tag,
                t.ads,
                money(t.spend_cents),
                t.leads
            );
        }
    }
    if !ctx.adjustments.is_empty() {
        let _ = writeln!(out, "Validator adjustments:");
        for a in ctx.adjustments {
            let _ = writeln!(out, "  - {a}");
        }
    }
    if ctx.rejected.is_empty() {
        let _ = writeln!(out, "Rejected actions: none");
    } else {
        let _ = writeln!(out, "Rejected actions: {}", ctx.rejected.len());
        for r in ctx.rejected {
            let kind = r.action.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
            let _ = writeln!(out, "  - {kind}: {}", r.reason);
        }
    }

    if let Some(note) = &ctx.dispatch_note {
        let _ = writeln!(out, "Execution: {note}");
    }
    if !ctx.results.is_empty() {
        let count = |s: ExecutionStatus| ctx.results.iter().filter(|r| r.status == s).count();
        let _ = writeln!(
            out,
            "Execution results: {} succeeded, {} failed, {} skipped",
            count(ExecutionStatus::Success),
            count(ExecutionStatus::Failed),
            count(ExecutionStatus::Skipped)
        );
        for r in ctx.results.iter().filter(|r| r.status != ExecutionStatus::Success) {
            let _ = writeln!(
                out,
                "  - {} {}: {}",
                r.status.as_str(),
                r.action.describe(),
                r.message.as_deref().unwrap_or("")
            );
        }
    }
    out
}

/// Report for an account that was skipped before anything was dispatched.
pub fn no_action_report(account: &Account, run_id: Uuid, reason: &str) -> String {
    format!(
        "Account {} ({}), run {run_id}\nNo action taken: {reason}\n",
        account.name, account.id
    )
}

//! # Pipeline: One Account, Start to Report
//!
//! ```text
//! collect ─► score (health, creatives, risk) ─► plan ─► validate ─► guard ─► dispatch ─► report
//!    │                                            │
//!    └── structure unavailable ──► no action      └── planner error ──► no action
//! ```
//!
//! Stages run strictly in this order with no fan-out. Each stage runs inside
//! an `info_span!` carrying `account_id`, `run_id` and `stage`.
//!
//! Every run ends with a report delivered to the notifier and an
//! [`AccountRun`] record, whether or not anything was dispatched. A failed
//! notification is logged and does not change the run's status.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::{AdPlatform, Collector, MetricsBundle};
use crate::config::EngineConfig;
use crate::creative::{analyze_ads, summarize_by_tag, AdAnalysis};
use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, ExecutionResult, ExecutionStatus, Executor};
use crate::health::{class_distribution, median_cpm, score_adgroup, HealthClass, HealthInput, HealthScore, HistoryFlags};
use crate::llm::LlmClient;
use crate::model::{Account, ActionHistoryEntry, BudgetAuditRecord, Direction};
use crate::notify::{Notification, Notifier};
use crate::planner::report::{account_report, no_action_report, ReportContext};
use crate::planner::{
    Action, AdGroupView, BudgetGuard, DirectionView, LlmPlanner, Planner, PlannerOutput, PlanningInput, PolicyGuard,
    RulePlanner,
};
use crate::prom_metrics::Metrics;
use crate::risk::{RiskAgent, RiskAssessment, RiskContext};
use crate::store::{AccountRun, RunStatus, Store};
use crate::validator::{KnownEntities, RejectedAction, Validator};

/// External collaborators the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub platform: Arc<dyn AdPlatform>,
    pub executor: Arc<dyn Executor>,
    /// `None` disables the LLM planner and the risk advisory.
    pub llm: Option<Arc<dyn LlmClient>>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<Metrics>,
}

/// What one account run produced.
#[derive(Debug, Clone, Serialize)]
pub struct AccountOutcome {
    pub run: AccountRun,
    pub actions: Vec<Action>,
    pub rejected: Vec<RejectedAction>,
    pub results: Vec<ExecutionResult>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    collector: Collector,
    risk: RiskAgent,
    planner: Box<dyn Planner>,
    validator: Validator,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: Collaborators) -> Self {
        let rules = RulePlanner::new(config.planner.clone());
        let llm = deps.llm.filter(|_| config.llm.enabled);
        let planner: Box<dyn Planner> = match &llm {
            Some(client) => Box::new(LlmPlanner::new(client.clone(), rules, config.llm.retry.clone())),
            None => Box::new(rules),
        };
        info!(planner = planner.name(), "engine configured");
        Self {
            collector: Collector::new(deps.platform, config.collector.retry.clone()),
            risk: RiskAgent::new(llm, config.llm.retry.clone(), config.risk.clone()),
            planner,
            validator: Validator::new(config.validator.clone()),
            dispatcher: Dispatcher::new(deps.store.clone(), deps.executor, config.dispatcher.clone()),
            store: deps.store,
            notifier: deps.notifier,
            metrics: deps.metrics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Load the account and run it. Unknown ids are an error.
    pub async fn run_account_by_id(&self, account_id: i64, dry_run: bool) -> Result<AccountOutcome> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .with_context(|| format!("account {account_id} not found"))?;
        self.run_account(&account, dry_run, Utc::now()).await
    }

    pub async fn run_account(&self, account: &Account, dry_run: bool, now: DateTime<Utc>) -> Result<AccountOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("account_run", account_id = account.id, run_id = %run_id, dry_run);
        self.run_inner(account, dry_run, now, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        account: &Account,
        dry_run: bool,
        now: DateTime<Utc>,
        run_id: Uuid,
    ) -> Result<AccountOutcome> {
        let started_at = Utc::now();
        let directions: Vec<Direction> = self
            .store
            .list_directions(account.id)
            .await?
            .into_iter()
            .filter(|d| d.active)
            .collect();
        let creatives = self.store.list_creatives(account.id).await?;

        // ── collect ──
        let bundle = match self
            .collector
            .collect(account, now)
            .instrument(info_span!("stage", stage = "collect"))
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                self.metrics.provider_failure("platform");
                warn!(account_id = account.id, error = %e, "account structure unavailable");
                let reason = format!("account structure unavailable ({e})");
                return self.finish_without_action(account, run_id, dry_run, started_at, &reason).await;
            }
        };
        for _ in &bundle.missing {
            self.metrics.provider_failure("platform");
        }
        if bundle.adgroup_data_unavailable() {
            let reason = "no ad-group metrics could be fetched for any window";
            return self.finish_without_action(account, run_id, dry_run, started_at, reason).await;
        }

        // ── score ──
        let audit = self
            .store
            .budget_audit_since(account.id, now - Duration::days(self.config.scheduler.audit_lookback_days))
            .await?;
        let owners = bundle.structure.assign_directions(&directions);
        let target_for = |adgroup_id: &str| {
            owners
                .get(adgroup_id)
                .and_then(|id| directions.iter().find(|d| d.id == *id))
                .map(|d| d.target_cpl_cents)
                .unwrap_or(account.target_cpl_cents)
        };

        let scores = {
            let _g = info_span!("stage", stage = "health").entered();
            self.score_health(&bundle, &audit, &target_for, now)
        };
        let analyses = {
            let _g = info_span!("stage", stage = "creative").entered();
            analyze_ads(&bundle, &target_for, &self.config.creative)
        };
        let assessment = self
            .risk
            .assess(&RiskContext {
                bundle: &bundle,
                directions: &directions,
                owners: &owners,
                creatives: &creatives,
                audit: &audit,
                account_overrides: account.risk_overrides.as_ref(),
                now,
            })
            .instrument(info_span!("stage", stage = "risk"))
            .await;

        // ── plan ──
        let history = self.store.recent_actions(account.id, now - self.history_window()).await?;
        let input = build_input(PlanningParts {
            account,
            directions: &directions,
            bundle: &bundle,
            owners: &owners,
            scores: &scores,
            analyses: &analyses,
            assessment: &assessment,
            history: &history,
            cooldown_hours: self.config.planner.cooldown_hours,
            duplicate_cooldown_hours: self.config.planner.duplicate_cooldown_hours,
            now,
        });
        let output: PlannerOutput = match self
            .planner
            .plan(&input)
            .instrument(info_span!("stage", stage = "plan"))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(account_id = account.id, error = %e, "planner produced no usable plan");
                let reason = format!("planner error ({e})");
                return self.finish_without_action(account, run_id, dry_run, started_at, &reason).await;
            }
        };
        if output.fallback_reason.is_some() {
            self.metrics.planner_fallbacks.inc();
        }
        if output.provider_failed {
            self.metrics.provider_failure("llm");
        }

        // ── validate + guard ──
        let (actions, rejected, adjustments) = {
            let _g = info_span!("stage", stage = "validate").entered();
            let known = KnownEntities::new(&bundle.structure, &directions);
            let outcome = self.validator.validate(&output.plan.actions, &known);
            let (allowed, policy_rejected) = PolicyGuard::new(&input).check(outcome.actions);
            let (accepted, guard_rejected) = BudgetGuard::new(&input).check(allowed);
            let mut rejected = outcome.rejected;
            rejected.extend(policy_rejected);
            rejected.extend(guard_rejected);
            (accepted, rejected, outcome.adjustments)
        };
        self.metrics.validator_rejections.inc_by(rejected.len() as u64);
        for r in &rejected {
            info!(account_id = account.id, reason = %r.reason, "action rejected");
        }

        // ── dispatch ──
        let dispatched = self
            .dispatcher
            .dispatch(&DispatchRequest {
                account,
                local_date: bundle.local_date,
                run_id,
                actions: &actions,
                structure: &bundle.structure,
                dry_run,
                now,
            })
            .instrument(info_span!("stage", stage = "dispatch"))
            .await;
        let (outcome, dispatch_error) = match dispatched {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "dispatch aborted");
                self.metrics.provider_failure("executor");
                (None, Some(e.to_string()))
            }
        };
        let results: Vec<ExecutionResult> = outcome.as_ref().map(|o| o.results().to_vec()).unwrap_or_default();
        if matches!(outcome, Some(DispatchOutcome::Dispatched { .. })) {
            for r in &results {
                self.metrics.action(r.action.kind(), r.status.as_str());
            }
        }

        // ── report ──
        let mut all_scores: Vec<HealthScore> = scores.into_values().collect();
        all_scores.sort_by(|a, b| a.adgroup_id.cmp(&b.adgroup_id));
        if let Err(e) = self.store.save_health_snapshot(account.id, run_id, &all_scores).await {
            warn!(account_id = account.id, error = %e, "health snapshot not saved");
        }
        let mut no_data: Vec<String> = all_scores
            .iter()
            .filter(|s| s.class == HealthClass::NoData)
            .filter(|s| bundle.structure.adgroup(&s.adgroup_id).is_some_and(|g| g.is_active()))
            .map(|s| s.adgroup_id.clone())
            .collect();
        no_data.sort();
        let tags = summarize_by_tag(&analyses);
        let dispatch_note = match (&outcome, &dispatch_error) {
            (_, Some(e)) => Some(format!("dispatch failed: {e}")),
            (Some(o), None) => Some(o.note()),
            (None, None) => None,
        };
        let text = account_report(&ReportContext {
            account,
            run_id,
            dry_run,
            missing: &bundle.missing,
            no_data_adgroups: no_data,
            distribution: class_distribution(&all_scores),
            source: output.source,
            fallback_reason: output.fallback_reason.as_deref(),
            plan_text: &output.plan.report_text,
            recommendations: &assessment.recommendations,
            adjustments: &adjustments,
            rejected: &rejected,
            results: &results,
            dispatch_note,
            tags: &tags,
        });

        let status = match (&outcome, &dispatch_error) {
            (_, Some(_)) => RunStatus::Failed,
            (Some(DispatchOutcome::DryRun { .. }), _) => RunStatus::DryRun,
            (Some(DispatchOutcome::Duplicate { .. }), _) => RunStatus::Duplicate,
            _ => RunStatus::Completed,
        };
        let count = |s: ExecutionStatus| results.iter().filter(|r| r.status == s).count() as i32;
        let run = AccountRun {
            id: run_id,
            account_id: account.id,
            status,
            dry_run,
            plan_source: Some(output.source.as_str().to_string()),
            fallback: output.fallback_reason.is_some(),
            planned: output.plan.actions.len() as i32,
            dispatched: count(ExecutionStatus::Success),
            failed: count(ExecutionStatus::Failed),
            rejected: rejected.len() as i32,
            idempotency_key: outcome.as_ref().and_then(|o| o.key()).map(str::to_string),
            report: text,
            started_at,
            finished_at: Utc::now(),
        };
        self.finish(account, &run).await?;
        Ok(AccountOutcome {
            run,
            actions,
            rejected,
            results,
        })
    }

    fn history_window(&self) -> Duration {
        Duration::hours(
            self.config
                .planner
                .cooldown_hours
                .max(self.config.planner.duplicate_cooldown_hours),
        )
    }

    fn score_health(
        &self,
        bundle: &MetricsBundle,
        audit: &[BudgetAuditRecord],
        target_for: &impl Fn(&str) -> i64,
        now: DateTime<Utc>,
    ) -> HashMap<String, HealthScore> {
        let median = median_cpm(&bundle.adgroups);
        bundle
            .structure
            .adgroups
            .iter()
            .map(|g| {
                let score = score_adgroup(
                    &HealthInput {
                        adgroup: g,
                        metrics: bundle.adgroup(&g.id),
                        target_cpl_cents: target_for(&g.id),
                        history: HistoryFlags::from_audit(g, audit, now, &self.config.health),
                        median_cpm_cents: median,
                    },
                    &self.config.health,
                );
                (g.id.clone(), score)
            })
            .collect()
    }

    async fn finish_without_action(
        &self,
        account: &Account,
        run_id: Uuid,
        dry_run: bool,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<AccountOutcome> {
        let run = AccountRun {
            id: run_id,
            account_id: account.id,
            status: RunStatus::NoAction,
            dry_run,
            plan_source: None,
            fallback: false,
            planned: 0,
            dispatched: 0,
            failed: 0,
            rejected: 0,
            idempotency_key: None,
            report: no_action_report(account, run_id, reason),
            started_at,
            finished_at: Utc::now(),
        };
        self.finish(account, &run).await?;
        Ok(AccountOutcome {
            run,
            actions: Vec::new(),
            rejected: Vec::new(),
            results: Vec::new(),
        })
    }

    /// Record the run, then deliver the report.
    async fn finish(&self, account: &Account, run: &AccountRun) -> Result<()> {
        self.store.insert_run(run).await?;
        self.metrics.account_run(run.status.as_str());
        let notification = Notification {
            account_id: account.id,
            account_name: account.name.clone(),
            run_id: run.id,
            text: run.report.clone(),
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            self.metrics.provider_failure("notifier");
            warn!(account_id = account.id, run_id = %run.id, error = %e, "report not delivered");
        }
        info!(
            account_id = account.id,
            status = run.status.as_str(),
            dispatched = run.dispatched,
            failed = run.failed,
            rejected = run.rejected,
            "account run finished"
        );
        Ok(())
    }
}

// ── Planning input ──────────────────────────────────────────────

/// Borrowed pieces the planning input is assembled from.
pub struct PlanningParts<'a> {
    pub account: &'a Account,
    pub directions: &'a [Direction],
    pub bundle: &'a MetricsBundle,
    pub owners: &'a HashMap<String, i64>,
    pub scores: &'a HashMap<String, HealthScore>,
    pub analyses: &'a [AdAnalysis],
    pub assessment: &'a RiskAssessment,
    pub history: &'a [ActionHistoryEntry],
    pub cooldown_hours: i64,
    pub duplicate_cooldown_hours: i64,
    pub now: DateTime<Utc>,
}

/// Group scored ad-groups by owning direction and derive cooldown sets.
///
/// Paused pre-provisioned ad-groups form the direction's activation pool
/// instead of appearing as owned ad-groups.
pub fn build_input(p: PlanningParts<'_>) -> PlanningInput {
    let structure = &p.bundle.structure;
    let cooldown_cutoff = p.now - Duration::hours(p.cooldown_hours);
    let duplicate_cutoff = p.now - Duration::hours(p.duplicate_cooldown_hours);
    let cooldown: HashSet<String> = p
        .history
        .iter()
        .filter(|h| h.executed_at >= cooldown_cutoff)
        .map(|h| h.entity_id.clone())
        .collect();
    let duplicate_cooldown: HashSet<String> = p
        .history
        .iter()
        .filter(|h| h.action_type == "duplicate_ad_group" && h.executed_at >= duplicate_cutoff)
        .map(|h| h.entity_id.clone())
        .collect();

    let directions = p
        .directions
        .iter()
        .map(|d| {
            let in_pool = |id: &str| d.pre_provisioned.iter().any(|x| x == id);
            let pool = structure
                .adgroups
                .iter()
                .filter(|g| in_pool(&g.id) && !g.is_active())
                .cloned()
                .collect();
            let adgroups = structure
                .adgroups
                .iter()
                .filter(|g| p.owners.get(&g.id) == Some(&d.id))
                .filter(|g| !(in_pool(&g.id) && !g.is_active()))
                .filter_map(|g| {
                    let health = p.scores.get(&g.id)?.clone();
                    Some(AdGroupView {
                        state: g.clone(),
                        health,
                        risk: p.assessment.item(&g.id).cloned(),
                        ads: p.analyses.iter().filter(|a| a.adgroup_id == g.id).cloned().collect(),
                        active_ads: structure.active_ads_in(&g.id).count(),
                    })
                })
                .collect();
            let ready_creatives = p
                .assessment
                .ready_creatives
                .iter()
                .filter(|c| c.direction_id.map_or(true, |id| id == d.id))
                .cloned()
                .collect();
            DirectionView {
                direction: d.clone(),
                adgroups,
                pool,
                ready_creatives,
            }
        })
        .collect();

    let unassigned_active_cents = structure
        .adgroups
        .iter()
        .filter(|g| g.is_active() && !p.owners.contains_key(&g.id))
        .map(|g| g.daily_budget_cents)
        .sum();

    PlanningInput {
        account: p.account.clone(),
        directions,
        unassigned_active_cents,
        cooldown,
        duplicate_cooldown,
        recommendations: p.assessment.recommendations.clone(),
        degraded: p.bundle.is_degraded(),
        now: p.now,
    }
}

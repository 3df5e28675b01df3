//! # Prometheus Metrics: Engine Counters for Scraping
//!
//! Exposes adpilot operational metrics in the Prometheus text exposition
//! format.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `adpilot_account_runs_total` | Counter | `status` | Account pipeline runs |
//! | `adpilot_actions_total` | Counter | `kind`, `status` | Actions by outcome |
//! | `adpilot_planner_fallbacks_total` | Counter | none | LLM plans replaced by rules |
//! | `adpilot_validator_rejections_total` | Counter | none | Actions dropped before dispatch |
//! | `adpilot_provider_failures_total` | Counter | `provider` | Collaborator calls that failed after retries |
//! | `adpilot_lock_contention_total` | Counter | none | Batch starts skipped because the lock was held |
//! | `adpilot_batch_running` | Gauge | none | 1 while this instance runs a batch |
//! | `adpilot_http_request_duration_seconds` | Histogram | `method`, `path`, `status` | HTTP latency |
//!
//! The `/metrics` endpoint renders the registry on each scrape.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ActionLabels {
    pub kind: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ProviderLabel {
    pub provider: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub path: String,
    pub status: u16,
}

/// Thread-safe metrics registry. Every field is atomic and safe to update
/// from any task.
pub struct Metrics {
    pub registry: Registry,
    pub account_runs: Family<StatusLabel, Counter>,
    pub actions: Family<ActionLabels, Counter>,
    pub planner_fallbacks: Counter,
    pub validator_rejections: Counter,
    pub provider_failures: Family<ProviderLabel, Counter>,
    pub lock_contention: Counter,
    pub batch_running: Gauge,
    pub http_duration: Family<HttpLabels, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let account_runs = Family::<StatusLabel, Counter>::default();
        registry.register("adpilot_account_runs", "Account pipeline runs by status", account_runs.clone());

        let actions = Family::<ActionLabels, Counter>::default();
        registry.register("adpilot_actions", "Actions by kind and execution status", actions.clone());

        let planner_fallbacks = Counter::default();
        registry.register(
            "adpilot_planner_fallbacks",
            "LLM plans replaced by the deterministic planner",
            planner_fallbacks.clone(),
        );

        let validator_rejections = Counter::default();
        registry.register(
            "adpilot_validator_rejections",
            "Actions rejected by the validator or budget guard",
            validator_rejections.clone(),
        );

        let provider_failures = Family::<ProviderLabel, Counter>::default();
        registry.register(
            "adpilot_provider_failures",
            "External calls that failed after retries",
            provider_failures.clone(),
        );

        let lock_contention = Counter::default();
        registry.register(
            "adpilot_lock_contention",
            "Batch starts skipped because another instance held the lock",
            lock_contention.clone(),
        );

        let batch_running = Gauge::default();
        registry.register("adpilot_batch_running", "1 while a batch is running", batch_running.clone());

        let http_duration =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| Histogram::new(exponential_buckets(0.005, 2.0, 14)));
        registry.register(
            "adpilot_http_request_duration_seconds",
            "HTTP request latency",
            http_duration.clone(),
        );

        Self {
            registry,
            account_runs,
            actions,
            planner_fallbacks,
            validator_rejections,
            provider_failures,
            lock_contention,
            batch_running,
            http_duration,
        }
    }

    pub fn provider_failure(&self, provider: &str) {
        self.provider_failures
            .get_or_create(&ProviderLabel {
                provider: provider.to_string(),
            })
            .inc();
    }

    pub fn action(&self, kind: &str, status: &str) {
        self.actions
            .get_or_create(&ActionLabels {
                kind: kind.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn account_run(&self, status: &str) {
        self.account_runs
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if encode(&mut buf, &self.registry).is_err() {
            buf.clear();
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

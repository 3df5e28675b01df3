//! # adpilot: Daily Ad Campaign Decision Engine
//!
//! Once a day, for every active ad account: collect windowed performance
//! metrics, score ad-group health and creative quality, assess short-horizon
//! risk, plan budget and structure changes, validate them against hard
//! constraints, and execute them idempotently through the ad platform.
//!
//! | Module | Stage |
//! |--------|-------|
//! | [`collector`] | Metrics for five windows at ad-group and ad level |
//! | [`health`], [`creative`], [`risk`] | Scoring |
//! | [`planner`] | Rule-based and LLM planners, budget guard, reports |
//! | [`validator`] | Structural checks and clamping of planned actions |
//! | [`dispatcher`] | Idempotent execution, budget audit trail |
//! | [`pipeline`] | One account end to end |
//! | [`scheduler`] | Daily batch under a persisted lock |
//!
//! Collaborators sit behind traits: [`collector::AdPlatform`],
//! [`dispatcher::Executor`], [`llm::LlmClient`], [`notify::Notifier`] and
//! [`store::Store`].

pub mod collector;
pub mod config;
pub mod creative;
pub mod dashboard;
pub mod db;
pub mod dispatcher;
pub mod health;
pub mod llm;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod planner;
pub mod platform;
pub mod prom_metrics;
pub mod retry;
pub mod risk;
pub mod scheduler;
pub mod store;
pub mod validator;

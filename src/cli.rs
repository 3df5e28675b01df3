//! Subcommand bodies: wire the configured collaborators into an [`Engine`]
//! and hand control to it.

use anyhow::{Context, Result};
use adpilot::config::EngineConfig;
use adpilot::dashboard::{self, AppState};
use adpilot::db::Database;
use adpilot::llm::{HttpLlmClient, LlmClient};
use adpilot::notify;
use adpilot::pipeline::{Collaborators, Engine};
use adpilot::platform::HttpAdPlatform;
use adpilot::prom_metrics::Metrics;
use adpilot::scheduler::{BatchOutcome, BatchScheduler};
use std::sync::Arc;
use tracing::{info, warn};

use super::Cli;

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => EngineConfig::parse_toml_file(path)
            .with_context(|| format!("invalid config {}", path.display())),
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn build_engine(cli: &Cli) -> Result<Engine> {
    let config = load_config(cli)?;
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;
    let database = Database::connect(database_url).await?;
    database.migrate().await?;

    let platform = Arc::new(HttpAdPlatform::new(
        &config.platform,
        cli.platform_token.clone(),
    )?);
    let llm: Option<Arc<dyn LlmClient>> = if config.llm.enabled {
        if cli.llm_api_key.is_none() {
            warn!("llm enabled without LLM_API_KEY; requests go out unauthenticated");
        }
        Some(Arc::new(HttpLlmClient::new(
            &config.llm,
            cli.llm_api_key.clone(),
        )?))
    } else {
        None
    };
    let notifier = notify::from_config(&config.notify)?;

    info!(
        llm = config.llm.enabled,
        platform = %config.platform.base_url,
        "engine configured"
    );
    Ok(Engine::new(
        config,
        Collaborators {
            store: Arc::new(database),
            platform: platform.clone(),
            executor: platform,
            llm,
            notifier,
            metrics: Arc::new(Metrics::new()),
        },
    ))
}

pub fn check_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let rendered = toml::to_string_pretty(&config)?;
    println!("{rendered}");
    eprintln!("config ok");
    Ok(())
}

pub async fn serve(
    cli: &Cli,
    port: u16,
    admin_token: Option<String>,
    no_schedule: bool,
) -> Result<()> {
    let engine = Arc::new(build_engine(cli).await?);
    let scheduler = Arc::new(BatchScheduler::new(engine.clone()));

    // Held for the lifetime of the server; dropping it stops the jobs.
    let _cron = if engine.config().scheduler.enabled && !no_schedule {
        Some(scheduler.clone().start_cron().await?)
    } else {
        info!("batch schedule disabled");
        None
    };

    let state = AppState::new(scheduler, admin_token);
    dashboard::run(port, state).await
}

pub async fn run_account(cli: &Cli, account_id: i64, dry_run: bool) -> Result<()> {
    let engine = build_engine(cli).await?;
    let outcome = engine.run_account_by_id(account_id, dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

pub async fn run_batch(cli: &Cli, dry_run: bool) -> Result<()> {
    let engine = Arc::new(build_engine(cli).await?);
    let scheduler = BatchScheduler::new(engine);
    let outcome = scheduler.run_batch(dry_run).await?;
    if let BatchOutcome::AlreadyRunning { holder } = &outcome {
        eprintln!(
            "batch already running on {}",
            holder.as_deref().unwrap_or("another instance")
        );
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

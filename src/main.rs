//! # Main: CLI Entry Point
//!
//! Routes subcommands to the engine. Shared concerns handled here: `.env`
//! loading, structured logging and the tokio runtime.
//!
//! ## Subcommands
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `serve` | HTTP trigger surface plus the daily cron batch |
//! | `run-account <id>` | One account, printed as JSON |
//! | `run-batch` | Every active account once, printed as JSON |
//! | `check-config` | Parse and validate the engine config, print the effective values |
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection.
//! - `--config` / `ADPILOT_CONFIG`: engine TOML file (defaults when absent).
//! - `--llm-api-key` / `LLM_API_KEY`, `--platform-token` / `PLATFORM_API_TOKEN`.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "adpilot", about = "Daily ad campaign optimization engine", version)]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long, env = "ADPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// API key for the LLM provider
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Ad platform token used for accounts without their own
    #[arg(long, env = "PLATFORM_API_TOKEN", hide_env_values = true)]
    platform_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the daily batch schedule
    Serve {
        #[arg(long, env = "ADPILOT_PORT", default_value_t = 8090)]
        port: u16,
        /// Bearer token for admin routes; unset means development mode
        #[arg(long, env = "ADPILOT_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: Option<String>,
        /// Do not register the cron job even if the config enables it
        #[arg(long)]
        no_schedule: bool,
    },
    /// Run the pipeline for one account
    RunAccount {
        account_id: i64,
        /// Plan and validate without executing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Run every active account once under the batch lock
    RunBatch {
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration file and print the effective config
    CheckConfig,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for K8s, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::CheckConfig => cli::check_config(&cli),
        Commands::Serve {
            port,
            admin_token,
            no_schedule,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::serve(&cli, *port, admin_token.clone(), *no_schedule))
        }
        Commands::RunAccount {
            account_id,
            dry_run,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_account(&cli, *account_id, *dry_run))
        }
        Commands::RunBatch { dry_run } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_batch(&cli, *dry_run))
        }
    }
}

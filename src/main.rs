//! # Relaycast: Bulk WhatsApp Template Campaigns
//!
//! Runs the campaign scheduler and the status webhook gateway, or performs
//! one-off operations against the campaign database.
//!
//! Usage:
//!   relaycast serve                      # Scheduler loop + webhook gateway
//!   relaycast tick                       # One due/retry pass, then exit
//!   relaycast retry <campaign-id>        # Manual retry (ignores cooldown)
//!   relaycast dispatch <campaign-id>     # Send a draft/scheduled campaign now
//!   relaycast status <campaign-id>       # Print campaign counters

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaycast_channels::WhatsAppTransport;
use relaycast_core::RelayConfig;
use relaycast_core::traits::CampaignStore;
use relaycast_gateway::AppState;
use relaycast_scheduler::{CampaignDb, CampaignScheduler, StatusReconciler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "relaycast",
    version,
    about = "📣 Relaycast: bulk WhatsApp template campaigns with delivery tracking"
)]
struct Cli {
    /// Config file (default: ~/.relaycast/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the database path from config
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop and the webhook gateway
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one due-campaign pass and one auto-retry pass, then exit
    Tick,
    /// Retry failed recipients of a campaign now, ignoring the cooldown
    Retry { campaign_id: String },
    /// Send a draft or scheduled campaign immediately
    Dispatch { campaign_id: String },
    /// Show a campaign's status and counters
    Status { campaign_id: String },
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).to_string());
            RelayConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => RelayConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    Ok(config)
}

fn open_store(config: &RelayConfig) -> Result<Arc<dyn CampaignStore>> {
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = CampaignDb::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    tracing::debug!("Campaign database: {}", db_path.display());
    Ok(Arc::new(db))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "relaycast=debug,relaycast_scheduler=debug,relaycast_gateway=debug,tower_http=debug"
    } else {
        "relaycast=info,relaycast_scheduler=info,relaycast_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let store = open_store(&config)?;
    let transport = Arc::new(WhatsAppTransport::new(config.whatsapp.clone()));
    let scheduler = CampaignScheduler::new(store.clone(), transport, &config.scheduler);

    match cli.command {
        Command::Serve { port } => {
            let mut gateway = config.gateway.clone();
            if let Some(port) = port {
                gateway.port = port;
            }

            let state = AppState {
                whatsapp: config.whatsapp.clone(),
                scheduler: scheduler.clone(),
                reconciler: Arc::new(StatusReconciler::new(
                    store.clone(),
                    config.scheduler.retry_conflict_attempts,
                )),
                start_time: std::time::Instant::now(),
            };
            if config.whatsapp.app_secret.is_empty() {
                tracing::warn!("⚠️ whatsapp.app_secret not set; webhook signatures are not checked");
            }

            scheduler.start();
            tokio::select! {
                result = relaycast_gateway::start(&gateway, state) => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
            }
            scheduler.stop();
        }
        Command::Tick => {
            let summary = scheduler.tick().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Retry { campaign_id } => {
            let outcome = scheduler.trigger_manual_retry(&campaign_id).await?;
            println!("🔁 Retry for {campaign_id}:");
            println!("   Succeeded: {}", outcome.success);
            println!("   Failed:    {}", outcome.failed);
            println!("   At cap:    {}", outcome.skipped);
        }
        Command::Dispatch { campaign_id } => {
            let outcome = scheduler.dispatch_now(&campaign_id).await?;
            println!("📤 Dispatched {campaign_id}: {} sent, {} failed", outcome.sent, outcome.failed);
        }
        Command::Status { campaign_id } => {
            let campaign = store
                .get_campaign(&campaign_id)
                .await?
                .with_context(|| format!("campaign {campaign_id} not found"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "id": campaign.id,
                    "status": campaign.status,
                    "template": campaign.template_name,
                    "counters": campaign.counters,
                    "started_at": campaign.started_at,
                    "completed_at": campaign.completed_at,
                }))?
            );
        }
    }

    Ok(())
}

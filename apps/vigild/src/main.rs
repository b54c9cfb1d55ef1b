mod config;
mod handler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use handler::ControllerHandler;
use tracing::info;
use vigil_channel_telegram::{TelegramBot, TelegramBotConfig};
use vigil_core::MonitorService;
use vigil_relay::{HttpAgentClient, RelayConfig};
use vigil_storage::JsonRegistryStore;

#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "vigild: server metrics over a chat channel")]
struct Cli {
    #[arg(long, default_value = "vigild.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller against the Telegram Bot API.
    Serve,
    /// Write a starter config file.
    Init {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => run_init(&cli.config, force),
        Commands::Serve => run_serve(&cli.config).await,
    }
}

const STARTER_CONFIG: &str = r#"registry_path = "registry.json"

[telegram]
bot_token_env = "TELEGRAM_BOT_TOKEN"
polling_timeout_seconds = 30
# allowed_chat_ids = [123456789]

[agent]
port = 5000
request_timeout_seconds = 10
"#;

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    println!("Wrote {}.", path.display());
    println!("Set TELEGRAM_BOT_TOKEN and run: vigild serve");
    Ok(())
}

async fn run_serve(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let token = std::env::var(&config.telegram.bot_token_env).with_context(|| {
        format!(
            "bot token environment variable {} is not set",
            config.telegram.bot_token_env
        )
    })?;

    let store = Arc::new(JsonRegistryStore::new(&config.registry_path));
    let agent = Arc::new(HttpAgentClient::new(RelayConfig {
        agent_port: config.agent.port,
        request_timeout: Duration::from_secs(config.agent.request_timeout_seconds),
    })?);
    let service = MonitorService::new(store, agent);
    let handler = Arc::new(ControllerHandler::new(service, config.agent.port));

    let bot = TelegramBot::new(TelegramBotConfig {
        token,
        polling_timeout_seconds: config.telegram.polling_timeout_seconds.unwrap_or(30),
        allowed_chat_ids: config.telegram.allowed_chat_ids.clone(),
    })?;

    info!(
        registry = %config.registry_path,
        agent_port = config.agent.port,
        "vigild starting"
    );
    bot.run_until_shutdown(handler).await
}

mod collect;
mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use routes::AppState;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "vigil-agent")]
#[command(about = "vigil-agent: authenticated host metrics endpoint")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "AGENT_LISTEN", default_value = "0.0.0.0:5000")]
    listen: String,
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

    // The secret is issued by the controller at registration time and handed
    // to this process through the environment only.
    let secret = std::env::var("SECRET_KEY")
        .ok()
        .filter(|value| !value.trim().is_empty());
    if secret.is_none() {
        // Still serves, but answers every request with the configuration
        // error until restarted with a key.
        warn!("SECRET_KEY is not set; all requests will be rejected");
    }

    let app = routes::build_router(AppState::new(secret));
    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;

    info!(listen = %cli.listen, "vigil-agent starting");
    axum::serve(listener, app)
        .await
        .context("agent server terminated")?;
    Ok(())
}

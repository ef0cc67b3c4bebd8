use anyhow::Context as _;
use clap::Parser;
use serenity::http::Http;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil::config::Config;
use vigil::debounce::DebounceManager;
use vigil::llm::{LlmManager, LlmPipeline};
use vigil::messaging::discord::{self, DiscordTransport};
use vigil::router::MessageRouter;
use vigil::watch::{WatchManager, spawn_stale_sweep};
use vigil::WatchDeps;

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Conversation-watching Discord bot")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "vigil=debug,info" } else { "vigil=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load().context("failed to load configuration")?;

    let llm = Arc::new(LlmManager::new(&config.llm)?);
    let pipeline = Arc::new(LlmPipeline::new(
        llm,
        config.llm.evaluation_model.clone(),
        config.llm.response_model.clone(),
    ));

    let http = Arc::new(Http::new(&config.discord.token));
    let identity = discord::fetch_identity(&http)
        .await
        .context("failed to fetch bot identity")?;
    tracing::info!(bot_name = %identity.bot_name, bot_id = %identity.bot_id, "starting up");

    let transport = Arc::new(DiscordTransport::new(http, identity.clone()));
    let manager = Arc::new(WatchManager::new());

    let deps = WatchDeps {
        manager: manager.clone(),
        pipeline,
        transport,
        identity,
        config: config.watch,
    };

    let sweeper = spawn_stale_sweep(
        manager.clone(),
        Duration::from_secs(config.watch.sweep_interval_secs),
    );

    let debounce = DebounceManager::new(config.debounce);
    let router = MessageRouter::new(deps, debounce.clone());
    debounce.set_handler(router.clone());
    let idle_sweeper = vigil::debounce::spawn_idle_sweep(
        debounce.clone(),
        Duration::from_secs(config.watch.sweep_interval_secs),
    );

    let gateway = tokio::spawn(discord::run_gateway(config.discord.token.clone(), router));

    tokio::select! {
        result = gateway => {
            match result {
                Ok(Ok(())) => tracing::warn!("gateway exited cleanly"),
                Ok(Err(error)) => tracing::error!(%error, "gateway exited with error"),
                Err(error) => tracing::error!(%error, "gateway task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    sweeper.abort();
    idle_sweeper.abort();
    manager.shutdown().await;
    debounce.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

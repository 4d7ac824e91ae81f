//! Chat server binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tavernkeep::cache::NpcActivationCache;
use tavernkeep::config::ChatConfig;
use tavernkeep::ingress::ChatService;
use tavernkeep::orchestrator::{AiOrchestrator, NpcResponder};
use tavernkeep::permissions::AllowAll;
use tavernkeep::provider::build_provider;
use tavernkeep::queue::ResponseJobQueue;
use tavernkeep::roll::PassthroughRollEngine;
use tavernkeep::server::{AppState, ChatServer};
use tavernkeep::store::SqliteStore;
use tavernkeep::stream::StreamBroker;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tavernkeep: real-time tabletop-RPG session chat with AI-driven NPCs.
#[derive(Parser)]
#[command(name = "tavernkeep", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to info-level logs for this crate; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tavernkeep=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => ChatConfig::load(path)?,
        None => ChatConfig::load_from_env()?,
    };

    let store = Arc::new(match config.server.database_path {
        Some(ref path) => SqliteStore::open(path)?,
        None => {
            info!("no database path configured; using in-memory storage");
            SqliteStore::open_in_memory()?
        }
    });

    let broker = Arc::new(StreamBroker::new(config.stream.clone()));
    let queue = Arc::new(ResponseJobQueue::new(config.queue.clone()));
    let cache = Arc::new(NpcActivationCache::new(store.clone(), config.cache.ttl()));
    let provider = build_provider(&config.provider);

    let chat = Arc::new(ChatService::new(
        store.clone(),
        broker.clone(),
        queue.clone(),
        cache.clone(),
        Arc::new(PassthroughRollEngine),
        config.ingress.clone(),
        config.orchestrator.context_window,
    ));
    let orchestrator = Arc::new(AiOrchestrator::new(
        provider,
        store.clone(),
        config.orchestrator.clone(),
    ));
    let responder = Arc::new(NpcResponder::new(
        orchestrator.clone(),
        chat.clone(),
        cache.clone(),
    ));
    queue.spawn_workers(responder, cache);

    let shutdown = CancellationToken::new();
    let ingress_maintenance = chat.spawn_maintenance(shutdown.clone());
    let broker_maintenance = broker.spawn_maintenance(shutdown.clone());

    let state = AppState {
        chat,
        store,
        broker,
        queue: queue.clone(),
        permissions: Arc::new(AllowAll),
    };
    let server = ChatServer::start(state, &config.server).await?;
    info!("tavernkeep v{} ready on {}", env!("CARGO_PKG_VERSION"), server.addr());

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down");

    // Stop intake first, then drain workers so in-flight replies land,
    // then wait out detached memory writes before stopping maintenance.
    server.shutdown();
    queue.shutdown().await;
    orchestrator.drain_memory_tasks().await;
    shutdown.cancel();
    ingress_maintenance.await?;
    broker_maintenance.await?;
    Ok(())
}

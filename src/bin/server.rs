use std::sync::Arc;

use clap::Parser;
use maze_quest_server::config::{GameRules, ServerConfig};
use maze_quest_server::questions::QuestionBank;
use maze_quest_server::registry::{spawn_idle_sweeper, RegistryOptions, SessionRegistry};
use maze_quest_server::server::{build_router, resolve_static_dir, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "maze_quest_server=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::parse();

    let bank = match config.questions_path.as_deref() {
        Some(path) => QuestionBank::load(path).map_err(|err| {
            tracing::error!(path = %path.display(), %err, "failed to load question bank");
            err
        })?,
        None => QuestionBank::builtin()?,
    };
    tracing::info!(questions = bank.len(), "question bank ready");

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(bank),
        RegistryOptions {
            rules: GameRules::default(),
            maze: config.maze_options(),
        },
    ));
    spawn_idle_sweeper(
        Arc::clone(&registry),
        config.sweep_interval(),
        config.idle_timeout(),
    );

    let static_dir = resolve_static_dir(config.static_dir.as_deref());
    if static_dir.is_none() {
        tracing::info!("no client bundle found; serving API only");
    }
    let app = build_router(AppState::new(registry), static_dir);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

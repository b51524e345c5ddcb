use std::net::SocketAddr;

use tracing::info;

mod app;
mod auth;
mod envelope;
mod http;
mod ratelimit;
mod scheduler;
mod sse;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lore_gateway=info,lore_ingest=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path via LORE_CONFIG > ./lore.toml, then LORE_* env
    let config_path = std::env::var("LORE_CONFIG").ok();
    let config = lore_core::LoreConfig::load(config_path.as_deref())?;

    let bind = config.server.bind.clone();
    let port = config.server.port;

    let state = app::AppState::bootstrap(config).await?;
    scheduler::spawn(state.clone());
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("lore gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

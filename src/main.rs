use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use media_delivery::config::EngineConfig;
use media_delivery::proxy::{ProxyServer, ProxyState};
use media_delivery::Engine;

#[derive(Parser, Debug)]
#[command(name = "media_delivery")]
#[command(about = "Caching media delivery proxy with offline fallback and adaptive preloading")]
#[command(version)]
struct Args {
    /// Path to a YAML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding server.listen
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Persist the cache in this directory instead of memory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("media_delivery=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(dir) = args.cache_dir {
        config.cache.dir = Some(dir);
    }

    let engine = Engine::start(&config).await.context("starting delivery engine")?;
    let server = ProxyServer::bind(config.server.listen, ProxyState::new(&engine, config.server.max_connections))
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}

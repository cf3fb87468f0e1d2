mod cli;
mod console;
mod handlers;

use std::sync::Arc;

use clap::Parser as _;
use color_eyre::eyre::Context as _;
use dashmap::DashMap;
use fulcrum_bus::MessageBus;
use fulcrum_dispatch::{Dispatcher, FamilyCache};
use fulcrum_registry::{ControlSurface, Inspector, RegistryStore, Sweeper, SweeperConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use handlers::Handlers;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = cli::Cli::parse();

    fulcrum_common::messages::register_all();

    let client = redis::Client::open(cli.redis_url.as_str())
        .wrap_err_with(|| format!("failed to parse redis url {}", cli.redis_url))?;
    let registry_conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .wrap_err("failed to open registry redis connection")?;
    let sweeper_conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .wrap_err("failed to open sweeper redis connection")?;

    let bus = MessageBus::connect(&cli.redis_url, "coordinator")
        .await
        .wrap_err("failed to connect message bus")?;

    let registry = Arc::new(RegistryStore::new(registry_conn));
    let family_cache = Arc::new(FamilyCache::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&family_cache), Arc::clone(&registry)));
    let inspector = Arc::new(Inspector::new(Arc::clone(&registry)));
    let control = Arc::new(ControlSurface::new(Arc::clone(&bus)));

    let handlers = Arc::new(Handlers {
        bus: Arc::clone(&bus),
        registry: Arc::clone(&registry),
        dispatcher,
        family_cache,
        registering_fsms: Arc::new(DashMap::new()),
        registering_watchdog: cli.registering_watchdog(),
    });
    handlers.install();

    let sweeper = Sweeper::with_config(
        Arc::clone(&registry),
        Arc::clone(&bus),
        sweeper_conn,
        SweeperConfig {
            unavailable_timeout: cli.unavailable_timeout(),
            dead_timeout: cli.dead_timeout(),
            sweep_period: cli.sweep_period(),
        },
    );
    sweeper.spawn();

    info!("fulcrum coordinator ready");

    tokio::select! {
        _ = console::run(Arc::clone(&inspector), Arc::clone(&control)) => {
            info!("operator console exited; shutting down");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::warn!(error = %err, "error awaiting ctrl-c; shutting down anyway");
            } else {
                info!("ctrl-c received; shutting down");
            }
        }
    }

    match tokio::time::timeout(std::time::Duration::from_secs(5), drain()).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            Ok(())
        }
        Err(_) => {
            tracing::error!("graceful shutdown deadline exceeded");
            std::process::exit(1);
        }
    }
}

/// Placeholder drain point for in-flight handler tasks. Handlers are
/// fire-and-forget `tokio::spawn`s with no join handles tracked centrally,
/// so today this just yields once to let the runtime flush pending work.
async fn drain() {
    tokio::task::yield_now().await;
}

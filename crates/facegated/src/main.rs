use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;
mod store;

const BUS_NAME: &str = "org.freedesktop.Facegate1";
const OBJECT_PATH: &str = "/org/freedesktop/Facegate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = store::IdentityStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let pipeline = facegate_vision::load_pipeline(&config.model_paths())
        .context("failed to load models")?;
    let engine = engine::spawn_engine(
        Box::new(pipeline),
        Duration::from_secs(config.analyze_timeout_secs),
    );

    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    let session_bus = config.session_bus;
    let state = Arc::new(dbus_interface::AppState::load(config, engine, store).await?);

    let sweeper = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                state.sweep().await;
            }
        })
    };

    let service = dbus_interface::FacegateService { state };
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");
    sweeper.abort();

    Ok(())
}

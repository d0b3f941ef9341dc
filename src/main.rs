use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod broker;
mod cache;
mod config;
mod db;
mod error;
mod ids;
mod messages;
mod services;

use broker::BrokerGateway;
use cache::IdempotencyStore;
use config::Config;
use ids::IdHub;
use services::check_in::CheckInService;
use services::init;
use services::journey::JourneyService;
use services::outbound::{LogSender, OutboundWorker};
use services::scheduler::DailyScheduler;
use services::sweeper::JourneySweeper;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub broker: BrokerGateway,
    pub cache: IdempotencyStore,
    pub ids: IdHub,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ayok_scheduler=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting check-in scheduling service");

    // Initialize database
    let pool = init::init_db(&config).await?;

    // Broker, cache, id generators
    let broker = BrokerGateway::connect(&config.broker, config.scheduler.max_delay_seconds).await?;
    broker.declare_topology().await?;
    let cache = IdempotencyStore::connect(&config.cache).await?;
    let ids = IdHub::new(&config.id_gen)?;

    let state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        broker,
        cache,
        ids,
    });

    // Services
    let daily = Arc::new(DailyScheduler::new(state.clone()));
    let sweeper = Arc::new(JourneySweeper::new(state.clone()));
    let check_in = Arc::new(CheckInService::new(state.clone()));
    let journey = Arc::new(JourneyService::new(state.clone()));
    let outbound = Arc::new(OutboundWorker::new(state.clone(), Arc::new(LogSender)));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Consumers first so a catch-up run's messages have somewhere to land.
    let mut handles = init::spawn_consumers(
        state.clone(),
        check_in,
        journey,
        outbound,
        shutdown_tx.clone(),
    );
    handles.extend(init::spawn_background_workers(
        daily.clone(),
        sweeper,
        &config,
        shutdown_tx.clone(),
    ));

    // Catch-up fan-out for restarts after 00:05. Scheduling marks and the
    // task filter make this idempotent.
    if let Err(e) = daily.run().await {
        tracing::error!("Startup scheduling run failed: {e}");
    }

    // Graceful shutdown on SIGINT / SIGTERM
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }

    tracing::info!("Shutting down; draining workers");
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

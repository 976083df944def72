use clap::Parser;
use eeg_relay::{
    build_router, cli::Cli, spawn_session_sweeper, PersistenceHandle, PersistenceWriter,
    PostgresSignalStore, RelayConfig, RelayState, SignalQuery,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eeg_relay=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env()?;
    cli.apply(&mut config);

    info!("Starting EEG relay v{}", VERSION);
    info!("   Alignment: {:?}", config.alignment_policy);
    info!("   Reference scheme: {:?}", config.reference_scheme);
    info!(
        "   Filters: {:?}, HP {} Hz, notch {} Hz, LP {} Hz",
        config.filter_mode, config.highpass_hz, config.mains_hz, config.lowpass_hz
    );
    info!("   Spectrum augmentation: {}", config.spectrum_enabled);

    let shutdown = CancellationToken::new();

    // Connect to database
    let (persistence, signal_query, writer_task) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await?;
            let store = Arc::new(PostgresSignalStore::new(pool));
            store.initialize().await?;
            info!("Database connected and schema initialized");

            let (handle, task) = PersistenceWriter::spawn(
                store.clone(),
                config.gateway_config(),
                config.persist_queue_capacity,
            );
            (handle, Some(store as Arc<dyn SignalQuery>), Some(task))
        }
        None => {
            warn!("DATABASE_URL not set, persistence disabled");
            (PersistenceHandle::disabled(), None, None)
        }
    };

    let state = RelayState::new(&config, persistence, signal_query, shutdown.clone());

    let sweeper = spawn_session_sweeper(
        state.registry.clone(),
        config.session_idle_timeout(),
        shutdown.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    let app = build_router(state.clone(), &config.cors_origins);

    // Start server
    let addr: SocketAddr = config.bind_address().parse()?;
    info!("Listening on http://{}", addr);
    info!("Device endpoint: ws://{}/ws?pair=<id>", addr);
    info!("Observer endpoint: ws://{}/ws/subscribe", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let graceful = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    // Sessions flush their pending rows as they close; the writer finishes
    // once the last persistence handle is gone.
    state.registry.cancel_all();
    drop(state);
    let _ = sweeper.await;
    if let Some(task) = writer_task {
        if time_limited(task).await.is_err() {
            warn!("Persistence writer did not finish in time, pending rows lost");
        }
    }

    info!("Relay stopped");
    Ok(())
}

async fn time_limited(task: tokio::task::JoinHandle<()>) -> Result<(), tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .map(|_| ())
}

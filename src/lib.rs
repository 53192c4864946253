pub mod cli;
pub mod commands;
pub mod db;
pub mod error;
pub mod state;
pub mod stream;

use clap::Parser;
use cli::Cli;
use commands::{
    health::health,
    preferences::{preferences_get, preferences_save},
    stream::{start_stream, stop_stream},
};
use db::initialize_pool;
use error::AppError;
use state::AppState;
use std::time::Duration;
use stream::types::{PresenceUpdate, SaveStreamPreferencesArgs};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRESENCE_CHANNEL_CAPACITY: usize = 64;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seismo_stream_lib=info,seismo_stream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn log_presence(mut presence_rx: mpsc::Receiver<PresenceUpdate>) {
    while let Some(update) = presence_rx.recv().await {
        debug!(kind = ?update.kind, payload = ?update.payload, "station presence update");
    }
}

async fn log_status(state: &AppState) {
    match health(state).await {
        Ok(report) => {
            let snapshot = state.stream_status.read().clone();
            info!(
                client = ?report.client,
                station = ?report.station,
                gps_synced = ?report.gps_synced,
                samples = report.buffered_samples,
                virtual_now = ?snapshot.virtual_now,
                batches = snapshot.stats.batches_received,
                reconnects = snapshot.stats.reconnects,
                db = report.db,
                "stream status"
            );
        }
        Err(error) => warn!(%error, "failed to build stream status"),
    }
}

pub async fn run() -> Result<(), AppError> {
    init_tracing();
    let cli = Cli::parse();

    let db_pool = initialize_pool(cli.db_path.clone()).await?;
    let (presence_tx, presence_rx) = mpsc::channel(PRESENCE_CHANNEL_CAPACITY);
    let state = AppState::new(db_pool, Some(presence_tx));

    if let (true, Some(window_seconds)) = (cli.save_window, cli.window_seconds) {
        let saved = preferences_save(&state, SaveStreamPreferencesArgs { window_seconds }).await?;
        info!(window_seconds = saved.window_seconds, "saved window preference");
    }
    let saved_window_seconds = match preferences_get(&state).await {
        Ok(preferences) => Some(preferences.window_seconds),
        Err(error) => {
            warn!(%error, "failed to read stream preferences, using defaults");
            None
        }
    };

    let presence_handle = tokio::spawn(log_presence(presence_rx));
    let session = start_stream(&state, Some(cli.start_args(saved_window_seconds))).await?;
    info!(
        endpoint = %session.endpoint_url,
        history = %session.history_url,
        window_seconds = session.window_seconds,
        tick_interval_ms = session.tick_interval_ms,
        decimation = ?session.decimation,
        "stream started"
    );

    let mut status_ticker =
        tokio::time::interval(Duration::from_millis(cli.status_interval_ms.max(100)));
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for shutdown signal");
                }
                break;
            }
            _ = status_ticker.tick() => log_status(&state).await,
        }
    }

    info!("shutting down");
    let result = stop_stream(&state).await?;
    debug!(stopped = result.stopped, "stream task joined");
    presence_handle.abort();
    state.db_pool.close().await;
    Ok(())
}

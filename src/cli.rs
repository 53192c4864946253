use crate::stream::types::StartStreamArgs;
use clap::Parser;
use std::path::PathBuf;

/// Seismo Stream - live seismograph sample stream client
#[derive(Debug, Parser)]
#[command(name = "seismo-stream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Websocket endpoint delivering live sample batches
    #[arg(long, env = "SEISMO_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// HTTP endpoint returning the historical backfill
    #[arg(long, env = "SEISMO_HISTORY_URL")]
    pub history_url: Option<String>,

    /// Trailing window kept in the buffer, in seconds. Defaults to the saved preference.
    #[arg(short, long, env = "SEISMO_WINDOW_SECONDS")]
    pub window_seconds: Option<f64>,

    /// Persist --window-seconds as the new default
    #[arg(long, requires = "window_seconds")]
    pub save_window: bool,

    #[arg(long, env = "SEISMO_TICK_INTERVAL_MS")]
    pub tick_interval_ms: Option<u64>,

    #[arg(long, env = "SEISMO_RECONNECT_BASE_MS")]
    pub reconnect_base_ms: Option<u64>,

    #[arg(long, env = "SEISMO_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: Option<u64>,

    #[arg(long, env = "SEISMO_RECONNECT_ATTEMPT_CAP")]
    pub reconnect_attempt_cap: Option<u32>,

    #[arg(long, env = "SEISMO_HISTORY_TIMEOUT_MS")]
    pub history_timeout_ms: Option<u64>,

    /// Silence after which the station is reported disconnected
    #[arg(long, env = "SEISMO_STATION_TIMEOUT_MS")]
    pub station_timeout_ms: Option<u64>,

    /// Keep every Nth live sample on coarse windows (300 s and above)
    #[arg(long, env = "SEISMO_DECIMATION_FACTOR")]
    pub decimation_factor: Option<usize>,

    /// Absolute value at or above which a sample survives decimation
    #[arg(long, env = "SEISMO_SPIKE_THRESHOLD")]
    pub spike_threshold: Option<f64>,

    /// SQLite file holding user preferences
    #[arg(long, env = "SEISMO_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// How often the stream status is logged
    #[arg(long, env = "SEISMO_STATUS_INTERVAL_MS", default_value_t = 5_000)]
    pub status_interval_ms: u64,
}

impl Cli {
    pub fn start_args(&self, saved_window_seconds: Option<f64>) -> StartStreamArgs {
        StartStreamArgs {
            endpoint_url: self.endpoint_url.clone(),
            history_url: self.history_url.clone(),
            window_seconds: self.window_seconds.or(saved_window_seconds),
            tick_interval_ms: self.tick_interval_ms,
            reconnect_base_ms: self.reconnect_base_ms,
            reconnect_max_ms: self.reconnect_max_ms,
            reconnect_attempt_cap: self.reconnect_attempt_cap,
            history_timeout_ms: self.history_timeout_ms,
            station_timeout_ms: self.station_timeout_ms,
            decimation_factor: self.decimation_factor,
            spike_threshold: self.spike_threshold,
        }
    }
}

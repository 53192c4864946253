use crate::error::AppError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_ENDPOINT_URL: &str = "wss://seismologos.shop/ws/user";
pub const DEFAULT_HISTORY_URL: &str = "https://seismologos.shop/buffer";
pub const DEFAULT_WINDOW_SECONDS: f64 = 30.0;
pub const COARSE_WINDOW_SECONDS: f64 = 300.0;
pub const MIN_WINDOW_SECONDS: f64 = 1.0;
pub const MAX_WINDOW_SECONDS: f64 = 3_600.0;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
pub const MIN_TICK_INTERVAL_MS: u64 = 10;
pub const MAX_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_ATTEMPT_CAP: u32 = 10;
pub const MAX_RECONNECT_ATTEMPT_CAP: u32 = 32;
pub const DEFAULT_HISTORY_TIMEOUT_MS: u64 = 10_000;
pub const MIN_HISTORY_TIMEOUT_MS: u64 = 100;
pub const MAX_HISTORY_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_STATION_TIMEOUT_MS: u64 = 5_000;
pub const MIN_STATION_TIMEOUT_MS: u64 = 500;
pub const MAX_STATION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DECIMATION_FACTOR: usize = 5;
pub const DEFAULT_SPIKE_THRESHOLD: f64 = 1_000.0;

/// One measurement. Timestamps are seconds and unique within a buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A delivery unit from the transport, already resolved to stamped samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub samples: Vec<Sample>,
    pub sample_rate: Option<f64>,
    pub timestamp_start: Option<f64>,
    pub gps_synced: Option<bool>,
}

impl SampleBatch {
    pub fn stamped(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            sample_rate: None,
            timestamp_start: None,
            gps_synced: None,
        }
    }

    /// End of the batch in source time, when the batch carries rate and start metadata.
    pub fn sync_point(&self) -> Option<f64> {
        let rate = self
            .sample_rate
            .filter(|rate| rate.is_finite() && *rate > 0.0)?;
        let start = self.timestamp_start?;
        if self.samples.is_empty() {
            return None;
        }
        Some(start + self.samples.len() as f64 / rate)
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.samples
            .iter()
            .map(|sample| sample.timestamp)
            .max_by(f64::total_cmp)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecimationConfig {
    pub every_nth: usize,
    pub spike_threshold: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "state",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub batches_received: u64,
    pub samples_received: u64,
    pub batches_ignored: u64,
    pub parse_failures: u64,
    pub history_loads: u64,
    pub history_failures: u64,
    pub clock_regressions: u64,
    pub reconnects: u64,
}

/// Immutable view handed to consumers. Samples are shared, never written back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub connection: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub visible: bool,
    pub virtual_now: Option<f64>,
    pub samples: Arc<[Sample]>,
    pub window_seconds: f64,
    pub gps_synced: bool,
    pub station_connected: bool,
    pub reconnect_attempt: u32,
    pub stats: StreamStats,
    pub reason: Option<String>,
}

impl StreamSnapshot {
    pub fn stopped(window_seconds: f64, reason: Option<String>) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            connected: false,
            connecting: false,
            visible: true,
            virtual_now: None,
            samples: Arc::new([]),
            window_seconds,
            gps_synced: false,
            station_connected: false,
            reconnect_attempt: 0,
            stats: StreamStats::default(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamArgs {
    pub endpoint_url: Option<String>,
    pub history_url: Option<String>,
    pub window_seconds: Option<f64>,
    pub tick_interval_ms: Option<u64>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_attempt_cap: Option<u32>,
    pub history_timeout_ms: Option<u64>,
    pub station_timeout_ms: Option<u64>,
    pub decimation_factor: Option<usize>,
    pub spike_threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint_url: String,
    pub history_url: String,
    pub window_seconds: f64,
    pub tick_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempt_cap: u32,
    pub history_timeout_ms: u64,
    pub station_timeout_ms: u64,
    pub decimation: Option<DecimationConfig>,
}

impl StartStreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, AppError> {
        let endpoint_url = normalize_endpoint(
            self.endpoint_url,
            DEFAULT_ENDPOINT_URL,
            &["ws", "wss"],
            "endpointUrl",
        )?;
        let history_url = normalize_endpoint(
            self.history_url,
            DEFAULT_HISTORY_URL,
            &["http", "https"],
            "historyUrl",
        )?;

        let window_seconds =
            normalize_window_seconds(self.window_seconds.unwrap_or(DEFAULT_WINDOW_SECONDS))?;

        let tick_interval_ms = self.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS);
        if !(MIN_TICK_INTERVAL_MS..=MAX_TICK_INTERVAL_MS).contains(&tick_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "tickIntervalMs must be between {MIN_TICK_INTERVAL_MS} and {MAX_TICK_INTERVAL_MS}"
            )));
        }

        let reconnect_base_ms = self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS);
        if reconnect_base_ms == 0 {
            return Err(AppError::InvalidArgument(
                "reconnectBaseMs must be positive".to_string(),
            ));
        }
        let reconnect_max_ms = self.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS);
        if reconnect_max_ms < reconnect_base_ms {
            return Err(AppError::InvalidArgument(
                "reconnectMaxMs must not be below reconnectBaseMs".to_string(),
            ));
        }
        let reconnect_attempt_cap = self
            .reconnect_attempt_cap
            .unwrap_or(DEFAULT_RECONNECT_ATTEMPT_CAP);
        if reconnect_attempt_cap > MAX_RECONNECT_ATTEMPT_CAP {
            return Err(AppError::InvalidArgument(format!(
                "reconnectAttemptCap must be at most {MAX_RECONNECT_ATTEMPT_CAP}"
            )));
        }

        let history_timeout_ms = self
            .history_timeout_ms
            .unwrap_or(DEFAULT_HISTORY_TIMEOUT_MS);
        if !(MIN_HISTORY_TIMEOUT_MS..=MAX_HISTORY_TIMEOUT_MS).contains(&history_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "historyTimeoutMs must be between {MIN_HISTORY_TIMEOUT_MS} and {MAX_HISTORY_TIMEOUT_MS}"
            )));
        }

        let station_timeout_ms = self
            .station_timeout_ms
            .unwrap_or(DEFAULT_STATION_TIMEOUT_MS);
        if !(MIN_STATION_TIMEOUT_MS..=MAX_STATION_TIMEOUT_MS).contains(&station_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "stationTimeoutMs must be between {MIN_STATION_TIMEOUT_MS} and {MAX_STATION_TIMEOUT_MS}"
            )));
        }

        let decimation_factor = self.decimation_factor.unwrap_or(DEFAULT_DECIMATION_FACTOR);
        if decimation_factor == 0 {
            return Err(AppError::InvalidArgument(
                "decimationFactor must be at least 1".to_string(),
            ));
        }
        let spike_threshold = self.spike_threshold.unwrap_or(DEFAULT_SPIKE_THRESHOLD);
        if !spike_threshold.is_finite() || spike_threshold <= 0.0 {
            return Err(AppError::InvalidArgument(
                "spikeThreshold must be a finite positive number".to_string(),
            ));
        }
        let decimation = (window_seconds >= COARSE_WINDOW_SECONDS && decimation_factor > 1)
            .then_some(DecimationConfig {
                every_nth: decimation_factor,
                spike_threshold,
            });

        Ok(StreamConfig {
            endpoint_url,
            history_url,
            window_seconds,
            tick_interval_ms,
            reconnect_base_ms,
            reconnect_max_ms,
            reconnect_attempt_cap,
            history_timeout_ms,
            station_timeout_ms,
            decimation,
        })
    }
}

pub fn normalize_window_seconds(window_seconds: f64) -> Result<f64, AppError> {
    if !window_seconds.is_finite()
        || !(MIN_WINDOW_SECONDS..=MAX_WINDOW_SECONDS).contains(&window_seconds)
    {
        return Err(AppError::InvalidArgument(format!(
            "windowSeconds must be between {MIN_WINDOW_SECONDS} and {MAX_WINDOW_SECONDS}"
        )));
    }
    Ok(window_seconds)
}

fn normalize_endpoint(
    value: Option<String>,
    default: &str,
    schemes: &[&str],
    field: &str,
) -> Result<String, AppError> {
    let raw = value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string());
    let parsed = Url::parse(&raw)
        .map_err(|error| AppError::InvalidArgument(format!("{field} is not a valid URL: {error}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must use one of the schemes {}",
            schemes.join(", ")
        )));
    }
    Ok(raw)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub running: bool,
    pub endpoint_url: String,
    pub history_url: String,
    pub window_seconds: f64,
    pub tick_interval_ms: u64,
    pub decimation: Option<DecimationConfig>,
}

impl StreamSession {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            running: true,
            endpoint_url: config.endpoint_url.clone(),
            history_url: config.history_url.clone(),
            window_seconds: config.window_seconds,
            tick_interval_ms: config.tick_interval_ms,
            decimation: config.decimation,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamPreferencesSnapshot {
    pub window_seconds: f64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStreamPreferencesArgs {
    pub window_seconds: f64,
}

impl SaveStreamPreferencesArgs {
    pub fn normalize(self) -> Result<Self, AppError> {
        Ok(Self {
            window_seconds: normalize_window_seconds(self.window_seconds)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Stations,
    StationStatus,
}

/// Station metadata passed through to collaborators without interpretation.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub kind: PresenceKind,
    pub payload: simd_json::OwnedValue,
}

#[derive(Debug, Clone)]
pub enum StreamPayload {
    Data(SampleBatch),
    Presence(PresenceUpdate),
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct SampleWire {
    #[serde(default)]
    pub timestamp: Option<f64>,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TimestampWire {
    Seconds(f64),
    Text(String),
}

impl TimestampWire {
    pub fn to_seconds(&self) -> Result<f64, AppError> {
        match self {
            Self::Seconds(seconds) => Ok(*seconds),
            Self::Text(text) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(text.trim())?;
                Ok(parsed.timestamp_micros() as f64 / 1_000_000.0)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DataBatchWire {
    #[serde(default)]
    pub samples: Vec<SampleWire>,
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub timestamp_start: Option<TimestampWire>,
    #[serde(default)]
    pub gps_synced: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamPayloadWire {
    Data(DataBatchWire),
    Stations(simd_json::OwnedValue),
    StationStatus(simd_json::OwnedValue),
    #[serde(other)]
    Unknown,
}

impl TryFrom<DataBatchWire> for SampleBatch {
    type Error = AppError;

    fn try_from(value: DataBatchWire) -> Result<Self, Self::Error> {
        let sample_rate = value
            .sample_rate
            .filter(|rate| rate.is_finite() && *rate > 0.0);
        let timestamp_start = value
            .timestamp_start
            .as_ref()
            .map(TimestampWire::to_seconds)
            .transpose()?;
        if timestamp_start.is_some_and(|start| !start.is_finite()) {
            return Err(AppError::InvalidPayload(
                "timestamp_start must be finite".to_string(),
            ));
        }

        let mut samples = Vec::with_capacity(value.samples.len());
        for (index, sample) in value.samples.into_iter().enumerate() {
            let timestamp = match (sample.timestamp, sample_rate, timestamp_start) {
                (Some(timestamp), _, _) => timestamp,
                (None, Some(rate), Some(start)) => start + index as f64 / rate,
                (None, _, _) => {
                    return Err(AppError::InvalidPayload(
                        "sample without timestamp in a batch without rate/start metadata"
                            .to_string(),
                    ))
                }
            };
            if !timestamp.is_finite() || !sample.value.is_finite() {
                return Err(AppError::InvalidPayload(
                    "sample timestamp and value must be finite".to_string(),
                ));
            }
            samples.push(Sample::new(timestamp, sample.value));
        }

        Ok(Self {
            samples,
            sample_rate,
            timestamp_start,
            gps_synced: value.gps_synced,
        })
    }
}

pub fn parse_stream_payload(payload: &mut [u8]) -> Result<StreamPayload, AppError> {
    let wire: StreamPayloadWire = simd_json::serde::from_slice(payload)?;
    Ok(match wire {
        StreamPayloadWire::Data(batch) => StreamPayload::Data(batch.try_into()?),
        StreamPayloadWire::Stations(payload) => StreamPayload::Presence(PresenceUpdate {
            kind: PresenceKind::Stations,
            payload,
        }),
        StreamPayloadWire::StationStatus(payload) => StreamPayload::Presence(PresenceUpdate {
            kind: PresenceKind::StationStatus,
            payload,
        }),
        StreamPayloadWire::Unknown => StreamPayload::Unknown,
    })
}

#[derive(Debug, Deserialize)]
pub struct HistoryWire {
    #[serde(default)]
    pub samples: Vec<SampleWire>,
}

impl TryFrom<HistoryWire> for Vec<Sample> {
    type Error = AppError;

    fn try_from(value: HistoryWire) -> Result<Self, Self::Error> {
        let mut samples = Vec::with_capacity(value.samples.len());
        for sample in value.samples {
            let timestamp = sample.timestamp.ok_or_else(|| {
                AppError::InvalidPayload("history sample without timestamp".to_string())
            })?;
            if !timestamp.is_finite() || !sample.value.is_finite() {
                return Err(AppError::InvalidPayload(
                    "history sample timestamp and value must be finite".to_string(),
                ));
            }
            samples.push(Sample::new(timestamp, sample.value));
        }
        Ok(samples)
    }
}

use crate::{error::AppError, state::AppState, stream::types::StreamSnapshot};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ClientHealth {
    Connecting,
    Good,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StationHealth {
    Good,
    Disconnected,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub client: ClientHealth,
    /// Only reported while the client is connected.
    pub station: Option<StationHealth>,
    /// Only reported while the station is delivering data.
    pub gps_synced: Option<bool>,
    pub buffered_samples: usize,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    snapshot: &StreamSnapshot,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    let client = if snapshot.connecting {
        ClientHealth::Connecting
    } else if snapshot.connected {
        ClientHealth::Good
    } else {
        ClientHealth::Disconnected
    };
    let station = snapshot.connected.then_some(if snapshot.station_connected {
        StationHealth::Good
    } else {
        StationHealth::Disconnected
    });
    let gps_synced =
        (snapshot.connected && snapshot.station_connected).then_some(snapshot.gps_synced);

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        client,
        station,
        gps_synced,
        buffered_samples: snapshot.samples.len(),
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let snapshot = state.stream_status.read().clone();
    Ok(build_health_response(state.started_at, &state.db_pool, &snapshot).await)
}

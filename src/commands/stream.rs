use crate::error::AppError;
use crate::state::{AppState, StreamHandle};
use crate::stream::lifecycle::{LifecycleEvent, LifecycleHandle};
use crate::stream::pipeline::run_sensor_stream;
use crate::stream::transport::{Connector, HistorySource, HttpHistorySource, WebSocketConnector};
use crate::stream::types::{
    StartStreamArgs, StreamConfig, StreamSession, StreamSnapshot, StreamStopResult,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

pub async fn start_stream(
    state: &AppState,
    args: Option<StartStreamArgs>,
) -> Result<StreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let client = Client::builder()
        .timeout(Duration::from_millis(config.history_timeout_ms))
        .build()?;
    let history = HttpHistorySource::new(client, config.history_url.clone());

    start_stream_with(state, config, Arc::new(WebSocketConnector), Arc::new(history)).await
}

/// Replaces any running stream with one built on the given transport and history source.
pub async fn start_stream_with<C, H>(
    state: &AppState,
    config: StreamConfig,
    connector: Arc<C>,
    history: Arc<H>,
) -> Result<StreamSession, AppError>
where
    C: Connector,
    H: HistorySource,
{
    let existing_handle = {
        let mut stream_slot = state.stream.lock().await;
        stream_slot.take()
    };
    if let Some(handle) = existing_handle {
        info!("replacing running stream");
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let (lifecycle, lifecycle_rx) = LifecycleHandle::channel(LIFECYCLE_CHANNEL_CAPACITY);
    let join_handle = tokio::spawn(run_sensor_stream(
        config.clone(),
        connector,
        history,
        lifecycle_rx,
        Arc::clone(&state.stream_status),
        state.presence_tx.clone(),
        cancellation_token.clone(),
    ));

    {
        let mut stream_slot = state.stream.lock().await;
        *stream_slot = Some(StreamHandle {
            cancellation_token,
            join_handle,
            lifecycle,
        });
    }

    Ok(StreamSession::from_config(&config))
}

pub async fn stop_stream(state: &AppState) -> Result<StreamStopResult, AppError> {
    let existing_handle = {
        let mut stream_slot = state.stream.lock().await;
        stream_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let mut writable = state.stream_status.write();
        let window_seconds = writable.window_seconds;
        *writable = StreamSnapshot::stopped(
            window_seconds,
            Some("stream stopped by command".to_string()),
        );
    }

    Ok(StreamStopResult { stopped })
}

pub async fn stream_status(state: &AppState) -> Result<StreamSnapshot, AppError> {
    let snapshot = state.stream_status.read().clone();
    Ok(snapshot)
}

/// Feeds the running stream's lifecycle source. Returns false when no stream is running.
pub async fn set_visibility(state: &AppState, visible: bool) -> Result<bool, AppError> {
    let lifecycle = {
        let stream_slot = state.stream.lock().await;
        stream_slot.as_ref().map(|handle| handle.lifecycle.clone())
    };
    let Some(lifecycle) = lifecycle else {
        return Ok(false);
    };

    let event = if visible {
        LifecycleEvent::Foreground
    } else {
        LifecycleEvent::Background
    };
    lifecycle.send(event).await?;
    Ok(true)
}

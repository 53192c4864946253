use crate::stream::lifecycle::LifecycleHandle;
use crate::stream::pipeline::SnapshotStore;
use crate::stream::types::{PresenceUpdate, StreamSnapshot, DEFAULT_WINDOW_SECONDS};
use parking_lot::RwLock;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct StreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub lifecycle: LifecycleHandle,
}

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub stream: Mutex<Option<StreamHandle>>,
    pub stream_status: SnapshotStore,
    pub presence_tx: Option<mpsc::Sender<PresenceUpdate>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, presence_tx: Option<mpsc::Sender<PresenceUpdate>>) -> Self {
        let stream_status =
            StreamSnapshot::stopped(DEFAULT_WINDOW_SECONDS, Some("stream idle".to_string()));

        Self {
            started_at: Instant::now(),
            db_pool,
            stream: Mutex::new(None),
            stream_status: Arc::new(RwLock::new(stream_status)),
            presence_tx,
        }
    }
}

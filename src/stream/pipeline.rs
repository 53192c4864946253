use crate::error::AppError;
use crate::stream::connection::SessionId;
use crate::stream::core::{CoreAction, HistoryTicket, StreamCore};
use crate::stream::lifecycle::LifecycleEvent;
use crate::stream::transport::{Connector, HistorySource, TransportFrame, TransportSession};
use crate::stream::types::{PresenceUpdate, Sample, StreamConfig, StreamSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SnapshotStore = Arc<RwLock<StreamSnapshot>>;

enum TransportEvent {
    Opened,
    Frame(Vec<u8>),
    Closed(Option<String>),
}

enum RuntimeEvent {
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    History {
        ticket: HistoryTicket,
        result: Result<Vec<Sample>, AppError>,
    },
}

struct TaskSlot {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskSlot {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// I/O half of the stream: owns spawned tasks and timers and executes the
/// actions the core asks for.
struct StreamRuntime<C, H> {
    config: StreamConfig,
    connector: Arc<C>,
    history: Arc<H>,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    presence_tx: Option<mpsc::Sender<PresenceUpdate>>,
    cancel_token: CancellationToken,
    session_task: Option<(SessionId, TaskSlot)>,
    history_task: Option<TaskSlot>,
    /// Tasks cancelled while stopping; joined before the stream returns.
    closing: Vec<TaskSlot>,
    stopping: bool,
    reconnect_at: Option<Instant>,
}

impl<C, H> StreamRuntime<C, H>
where
    C: Connector,
    H: HistorySource,
{
    fn apply(&mut self, actions: Vec<CoreAction>) {
        for action in actions {
            match action {
                CoreAction::Open(session) => self.open_session(session),
                CoreAction::Close(session) => self.close_session(session),
                CoreAction::ScheduleReconnect(delay) => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                CoreAction::CancelReconnect => self.reconnect_at = None,
                CoreAction::FetchHistory(ticket) => self.fetch_history(ticket),
                CoreAction::CancelHistory => {
                    if let Some(task) = self.history_task.take() {
                        task.token.cancel();
                        if self.stopping {
                            self.closing.push(task);
                        }
                    }
                }
                CoreAction::Forward(update) => self.forward_presence(update),
            }
        }
    }

    fn open_session(&mut self, session: SessionId) {
        if let Some((_, previous)) = self.session_task.take() {
            previous.token.cancel();
        }

        let token = self.cancel_token.child_token();
        let handle = tokio::spawn(run_session(
            Arc::clone(&self.connector),
            self.config.endpoint_url.clone(),
            session,
            self.events_tx.clone(),
            token.clone(),
        ));
        self.session_task = Some((session, TaskSlot { token, handle }));
    }

    fn close_session(&mut self, session: SessionId) {
        if self
            .session_task
            .as_ref()
            .is_some_and(|(active, _)| *active == session)
        {
            if let Some((_, task)) = self.session_task.take() {
                task.token.cancel();
                if self.stopping {
                    self.closing.push(task);
                }
            }
        }
    }

    fn fetch_history(&mut self, ticket: HistoryTicket) {
        if let Some(previous) = self.history_task.take() {
            previous.token.cancel();
        }

        let token = self.cancel_token.child_token();
        let task_token = token.clone();
        let history = Arc::clone(&self.history);
        let events_tx = self.events_tx.clone();
        let timeout_ms = self.config.history_timeout_ms;

        let handle = tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = task_token.cancelled() => return,
                fetched = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    history.fetch_history(),
                ) => fetched,
            };
            let result = fetched.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!(
                    "history backfill did not complete within {timeout_ms} ms"
                )))
            });
            let _ = events_tx.send(RuntimeEvent::History { ticket, result });
        });
        self.history_task = Some(TaskSlot { token, handle });
    }

    fn forward_presence(&self, update: PresenceUpdate) {
        let Some(presence_tx) = &self.presence_tx else {
            return;
        };
        match presence_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(kind = ?update.kind, "presence consumer is behind, dropping update");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("presence consumer closed");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        if let Some((_, task)) = self.session_task.take() {
            self.closing.push(task);
        }
        for task in self.closing.drain(..) {
            task.stop().await;
        }
        if let Some(task) = self.history_task.take() {
            task.stop().await;
        }
    }
}

async fn run_session<C: Connector>(
    connector: Arc<C>,
    url: String,
    session: SessionId,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    token: CancellationToken,
) {
    let send = |event: TransportEvent| {
        let _ = events_tx.send(RuntimeEvent::Transport { session, event });
    };

    let opened = tokio::select! {
        _ = token.cancelled() => return,
        opened = connector.open(&url) => opened,
    };
    let mut transport: Box<dyn TransportSession> = match opened {
        Ok(transport) => transport,
        Err(error) => {
            send(TransportEvent::Closed(Some(format!(
                "websocket connect error: {error}"
            ))));
            return;
        }
    };
    send(TransportEvent::Opened);

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            frame = transport.next_frame() => Some(frame),
        };
        let Some(frame) = frame else {
            transport.close().await;
            return;
        };

        match frame {
            TransportFrame::Payload(payload) => send(TransportEvent::Frame(payload)),
            TransportFrame::Closed(reason) => {
                send(TransportEvent::Closed(reason));
                return;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn publish(snapshot_store: &SnapshotStore, core: &StreamCore) {
    *snapshot_store.write() = core.snapshot();
}

/// Runs the stream until `cancel_token` fires. Every state change happens on
/// this task; spawned session and history tasks only report back via events.
pub async fn run_sensor_stream<C, H>(
    config: StreamConfig,
    connector: Arc<C>,
    history: Arc<H>,
    mut lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
    snapshot_store: SnapshotStore,
    presence_tx: Option<mpsc::Sender<PresenceUpdate>>,
    cancel_token: CancellationToken,
) where
    C: Connector,
    H: HistorySource,
{
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut core = StreamCore::new(&config);
    let mut ticker = core.scheduler().ticker();
    let mut runtime = StreamRuntime {
        config,
        connector,
        history,
        events_tx,
        presence_tx,
        cancel_token: cancel_token.clone(),
        session_task: None,
        history_task: None,
        closing: Vec::new(),
        stopping: false,
        reconnect_at: None,
    };

    info!(
        endpoint = %runtime.config.endpoint_url,
        window_seconds = runtime.config.window_seconds,
        decimation = runtime.config.decimation.is_some(),
        "starting sensor stream"
    );
    let actions = core.start();
    runtime.apply(actions);
    publish(&snapshot_store, &core);

    let mut lifecycle_open = true;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            Some(event) = events_rx.recv() => {
                let now = Instant::now().into_std();
                let actions = match event {
                    RuntimeEvent::Transport { session, event } => match event {
                        TransportEvent::Opened => core.on_transport_open(session),
                        TransportEvent::Frame(mut payload) => {
                            core.on_message(session, payload.as_mut_slice(), now)
                        }
                        TransportEvent::Closed(reason) => {
                            if let Some(reason) = &reason {
                                debug!(session = session.get(), reason = %reason, "transport closed");
                            }
                            core.on_transport_closed(session, reason)
                        }
                    },
                    RuntimeEvent::History { ticket, result } => {
                        core.on_history(ticket, result, now);
                        Vec::new()
                    }
                };
                runtime.apply(actions);
            }
            event = lifecycle_rx.recv(), if lifecycle_open => {
                let Some(event) = event else {
                    lifecycle_open = false;
                    continue;
                };
                let was_visible = core.is_visible();
                let actions = core.on_lifecycle(event);
                runtime.apply(actions);
                if !was_visible && core.is_visible() {
                    ticker.reset();
                }
            }
            _ = wait_until(runtime.reconnect_at), if runtime.reconnect_at.is_some() => {
                runtime.reconnect_at = None;
                let actions = core.on_backoff_elapsed();
                runtime.apply(actions);
            }
            _ = ticker.tick(), if core.is_visible() => {
                core.on_tick(Instant::now().into_std());
            }
        }
        publish(&snapshot_store, &core);
    }

    runtime.stopping = true;
    let actions = core.shutdown();
    runtime.apply(actions);
    runtime.shutdown().await;
    publish(&snapshot_store, &core);
    info!("sensor stream stopped");
}

use crate::error::AppError;
use crate::stream::buffer::{MergeOutcome, SampleBuffer};
use crate::stream::clock::{ClockSynchronizer, SyncOutcome};
use crate::stream::connection::{CloseOutcome, ConnectionManager, ReconnectPolicy, SessionId};
use crate::stream::lifecycle::{LifecycleController, LifecycleDirective, LifecycleEvent};
use crate::stream::scheduler::{TickOutcome, TickScheduler};
use crate::stream::types::{
    parse_stream_payload, ConnectionState, PresenceUpdate, Sample, SampleBatch, StreamConfig,
    StreamPayload, StreamSnapshot, StreamStats,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ties a backfill response to the visibility epoch that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    epoch: u64,
}

/// Side effects requested by a state transition. The event loop performs them in order.
#[derive(Debug, Clone)]
pub enum CoreAction {
    Open(SessionId),
    Close(SessionId),
    ScheduleReconnect(Duration),
    CancelReconnect,
    FetchHistory(HistoryTicket),
    CancelHistory,
    Forward(PresenceUpdate),
}

/// All mutable stream state, owned by one task and changed only through the
/// transition methods below.
#[derive(Debug)]
pub struct StreamCore {
    window_seconds: f64,
    station_timeout: Duration,
    buffer: SampleBuffer,
    clock: ClockSynchronizer,
    connection: ConnectionManager,
    scheduler: TickScheduler,
    lifecycle: LifecycleController,
    history_epoch: u64,
    history_requested: bool,
    gps_synced: bool,
    station_deadline: Option<Instant>,
    stats: StreamStats,
    reason: Option<String>,
}

impl StreamCore {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            window_seconds: config.window_seconds,
            station_timeout: Duration::from_millis(config.station_timeout_ms),
            buffer: SampleBuffer::new(config.decimation),
            clock: ClockSynchronizer::default(),
            connection: ConnectionManager::new(ReconnectPolicy::from_config(config)),
            scheduler: TickScheduler::new(Duration::from_millis(config.tick_interval_ms)),
            lifecycle: LifecycleController::default(),
            history_epoch: 0,
            history_requested: false,
            gps_synced: false,
            station_deadline: None,
            stats: StreamStats::default(),
            reason: Some("stream idle".to_string()),
        }
    }

    pub fn scheduler(&self) -> TickScheduler {
        self.scheduler
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn clock(&self) -> &ClockSynchronizer {
        &self.clock
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_visible(&self) -> bool {
        self.lifecycle.is_visible()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn start(&mut self) -> Vec<CoreAction> {
        self.connection.set_should_reconnect(true);
        self.reason = Some("opening websocket stream".to_string());
        self.connection
            .connect()
            .map(CoreAction::Open)
            .into_iter()
            .collect()
    }

    pub fn on_transport_open(&mut self, session: SessionId) -> Vec<CoreAction> {
        if !self.connection.on_open(session) {
            debug!(session = session.get(), "late open for a dropped session");
            return vec![CoreAction::Close(session)];
        }
        self.reason = Some("websocket connected".to_string());
        Vec::new()
    }

    pub fn on_transport_closed(
        &mut self,
        session: SessionId,
        reason: Option<String>,
    ) -> Vec<CoreAction> {
        match self.connection.on_closed(session) {
            CloseOutcome::Stale => Vec::new(),
            CloseOutcome::Idle => {
                self.reason = reason.or_else(|| Some("websocket closed".to_string()));
                Vec::new()
            }
            CloseOutcome::Reconnect { attempt, delay } => {
                self.stats.reconnects = self.stats.reconnects.saturating_add(1);
                let cause = reason.unwrap_or_else(|| "websocket closed".to_string());
                self.reason = Some(format!(
                    "{cause}; reconnect attempt {} in {} ms",
                    attempt + 1,
                    delay.as_millis()
                ));
                vec![CoreAction::ScheduleReconnect(delay)]
            }
        }
    }

    pub fn on_backoff_elapsed(&mut self) -> Vec<CoreAction> {
        self.connection
            .on_backoff_elapsed()
            .map(CoreAction::Open)
            .into_iter()
            .collect()
    }

    pub fn on_message(
        &mut self,
        session: SessionId,
        payload: &mut [u8],
        now: Instant,
    ) -> Vec<CoreAction> {
        if !self.connection.is_current(session) {
            return Vec::new();
        }

        let payload = match parse_stream_payload(payload) {
            Ok(payload) => payload,
            Err(error) => {
                self.stats.parse_failures = self.stats.parse_failures.saturating_add(1);
                warn!(%error, "dropping unparseable stream message");
                return Vec::new();
            }
        };

        match payload {
            StreamPayload::Data(batch) => self.on_data_batch(batch, now),
            StreamPayload::Presence(update) => vec![CoreAction::Forward(update)],
            StreamPayload::Unknown => {
                debug!("ignoring stream message of unknown type");
                Vec::new()
            }
        }
    }

    pub fn on_history(
        &mut self,
        ticket: HistoryTicket,
        result: Result<Vec<Sample>, AppError>,
        now: Instant,
    ) {
        if ticket.epoch != self.history_epoch {
            debug!("discarding backfill from a previous session");
            return;
        }

        let samples = match result {
            Ok(samples) => samples,
            Err(error) => {
                self.stats.history_failures = self.stats.history_failures.saturating_add(1);
                let released = self.buffer.release_pending(self.window_seconds);
                warn!(%error, released, "history backfill failed, continuing with live data");
                return;
            }
        };

        self.stats.history_loads = self.stats.history_loads.saturating_add(1);
        if samples.is_empty() {
            self.buffer.release_pending(self.window_seconds);
            info!("history backfill returned no samples");
            return;
        }

        let batch = SampleBatch::stamped(samples);
        self.observe_clock(&batch, true, now);
        let count = batch.samples.len();
        match self
            .buffer
            .merge_batch(batch.samples, self.window_seconds, true)
        {
            MergeOutcome::Merged { retained, pruned } => {
                info!(count, retained, pruned, "history backfill merged");
            }
            MergeOutcome::Overlapping => {
                debug!(count, "history backfill already covered by live data");
            }
            MergeOutcome::Held { .. } | MergeOutcome::Empty => {}
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        if self.station_deadline.is_some_and(|deadline| now >= deadline) {
            self.station_deadline = None;
            self.gps_synced = false;
            info!(
                timeout_ms = self.station_timeout.as_millis() as u64,
                "no station data within timeout, marking station disconnected"
            );
        }

        self.scheduler.tick(
            now,
            &mut self.clock,
            &mut self.buffer,
            self.window_seconds,
            self.lifecycle.is_visible(),
        )
    }

    pub fn on_lifecycle(&mut self, event: LifecycleEvent) -> Vec<CoreAction> {
        match self.lifecycle.apply(event) {
            LifecycleDirective::Suspend => {
                self.connection.set_visible(false);
                let actions = self.suspend();
                self.reason = Some("consumer hidden".to_string());
                actions
            }
            LifecycleDirective::Resume => {
                self.connection.set_visible(true);
                self.connection.reset_attempts();
                self.reason = Some("consumer visible, reconnecting".to_string());
                self.connection
                    .connect()
                    .map(CoreAction::Open)
                    .into_iter()
                    .collect()
            }
            LifecycleDirective::Ignored => Vec::new(),
        }
    }

    pub fn shutdown(&mut self) -> Vec<CoreAction> {
        self.connection.set_should_reconnect(false);
        let actions = self.suspend();
        self.reason = Some("stream stopped".to_string());
        actions
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let connection = self.connection.state();
        StreamSnapshot {
            connection,
            connected: matches!(connection, ConnectionState::Connected),
            connecting: matches!(
                connection,
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
            ),
            visible: self.lifecycle.is_visible(),
            virtual_now: self
                .clock
                .is_initialized()
                .then(|| self.clock.virtual_now()),
            samples: self.buffer.snapshot(),
            window_seconds: self.window_seconds,
            gps_synced: self.gps_synced,
            station_connected: self.station_deadline.is_some(),
            reconnect_attempt: self.connection.attempt(),
            stats: self.stats,
            reason: self.reason.clone(),
        }
    }

    fn on_data_batch(&mut self, batch: SampleBatch, now: Instant) -> Vec<CoreAction> {
        self.stats.batches_received = self.stats.batches_received.saturating_add(1);
        self.stats.samples_received = self
            .stats
            .samples_received
            .saturating_add(batch.samples.len() as u64);
        self.station_deadline = Some(now + self.station_timeout);
        self.gps_synced = batch.gps_synced.unwrap_or(false);

        if batch.samples.is_empty() {
            self.stats.batches_ignored = self.stats.batches_ignored.saturating_add(1);
            debug!("ignoring data batch without samples");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.history_requested {
            self.history_requested = true;
            self.buffer.await_seed();
            actions.push(CoreAction::FetchHistory(HistoryTicket {
                epoch: self.history_epoch,
            }));
        }

        self.observe_clock(&batch, false, now);
        if let MergeOutcome::Held { pending_batches } =
            self.buffer
                .merge_batch(batch.samples, self.window_seconds, false)
        {
            debug!(pending_batches, "live batch parked until backfill lands");
        }
        actions
    }

    fn observe_clock(&mut self, batch: &SampleBatch, is_historical: bool, now: Instant) {
        if let SyncOutcome::Regressed { .. } = self.clock.observe_batch(batch, is_historical, now) {
            self.stats.clock_regressions = self.stats.clock_regressions.saturating_add(1);
        }
    }

    /// Common teardown for background and stop. Anything in flight for the old
    /// epoch is ignored once it completes.
    fn suspend(&mut self) -> Vec<CoreAction> {
        let mut actions = vec![CoreAction::CancelReconnect, CoreAction::CancelHistory];
        if let Some(session) = self.connection.teardown() {
            actions.push(CoreAction::Close(session));
        }
        self.buffer.clear();
        self.clock.reset();
        self.history_epoch = self.history_epoch.wrapping_add(1);
        self.history_requested = false;
        self.station_deadline = None;
        self.gps_synced = false;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::StartStreamArgs;

    fn config() -> StreamConfig {
        StartStreamArgs::default()
            .normalize()
            .expect("defaults should be valid")
    }

    fn data(samples: &[(f64, f64)], gps_synced: bool) -> Vec<u8> {
        let samples = samples
            .iter()
            .map(|(timestamp, value)| format!(r#"{{"timestamp":{timestamp},"value":{value}}}"#))
            .collect::<Vec<_>>()
            .join(",");
        format!(r#"{{"type":"data","samples":[{samples}],"gps_synced":{gps_synced}}}"#)
            .into_bytes()
    }

    fn opened(core: &mut StreamCore) -> SessionId {
        let actions = core.start();
        let Some(CoreAction::Open(session)) = actions.first().cloned() else {
            panic!("start should open a session");
        };
        assert!(core.on_transport_open(session).is_empty());
        session
    }

    fn fetch_ticket(actions: &[CoreAction]) -> Option<HistoryTicket> {
        actions.iter().find_map(|action| match action {
            CoreAction::FetchHistory(ticket) => Some(*ticket),
            _ => None,
        })
    }

    fn timestamps(core: &StreamCore) -> Vec<f64> {
        core.buffer().samples().iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn first_data_message_requests_history_once() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();

        let actions = core.on_message(session, &mut data(&[(10.0, 1.0)], true), now);
        assert!(fetch_ticket(&actions).is_some());
        assert_eq!(core.buffer().pending_batches(), 1);

        let actions = core.on_message(session, &mut data(&[(11.0, 1.0)], true), now);
        assert!(fetch_ticket(&actions).is_none());
        assert_eq!(core.snapshot().stats.batches_received, 2);
        assert!(core.snapshot().gps_synced);
        assert!(core.snapshot().station_connected);
    }

    #[test]
    fn backfill_seeds_buffer_then_pending_live_data_follows() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();

        let actions = core.on_message(session, &mut data(&[(20.0, 2.0), (21.0, 2.0)], false), now);
        let ticket = fetch_ticket(&actions).expect("history requested");
        assert!(core.buffer().is_empty());

        let history = (5..20).map(|t| Sample::new(f64::from(t), 0.0)).collect();
        core.on_history(ticket, Ok(history), now);

        assert_eq!(
            timestamps(&core),
            (5..22).map(f64::from).collect::<Vec<_>>()
        );
        assert_eq!(core.snapshot().virtual_now, Some(21.0));
        assert_eq!(core.snapshot().stats.history_loads, 1);
    }

    #[test]
    fn failed_backfill_releases_pending_batches() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();

        let actions = core.on_message(session, &mut data(&[(20.0, 2.0)], false), now);
        let ticket = fetch_ticket(&actions).expect("history requested");

        core.on_history(
            ticket,
            Err(AppError::Timeout("history backfill".to_string())),
            now,
        );

        assert_eq!(timestamps(&core), vec![20.0]);
        assert_eq!(core.snapshot().stats.history_failures, 1);
        assert_eq!(core.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn parse_failures_are_counted_and_connection_survives() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);

        let mut payload = br#"{"type":"data","samples":["#.to_vec();
        let actions = core.on_message(session, &mut payload, Instant::now());

        assert!(actions.is_empty());
        assert_eq!(core.stats().parse_failures, 1);
        assert_eq!(core.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn empty_batches_are_ignored() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);

        let actions = core.on_message(session, &mut data(&[], true), Instant::now());

        assert!(actions.is_empty());
        assert_eq!(core.stats().batches_ignored, 1);
        assert!(core.buffer().is_empty());
    }

    #[test]
    fn presence_messages_are_forwarded() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);

        let actions = core.on_message(
            session,
            &mut br#"{"type":"stations","stations":[]}"#.to_vec(),
            Instant::now(),
        );

        assert!(matches!(actions.as_slice(), [CoreAction::Forward(_)]));
    }

    #[test]
    fn messages_from_stale_sessions_are_dropped() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        core.on_transport_closed(session, None);

        let actions = core.on_message(session, &mut data(&[(1.0, 1.0)], true), Instant::now());

        assert!(actions.is_empty());
        assert_eq!(core.stats().batches_received, 0);
    }

    #[test]
    fn close_schedules_backoff_and_reconnects() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);

        let actions = core.on_transport_closed(session, Some("reset by peer".to_string()));
        assert!(matches!(
            actions.as_slice(),
            [CoreAction::ScheduleReconnect(delay)] if *delay == Duration::from_millis(1_000)
        ));
        assert!(core.snapshot().connecting);

        let actions = core.on_backoff_elapsed();
        assert!(matches!(actions.as_slice(), [CoreAction::Open(_)]));
        assert_eq!(core.snapshot().reconnect_attempt, 1);
        assert_eq!(core.stats().reconnects, 1);
    }

    #[test]
    fn hiding_clears_state_and_showing_reconnects_from_zero() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();

        let actions = core.on_message(session, &mut data(&[(20.0, 1.0)], true), now);
        let ticket = fetch_ticket(&actions).expect("history requested");
        core.on_history(ticket, Ok(vec![Sample::new(19.0, 1.0)]), now);
        assert!(!core.buffer().is_empty());

        let actions = core.on_lifecycle(LifecycleEvent::Background);
        assert!(actions
            .iter()
            .any(|action| matches!(action, CoreAction::Close(closed) if *closed == session)));
        let snapshot = core.snapshot();
        assert!(snapshot.samples.is_empty());
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert_eq!(snapshot.virtual_now, None);
        assert!(!snapshot.visible);

        // A response for the old epoch must not repopulate the buffer.
        core.on_history(ticket, Ok(vec![Sample::new(30.0, 1.0)]), now);
        assert!(core.buffer().is_empty());

        let actions = core.on_lifecycle(LifecycleEvent::Foreground);
        let Some(CoreAction::Open(resumed)) = actions.first().cloned() else {
            panic!("foreground should reconnect");
        };
        assert_ne!(resumed, session);
        assert_eq!(core.connection_state(), ConnectionState::Connecting);
        assert_eq!(core.snapshot().reconnect_attempt, 0);

        core.on_transport_open(resumed);
        let actions = core.on_message(resumed, &mut data(&[(40.0, 1.0)], true), now);
        assert!(fetch_ticket(&actions).is_some());
    }

    #[test]
    fn hidden_close_does_not_schedule_reconnect() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        core.on_lifecycle(LifecycleEvent::Background);

        assert!(core.on_transport_closed(session, None).is_empty());
        assert!(core.on_backoff_elapsed().is_empty());
    }

    #[test]
    fn station_timeout_clears_station_and_gps_flags() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();
        core.on_message(session, &mut data(&[(1.0, 1.0)], true), now);

        core.on_tick(now + Duration::from_millis(4_900));
        assert!(core.snapshot().station_connected);

        core.on_tick(now + Duration::from_millis(5_000));
        let snapshot = core.snapshot();
        assert!(!snapshot.station_connected);
        assert!(!snapshot.gps_synced);
    }

    #[test]
    fn ticks_extend_virtual_time_after_seeding() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let now = Instant::now();
        let actions = core.on_message(session, &mut data(&[(100.0, 1.0)], true), now);
        let ticket = fetch_ticket(&actions).expect("history requested");
        core.on_history(ticket, Ok(Vec::new()), now);

        let outcome = core.on_tick(now + Duration::from_millis(500));
        assert!(matches!(
            outcome,
            TickOutcome::Advanced { virtual_now, .. } if (virtual_now - 100.5).abs() < 1e-9
        ));
    }

    #[test]
    fn late_tick_deadline_does_not_run_the_clock_ahead() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);
        let base = Instant::now();
        let received = base + Duration::from_millis(105);
        let actions = core.on_message(session, &mut data(&[(100.0, 1.0)], true), received);
        let ticket = fetch_ticket(&actions).expect("history requested");
        core.on_history(ticket, Ok(Vec::new()), received);

        core.on_tick(base + Duration::from_millis(100));
        assert_eq!(core.clock().virtual_now(), 100.0);

        let outcome = core.on_tick(base + Duration::from_millis(200));
        assert!(matches!(
            outcome,
            TickOutcome::Advanced { virtual_now, .. } if (virtual_now - 100.095).abs() < 1e-9
        ));
    }

    #[test]
    fn shutdown_stops_reconnecting() {
        let mut core = StreamCore::new(&config());
        let session = opened(&mut core);

        let actions = core.shutdown();
        assert!(actions
            .iter()
            .any(|action| matches!(action, CoreAction::Close(closed) if *closed == session)));
        assert!(core.on_transport_closed(session, None).is_empty());
        assert!(core.on_backoff_elapsed().is_empty());
        assert_eq!(core.snapshot().reason.as_deref(), Some("stream stopped"));
    }
}

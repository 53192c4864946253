use crate::stream::types::SampleBatch;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    Synced { virtual_now: f64 },
    /// The source clock moved backward; the new value was still accepted.
    Regressed { previous: f64, virtual_now: f64 },
    Unchanged,
}

/// Reconstructs source-side time from batch metadata and local monotonic time.
///
/// `virtual_now` is `-inf` until the first synchronization. Between sync points it is
/// extrapolated linearly from elapsed monotonic time.
#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    virtual_now: f64,
    last_sync: Option<Instant>,
    regressions: u64,
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self {
            virtual_now: f64::NEG_INFINITY,
            last_sync: None,
            regressions: 0,
        }
    }
}

impl ClockSynchronizer {
    pub fn is_initialized(&self) -> bool {
        self.virtual_now.is_finite()
    }

    /// Value at the last synchronization or tick.
    pub fn virtual_now(&self) -> f64 {
        self.virtual_now
    }

    pub fn regressions(&self) -> u64 {
        self.regressions
    }

    pub fn virtual_now_at(&self, now: Instant) -> f64 {
        match self.last_sync {
            Some(synced_at) if self.is_initialized() => {
                self.virtual_now + now.saturating_duration_since(synced_at).as_secs_f64()
            }
            _ => self.virtual_now,
        }
    }

    /// Folds elapsed monotonic time into `virtual_now` and returns the new value.
    /// A `now` older than the last sync point leaves the clock untouched.
    pub fn advance(&mut self, now: Instant) -> f64 {
        if !self.is_initialized() {
            return self.virtual_now;
        }
        if self.last_sync.is_some_and(|synced_at| now < synced_at) {
            return self.virtual_now;
        }
        self.virtual_now = self.virtual_now_at(now);
        self.last_sync = Some(now);
        self.virtual_now
    }

    pub fn observe_batch(
        &mut self,
        batch: &SampleBatch,
        is_historical: bool,
        now: Instant,
    ) -> SyncOutcome {
        if let Some(batch_end) = batch.sync_point() {
            return self.resync(batch_end, now);
        }

        let Some(last_timestamp) = batch.last_timestamp() else {
            return SyncOutcome::Unchanged;
        };
        if is_historical {
            let target = self.virtual_now_at(now).max(last_timestamp);
            return self.resync(target, now);
        }
        self.resync(last_timestamp, now)
    }

    pub fn reset(&mut self) {
        self.virtual_now = f64::NEG_INFINITY;
        self.last_sync = None;
    }

    fn resync(&mut self, value: f64, now: Instant) -> SyncOutcome {
        if !value.is_finite() {
            return SyncOutcome::Unchanged;
        }

        let previous = self.virtual_now_at(now);
        self.virtual_now = value;
        self.last_sync = Some(now);

        if previous.is_finite() && value < previous {
            self.regressions = self.regressions.saturating_add(1);
            info!(
                previous,
                current = value,
                jump_seconds = previous - value,
                "source clock moved backward"
            );
            return SyncOutcome::Regressed {
                previous,
                virtual_now: value,
            };
        }

        SyncOutcome::Synced { virtual_now: value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::Sample;
    use std::time::Duration;

    fn synced_batch(start: f64, count: usize, rate: f64) -> SampleBatch {
        SampleBatch {
            samples: (0..count)
                .map(|index| Sample::new(start + index as f64 / rate, 0.0))
                .collect(),
            sample_rate: Some(rate),
            timestamp_start: Some(start),
            gps_synced: Some(true),
        }
    }

    #[test]
    fn starts_uninitialized() {
        let clock = ClockSynchronizer::default();
        assert!(!clock.is_initialized());
        assert_eq!(clock.virtual_now(), f64::NEG_INFINITY);
        assert_eq!(clock.virtual_now_at(Instant::now()), f64::NEG_INFINITY);
    }

    #[test]
    fn syncs_to_batch_end_from_metadata() {
        let mut clock = ClockSynchronizer::default();
        let outcome = clock.observe_batch(&synced_batch(100.0, 50, 100.0), false, Instant::now());

        assert_eq!(outcome, SyncOutcome::Synced { virtual_now: 100.5 });
        assert_eq!(clock.virtual_now(), 100.5);
    }

    #[test]
    fn extrapolates_with_elapsed_monotonic_time() {
        let mut clock = ClockSynchronizer::default();
        let synced_at = Instant::now();
        clock.observe_batch(&synced_batch(100.0, 100, 100.0), false, synced_at);

        let later = synced_at + Duration::from_millis(250);
        assert!((clock.virtual_now_at(later) - 101.25).abs() < 1e-9);
    }

    #[test]
    fn advance_is_monotonic_between_syncs() {
        let mut clock = ClockSynchronizer::default();
        let start = Instant::now();
        clock.observe_batch(&SampleBatch::stamped(vec![Sample::new(10.0, 0.0)]), false, start);

        let mut previous = clock.virtual_now();
        for step in 1..=20 {
            let value = clock.advance(start + Duration::from_millis(100 * step));
            assert!(value > previous);
            previous = value;
        }
        assert!((previous - 12.0).abs() < 1e-9);
    }

    #[test]
    fn advance_ignores_instants_before_the_last_sync() {
        let mut clock = ClockSynchronizer::default();
        let base = Instant::now();
        let synced_at = base + Duration::from_millis(105);
        clock.observe_batch(&SampleBatch::stamped(vec![Sample::new(100.0, 0.0)]), false, synced_at);

        assert_eq!(clock.advance(base + Duration::from_millis(100)), 100.0);
        let value = clock.advance(base + Duration::from_millis(200));
        assert!((value - 100.095).abs() < 1e-9);
    }

    #[test]
    fn advance_does_nothing_before_first_sync() {
        let mut clock = ClockSynchronizer::default();
        assert_eq!(clock.advance(Instant::now()), f64::NEG_INFINITY);
    }

    #[test]
    fn accepts_and_counts_backward_jumps() {
        let mut clock = ClockSynchronizer::default();
        let now = Instant::now();
        clock.observe_batch(&synced_batch(200.0, 100, 100.0), false, now);

        let outcome = clock.observe_batch(&synced_batch(150.0, 100, 100.0), false, now);

        assert_eq!(
            outcome,
            SyncOutcome::Regressed {
                previous: 201.0,
                virtual_now: 151.0
            }
        );
        assert_eq!(clock.virtual_now(), 151.0);
        assert_eq!(clock.regressions(), 1);
    }

    #[test]
    fn pre_stamped_live_batches_follow_their_last_sample() {
        let mut clock = ClockSynchronizer::default();
        let now = Instant::now();
        clock.observe_batch(
            &SampleBatch::stamped(vec![Sample::new(50.0, 0.0), Sample::new(51.0, 0.0)]),
            false,
            now,
        );
        assert_eq!(clock.virtual_now(), 51.0);
    }

    #[test]
    fn historical_batches_only_raise_virtual_now() {
        let mut clock = ClockSynchronizer::default();
        let now = Instant::now();
        clock.observe_batch(&SampleBatch::stamped(vec![Sample::new(80.0, 0.0)]), false, now);

        let outcome =
            clock.observe_batch(&SampleBatch::stamped(vec![Sample::new(60.0, 0.0)]), true, now);
        assert_eq!(outcome, SyncOutcome::Synced { virtual_now: 80.0 });

        clock.observe_batch(&SampleBatch::stamped(vec![Sample::new(90.0, 0.0)]), true, now);
        assert_eq!(clock.virtual_now(), 90.0);
        assert_eq!(clock.regressions(), 0);
    }

    #[test]
    fn reset_returns_to_uninitialized() {
        let mut clock = ClockSynchronizer::default();
        clock.observe_batch(&synced_batch(10.0, 10, 10.0), false, Instant::now());
        clock.reset();
        assert!(!clock.is_initialized());
    }
}

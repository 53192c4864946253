use crate::stream::buffer::SampleBuffer;
use crate::stream::clock::ClockSynchronizer;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Suspended,
    Advanced { virtual_now: f64, pruned: usize },
}

/// Advances the virtual clock and re-prunes the buffer between network batches.
#[derive(Debug, Clone, Copy)]
pub struct TickScheduler {
    interval: Duration,
}

impl TickScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_tick(buffer: &SampleBuffer, clock: &ClockSynchronizer, visible: bool) -> bool {
        visible && !buffer.is_empty() && clock.is_initialized()
    }

    pub fn tick(
        &self,
        now: Instant,
        clock: &mut ClockSynchronizer,
        buffer: &mut SampleBuffer,
        window_seconds: f64,
        visible: bool,
    ) -> TickOutcome {
        if !Self::should_tick(buffer, clock, visible) {
            return TickOutcome::Suspended;
        }

        let virtual_now = clock.advance(now);
        let pruned = buffer.prune_to(virtual_now, window_seconds);
        TickOutcome::Advanced {
            virtual_now,
            pruned,
        }
    }

    /// Periodic timer for the event loop. Late ticks are skipped, never bunched.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::{Sample, SampleBatch};

    fn seeded(now: Instant) -> (ClockSynchronizer, SampleBuffer) {
        let samples: Vec<Sample> = (0..10).map(|t| Sample::new(f64::from(t), 0.0)).collect();
        let mut clock = ClockSynchronizer::default();
        clock.observe_batch(&SampleBatch::stamped(samples.clone()), false, now);
        let mut buffer = SampleBuffer::new(None);
        buffer.merge_batch(samples, 30.0, false);
        (clock, buffer)
    }

    #[test]
    fn suspends_without_data_or_visibility() {
        let scheduler = TickScheduler::new(Duration::from_millis(100));
        let now = Instant::now();

        let mut clock = ClockSynchronizer::default();
        let mut buffer = SampleBuffer::new(None);
        assert_eq!(
            scheduler.tick(now, &mut clock, &mut buffer, 30.0, true),
            TickOutcome::Suspended
        );

        let (mut clock, mut buffer) = seeded(now);
        assert_eq!(
            scheduler.tick(now, &mut clock, &mut buffer, 30.0, false),
            TickOutcome::Suspended
        );
    }

    #[test]
    fn ticks_prune_against_virtual_now() {
        let scheduler = TickScheduler::new(Duration::from_millis(100));
        let start = Instant::now();
        let (mut clock, mut buffer) = seeded(start);

        // virtual_now 9 -> 12.5, so samples older than 2.5 fall out of a 10 s window.
        let outcome = scheduler.tick(
            start + Duration::from_millis(3_500),
            &mut clock,
            &mut buffer,
            10.0,
            true,
        );

        let TickOutcome::Advanced {
            virtual_now,
            pruned,
        } = outcome
        else {
            panic!("tick should advance a seeded clock");
        };
        assert!((virtual_now - 12.5).abs() < 1e-9);
        assert_eq!(pruned, 3);
        assert_eq!(buffer.samples().first().map(|s| s.timestamp), Some(3.0));
    }

    #[test]
    fn consecutive_ticks_never_move_backward() {
        let scheduler = TickScheduler::new(Duration::from_millis(100));
        let start = Instant::now();
        let (mut clock, mut buffer) = seeded(start);

        let mut previous = clock.virtual_now();
        for step in 1..=10 {
            let now = start + Duration::from_millis(100 * step);
            if let TickOutcome::Advanced { virtual_now, .. } =
                scheduler.tick(now, &mut clock, &mut buffer, 30.0, true)
            {
                assert!(virtual_now > previous);
                previous = virtual_now;
            }
        }
        assert!((previous - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_the_configured_interval() {
        let scheduler = TickScheduler::new(Duration::from_millis(100));
        let mut ticker = scheduler.ticker();
        let started = tokio::time::Instant::now();

        ticker.tick().await;
        ticker.tick().await;
        ticker.tick().await;

        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}

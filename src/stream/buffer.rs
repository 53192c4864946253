use crate::stream::types::{DecimationConfig, Sample};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged { retained: usize, pruned: usize },
    /// Parked until the backfill seeds the buffer.
    Held { pending_batches: usize },
    /// Backfill entirely covered by data already buffered.
    Overlapping,
    Empty,
}

/// Ordered, deduplicated, windowed sample set.
///
/// After every mutation the samples are strictly ascending by timestamp and every
/// retained sample lies within `window_seconds` of the reference time used by
/// that mutation.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
    pending: Vec<Vec<Sample>>,
    latest: Option<f64>,
    awaiting_seed: bool,
    decimation: Option<DecimationConfig>,
    /// Shared copy of `samples`, rebuilt lazily after a mutation.
    shared: OnceLock<Arc<[Sample]>>,
}

impl SampleBuffer {
    pub fn new(decimation: Option<DecimationConfig>) -> Self {
        Self {
            decimation,
            ..Self::default()
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Latest known data time (the merge watermark).
    pub fn latest_timestamp(&self) -> Option<f64> {
        self.latest
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    pub fn is_awaiting_seed(&self) -> bool {
        self.awaiting_seed
    }

    pub fn snapshot(&self) -> Arc<[Sample]> {
        Arc::clone(
            self.shared
                .get_or_init(|| Arc::from(self.samples.as_slice())),
        )
    }

    /// Marks a backfill as outstanding: while the buffer is empty, live batches are parked.
    pub fn await_seed(&mut self) {
        if self.samples.is_empty() {
            self.awaiting_seed = true;
        }
    }

    pub fn merge_batch(
        &mut self,
        incoming: Vec<Sample>,
        window_seconds: f64,
        is_historical: bool,
    ) -> MergeOutcome {
        let incoming = normalize_incoming(incoming);
        if incoming.is_empty() {
            return MergeOutcome::Empty;
        }

        if is_historical {
            let outcome = self.merge_historical(incoming, window_seconds);
            self.awaiting_seed = false;
            self.flush_pending(window_seconds);
            return outcome;
        }

        if self.awaiting_seed && self.samples.is_empty() {
            return self.hold(incoming, window_seconds);
        }

        self.merge_live(incoming, window_seconds)
    }

    /// Gives up waiting for a backfill and merges whatever was parked.
    pub fn release_pending(&mut self, window_seconds: f64) -> usize {
        self.awaiting_seed = false;
        self.flush_pending(window_seconds)
    }

    /// Drops samples older than the window relative to `reference`.
    pub fn prune_to(&mut self, reference: f64, window_seconds: f64) -> usize {
        if !reference.is_finite() {
            return 0;
        }
        let cut = self
            .samples
            .partition_point(|sample| reference - sample.timestamp > window_seconds);
        if cut > 0 {
            self.samples.drain(..cut);
            self.shared.take();
        }
        cut
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.shared.take();
        self.pending.clear();
        self.latest = None;
        self.awaiting_seed = false;
    }

    fn merge_live(&mut self, incoming: Vec<Sample>, window_seconds: f64) -> MergeOutcome {
        let Some(reference) = incoming.last().map(|sample| sample.timestamp) else {
            return MergeOutcome::Empty;
        };
        let incoming = match self.decimation {
            Some(decimation) => decimate(incoming, decimation),
            None => incoming,
        };

        self.replace_and_sort(incoming);
        self.latest = Some(reference);
        let pruned = self.prune_to(reference, window_seconds);
        MergeOutcome::Merged {
            retained: self.samples.len(),
            pruned,
        }
    }

    fn merge_historical(&mut self, mut incoming: Vec<Sample>, window_seconds: f64) -> MergeOutcome {
        if let Some(newest) = self.samples.last().map(|sample| sample.timestamp) {
            let first_new = incoming.partition_point(|sample| sample.timestamp <= newest);
            if first_new == incoming.len() {
                debug!(
                    incoming = incoming.len(),
                    "backfill fully overlaps buffered data, ignoring"
                );
                return MergeOutcome::Overlapping;
            }
            incoming.drain(..first_new);
        }

        let Some(last) = incoming.last().map(|sample| sample.timestamp) else {
            return MergeOutcome::Empty;
        };
        self.replace_and_sort(incoming);
        let reference = self.latest.map_or(last, |latest| latest.max(last));
        self.latest = Some(reference);
        let pruned = self.prune_to(reference, window_seconds);
        MergeOutcome::Merged {
            retained: self.samples.len(),
            pruned,
        }
    }

    fn hold(&mut self, incoming: Vec<Sample>, window_seconds: f64) -> MergeOutcome {
        let newest = incoming.last().map(|sample| sample.timestamp);
        self.pending.push(incoming);
        if let Some(newest) = newest {
            self.pending.retain(|batch| {
                batch
                    .last()
                    .is_some_and(|sample| newest - sample.timestamp <= window_seconds)
            });
        }
        debug!(
            pending_batches = self.pending.len(),
            "buffer empty, holding batch until backfill arrives"
        );
        MergeOutcome::Held {
            pending_batches: self.pending.len(),
        }
    }

    fn flush_pending(&mut self, window_seconds: f64) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let flushed = pending.len();
        for batch in pending {
            self.merge_live(batch, window_seconds);
        }
        flushed
    }

    fn replace_and_sort(&mut self, incoming: Vec<Sample>) {
        let incoming_keys: HashSet<u64> = incoming
            .iter()
            .map(|sample| timestamp_key(sample.timestamp))
            .collect();
        self.samples
            .retain(|sample| !incoming_keys.contains(&timestamp_key(sample.timestamp)));
        self.samples.extend(incoming);
        self.samples
            .sort_by(|left, right| left.timestamp.total_cmp(&right.timestamp));
        self.shared.take();
    }
}

/// Keeps every `every_nth` sample plus any sample at or above the spike threshold.
pub fn decimate(samples: Vec<Sample>, decimation: DecimationConfig) -> Vec<Sample> {
    if decimation.every_nth <= 1 {
        return samples;
    }
    samples
        .into_iter()
        .enumerate()
        .filter(|(index, sample)| {
            index % decimation.every_nth == 0 || sample.value.abs() >= decimation.spike_threshold
        })
        .map(|(_, sample)| sample)
        .collect()
}

/// Sorts a batch and collapses duplicate timestamps, the later sample winning.
fn normalize_incoming(mut samples: Vec<Sample>) -> Vec<Sample> {
    samples.retain(|sample| sample.timestamp.is_finite());
    samples.sort_by(|left, right| left.timestamp.total_cmp(&right.timestamp));
    let mut normalized: Vec<Sample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match normalized.last_mut() {
            Some(last) if timestamp_key(last.timestamp) == timestamp_key(sample.timestamp) => {
                *last = sample;
            }
            _ => normalized.push(sample),
        }
    }
    normalized
}

fn timestamp_key(timestamp: f64) -> u64 {
    // -0.0 and 0.0 are the same instant
    if timestamp == 0.0 {
        0
    } else {
        timestamp.to_bits()
    }
}

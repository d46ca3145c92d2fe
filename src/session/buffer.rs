//! Time-ordered sample storage shared by the recorders

use crate::types::{Timestamp, Timestamped};

/// Samples kept in non-decreasing timestamp order
///
/// Out-of-order arrivals are inserted at their sorted position. Equal
/// timestamps keep arrival order.
#[derive(Debug, Clone)]
pub struct SampleBuffer<T> {
    samples: Vec<Timestamped<T>>,
}

impl<T> Default for SampleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SampleBuffer<T> {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Insert a sample; non-finite timestamps are rejected
    pub fn insert(&mut self, timestamp: Timestamp, value: T) -> bool {
        if !timestamp.is_finite() {
            return false;
        }
        let idx = self.samples.partition_point(|s| s.timestamp <= timestamp);
        self.samples.insert(idx, Timestamped::new(timestamp, value));
        true
    }

    /// Samples with `start <= timestamp <= stop`
    pub fn range(&self, start: Timestamp, stop: Timestamp) -> &[Timestamped<T>] {
        if !(start <= stop) {
            return &[];
        }
        let lo = self.samples.partition_point(|s| s.timestamp < start);
        let hi = self.samples.partition_point(|s| s.timestamp <= stop);
        &self.samples[lo..hi.max(lo)]
    }

    /// All samples
    pub fn as_slice(&self) -> &[Timestamped<T>] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Earliest and latest timestamp
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        }
    }

    /// Remove and return every sample
    pub fn take(&mut self) -> Vec<Timestamped<T>> {
        std::mem::take(&mut self.samples)
    }

    /// Remove every sample
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl<T: Clone> SampleBuffer<T> {
    /// Copy of the samples with `start <= timestamp <= stop`
    pub fn window(&self, start: Timestamp, stop: Timestamp) -> Vec<Timestamped<T>> {
        self.range(start, stop).to_vec()
    }
}

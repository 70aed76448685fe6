//! Bounded sensor ring buffers.
//!
//! The platform delivers sensor callbacks on a thread the pipeline does not
//! control, at rates it does not control. This module absorbs that stream:
//! one bounded ring buffer per sensor kind, append-only from the producer's
//! point of view, with the oldest sample dropped (and counted) when a buffer
//! fills. Submission never blocks and never fails; overflow degrades window
//! quality for the affected steps, nothing more.

use crate::{SensorKind, SensorSample};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Configuration for the sensor sampler.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Ring capacity per sensor kind, in samples. The default holds roughly
    /// five seconds of data at a 200 Hz delivery rate.
    pub capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig { capacity: 1024 }
    }
}

/// Per-kind bounded sample buffers with order enforcement.
///
/// Timestamps must be strictly increasing within each sensor kind; a sample
/// that runs backwards against its own stream is rejected and counted rather
/// than corrupting window extraction downstream.
#[derive(Debug)]
pub struct SensorSampler {
    buffers: [VecDeque<SensorSample>; 3],
    capacity: usize,
    last_timestamp: [Option<i64>; 3],
    overflow_count: u64,
    rejected_count: u64,
}

impl SensorSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let capacity = config.capacity.max(1);
        SensorSampler {
            buffers: [
                VecDeque::with_capacity(capacity),
                VecDeque::with_capacity(capacity),
                VecDeque::with_capacity(capacity),
            ],
            capacity,
            last_timestamp: [None; 3],
            overflow_count: 0,
            rejected_count: 0,
        }
    }

    /// Append one sample to its kind's ring buffer.
    ///
    /// Never blocks. On overflow the oldest sample of that kind is dropped
    /// and [`overflow_count`](Self::overflow_count) is incremented. Samples
    /// whose timestamp does not advance their stream are dropped and counted
    /// in [`rejected_count`](Self::rejected_count).
    pub fn submit(&mut self, sample: SensorSample) {
        let idx = sample.kind.buffer_index();
        if let Some(last) = self.last_timestamp[idx]
            && sample.timestamp_ns <= last
        {
            self.rejected_count += 1;
            log::debug!(
                "dropping non-monotonic {} sample: {} ns <= {} ns",
                sample.kind,
                sample.timestamp_ns,
                last
            );
            return;
        }
        if self.buffers[idx].len() == self.capacity {
            self.buffers[idx].pop_front();
            self.overflow_count += 1;
        }
        self.last_timestamp[idx] = Some(sample.timestamp_ns);
        self.buffers[idx].push_back(sample);
    }

    /// Copy out the samples of one kind inside `[start_ns, end_ns]`, oldest
    /// first. Non-destructive: step windows may overlap, so extraction must
    /// not consume the buffer.
    pub fn window(&self, kind: SensorKind, start_ns: i64, end_ns: i64) -> Vec<SensorSample> {
        self.buffers[kind.buffer_index()]
            .iter()
            .filter(|s| s.timestamp_ns >= start_ns && s.timestamp_ns <= end_ns)
            .copied()
            .collect()
    }

    /// Drain every buffered sample with a timestamp at or after `since_ns`,
    /// merged across kinds in timestamp order. One-shot: drained samples are
    /// removed. This is the export path for session recording; the estimation
    /// pipeline reads non-destructively through [`window`](Self::window).
    pub fn drain_since(&mut self, since_ns: i64) -> impl Iterator<Item = SensorSample> + use<> {
        let mut drained: Vec<SensorSample> = Vec::new();
        for buffer in self.buffers.iter_mut() {
            while let Some(front) = buffer.front() {
                if front.timestamp_ns >= since_ns {
                    break;
                }
                buffer.pop_front();
            }
            drained.extend(buffer.drain(..));
        }
        drained.sort_by_key(|s| s.timestamp_ns);
        drained.into_iter()
    }

    /// Number of buffered samples of the given kind.
    pub fn len(&self, kind: SensorKind) -> usize {
        self.buffers[kind.buffer_index()].len()
    }

    /// True when no samples of any kind are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.is_empty())
    }

    /// Timestamp of the newest sample of the given kind, if any.
    pub fn latest_timestamp(&self, kind: SensorKind) -> Option<i64> {
        self.last_timestamp[kind.buffer_index()]
    }

    /// Samples dropped to make room since construction or the last reset.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Samples rejected for running backwards in time.
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }

    /// Clear all buffers and ordering state. Counters are preserved; they are
    /// session diagnostics, not buffer contents.
    pub fn reset(&mut self) {
        for buffer in self.buffers.iter_mut() {
            buffer.clear();
        }
        self.last_timestamp = [None; 3];
    }
}

//! Bounded in-memory tier of one channel.
//!
//! Holds the most recent window of samples `[first_seq, first_seq + len)`.
//! Eviction only happens from the front, and only for samples the caller has
//! already made durable in the archive.

use bridge_core::Sample;
use std::collections::VecDeque;
use std::ops::Range;

/// Fixed-capacity window over a channel's newest samples.
#[derive(Debug)]
pub struct SampleRing {
    samples: VecDeque<Sample>,
    capacity: usize,
    /// Sequence number of `samples[0]`
    first_seq: u64,
}

impl SampleRing {
    /// Create an empty ring starting at sequence 0.
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Create an empty ring whose next sample will be `first_seq`.
    ///
    /// Used when a channel is reopened from the archive after restart.
    pub fn starting_at(capacity: usize, first_seq: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            first_seq,
        }
    }

    /// Maximum number of held samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of held samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if nothing is held
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True if the next push needs an eviction first
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Sequence number of the oldest held sample
    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    /// Sequence number the next pushed sample must carry
    pub fn next_seq(&self) -> u64 {
        self.first_seq + self.samples.len() as u64
    }

    /// Held sequence range
    pub fn span(&self) -> Range<u64> {
        self.first_seq..self.next_seq()
    }

    /// Append a sample. The caller guarantees `sample.seq == next_seq()` and
    /// that the ring is not full.
    pub fn push(&mut self, sample: Sample) {
        debug_assert_eq!(sample.seq, self.next_seq());
        debug_assert!(!self.is_full());
        self.samples.push_back(sample);
    }

    /// Drop samples from the front until `first_seq() >= upto` (or the ring is empty).
    pub fn evict_until(&mut self, upto: u64) -> usize {
        let mut evicted = 0;
        while self.first_seq < upto && self.samples.pop_front().is_some() {
            self.first_seq += 1;
            evicted += 1;
        }
        evicted
    }

    /// Evict everything below `upto` and give the freed memory back.
    pub fn release(&mut self, upto: u64) -> usize {
        let evicted = self.evict_until(upto);
        self.samples.shrink_to_fit();
        evicted
    }

    /// Clone the held samples intersecting `range`, in sequence order.
    pub fn read(&self, range: Range<u64>) -> Vec<Sample> {
        let start = range.start.max(self.first_seq);
        let end = range.end.min(self.next_seq());
        if start >= end {
            return Vec::new();
        }
        let lo = (start - self.first_seq) as usize;
        let hi = (end - self.first_seq) as usize;
        self.samples.range(lo..hi).cloned().collect()
    }
}

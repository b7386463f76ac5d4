//! Rolling statistics window.

use std::{collections::VecDeque, time::Duration};

use {serde::Serialize, tokio::time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Timeout,
    Reject,
}

/// Totals across the live buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
}

impl WindowCounts {
    /// Calls that reached the dependency. Rejects are not calls.
    pub fn calls(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    pub fn failure_percentage(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 0.0;
        }
        (self.failures + self.timeouts) as f64 * 100.0 / calls as f64
    }

    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::Reject => self.rejects += 1,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejects += other.rejects;
    }
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    counts: WindowCounts,
}

/// A window of `len` split into fixed-length buckets that expire as time
/// moves on.
#[derive(Debug)]
pub struct RollingWindow {
    len: Duration,
    bucket_len: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(len: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        let bucket_len = (len / buckets).max(Duration::from_millis(1));
        Self {
            len,
            bucket_len,
            buckets: VecDeque::with_capacity(buckets as usize + 1),
        }
    }

    pub(crate) fn record(&mut self, now: Instant, outcome: Outcome) {
        self.evict(now);
        let needs_bucket = self
            .buckets
            .back()
            .is_none_or(|b| now.duration_since(b.start) >= self.bucket_len);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                start: now,
                counts: WindowCounts::default(),
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.counts.add(outcome);
        }
    }

    pub fn counts(&mut self, now: Instant) -> WindowCounts {
        self.evict(now);
        let mut total = WindowCounts::default();
        for bucket in &self.buckets {
            total.merge(&bucket.counts);
        }
        total
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    fn evict(&mut self, now: Instant) {
        while self
            .buckets
            .front()
            .is_some_and(|b| now.duration_since(b.start) >= self.len)
        {
            self.buckets.pop_front();
        }
    }
}

//! Sliding-window counter built from fixed-width time buckets
//!
//! The window is split into ten buckets. Events increment a per-label counter
//! in the bucket covering their timestamp; eviction drops whole buckets from
//! the front of the queue, so expiring old traffic never rescans events.

use crate::events::Timestamp;
use chrono::{Duration, DurationRound, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};

/// Number of buckets a window is divided into
pub const BUCKETS_PER_WINDOW: i32 = 10;

/// Counters for one bucket-width slice of time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Slice start, truncated to the owning aggregator's bucket width
    start: Timestamp,
    counts: HashMap<String, u64>,
    total: u64,
}

impl Bucket {
    fn new(start: Timestamp) -> Self {
        Self {
            start,
            counts: HashMap::new(),
            total: 0,
        }
    }

    /// Increment `label` and return its new count in this bucket
    fn increment(&mut self, label: &str) -> u64 {
        self.total += 1;
        let count = self.counts.entry(label.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.counts
    }

    /// Sum of all label counts in this bucket
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Bucketed sliding-window counter keyed by label
///
/// Not thread-safe by intent: each reporter or alert owns exactly one instance
/// and mutates it from a single thread.
#[derive(Debug, Clone)]
pub struct WindowedAggregator {
    window: Duration,
    bucket_width: Duration,
    /// Ordered by `start`, oldest first
    buckets: VecDeque<Bucket>,
    running_total: u64,
}

impl WindowedAggregator {
    /// Create an aggregator covering the trailing `window`
    ///
    /// # Examples
    ///
    /// ```
    /// use trafficwatch::aggregator::WindowedAggregator;
    /// use chrono::{Duration, Utc};
    ///
    /// let mut aggregator = WindowedAggregator::new(Duration::seconds(10));
    /// aggregator.record("/pages", Utc::now());
    /// assert_eq!(aggregator.running_total(), 1);
    /// ```
    pub fn new(window: Duration) -> Self {
        let bucket_width = (window / BUCKETS_PER_WINDOW).max(Duration::nanoseconds(1));
        Self {
            window,
            bucket_width,
            buckets: VecDeque::with_capacity(BUCKETS_PER_WINDOW as usize + 1),
            running_total: 0,
        }
    }

    /// Convenience constructor for std durations coming from configuration
    pub fn from_std(window: std::time::Duration) -> Self {
        Self::new(Duration::from_std(window).unwrap_or(Duration::MAX))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Number of buckets currently retained
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Retained buckets, oldest first
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// Record one hit for `label` at `timestamp`, using the wall clock as "now"
    ///
    /// Returns the label's updated count in the bucket it landed in, or 0 when
    /// the timestamp was already outside the window and the hit was discarded.
    pub fn record(&mut self, label: &str, timestamp: Timestamp) -> u64 {
        self.record_at(label, timestamp, Utc::now())
    }

    /// Same as [`record`](Self::record) with an explicit reference time
    pub fn record_at(&mut self, label: &str, timestamp: Timestamp, now: Timestamp) -> u64 {
        self.evict(now);

        if let Some(cutoff) = now.checked_sub_signed(self.window) {
            if timestamp < cutoff {
                debug!(
                    "Discarding stale hit for '{}' at {} (cutoff {})",
                    label, timestamp, cutoff
                );
                return 0;
            }
        }

        let start = match self.truncate(timestamp) {
            Some(start) => start,
            None => {
                debug!("Discarding hit for '{}': timestamp {} out of range", label, timestamp);
                return 0;
            }
        };

        // Input is mostly in order, so the matching bucket is usually the last one
        let last_start = self.buckets.back().map(|bucket| bucket.start);
        let index = match last_start {
            Some(last) if last == start => self.buckets.len() - 1,
            Some(last) if last > start => {
                match self.buckets.binary_search_by(|bucket| bucket.start.cmp(&start)) {
                    Ok(i) => i,
                    Err(i) => {
                        self.buckets.insert(i, Bucket::new(start));
                        i
                    }
                }
            }
            _ => {
                self.buckets.push_back(Bucket::new(start));
                self.buckets.len() - 1
            }
        };

        self.running_total += 1;
        self.buckets[index].increment(label)
    }

    /// Drop every bucket whose whole slice lies before `now - window`
    ///
    /// Returns the number of hits removed. Runs in time proportional to the
    /// number of stale buckets.
    ///
    /// A bucket straddling the cutoff is kept whole, so retained counts may
    /// overstate the window by up to one bucket width of hits.
    pub fn evict(&mut self, now: Timestamp) -> u64 {
        let cutoff = match now
            .checked_sub_signed(self.window)
            .and_then(|cutoff| self.truncate(cutoff))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let mut removed = 0;
        while let Some(front) = self.buckets.front() {
            if front.start >= cutoff {
                break;
            }
            if let Some(bucket) = self.buckets.pop_front() {
                removed += bucket.total;
            }
        }
        self.running_total -= removed;
        removed
    }

    /// Point-in-time copy of label totals across all retained buckets
    pub fn totals(&self) -> HashMap<String, u64> {
        let mut totals = HashMap::new();
        for bucket in &self.buckets {
            for (label, count) in &bucket.counts {
                *totals.entry(label.clone()).or_insert(0) += count;
            }
        }
        totals
    }

    /// Aggregate count across all labels and buckets
    pub fn running_total(&self) -> u64 {
        self.running_total
    }

    fn truncate(&self, timestamp: Timestamp) -> Option<Timestamp> {
        timestamp.duration_trunc(self.bucket_width).ok()
    }
}

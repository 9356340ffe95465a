/// Bucketed sliding-window counters
pub mod windowed_aggregator;

pub use windowed_aggregator::{Bucket, WindowedAggregator, BUCKETS_PER_WINDOW};

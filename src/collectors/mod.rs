/// Ordered fan-out of events to bounded subscriber streams
pub mod distributor;

/// Polling tailer for a growing log file
pub mod file_tailer;

pub use distributor::{EventDistributor, Subscriptions, DEFAULT_BUFFER_CAPACITY};
pub use file_tailer::{FileTailer, LogTail, ParseFailurePolicy, TailableFile, TailerConfig};

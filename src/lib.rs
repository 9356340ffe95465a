/// Error types for every pipeline stage
pub mod error;

/// Parsed log events
pub mod events;

/// Log line parsing capability and the Common Log Format adapter
pub mod parser;

/// Bucketed sliding-window counters
pub mod aggregator;

/// File tailing and event fan-out
pub mod collectors;

/// Per-section traffic statistics
pub mod reporter;

/// Traffic volume alerting
pub mod alerts;

/// Background thread helpers
pub mod worker;

/// Consume-and-tick loop for reporters and alerts
pub mod runner;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{ConfigError, DistributorError, ParseError, SectionError, TailerError, TaskError};
pub use events::{LogEvent, Timestamp};

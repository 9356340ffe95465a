//! Core event types for the traffic monitor
//!
//! A `LogEvent` is what the parser produces from one access-log line. It carries
//! only what the windowed statistics need: when the request happened and which
//! resource it hit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// One parsed request from the tailed log file
///
/// Events are immutable once produced; every subscriber receives its own clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    /// When the request was served, as recorded in the log line
    pub occurred_at: Timestamp,
    /// Requested resource, e.g. `/pages/create?id=1`
    pub resource_path: String,
}

impl LogEvent {
    pub fn new(occurred_at: Timestamp, resource_path: impl Into<String>) -> Self {
        Self {
            occurred_at,
            resource_path: resource_path.into(),
        }
    }

    pub fn occurred_at(&self) -> Timestamp {
        self.occurred_at
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }
}

use crate::aggregator::WindowedAggregator;
use crate::events::{LogEvent, Timestamp};
use crate::runner::WindowTask;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The single label every hit is counted under
pub const ALERT_LABEL: &str = "total";

/// Housekeeping ticks per alert window
const TICKS_PER_WINDOW: u32 = 100;

/// Direction of an alert state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTransition {
    Triggered,
    Recovered,
}

impl fmt::Display for AlertTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertTransition::Triggered => write!(f, "triggered"),
            AlertTransition::Recovered => write!(f, "recovered"),
        }
    }
}

/// Emitted once per state change of a [`ThresholdAlert`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_name: String,
    pub transition: AlertTransition,
    /// Hits in the window when the transition happened
    pub observed_total: u64,
    pub limit: u64,
    pub at: Timestamp,
}

impl fmt::Display for AlertNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.at.format("%Y-%m-%d %H:%M:%S");
        match self.transition {
            AlertTransition::Triggered => write!(
                f,
                "{} generated an alert - hits = {} (limit {}), triggered at {}",
                self.alert_name, self.observed_total, self.limit, at
            ),
            AlertTransition::Recovered => write!(
                f,
                "{} recovered - hits = {} (limit {}), recovered at {}",
                self.alert_name, self.observed_total, self.limit, at
            ),
        }
    }
}

/// Traffic volume alert with trigger/recovery hysteresis
///
/// Counts every event in a sliding window. The alert becomes active when the
/// count reaches `limit` and recovers once eviction brings it back below.
/// Notifications fire only on those two transitions.
///
/// State is changed only by [`record_at`](Self::record_at) and
/// [`housekeeping`](Self::housekeeping), which must be called from a single
/// thread.
#[derive(Debug, Clone)]
pub struct ThresholdAlert {
    name: String,
    window: Duration,
    limit: u64,
    active: bool,
    aggregator: WindowedAggregator,
}

impl ThresholdAlert {
    /// Create an inactive alert
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in notifications and log lines
    /// * `window` - Trailing duration over which hits are counted
    /// * `limit` - Hit count at which the alert triggers
    pub fn new(name: impl Into<String>, window: Duration, limit: u64) -> Self {
        Self {
            name: name.into(),
            window,
            limit,
            active: false,
            aggregator: WindowedAggregator::from_std(window),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Hits currently counted in the window
    pub fn running_total(&self) -> u64 {
        self.aggregator.running_total()
    }

    /// Count one hit and trigger if the limit is reached
    pub fn record(&mut self, event: &LogEvent) -> Option<AlertNotification> {
        self.record_at(event.occurred_at(), Utc::now())
    }

    /// Count one hit at `timestamp`, evaluating against `now`
    ///
    /// # Returns
    ///
    /// A `Triggered` notification if this hit moved the alert from inactive to
    /// active, `None` otherwise.
    pub fn record_at(&mut self, timestamp: Timestamp, now: Timestamp) -> Option<AlertNotification> {
        self.aggregator.record_at(ALERT_LABEL, timestamp, now);

        let total = self.aggregator.running_total();
        if !self.active && total >= self.limit {
            self.active = true;
            warn!("{}: {} hits reached limit {}", self.name, total, self.limit);
            return Some(self.notification(AlertTransition::Triggered, now));
        }
        None
    }

    /// Evict expired hits and recover if the count fell below the limit
    pub fn housekeeping(&mut self, now: Timestamp) -> Option<AlertNotification> {
        self.aggregator.evict(now);

        let total = self.aggregator.running_total();
        if self.active && total < self.limit {
            self.active = false;
            info!("{}: {} hits, back below limit {}", self.name, total, self.limit);
            return Some(self.notification(AlertTransition::Recovered, now));
        }
        None
    }

    fn notification(&self, transition: AlertTransition, at: Timestamp) -> AlertNotification {
        AlertNotification {
            alert_name: self.name.clone(),
            transition,
            observed_total: self.aggregator.running_total(),
            limit: self.limit,
            at,
        }
    }
}

impl WindowTask for ThresholdAlert {
    type Output = AlertNotification;

    fn name(&self) -> &str {
        &self.name
    }

    /// A hundredth of the window, so a drop in traffic is noticed well before
    /// the next reporter snapshot
    fn tick_interval(&self) -> Duration {
        (self.window / TICKS_PER_WINDOW).max(Duration::from_millis(1))
    }

    fn on_event(&mut self, event: &LogEvent) -> Option<AlertNotification> {
        self.record(event)
    }

    fn on_tick(&mut self, now: Timestamp) -> Option<AlertNotification> {
        self.housekeeping(now)
    }
}

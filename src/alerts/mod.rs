/// Volume threshold alert with trigger/recovery notifications
pub mod threshold_alert;

pub use threshold_alert::{AlertNotification, AlertTransition, ThresholdAlert, ALERT_LABEL};

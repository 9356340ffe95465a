//! Log line parsing
//!
//! The tailer only depends on the [`LogParser`] capability. [`CommonLogParser`]
//! is the adapter used by the binary for NCSA Common/Combined Log Format files.

use crate::error::ParseError;
use crate::events::LogEvent;
use chrono::{DateTime, Utc};

/// Time layout inside the brackets of a Common Log Format line
const CLF_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Capability that turns one raw log line into an event
#[cfg_attr(test, mockall::automock)]
pub trait LogParser: Send + Sync {
    /// Parse a single line (without its trailing newline)
    fn parse(&self, line: &str) -> Result<LogEvent, ParseError>;
}

/// Parser for Common Log Format and its Combined variant
///
/// Accepts lines shaped like
/// `127.0.0.1 - james [09/May/2018:16:00:39 +0000] "GET /report HTTP/1.0" 200 123`
/// and ignores anything after the request line (status, size, referer, agent).
#[derive(Debug, Default, Clone, Copy)]
pub struct CommonLogParser;

impl CommonLogParser {
    pub fn new() -> Self {
        Self
    }
}

impl LogParser for CommonLogParser {
    fn parse(&self, line: &str) -> Result<LogEvent, ParseError> {
        let line = line.trim();
        let malformed = || ParseError::Malformed(line.to_string());

        let open = line.find('[').ok_or_else(malformed)?;
        // host, ident and authuser precede the timestamp
        if line[..open].split_whitespace().count() < 3 {
            return Err(malformed());
        }
        let close = line[open..]
            .find(']')
            .map(|i| open + i)
            .ok_or_else(malformed)?;

        let raw_time = &line[open + 1..close];
        let occurred_at = DateTime::parse_from_str(raw_time, CLF_TIME_FORMAT)
            .map_err(|source| ParseError::InvalidTimestamp {
                value: raw_time.to_string(),
                source,
            })?
            .with_timezone(&Utc);

        let rest = &line[close + 1..];
        let missing_request = || ParseError::MissingRequest(line.to_string());
        let start = rest.find('"').ok_or_else(missing_request)? + 1;
        let end = rest[start..]
            .find('"')
            .map(|i| start + i)
            .ok_or_else(missing_request)?;

        let mut request = rest[start..end].split_whitespace();
        let _method = request.next().ok_or_else(missing_request)?;
        let resource = request.next().ok_or_else(missing_request)?;

        Ok(LogEvent::new(occurred_at, resource))
    }
}

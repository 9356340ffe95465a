use crate::aggregator::WindowedAggregator;
use crate::error::SectionError;
use crate::events::{LogEvent, Timestamp};
use crate::runner::WindowTask;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Base used to resolve resource paths, which arrive without scheme or host
const SECTION_BASE: &str = "http://localhost/";

/// Map a resource path to its section
///
/// `/pages/create` becomes `/pages`, `/pages/create/lol.php` becomes
/// `/pages/create`, while `/pages` and `/` are their own sections. Query
/// strings and fragments are ignored. Relative paths are taken as written:
/// dot segments are not resolved and nothing is percent-encoded, so
/// `/a/../b/c` maps to `/a/../b`.
pub fn parse_section(resource_path: &str) -> Result<String, SectionError> {
    let invalid = |source| SectionError::InvalidPath {
        path: resource_path.to_string(),
        source,
    };
    let resolved = Url::parse(SECTION_BASE)
        .and_then(|base| base.join(resource_path))
        .map_err(invalid)?;

    let path = match Url::parse(resource_path) {
        // Absolute-form request target, e.g. `http://host/pages/create`
        Ok(_) => resolved.path(),
        Err(_) => resource_path
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or(resource_path),
    };

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }

    let section = match trimmed.rfind('/') {
        Some(index) if index > 1 => &trimmed[..index],
        _ => trimmed,
    };
    Ok(section.to_string())
}

/// Busiest section in a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotSection {
    pub section: String,
    pub hits: u64,
}

/// Section counts for the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSnapshot {
    pub taken_at: Timestamp,
    pub total_hits: u64,
    /// Sorted by section label
    pub sections: BTreeMap<String, u64>,
    pub hot_section: Option<HotSection>,
}

impl fmt::Display for SectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} hit(s) in window",
            self.taken_at.format("%Y-%m-%d %H:%M:%S"),
            self.total_hits
        )?;
        match &self.hot_section {
            Some(hot) => write!(f, ", hot section {} ({} hits)", hot.section, hot.hits)?,
            None => write!(f, ", no traffic")?,
        }
        for (section, hits) in &self.sections {
            write!(f, "\n  {:<40} {}", section, hits)?;
        }
        Ok(())
    }
}

/// Pick the section with the most hits; ties go to the smallest label
fn select_hot_section(sections: &BTreeMap<String, u64>) -> Option<HotSection> {
    let mut hot: Option<(&String, u64)> = None;
    for (section, &hits) in sections {
        if hits > 0 && hot.map_or(true, |(_, best)| hits > best) {
            hot = Some((section, hits));
        }
    }
    hot.map(|(section, hits)| HotSection {
        section: section.clone(),
        hits,
    })
}

/// Per-section traffic statistics over a sliding window
///
/// Owns its aggregator; driven from a single thread by a
/// [`TaskRunner`](crate::runner::TaskRunner), which emits a snapshot once per
/// window.
#[derive(Debug, Clone)]
pub struct SectionReporter {
    window: Duration,
    aggregator: WindowedAggregator,
}

impl SectionReporter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            aggregator: WindowedAggregator::from_std(window),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn aggregator(&self) -> &WindowedAggregator {
        &self.aggregator
    }

    /// Count `event` against its section
    ///
    /// Returns the section's count in the bucket the event landed in, 0 if the
    /// event was too old to count.
    pub fn add(&mut self, event: &LogEvent) -> Result<u64, SectionError> {
        self.add_at(event, Utc::now())
    }

    pub fn add_at(&mut self, event: &LogEvent, now: Timestamp) -> Result<u64, SectionError> {
        let section = parse_section(event.resource_path())?;
        Ok(self.aggregator.record_at(&section, event.occurred_at(), now))
    }

    /// Busiest section among the retained buckets, `None` when there is no traffic
    pub fn hot_section(&self) -> Option<HotSection> {
        let sections: BTreeMap<String, u64> = self.aggregator.totals().into_iter().collect();
        select_hot_section(&sections)
    }

    /// Drop buckets that fell out of the window
    pub fn evict(&mut self, now: Timestamp) -> u64 {
        self.aggregator.evict(now)
    }

    pub fn snapshot(&mut self) -> SectionSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Evict, then capture the remaining counts
    pub fn snapshot_at(&mut self, now: Timestamp) -> SectionSnapshot {
        self.aggregator.evict(now);
        let sections: BTreeMap<String, u64> = self.aggregator.totals().into_iter().collect();
        SectionSnapshot {
            taken_at: now,
            total_hits: self.aggregator.running_total(),
            hot_section: select_hot_section(&sections),
            sections,
        }
    }
}

impl WindowTask for SectionReporter {
    type Output = SectionSnapshot;

    fn name(&self) -> &str {
        "section-reporter"
    }

    fn tick_interval(&self) -> Duration {
        self.window
    }

    fn on_event(&mut self, event: &LogEvent) -> Option<SectionSnapshot> {
        if let Err(e) = self.add(event) {
            warn!("Dropping event from section stats: {}", e);
        }
        None
    }

    fn on_tick(&mut self, now: Timestamp) -> Option<SectionSnapshot> {
        Some(self.snapshot_at(now))
    }
}

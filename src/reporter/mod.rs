/// Windowed per-section traffic statistics
pub mod section_reporter;

pub use section_reporter::{parse_section, HotSection, SectionReporter, SectionSnapshot};

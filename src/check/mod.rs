//! Protocol compliance checking
//!
//! Consumes the decoded message stream and evaluates each participant
//! against the collaboration protocol rules. Failures are recorded in
//! per-link reports, never raised: a capture with broken links still
//! produces a full set of reports.

mod link;
mod registration;

pub use link::{AllLinksCheck, LinkCheck, LinkReport};
pub use registration::{AllClientsCheck, ClientCheck, ClientReport};

use serde::Serialize;

/// Half-open time window in which the rate and repeat-registration rules
/// apply: after the startup grace period, before teardown.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationWindow {
    pub start: f64,
    pub end: f64,
}

impl Default for ValidationWindow {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: u32::MAX as f64,
        }
    }
}

impl ValidationWindow {
    /// Build the window from match timing: grace period after the start,
    /// open-ended when the duration is unknown.
    pub fn from_match(start_time: i64, duration: Option<i64>, grace_period: i64) -> Self {
        Self {
            start: (start_time + grace_period) as f64,
            end: duration.map_or(u32::MAX as f64, |d| (start_time + d) as f64),
        }
    }

    pub fn contains(&self, timestamp: f64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

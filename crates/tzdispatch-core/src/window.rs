//! Local-hour send window evaluation.
//!
//! Given a reference instant, decides which configured IANA zones currently
//! have a local wall-clock hour inside the sending window. The result is a
//! plain list of zone names so stores can filter with set membership instead
//! of converting timezones per row.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Allowed local sending hours.
///
/// With `end_inclusive = false` the window is `[start_hour, end_hour)`, so
/// 9→23 admits 22:xx but not 23:xx. With `end_inclusive = true` it is
/// `[start_hour, end_hour]`. A start later than the end wraps past midnight.
/// Equal hours are only valid when the end is inclusive (a one-hour window).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub end_inclusive: bool,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 23,
            end_inclusive: false,
        }
    }
}

impl SendWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self { start_hour, end_hour, end_inclusive: false }
    }

    pub fn inclusive(mut self, end_inclusive: bool) -> Self {
        self.end_inclusive = end_inclusive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(DispatchError::config(format!(
                "Send window hours must be within 0..=23 (got {}..{})",
                self.start_hour, self.end_hour
            )));
        }
        if self.start_hour == self.end_hour && !self.end_inclusive {
            return Err(DispatchError::config(format!(
                "Send window {h}..{h} is empty; set end_inclusive = true for a one-hour window",
                h = self.start_hour
            )));
        }
        Ok(())
    }

    /// Whether a local hour (0..=23) falls inside the window.
    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        let before_end = if self.end_inclusive { hour <= end } else { hour < end };
        if start <= end {
            hour >= start && before_end
        } else {
            hour >= start || before_end
        }
    }
}

/// Resolve an IANA identifier against the bundled zone database.
pub fn parse_zone(zone: &str) -> Result<Tz> {
    zone.parse::<Tz>()
        .map_err(|_| DispatchError::unsupported_zone(zone))
}

/// Local wall-clock hour of `now` in `zone`, DST-aware.
pub fn local_hour(now: DateTime<Utc>, zone: Tz) -> u32 {
    now.with_timezone(&zone).hour()
}

/// Zones from `zones` whose local hour at `now` is inside `window`.
///
/// Unrecognized identifiers are skipped with a warning. Input order is kept
/// and duplicates are dropped.
pub fn compute_valid_zones(now: DateTime<Utc>, zones: &[String], window: &SendWindow) -> Vec<String> {
    let mut valid: Vec<String> = Vec::with_capacity(zones.len());
    for name in zones {
        let tz = match parse_zone(name) {
            Ok(tz) => tz,
            Err(e) => {
                tracing::warn!("⚠️ Skipping zone: {e}");
                continue;
            }
        };
        let hour = local_hour(now, tz);
        if window.contains(hour) && !valid.contains(name) {
            valid.push(name.clone());
        }
    }
    tracing::debug!("🕘 {} of {} zones open at {}", valid.len(), zones.len(), now.to_rfc3339());
    valid
}

/// Configured zones plus the window they are evaluated against.
#[derive(Debug, Clone)]
pub struct TimeWindowEvaluator {
    zones: Vec<String>,
    window: SendWindow,
}

impl TimeWindowEvaluator {
    pub fn new(zones: Vec<String>, window: SendWindow) -> Self {
        Self { zones, window }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub fn is_configured(&self, zone: &str) -> bool {
        self.zones.iter().any(|z| z == zone)
    }

    pub fn valid_zones(&self, now: DateTime<Utc>) -> Vec<String> {
        compute_valid_zones(now, &self.zones, &self.window)
    }
}

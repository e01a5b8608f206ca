//! Relay decision engine.
//!
//! `decide` is a pure function of wall-clock time, the weekly schedule, the
//! rain state and the latest moisture reading.  It never touches hardware
//! or storage; the controller loop applies the result.
//!
//! ## Windows
//!
//! Only time of day matters.  The current local time of day and each
//! configured start are projected onto the same synthetic date
//! (2000-01-01) and compared there.  A window is the half-open range
//! `[start, start + duration)`; windows do not wrap past midnight.
//!
//! In [`CascadeMode::Chained`] the zones run back to back in zone order:
//! zone 1 starts at its configured time and every later zone starts when
//! the previous zone's window ends, whether or not that zone was enabled.
//! [`CascadeMode::Independent`] gives every zone its own configured start.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::datetime;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, Weekday};

use crate::rain::{suppression, RainState, Suppression};
use crate::schedule::{ZoneSchedule, ZONE_COUNT};

/// Synthetic date every window is anchored to.
const REFERENCE: PrimitiveDateTime = datetime!(2000-01-01 00:00);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeMode {
    #[default]
    Chained,
    Independent,
}

/// Inputs to `decide` that come from configuration rather than state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WateringPolicy {
    pub moisture_threshold_pct: f64,
    /// Hours east of UTC; fractional offsets such as 5.5 are allowed.
    pub timezone_offset_hours: f64,
    pub cascade: CascadeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ZoneState {
    pub active: bool,
}

/// Local calendar position of an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub weekday: Weekday,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl LocalTime {
    pub fn seconds_of_day(&self) -> i64 {
        i64::from(self.hour) * 3600 + i64::from(self.minute) * 60 + i64::from(self.second)
    }
}

/// The decision cycle could not be evaluated.  All zones stay off for this
/// cycle; the next cycle tries again.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("timestamp {0} cannot be represented as a local date")]
    TimestampOutOfRange(i64),
    #[error("invalid schedule entry for {weekday} zone {zone}: {reason}")]
    InvalidEntry {
        weekday: Weekday,
        zone: usize,
        reason: String,
    },
}

/// Shift a UTC timestamp by the configured offset and split it into weekday
/// and time of day.
pub fn to_local(now: i64, timezone_offset_hours: f64) -> Result<LocalTime, ScheduleError> {
    let offset_secs = (timezone_offset_hours * 3600.0).round() as i64;
    let local = now
        .checked_add(offset_secs)
        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
        .ok_or(ScheduleError::TimestampOutOfRange(now))?;
    Ok(LocalTime {
        weekday: local.weekday(),
        hour: local.hour(),
        minute: local.minute(),
        second: local.second(),
    })
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// How the zone states of one cycle were reached.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The schedule was evaluated.
    Scheduled,
    /// Watering is held off; every zone is inactive.
    Suppressed(Suppression),
    /// The cycle could not be evaluated; every zone is inactive.
    Fault(ScheduleError),
}

impl Verdict {
    /// Short stable label, used to log only when the verdict changes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Suppressed(s) => s.kind(),
            Self::Fault(_) => "fault",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub zones: [ZoneState; ZONE_COUNT],
    pub verdict: Verdict,
    /// `None` only when the timestamp itself was unusable.
    pub local: Option<LocalTime>,
}

impl Decision {
    fn all_off(verdict: Verdict, local: Option<LocalTime>) -> Self {
        Self {
            zones: [ZoneState::default(); ZONE_COUNT],
            verdict,
            local,
        }
    }

    pub fn active_count(&self) -> usize {
        self.zones.iter().filter(|z| z.active).count()
    }
}

pub fn decide(
    now: i64,
    schedule: &ZoneSchedule,
    rain: &RainState,
    moisture_pct: Option<f64>,
    policy: &WateringPolicy,
) -> Decision {
    let local = match to_local(now, policy.timezone_offset_hours) {
        Ok(l) => l,
        Err(e) => return Decision::all_off(Verdict::Fault(e), None),
    };

    let day = schedule.day(local.weekday);
    for (zone, window) in day.zones.iter().enumerate() {
        if let Some(reason) = window.problem() {
            let err = ScheduleError::InvalidEntry {
                weekday: local.weekday,
                zone: zone + 1,
                reason,
            };
            return Decision::all_off(Verdict::Fault(err), Some(local));
        }
    }

    if let Some(s) = suppression(rain, now, moisture_pct, policy.moisture_threshold_pct) {
        return Decision::all_off(Verdict::Suppressed(s), Some(local));
    }

    let now_ref = REFERENCE + Duration::seconds(local.seconds_of_day());
    let mut cursor = REFERENCE + Duration::seconds(day.zones[0].start_secs());
    let mut zones = [ZoneState::default(); ZONE_COUNT];

    for (state, window) in zones.iter_mut().zip(day.zones.iter()) {
        let start = match policy.cascade {
            CascadeMode::Chained => cursor,
            CascadeMode::Independent => REFERENCE + Duration::seconds(window.start_secs()),
        };
        let end = start + Duration::seconds(window.duration_secs());
        state.active = window.enabled && start <= now_ref && now_ref < end;
        cursor = end;
    }

    Decision {
        zones,
        verdict: Verdict::Scheduled,
        local: Some(local),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Rain gate: remembers when rain was last seen and decides whether the
//! weather (or the soil) rules out watering right now.

use std::fmt;

use serde::Serialize;

use crate::db::{field, RecordError, Records};
use crate::sensor::is_fault;

pub const RECORD_PREFIX: &str = "rain.";
pub const KEY_LAST_RAIN_TS: &str = "rain.last_rain_ts";
const KEY_LOOKBACK_DAYS: &str = "rain.lookback_days";

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RainState {
    /// Unix seconds of the most recent rain-positive poll.  `None` until rain
    /// has been seen at least once on this controller.
    pub last_rain_ts: Option<i64>,
    pub lookback_days: u32,
}

impl RainState {
    pub fn new(lookback_days: u32) -> Self {
        Self {
            last_rain_ts: None,
            lookback_days,
        }
    }

    /// Fold one rain input into the state.  Every rain-positive poll moves
    /// the timestamp forward, so a long spell keeps extending suppression.
    /// A dry poll leaves the state untouched.
    #[must_use]
    pub fn observe(self, is_raining: bool, now: i64) -> Self {
        if is_raining {
            Self {
                last_rain_ts: Some(now),
                ..self
            }
        } else {
            self
        }
    }

    /// Whole days since the last rain, rounded down.
    pub fn days_since_rain(&self, now: i64) -> Option<i64> {
        self.last_rain_ts
            .map(|last| now.saturating_sub(last).div_euclid(SECS_PER_DAY))
    }

    pub fn rained_recently(&self, now: i64) -> bool {
        self.days_since_rain(now)
            .is_some_and(|days| days < i64::from(self.lookback_days))
    }

    // -- Flat record form ----------------------------------------------------

    pub fn to_records(&self) -> Records {
        let mut records = Records::new();
        if let Some(ts) = self.last_rain_ts {
            records.insert(KEY_LAST_RAIN_TS.to_string(), ts.to_string());
        }
        records.insert(KEY_LOOKBACK_DAYS.to_string(), self.lookback_days.to_string());
        records
    }

    pub fn from_records(records: &Records) -> Result<Self, RecordError> {
        let last_rain_ts = match records.get(KEY_LAST_RAIN_TS) {
            Some(value) => {
                let ts: i64 = field(records, KEY_LAST_RAIN_TS)?;
                // Rain before 1970 is a corrupt store, not weather.
                if ts < 0 {
                    return Err(RecordError::Malformed {
                        key: KEY_LAST_RAIN_TS.to_string(),
                        value: value.clone(),
                    });
                }
                Some(ts)
            }
            None => None,
        };
        Ok(Self {
            last_rain_ts,
            lookback_days: field(records, KEY_LOOKBACK_DAYS)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Suppression
// ---------------------------------------------------------------------------

/// Why every zone is held off this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Suppression {
    RecentRain { days_since_rain: i64, lookback_days: u32 },
    BelowMoistureThreshold { moisture_pct: f64, threshold_pct: f64 },
    /// No usable moisture reading (not polled yet, or the probe faulted).
    MoistureUnavailable,
}

impl Suppression {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RecentRain { .. } => "recent_rain",
            Self::BelowMoistureThreshold { .. } => "below_moisture_threshold",
            Self::MoistureUnavailable => "moisture_unavailable",
        }
    }
}

impl fmt::Display for Suppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecentRain {
                days_since_rain,
                lookback_days,
            } => write!(f, "rain {days_since_rain}d ago (lookback {lookback_days}d)"),
            Self::BelowMoistureThreshold {
                moisture_pct,
                threshold_pct,
            } => write!(f, "moisture {moisture_pct:.1}% below {threshold_pct:.1}%"),
            Self::MoistureUnavailable => f.write_str("moisture reading unavailable"),
        }
    }
}

/// First reason to suppress watering, if any.  Recent rain is checked
/// before moisture; either alone is sufficient.
pub fn suppression(
    state: &RainState,
    now: i64,
    moisture_pct: Option<f64>,
    threshold_pct: f64,
) -> Option<Suppression> {
    if state.rained_recently(now) {
        return Some(Suppression::RecentRain {
            days_since_rain: state.days_since_rain(now).unwrap_or_default(),
            lookback_days: state.lookback_days,
        });
    }
    match moisture_pct {
        None => Some(Suppression::MoistureUnavailable),
        Some(m) if is_fault(m) => Some(Suppression::MoistureUnavailable),
        Some(m) if m < threshold_pct => Some(Suppression::BelowMoistureThreshold {
            moisture_pct: m,
            threshold_pct,
        }),
        Some(_) => None,
    }
}

pub fn should_suppress(
    state: &RainState,
    now: i64,
    moisture_pct: Option<f64>,
    threshold_pct: f64,
) -> bool {
    suppression(state, now, moisture_pct, threshold_pct).is_some()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SENSOR_FAULT;

    const NOW: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z
    const DAY: i64 = SECS_PER_DAY;

    // -- observe -------------------------------------------------------------

    #[test]
    fn observe_rain_sets_timestamp() {
        let s = RainState::new(3).observe(true, NOW);
        assert_eq!(s.last_rain_ts, Some(NOW));
        assert_eq!(s.lookback_days, 3);
    }

    #[test]
    fn observe_dry_leaves_state_unchanged() {
        let s = RainState::new(3).observe(true, NOW);
        assert_eq!(s.observe(false, NOW + 5 * DAY), s);
        assert_eq!(RainState::new(3).observe(false, NOW), RainState::new(3));
    }

    #[test]
    fn continued_rain_extends_window() {
        let s = RainState::new(3)
            .observe(true, NOW)
            .observe(true, NOW + 2 * DAY);
        assert_eq!(s.last_rain_ts, Some(NOW + 2 * DAY));
        assert!(s.rained_recently(NOW + 4 * DAY));
    }

    // -- days_since_rain -----------------------------------------------------

    #[test]
    fn days_since_rain_floors() {
        let s = RainState::new(3).observe(true, NOW);
        assert_eq!(s.days_since_rain(NOW), Some(0));
        assert_eq!(s.days_since_rain(NOW + DAY - 1), Some(0));
        assert_eq!(s.days_since_rain(NOW + DAY), Some(1));
        assert_eq!(s.days_since_rain(NOW + 10 * DAY + 100), Some(10));
    }

    #[test]
    fn days_since_rain_saturates_on_extreme_timestamps() {
        let ancient = RainState {
            last_rain_ts: Some(i64::MIN),
            lookback_days: 3,
        };
        assert_eq!(ancient.days_since_rain(NOW), Some(i64::MAX.div_euclid(DAY)));
        assert!(!should_suppress(&ancient, NOW, Some(80.0), 30.0));

        let future = RainState {
            last_rain_ts: Some(i64::MAX),
            lookback_days: 3,
        };
        assert!(should_suppress(&future, -NOW, Some(80.0), 30.0));
    }

    #[test]
    fn days_since_rain_never_seen() {
        assert_eq!(RainState::new(3).days_since_rain(NOW), None);
        assert!(!RainState::new(3).rained_recently(NOW));
    }

    #[test]
    fn clock_behind_last_rain_counts_as_recent() {
        let s = RainState::new(1).observe(true, NOW);
        assert_eq!(s.days_since_rain(NOW - 10), Some(-1));
        assert!(s.rained_recently(NOW - 10));
    }

    // -- should_suppress -----------------------------------------------------

    #[test]
    fn suppressed_right_after_rain() {
        for lookback in 1..10 {
            let s = RainState::new(lookback).observe(true, NOW);
            assert!(should_suppress(&s, NOW, Some(80.0), 30.0));
        }
    }

    #[test]
    fn released_after_lookback_elapses() {
        let s = RainState::new(3).observe(true, NOW);
        assert!(should_suppress(&s, NOW + 3 * DAY - 1, Some(80.0), 30.0));
        assert!(!should_suppress(&s, NOW + 3 * DAY, Some(80.0), 30.0));
    }

    #[test]
    fn zero_lookback_never_suppresses_for_rain() {
        let s = RainState::new(0).observe(true, NOW);
        assert_eq!(suppression(&s, NOW, Some(80.0), 30.0), None);
    }

    #[test]
    fn moisture_below_threshold_suppresses() {
        let s = RainState::new(3);
        assert_eq!(
            suppression(&s, NOW, Some(29.9), 30.0),
            Some(Suppression::BelowMoistureThreshold {
                moisture_pct: 29.9,
                threshold_pct: 30.0
            })
        );
        assert!(!should_suppress(&s, NOW, Some(30.0), 30.0));
    }

    #[test]
    fn rain_takes_precedence_over_moisture() {
        let s = RainState::new(3).observe(true, NOW);
        assert!(matches!(
            suppression(&s, NOW + DAY, Some(5.0), 30.0),
            Some(Suppression::RecentRain {
                days_since_rain: 1,
                lookback_days: 3
            })
        ));
    }

    #[test]
    fn missing_or_faulted_moisture_suppresses() {
        let s = RainState::new(3);
        assert_eq!(
            suppression(&s, NOW, None, 30.0),
            Some(Suppression::MoistureUnavailable)
        );
        assert_eq!(
            suppression(&s, NOW, Some(SENSOR_FAULT), 30.0),
            Some(Suppression::MoistureUnavailable)
        );
        assert_eq!(
            suppression(&s, NOW, Some(f64::NAN), 30.0),
            Some(Suppression::MoistureUnavailable)
        );
    }

    #[test]
    fn suppression_display_and_kind() {
        let s = Suppression::RecentRain {
            days_since_rain: 1,
            lookback_days: 3,
        };
        assert_eq!(s.to_string(), "rain 1d ago (lookback 3d)");
        assert_eq!(s.kind(), "recent_rain");
        assert_eq!(Suppression::MoistureUnavailable.kind(), "moisture_unavailable");
    }

    #[test]
    fn suppression_serializes_tagged() {
        let json = serde_json::to_value(Suppression::BelowMoistureThreshold {
            moisture_pct: 12.5,
            threshold_pct: 30.0,
        })
        .unwrap();
        assert_eq!(json["cause"], "below_moisture_threshold");
        assert_eq!(json["moisture_pct"], 12.5);
    }

    // -- records -------------------------------------------------------------

    #[test]
    fn records_round_trip() {
        let s = RainState::new(4).observe(true, NOW);
        let records = s.to_records();
        assert_eq!(records["rain.last_rain_ts"], NOW.to_string());
        assert_eq!(records["rain.lookback_days"], "4");
        assert_eq!(RainState::from_records(&records), Ok(s));
    }

    #[test]
    fn records_without_rain_round_trip() {
        let s = RainState::new(2);
        let records = s.to_records();
        assert!(!records.contains_key("rain.last_rain_ts"));
        assert_eq!(RainState::from_records(&records), Ok(s));
    }

    #[test]
    fn negative_rain_timestamp_is_malformed() {
        let mut records = RainState::new(3).to_records();
        records.insert("rain.last_rain_ts".into(), i64::MIN.to_string());
        assert_eq!(
            RainState::from_records(&records),
            Err(RecordError::Malformed {
                key: "rain.last_rain_ts".into(),
                value: i64::MIN.to_string(),
            })
        );
        records.insert("rain.last_rain_ts".into(), "0".into());
        assert_eq!(RainState::from_records(&records).unwrap().last_rain_ts, Some(0));
    }

    #[test]
    fn records_errors() {
        assert_eq!(
            RainState::from_records(&Records::new()),
            Err(RecordError::Missing("rain.lookback_days".into()))
        );
        let mut records = RainState::new(2).to_records();
        records.insert("rain.last_rain_ts".into(), "yesterday".into());
        assert!(matches!(
            RainState::from_records(&records),
            Err(RecordError::Malformed { .. })
        ));
    }
}

//! Weekly watering timetable: for every weekday, one start/duration/enabled
//! window per zone.
//!
//! The table is a fixed `[DaySchedule; 7]` indexed by days-from-Monday, so
//! a weekday without an entry cannot be represented.  Deserialisation goes
//! through [`WeekTable`] (named `mon`..`sun` fields) and is validated, which
//! makes "all seven days present and well-formed" a property of every
//! `ZoneSchedule` value.

use serde::{Deserialize, Serialize};
use time::Weekday;

use crate::db::{field, RecordError, Records};

/// Independently actuated watering outputs.
pub const ZONE_COUNT: usize = 4;

/// Key fragments for each weekday, Monday first.
pub const DAY_KEYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

const SECS_PER_DAY: i64 = 86_400;

/// Record key prefix for persisted schedules.
pub const RECORD_PREFIX: &str = "schedule.";

pub fn day_index(weekday: Weekday) -> usize {
    weekday.number_days_from_monday() as usize
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One zone's window on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneWindow {
    /// Fractional hours after local midnight, e.g. 13.1666 = 13:10:00.
    pub start_hours: f64,
    pub duration_min: u32,
    pub enabled: bool,
}

impl ZoneWindow {
    /// The built-in safe entry: a valid window that never waters.
    pub const OFF: ZoneWindow = ZoneWindow {
        start_hours: 0.0,
        duration_min: 10,
        enabled: false,
    };

    /// Start as seconds after midnight, rounded to the nearest second so
    /// truncated decimals like 13.1666 land on 13:10:00.
    pub fn start_secs(&self) -> i64 {
        (self.start_hours * 3600.0).round() as i64
    }

    pub fn duration_secs(&self) -> i64 {
        i64::from(self.duration_min) * 60
    }

    /// Describe what is wrong with this entry, if anything.
    pub fn problem(&self) -> Option<String> {
        if !self.start_hours.is_finite() || !(0.0..24.0).contains(&self.start_hours) {
            return Some(format!("start_hours {} out of range [0, 24)", self.start_hours));
        }
        if self.start_secs() >= SECS_PER_DAY {
            return Some(format!(
                "start_hours {} rounds to midnight of the next day",
                self.start_hours
            ));
        }
        if self.duration_min == 0 {
            return Some("duration_min must be positive".to_string());
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaySchedule {
    pub zones: [ZoneWindow; ZONE_COUNT],
}

impl DaySchedule {
    pub const OFF: DaySchedule = DaySchedule {
        zones: [ZoneWindow::OFF; ZONE_COUNT],
    };

    /// Same window for all zones.
    pub fn uniform(window: ZoneWindow) -> Self {
        Self {
            zones: [window; ZONE_COUNT],
        }
    }
}

// ---------------------------------------------------------------------------
// Weekly table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WeekTable", into = "WeekTable")]
pub struct ZoneSchedule {
    days: [DaySchedule; 7],
}

impl Default for ZoneSchedule {
    fn default() -> Self {
        Self::all_disabled()
    }
}

impl ZoneSchedule {
    /// Fallback when no usable schedule is stored: nothing ever waters.
    pub fn all_disabled() -> Self {
        Self {
            days: [DaySchedule::OFF; 7],
        }
    }

    /// Same day schedule on every weekday.
    pub fn every_day(day: DaySchedule) -> Self {
        Self { days: [day; 7] }
    }

    pub fn day(&self, weekday: Weekday) -> &DaySchedule {
        &self.days[day_index(weekday)]
    }

    pub fn set_day(&mut self, weekday: Weekday, day: DaySchedule) {
        self.days[day_index(weekday)] = day;
    }

    pub fn has_enabled_zone(&self) -> bool {
        self.days
            .iter()
            .any(|d| d.zones.iter().any(|z| z.enabled))
    }

    /// Every invalid entry, not just the first one.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (d, day) in self.days.iter().enumerate() {
            for (z, window) in day.zones.iter().enumerate() {
                if let Some(problem) = window.problem() {
                    errors.push(format!("{} zone {}: {problem}", DAY_KEYS[d], z + 1));
                }
            }
        }
        errors
    }

    // -- Flat record form ----------------------------------------------------

    pub fn to_records(&self) -> Records {
        let mut records = Records::new();
        for (d, day) in self.days.iter().enumerate() {
            for (z, window) in day.zones.iter().enumerate() {
                let base = record_base(d, z);
                // f64 Display is the shortest string that parses back to the
                // same bits.
                records.insert(format!("{base}.start_hours"), window.start_hours.to_string());
                records.insert(format!("{base}.duration_min"), window.duration_min.to_string());
                records.insert(format!("{base}.enabled"), window.enabled.to_string());
            }
        }
        records
    }

    pub fn from_records(records: &Records) -> Result<Self, RecordError> {
        let mut schedule = Self::all_disabled();
        for (d, day) in schedule.days.iter_mut().enumerate() {
            for (z, window) in day.zones.iter_mut().enumerate() {
                let base = record_base(d, z);
                let start_key = format!("{base}.start_hours");
                *window = ZoneWindow {
                    start_hours: field(records, &start_key)?,
                    duration_min: field(records, &format!("{base}.duration_min"))?,
                    enabled: field(records, &format!("{base}.enabled"))?,
                };
                if window.problem().is_some() {
                    return Err(RecordError::Malformed {
                        value: records.get(&start_key).cloned().unwrap_or_default(),
                        key: base,
                    });
                }
            }
        }
        Ok(schedule)
    }
}

fn record_base(day: usize, zone: usize) -> String {
    format!("{RECORD_PREFIX}{}.zone{}", DAY_KEYS[day], zone + 1)
}

// ---------------------------------------------------------------------------
// Serde shape
// ---------------------------------------------------------------------------

/// On-disk and on-wire shape: one named table per weekday.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeekTable {
    pub mon: DaySchedule,
    pub tue: DaySchedule,
    pub wed: DaySchedule,
    pub thu: DaySchedule,
    pub fri: DaySchedule,
    pub sat: DaySchedule,
    pub sun: DaySchedule,
}

impl TryFrom<WeekTable> for ZoneSchedule {
    type Error = String;

    fn try_from(t: WeekTable) -> Result<Self, Self::Error> {
        let schedule = ZoneSchedule {
            days: [t.mon, t.tue, t.wed, t.thu, t.fri, t.sat, t.sun],
        };
        let errors = schedule.validate();
        if errors.is_empty() {
            Ok(schedule)
        } else {
            Err(format!("invalid schedule: {}", errors.join("; ")))
        }
    }
}

impl From<ZoneSchedule> for WeekTable {
    fn from(s: ZoneSchedule) -> Self {
        let [mon, tue, wed, thu, fri, sat, sun] = s.days;
        WeekTable {
            mon,
            tue,
            wed,
            thu,
            fri,
            sat,
            sun,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start_hours: f64, duration_min: u32, enabled: bool) -> ZoneWindow {
        ZoneWindow {
            start_hours,
            duration_min,
            enabled,
        }
    }

    fn varied_schedule() -> ZoneSchedule {
        let mut s = ZoneSchedule::all_disabled();
        s.set_day(Weekday::Monday, DaySchedule::uniform(window(6.0, 10, true)));
        s.set_day(
            Weekday::Thursday,
            DaySchedule {
                zones: [
                    window(13.1666, 15, true),
                    window(0.1, 1, false),
                    window(23.5, 45, true),
                    window(7.333333333333333, 20, true),
                ],
            },
        );
        s
    }

    // -- ZoneWindow ----------------------------------------------------------

    #[test]
    fn start_secs_rounds_truncated_decimals() {
        assert_eq!(window(13.1666, 10, true).start_secs(), 13 * 3600 + 10 * 60);
        assert_eq!(window(6.0, 10, true).start_secs(), 6 * 3600);
        assert_eq!(window(6.5, 10, true).start_secs(), 6 * 3600 + 1800);
    }

    #[test]
    fn duration_secs() {
        assert_eq!(window(6.0, 10, true).duration_secs(), 600);
    }

    #[test]
    fn window_problems() {
        assert!(window(0.0, 1, true).problem().is_none());
        assert!(window(23.99, 1, true).problem().is_none());
        assert!(window(24.0, 1, true).problem().is_some());
        assert!(window(-0.5, 1, true).problem().is_some());
        assert!(window(f64::NAN, 1, true).problem().is_some());
        assert!(window(23.99999, 1, true).problem().is_some());
        assert!(window(6.0, 0, false).problem().is_some());
    }

    // -- ZoneSchedule --------------------------------------------------------

    #[test]
    fn all_disabled_is_valid_and_never_waters() {
        let s = ZoneSchedule::all_disabled();
        assert!(s.validate().is_empty());
        assert!(!s.has_enabled_zone());
    }

    #[test]
    fn day_lookup_is_indexed_by_weekday() {
        let s = varied_schedule();
        assert_eq!(s.day(Weekday::Monday).zones[0].start_hours, 6.0);
        assert_eq!(s.day(Weekday::Thursday).zones[2].start_hours, 23.5);
        assert_eq!(*s.day(Weekday::Sunday), DaySchedule::OFF);
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut s = ZoneSchedule::all_disabled();
        s.set_day(
            Weekday::Tuesday,
            DaySchedule {
                zones: [
                    window(25.0, 10, true),
                    ZoneWindow::OFF,
                    window(6.0, 0, true),
                    ZoneWindow::OFF,
                ],
            },
        );
        let errors = s.validate();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].starts_with("tue zone 1"));
        assert!(errors[1].starts_with("tue zone 3"));
    }

    // -- Records -------------------------------------------------------------

    #[test]
    fn records_round_trip_bit_identical() {
        let s = varied_schedule();
        let records = s.to_records();
        assert_eq!(records.len(), 7 * ZONE_COUNT * 3);
        let back = ZoneSchedule::from_records(&records).unwrap();
        assert_eq!(back, s);
        let thu = back.day(Weekday::Thursday);
        assert_eq!(
            thu.zones[3].start_hours.to_bits(),
            7.333333333333333_f64.to_bits()
        );
    }

    #[test]
    fn record_keys_are_flat() {
        let records = varied_schedule().to_records();
        assert_eq!(records["schedule.mon.zone1.start_hours"], "6");
        assert_eq!(records["schedule.mon.zone4.duration_min"], "10");
        assert_eq!(records["schedule.thu.zone2.enabled"], "false");
    }

    #[test]
    fn from_records_missing_key() {
        let mut records = varied_schedule().to_records();
        records.remove("schedule.sat.zone3.enabled");
        assert_eq!(
            ZoneSchedule::from_records(&records),
            Err(RecordError::Missing("schedule.sat.zone3.enabled".into()))
        );
    }

    #[test]
    fn from_records_rejects_invalid_entry() {
        let mut records = varied_schedule().to_records();
        records.insert("schedule.wed.zone1.start_hours".into(), "30".into());
        assert!(matches!(
            ZoneSchedule::from_records(&records),
            Err(RecordError::Malformed { .. })
        ));
    }

    #[test]
    fn from_records_rejects_garbage() {
        let mut records = varied_schedule().to_records();
        records.insert("schedule.fri.zone2.duration_min".into(), "ten".into());
        assert!(matches!(
            ZoneSchedule::from_records(&records),
            Err(RecordError::Malformed { .. })
        ));
    }

    // -- Serde ---------------------------------------------------------------

    const DAY_JSON: &str = r#"{"zones":[
        {"start_hours":6.0,"duration_min":10,"enabled":true},
        {"start_hours":6.0,"duration_min":10,"enabled":true},
        {"start_hours":6.0,"duration_min":10,"enabled":true},
        {"start_hours":6.0,"duration_min":10,"enabled":true}]}"#;

    fn week_json(mon: &str) -> String {
        format!(
            r#"{{"mon":{mon},"tue":{d},"wed":{d},"thu":{d},"fri":{d},"sat":{d},"sun":{d}}}"#,
            d = DAY_JSON
        )
    }

    #[test]
    fn deserialize_full_week() {
        let s: ZoneSchedule = serde_json::from_str(&week_json(DAY_JSON)).unwrap();
        assert!(s.day(Weekday::Monday).zones[3].enabled);
        assert_eq!(s.day(Weekday::Sunday).zones[0].duration_min, 10);
    }

    #[test]
    fn deserialize_missing_weekday_fails() {
        let json = format!(
            r#"{{"mon":{d},"tue":{d},"wed":{d},"thu":{d},"fri":{d},"sat":{d}}}"#,
            d = DAY_JSON
        );
        assert!(serde_json::from_str::<ZoneSchedule>(&json).is_err());
    }

    #[test]
    fn deserialize_wrong_zone_count_fails() {
        let three = r#"{"zones":[
            {"start_hours":6.0,"duration_min":10,"enabled":true},
            {"start_hours":6.0,"duration_min":10,"enabled":true},
            {"start_hours":6.0,"duration_min":10,"enabled":true}]}"#;
        assert!(serde_json::from_str::<ZoneSchedule>(&week_json(three)).is_err());
    }

    #[test]
    fn deserialize_invalid_entry_fails_validation() {
        let bad = r#"{"zones":[
            {"start_hours":24.5,"duration_min":10,"enabled":true},
            {"start_hours":6.0,"duration_min":10,"enabled":true},
            {"start_hours":6.0,"duration_min":10,"enabled":true},
            {"start_hours":6.0,"duration_min":10,"enabled":true}]}"#;
        let err = serde_json::from_str::<ZoneSchedule>(&week_json(bad)).unwrap_err();
        assert!(err.to_string().contains("mon zone 1"), "{err}");
    }

    #[test]
    fn serialize_uses_weekday_names() {
        let json = serde_json::to_value(varied_schedule()).unwrap();
        assert_eq!(json["mon"]["zones"][0]["start_hours"], 6.0);
        assert_eq!(json["thu"]["zones"][2]["duration_min"], 45);
        assert!(json.get("days").is_none());
    }

    #[test]
    fn toml_table_parses() {
        let toml_str = r#"
[mon]
zones = [
  { start_hours = 6.0, duration_min = 10, enabled = true },
  { start_hours = 6.0, duration_min = 10, enabled = true },
  { start_hours = 6.0, duration_min = 10, enabled = true },
  { start_hours = 6.0, duration_min = 10, enabled = true },
]
[tue]
zones = [
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
[wed]
zones = [
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
[thu]
zones = [
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
[fri]
zones = [
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
[sat]
zones = [
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
[sun]
zones = [
  { start_hours = 18.25, duration_min = 5, enabled = true },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
  { start_hours = 0.0, duration_min = 10, enabled = false },
]
"#;
        let s: ZoneSchedule = toml::from_str(toml_str).unwrap();
        assert!(s.day(Weekday::Monday).zones[0].enabled);
        assert_eq!(s.day(Weekday::Sunday).zones[0].start_secs(), 18 * 3600 + 15 * 60);
    }
}

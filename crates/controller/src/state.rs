use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::aggregate::AggregatedReading;
use crate::rain::{RainState, Suppression};
use crate::schedule::{ZoneSchedule, ZONE_COUNT};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Read-mostly status snapshot.  The controller loop and the report task
/// write it; the web API only reads.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub reading: Option<TimedReading>,
    pub rain: RainState,
    pub zones: [ZoneStatus; ZONE_COUNT],
    /// Label of the last decision verdict (`scheduled`, `recent_rain`, ...).
    pub verdict: String,
    pub suppression: Option<Suppression>,
    pub schedule: ZoneSchedule,
    pub clock_offset_secs: i64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct TimedReading {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(flatten)]
    pub reading: AggregatedReading,
}

#[derive(Clone, Copy, Default, Serialize)]
pub struct ZoneStatus {
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Rain,
    Zone,
    Schedule,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
}

impl HostInfo {
    pub fn current() -> Self {
        let load = System::load_average();
        Self {
            hostname: System::host_name(),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub clock_offset_secs: i64,
    pub host: HostInfo,
    pub reading: Option<TimedReading>,
    pub rain: RainState,
    pub zones: [ZoneStatus; ZONE_COUNT],
    pub verdict: String,
    pub suppression: Option<Suppression>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

fn at(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

impl SystemState {
    pub fn new(schedule: ZoneSchedule, rain: RainState) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            reading: None,
            rain,
            zones: [ZoneStatus::default(); ZONE_COUNT],
            verdict: "pending".to_string(),
            suppression: None,
            schedule,
            clock_offset_secs: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a completed sensor poll.
    pub fn record_reading(&mut self, ts: i64, reading: AggregatedReading) {
        let detail = format!(
            "air {:.1}C, humidity {:.0}%, pressure {:.1}hPa, soil {:.1}C / {:.0}%, rain {}, faults {}",
            reading.air_temperature_c,
            reading.humidity_pct,
            reading.pressure_hpa,
            reading.soil_temperature_c,
            reading.soil_moisture_pct,
            reading.rain,
            reading.faults,
        );
        self.reading = Some(TimedReading {
            at: at(ts),
            reading,
        });
        self.push_event(EventKind::Reading, detail);
    }

    pub fn record_rain(&mut self, rain: RainState) {
        if rain.last_rain_ts != self.rain.last_rain_ts {
            self.push_event(EventKind::Rain, "rain observed".to_string());
        }
        self.rain = rain;
    }

    /// Record a zone on/off transition.  `zone` is the 0-based index.
    pub fn record_zone(&mut self, zone: usize, active: bool, ts: i64, cause: &str) {
        if let Some(z) = self.zones.get_mut(zone) {
            z.active = active;
            z.last_changed = Some(at(ts));
        }
        let state_str = if active { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Zone,
            format!("zone {} set {state_str} ({cause})", zone + 1),
        );
    }

    pub fn record_verdict(&mut self, kind: &str, suppression: Option<Suppression>) {
        self.verdict = kind.to_string();
        self.suppression = suppression;
    }

    pub fn record_schedule(&mut self, schedule: ZoneSchedule, source: &str) {
        self.schedule = schedule;
        self.push_event(EventKind::Schedule, format!("schedule replaced from {source}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            clock_offset_secs: self.clock_offset_secs,
            host: HostInfo::current(),
            reading: self.reading.clone(),
            rain: self.rain,
            zones: self.zones,
            verdict: self.verdict.clone(),
            suppression: self.suppression,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

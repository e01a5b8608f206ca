//! The controller loop: single owner of the reading, rain state, schedule
//! and zone states, driven by three independent timers.
//!
//! ```text
//!  clock tick ──▶ SNTP offset
//!  poll tick  ──▶ spawn_blocking(aggregate) ──▶ rain gate, history, report
//!  relay tick ──▶ decide ──▶ set_relay × 4 ──▶ zone events
//!  mqtt       ──▶ schedule update ──▶ swap + persist
//! ```
//!
//! Handlers log and return; nothing a tick does can stop the loop.  Sensor
//! reads block, so a poll runs on the blocking pool and the relay tick keeps
//! firing while it is in flight.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregate::{aggregate, AggregateError, AggregatedReading};
use crate::clock::Clock;
use crate::config::{Config, SensorSettings};
use crate::db::Db;
use crate::decision::{decide, Decision, Verdict, WateringPolicy, ZoneState};
use crate::rain::{self, RainState};
use crate::relay::{self, RelayOutput};
use crate::report::StatusReport;
use crate::schedule::{self, ZoneSchedule, ZONE_COUNT};
use crate::sensor::{self, MoistureCalibration, SensorDriver};
use crate::state::SharedState;

/// What a finished poll hands back: the driver, and the reading.
type PollOutcome = (Box<dyn SensorDriver>, Result<AggregatedReading, AggregateError>);

pub struct Controller {
    // -- configuration --
    samples_to_average: u32,
    poll_interval: Duration,
    relay_interval: Duration,
    clock_sync_interval: Duration,
    ntp_server: String,
    calibration: MoistureCalibration,
    sensor_settings: SensorSettings,
    policy: WateringPolicy,
    lookback_days: u32,

    // -- owned state --
    clock: Clock,
    schedule: ZoneSchedule,
    rain: RainState,
    reading: Option<AggregatedReading>,
    zones: [ZoneState; ZONE_COUNT],
    last_verdict: Option<Verdict>,

    // -- collaborators --
    /// `None` while a poll holds it, or after a poll task died.
    driver: Option<Box<dyn SensorDriver>>,
    relays: Box<dyn RelayOutput>,
    db: Db,
    shared: SharedState,
    reports: mpsc::Sender<StatusReport>,
}

fn ticker(period: Duration) -> Interval {
    let mut t = interval(period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

/// Await the in-flight poll, or forever when there is none.
async fn join_poll(poll: &mut Option<JoinHandle<PollOutcome>>) -> Result<PollOutcome, JoinError> {
    match poll.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl Controller {
    pub fn new(
        config: &Config,
        db: Db,
        shared: SharedState,
        driver: Box<dyn SensorDriver>,
        relays: Box<dyn RelayOutput>,
        reports: mpsc::Sender<StatusReport>,
    ) -> Self {
        let c = &config.controller;
        Self {
            samples_to_average: c.samples_to_average,
            poll_interval: Duration::from_secs(c.poll_interval_sec),
            relay_interval: Duration::from_secs(c.relay_interval_sec),
            clock_sync_interval: Duration::from_secs(c.clock_sync_interval_sec),
            ntp_server: c.ntp_server.clone(),
            calibration: config.sensors.calibration(),
            sensor_settings: config.sensors.clone(),
            policy: config.policy(),
            lookback_days: config.watering.lookback_days,
            clock: Clock::new(),
            schedule: ZoneSchedule::all_disabled(),
            rain: RainState::new(config.watering.lookback_days),
            reading: None,
            zones: [ZoneState::default(); ZONE_COUNT],
            last_verdict: None,
            driver: Some(driver),
            relays,
            db,
            shared,
            reports,
        }
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Load the schedule and rain state from the store.  Anything missing or
    /// corrupt falls back to the safe default (nothing waters, no rain seen).
    pub async fn restore(&mut self) {
        self.schedule = match self.db.load_prefix(schedule::RECORD_PREFIX).await {
            Ok(records) if records.is_empty() => {
                error!("no stored schedule, all zones disabled");
                ZoneSchedule::all_disabled()
            }
            Ok(records) => ZoneSchedule::from_records(&records).unwrap_or_else(|e| {
                error!("stored schedule unusable ({e}), all zones disabled");
                ZoneSchedule::all_disabled()
            }),
            Err(e) => {
                error!("failed to load schedule ({e:#}), all zones disabled");
                ZoneSchedule::all_disabled()
            }
        };

        self.rain = match self.db.load_prefix(rain::RECORD_PREFIX).await {
            Ok(records) => RainState::from_records(&records).unwrap_or_else(|e| {
                error!("stored rain state unusable ({e}), assuming no recent rain");
                RainState::new(self.lookback_days)
            }),
            Err(e) => {
                error!("failed to load rain state ({e:#}), assuming no recent rain");
                RainState::new(self.lookback_days)
            }
        };

        if !self.schedule.has_enabled_zone() {
            warn!("schedule has no enabled zone, nothing will be watered");
        }
        info!(
            last_rain_ts = ?self.rain.last_rain_ts,
            lookback_days = self.rain.lookback_days,
            "controller state restored"
        );

        let mut st = self.shared.write().await;
        st.schedule = self.schedule.clone();
        st.rain = self.rain;
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Run until ctrl-c, then switch every relay off.
    pub async fn run(mut self, mut schedules: mpsc::Receiver<ZoneSchedule>) -> Result<()> {
        let mut clock_tick = ticker(self.clock_sync_interval);
        let mut poll_tick = ticker(self.poll_interval);
        let mut relay_tick = ticker(self.relay_interval);
        let mut poll: Option<JoinHandle<PollOutcome>> = None;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(
            poll_sec = self.poll_interval.as_secs(),
            relay_sec = self.relay_interval.as_secs(),
            clock_sync_sec = self.clock_sync_interval.as_secs(),
            samples = self.samples_to_average,
            "controller loop started"
        );
        self.shared
            .write()
            .await
            .record_system("controller started".to_string());

        loop {
            tokio::select! {
                biased;

                res = &mut shutdown => {
                    if let Err(e) = res {
                        error!("ctrl-c handler failed: {e}");
                    }
                    info!("shutting down, switching all relays off");
                    relay::all_off(self.relays.as_mut());
                    return Ok(());
                }
                _ = clock_tick.tick() => self.on_clock_sync().await,
                Some(update) = schedules.recv() => self.on_schedule_update(update).await,
                outcome = join_poll(&mut poll) => {
                    poll = None;
                    self.on_poll_complete(outcome).await;
                }
                _ = poll_tick.tick() => {
                    if poll.is_some() {
                        warn!("previous sensor poll still running, skipping this one");
                    } else {
                        poll = self.start_poll();
                    }
                }
                _ = relay_tick.tick() => {
                    let now = self.clock.now_utc();
                    self.on_relay_tick(now).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn on_clock_sync(&mut self) {
        if self.ntp_server.is_empty() {
            return;
        }
        match self.clock.sync(&self.ntp_server).await {
            Ok(offset) => {
                info!(server = %self.ntp_server, offset_secs = offset, "clock synced");
                self.shared.write().await.clock_offset_secs = self.clock.offset_secs();
            }
            Err(e) => warn!(server = %self.ntp_server, "clock sync failed: {e:#}"),
        }
    }

    /// Hand the driver to the blocking pool for one aggregation pass.
    fn start_poll(&mut self) -> Option<JoinHandle<PollOutcome>> {
        let mut driver = match self.driver.take() {
            Some(d) => d,
            None => match sensor::open(&self.sensor_settings) {
                Ok(d) => {
                    info!("sensor driver reopened");
                    d
                }
                Err(e) => {
                    error!("sensor driver unavailable: {e:#}");
                    return None;
                }
            },
        };
        let samples = self.samples_to_average;
        let calibration = self.calibration;
        debug!(samples, "sensor poll started");
        Some(tokio::task::spawn_blocking(move || {
            let result = aggregate(driver.as_mut(), samples, &calibration);
            (driver, result)
        }))
    }

    async fn on_poll_complete(&mut self, outcome: Result<PollOutcome, JoinError>) {
        match outcome {
            Ok((driver, Ok(reading))) => {
                self.driver = Some(driver);
                let now = self.clock.now_utc();
                self.apply_reading(now, reading).await;
            }
            Ok((driver, Err(e))) => {
                self.driver = Some(driver);
                error!("sensor aggregation failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("sensor aggregation failed: {e}"));
            }
            Err(e) => {
                // The driver went down with the task; the next poll reopens it.
                error!("sensor poll task failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("sensor poll task failed: {e}"));
            }
        }
    }

    /// Fold a fresh reading into the owned state, persist what changed and
    /// report it.
    pub async fn apply_reading(&mut self, now: i64, reading: AggregatedReading) {
        self.reading = Some(reading);
        if reading.faults > 0 {
            warn!(
                faults = reading.faults,
                samples = reading.samples,
                "sensor poll had failed reads"
            );
        }

        let updated = self.rain.observe(reading.rain, now);
        if updated != self.rain {
            self.rain = updated;
            // Only the timestamp moves; the lookback is seeded from config.
            if let Some(ts) = updated.last_rain_ts {
                if let Err(e) = self.db.persist(rain::KEY_LAST_RAIN_TS, &ts.to_string()).await {
                    error!("failed to persist rain state: {e:#}");
                }
            }
            info!(ts = now, "rain observed");
        }

        if let Err(e) = self.db.insert_reading(now, &reading).await {
            warn!("failed to store reading: {e:#}");
        }

        {
            let mut st = self.shared.write().await;
            st.record_rain(self.rain);
            st.record_reading(now, reading);
        }

        let report = StatusReport {
            ts: now,
            reading,
            zones: self.zones.map(|z| z.active),
            verdict: self
                .last_verdict
                .as_ref()
                .map_or("pending", Verdict::kind)
                .to_string(),
            suppression: match &self.last_verdict {
                Some(Verdict::Suppressed(s)) => Some(*s),
                _ => None,
            },
        };
        match self.reports.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("report queue full, dropping report"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("report task gone"),
        }
    }

    /// Recompute zone states and drive the relays, once per zone.
    pub async fn on_relay_tick(&mut self, now: i64) -> Decision {
        let moisture = self.reading.and_then(|r| r.decision_moisture());
        let decision = decide(now, &self.schedule, &self.rain, moisture, &self.policy);
        self.note_verdict(&decision.verdict).await;

        for (zone, want) in decision.zones.iter().enumerate() {
            if let Err(e) = self.relays.set_relay(zone, want.active) {
                error!(zone = zone + 1, on = want.active, "relay write failed: {e:#}");
                continue;
            }
            if self.zones[zone] == *want {
                continue;
            }
            self.zones[zone] = *want;

            let cause = match (&decision.verdict, want.active) {
                (Verdict::Scheduled, true) => "schedule",
                (Verdict::Scheduled, false) => "window ended",
                (v, _) => v.kind(),
            };
            info!(
                zone = zone + 1,
                on = want.active,
                cause,
                active_zones = decision.active_count(),
                "zone switched"
            );
            if let Err(e) = self
                .db
                .insert_zone_event(now, zone, want.active, cause)
                .await
            {
                warn!(zone = zone + 1, "failed to store zone event: {e:#}");
            }
            self.shared
                .write()
                .await
                .record_zone(zone, want.active, now, cause);
        }

        decision
    }

    async fn note_verdict(&mut self, verdict: &Verdict) {
        if self.last_verdict.as_ref() == Some(verdict) {
            return;
        }
        let kind_changed = self.last_verdict.as_ref().map(Verdict::kind) != Some(verdict.kind());
        if kind_changed {
            match verdict {
                Verdict::Scheduled => info!("watering follows the schedule"),
                Verdict::Suppressed(s) => info!(cause = s.kind(), "watering suppressed: {s}"),
                Verdict::Fault(e) => error!("decision cycle failed, all zones off: {e}"),
            }
        }

        let suppression = match verdict {
            Verdict::Suppressed(s) => Some(*s),
            _ => None,
        };
        {
            let mut st = self.shared.write().await;
            st.record_verdict(verdict.kind(), suppression);
            if kind_changed {
                if let Verdict::Fault(e) = verdict {
                    st.record_error(format!("decision cycle failed: {e}"));
                }
            }
        }
        self.last_verdict = Some(verdict.clone());
    }

    /// Swap in a schedule from the remote configuration path and persist it.
    pub async fn on_schedule_update(&mut self, schedule: ZoneSchedule) {
        let errors = schedule.validate();
        if !errors.is_empty() {
            error!("rejecting schedule update: {}", errors.join("; "));
            return;
        }
        if let Err(e) = self.db.persist_records(&schedule.to_records()).await {
            error!("failed to persist schedule update: {e:#}");
        }
        info!(
            any_enabled = schedule.has_enabled_zone(),
            "schedule replaced"
        );
        self.shared
            .write()
            .await
            .record_schedule(schedule.clone(), "mqtt");
        self.schedule = schedule;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

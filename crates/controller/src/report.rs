//! MQTT transport: publishes status reports and receives remote schedule
//! updates.  The controller loop never waits on the broker; reports are
//! handed over through a bounded channel and published with `try_publish`.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::aggregate::AggregatedReading;
use crate::rain::Suppression;
use crate::schedule::{ZoneSchedule, ZONE_COUNT};
use crate::state::SharedState;

/// What one poll cycle reports upstream.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ts: i64,
    pub reading: AggregatedReading,
    pub zones: [bool; ZONE_COUNT],
    pub verdict: String,
    pub suppression: Option<Suppression>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub fn status_topic(device_id: &str) -> String {
    format!("irrigation/{device_id}/status")
}

pub fn schedule_topic(device_id: &str) -> String {
    format!("irrigation/{device_id}/schedule/set")
}

/// Extract device_id from "irrigation/<device_id>/schedule/set".
pub fn extract_schedule_device(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == "irrigation" && parts[2] == "schedule" && parts[3] == "set"
    {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse and validate a JSON weekly schedule (`{"mon": {"zones": [...]}, ...}`).
pub fn parse_schedule_update(payload: &[u8]) -> Result<ZoneSchedule, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad schedule json: {e}"))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn connect(device_id: &str, host: String, port: u16) -> (AsyncClient, EventLoop) {
    let client_id = format!("irrigation-{device_id}");
    let mut mqttoptions = MqttOptions::new(client_id, host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(mqttoptions, 20)
}

/// Run the MQTT side until the process exits.  Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    device_id: String,
    mut reports: mpsc::Receiver<StatusReport>,
    schedules: mpsc::Sender<ZoneSchedule>,
    shared: SharedState,
) {
    // Publisher: drains reports independently of the event loop.
    let publisher = client.clone();
    let topic = status_topic(&device_id);
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            let payload = match serde_json::to_vec(&report) {
                Ok(p) => p,
                Err(e) => {
                    warn!("status report not serialisable: {e}");
                    continue;
                }
            };
            match publisher.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload) {
                Ok(()) => debug!(topic = %topic, "status published"),
                Err(e) => warn!(topic = %topic, "status publish dropped: {e}"),
            }
        }
    });

    let set_topic = schedule_topic(&device_id);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if extract_schedule_device(&p.topic) != Some(device_id.as_str()) {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }
                match parse_schedule_update(&p.payload) {
                    Ok(schedule) => {
                        info!("schedule update received over mqtt");
                        if schedules.send(schedule).await.is_err() {
                            warn!("controller loop gone, dropping schedule update");
                        }
                    }
                    Err(msg) => {
                        warn!(topic = %p.topic, "{msg}");
                        shared.write().await.record_error(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                if let Err(e) = client.try_subscribe(set_topic.as_str(), QoS::AtLeastOnce) {
                    warn!(topic = %set_topic, "subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::Weekday;

    const DAY: &str = r#"{"zones":[
        {"start_hours":6.0,"duration_min":10,"enabled":true},
        {"start_hours":6.0,"duration_min":10,"enabled":false},
        {"start_hours":6.0,"duration_min":10,"enabled":false},
        {"start_hours":6.0,"duration_min":10,"enabled":false}]}"#;

    fn week() -> String {
        format!(
            r#"{{"mon":{d},"tue":{d},"wed":{d},"thu":{d},"fri":{d},"sat":{d},"sun":{d}}}"#,
            d = DAY
        )
    }

    // -- topics -------------------------------------------------------------

    #[test]
    fn topics_for_device() {
        assert_eq!(status_topic("garden"), "irrigation/garden/status");
        assert_eq!(schedule_topic("garden"), "irrigation/garden/schedule/set");
    }

    #[test]
    fn extract_schedule_device_valid_topic() {
        assert_eq!(
            extract_schedule_device("irrigation/garden/schedule/set"),
            Some("garden")
        );
    }

    #[test]
    fn extract_schedule_device_wrong_prefix() {
        assert_eq!(extract_schedule_device("valve/garden/schedule/set"), None);
    }

    #[test]
    fn extract_schedule_device_wrong_suffix() {
        assert_eq!(extract_schedule_device("irrigation/garden/schedule/get"), None);
        assert_eq!(extract_schedule_device("irrigation/garden/status"), None);
    }

    #[test]
    fn extract_schedule_device_segment_count() {
        assert_eq!(extract_schedule_device("irrigation/schedule/set"), None);
        assert_eq!(extract_schedule_device("irrigation/a/b/schedule/set"), None);
        assert_eq!(extract_schedule_device(""), None);
    }

    // -- parse_schedule_update ----------------------------------------------

    #[test]
    fn parse_schedule_update_valid() {
        let s = parse_schedule_update(week().as_bytes()).unwrap();
        assert!(s.day(Weekday::Saturday).zones[0].enabled);
        assert!(!s.day(Weekday::Saturday).zones[1].enabled);
    }

    #[test]
    fn parse_schedule_update_not_json() {
        let err = parse_schedule_update(b"ON").unwrap_err();
        assert!(err.starts_with("bad schedule json"));
    }

    #[test]
    fn parse_schedule_update_missing_day() {
        let json = format!(r#"{{"mon":{d}}}"#, d = DAY);
        assert!(parse_schedule_update(json.as_bytes()).is_err());
    }

    #[test]
    fn parse_schedule_update_invalid_entry() {
        let bad = week().replacen("\"duration_min\":10", "\"duration_min\":0", 1);
        let err = parse_schedule_update(bad.as_bytes()).unwrap_err();
        assert!(err.contains("duration_min must be positive"), "{err}");
    }

    // -- StatusReport -------------------------------------------------------

    #[test]
    fn status_report_json_shape() {
        let report = StatusReport {
            ts: 1_704_067_200,
            reading: AggregatedReading {
                air_temperature_c: 20.5,
                humidity_pct: 55.0,
                pressure_hpa: 1012.0,
                soil_temperature_c: 16.0,
                soil_moisture_pct: -255.0,
                latest_soil_moisture_pct: -255.0,
                rain: true,
                samples: 5,
                faults: 5,
            },
            zones: [false; ZONE_COUNT],
            verdict: "moisture_unavailable".into(),
            suppression: Some(Suppression::MoistureUnavailable),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ts"], 1_704_067_200);
        assert_eq!(json["reading"]["soil_moisture_pct"], -255.0);
        assert_eq!(json["reading"]["rain"], true);
        assert_eq!(json["zones"], serde_json::json!([false, false, false, false]));
        assert_eq!(json["suppression"]["cause"], "moisture_unavailable");
    }
}

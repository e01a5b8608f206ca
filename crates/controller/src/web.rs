use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::Db;
use crate::state::SharedState;

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/schedule", get(api_schedule))
        .route("/api/zone-events", get(api_zone_events))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.schedule.clone())
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
}

async fn api_zone_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Response {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    match state.db.recent_zone_events(limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => {
            error!("zone events query failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "zone events unavailable").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    use crate::rain::RainState;
    use crate::schedule::{DaySchedule, ZoneSchedule, ZoneWindow};
    use crate::state::SystemState;

    async fn app_state() -> AppState {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let schedule = ZoneSchedule::every_day(DaySchedule::uniform(ZoneWindow {
            start_hours: 6.5,
            duration_min: 12,
            enabled: true,
        }));
        let shared = Arc::new(RwLock::new(SystemState::new(schedule, RainState::new(3))));
        AppState { shared, db }
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    // -- /api/status --------------------------------------------------------

    #[tokio::test]
    async fn status_endpoint_returns_snapshot() {
        let state = app_state().await;
        state.shared.write().await.record_zone(0, true, 1_704_067_200, "schedule");

        let (status, json) = get_json(state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mqtt_connected"], false);
        assert_eq!(json["zones"][0]["active"], true);
        assert_eq!(json["verdict"], "pending");
        assert!(json["reading"].is_null());
        assert_eq!(json["events"][0]["kind"], "zone");
    }

    // -- /api/schedule ------------------------------------------------------

    #[tokio::test]
    async fn schedule_endpoint_returns_week_table() {
        let (status, json) = get_json(app_state().await, "/api/schedule").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mon"]["zones"][0]["start_hours"], 6.5);
        assert_eq!(json["sun"]["zones"][3]["duration_min"], 12);
    }

    // -- /api/zone-events ---------------------------------------------------

    #[tokio::test]
    async fn zone_events_newest_first_with_limit() {
        let state = app_state().await;
        for (ts, active) in [(100, true), (700, false), (800, true)] {
            state
                .db
                .insert_zone_event(ts, 0, active, "schedule")
                .await
                .unwrap();
        }

        let (status, json) = get_json(state.clone(), "/api/zone-events?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let events = json.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ts"], 800);
        assert_eq!(events[0]["zone"], 1);

        let (_, json) = get_json(state, "/api/zone-events").await;
        assert_eq!(json.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn zone_events_bad_limit_is_rejected() {
        let (status, _) = get_json(app_state().await, "/api/zone-events?limit=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (status, _) = get_json(app_state().await, "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

mod aggregate;
mod clock;
mod config;
mod controller;
mod db;
mod decision;
mod rain;
mod relay;
mod report;
mod schedule;
mod sensor;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use controller::Controller;
use db::Db;
use rain::RainState;
use schedule::ZoneSchedule;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database + config file ──────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let cfg = config::load_or_default(&config_path);
    config::apply(&cfg, &db).await?;

    // ── Hardware ────────────────────────────────────────────────────
    let mut relays = relay::open(&cfg.relays)?;
    let failed = relay::all_off(relays.as_mut());
    if failed > 0 {
        error!(failed, "could not switch every relay off at startup");
    }
    let sensors = sensor::open(&cfg.sensors)?;

    // ── Shared state (for the web API) ──────────────────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(
        ZoneSchedule::all_disabled(),
        RainState::new(cfg.watering.lookback_days),
    )));

    // ── Channels ────────────────────────────────────────────────────
    let (report_tx, report_rx) = mpsc::channel(16);
    let (schedule_tx, schedule_rx) = mpsc::channel(4);

    let mut controller = Controller::new(
        &cfg,
        db.clone(),
        Arc::clone(&shared),
        sensors,
        relays,
        report_tx,
    );
    controller.restore().await;

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = report::connect(&cfg.device_id, broker.clone(), mqtt_port);
    tokio::spawn(report::run(
        client,
        eventloop,
        cfg.device_id.clone(),
        report_rx,
        schedule_tx,
        Arc::clone(&shared),
    ));
    info!(
        device_id = %cfg.device_id,
        broker = %broker,
        mqtt_port,
        web_port,
        "irrigation controller starting"
    );

    controller.run(schedule_rx).await
}

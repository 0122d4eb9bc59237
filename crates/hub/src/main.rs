mod clock;
mod config;
mod db;
mod diagnostics;
mod engine;
mod guards;
mod host;
mod ingest;
mod mqtt;
mod notify;
mod pump;
mod pump_board;
mod scheduler;
mod settings;
mod state;
mod web;

#[cfg(test)]
mod fakes;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::{collections::BTreeMap, env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use db::Db;
use engine::PlantEngine;
use host::Host;
use ingest::Ingest;
use mqtt::MqttBridge;
use pump::PumpTiming;
use pump_board::{HubSwitches, PumpBoard};
use scheduler::{PlantScheduler, Plants};
use settings::{PlantSettings, SettingsStore};
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:plant-hub.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed plants) ───────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Plant setup records come from the DB.
    let plant_configs = db.load_plants().await?;
    if plant_configs.is_empty() {
        warn!("no plants configured in the database");
    }
    info!(plants = plant_configs.len(), "db ready");

    // ── Pump board ──────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let local_pumps = cfg.local_pumps();
    let mut board = PumpBoard::new(&local_pumps, active_low)?;
    board.all_off();

    let mut tracked: Vec<String> = local_pumps.iter().map(|(s, _)| s.clone()).collect();
    for p in &plant_configs {
        if !tracked.contains(&p.pump_switch) {
            tracked.push(p.pump_switch.clone());
        }
    }

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared(&tracked);
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("plant-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bridge = Arc::new(MqttBridge::new(client, clock.clone()));
    let switches = Arc::new(HubSwitches::new(
        board,
        bridge.clone(),
        shared.clone(),
        clock.clone(),
    ));
    let host = Host {
        states: switches.clone(),
        actuator: switches.clone(),
        notifier: bridge.clone(),
        clock: clock.clone(),
    };

    // ── Plants ──────────────────────────────────────────────────────
    let store: Arc<dyn SettingsStore> = Arc::new(db.clone());
    let interval = Duration::from_secs(cfg.evaluate_interval_min * 60);
    let mut plants = BTreeMap::new();

    for pc in plant_configs {
        let plant_id = pc.plant_id.clone();
        let settings = PlantSettings::load(pc, store.clone())
            .await
            .with_context(|| format!("failed to load settings for plant '{plant_id}'"))?;

        if let Some(entry) = cfg.plants.iter().find(|e| e.plant_id == plant_id) {
            settings
                .seed(&entry.options)
                .await
                .with_context(|| format!("failed to seed options for plant '{plant_id}'"))?;
        }

        let engine = Arc::new(PlantEngine::new(
            Arc::new(settings),
            host.clone(),
            PumpTiming::default(),
        ));
        let sched = PlantScheduler::new(engine, shared.clone());
        sched.start(interval);
        plants.insert(plant_id, sched);
    }
    let plants: Plants = Arc::new(plants);

    info!(
        plants = plants.len(),
        interval_min = cfg.evaluate_interval_min,
        "schedulers started"
    );

    let ingest = Arc::new(Ingest::new(
        bridge.clone(),
        plants.clone(),
        shared.clone(),
        clock.clone(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: shared.clone(),
        plants: plants.clone(),
        ingest: ingest.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web: {e:#}");
        }
    });

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    ingest.handle_publish(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    ingest.subscribe_all();
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    // Best-effort fail-safe: turn every local pump off on comms error
                    switches.all_off();

                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                    drop(st);

                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    // Schedulers wind down while the event loop keeps turning, so a pump off
    // queued by an in-flight cycle still reaches the broker.
    bridge
        .drive_until(&mut eventloop, async {
            for sched in plants.values() {
                sched.shutdown().await;
            }
        })
        .await;
    switches.all_off();
    bridge.disconnect(&mut eventloop).await;
    shared
        .write()
        .await
        .record_system("hub stopped".to_string());
    info!("hub stopped");
    Ok(())
}

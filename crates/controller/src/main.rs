mod capability;
mod clock;
mod config;
mod cooldown;
mod db;
mod engine;
mod executor;
mod freshness;
mod mqtt;
mod pump;
mod state;
mod throttle;
mod web;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use config::PumpEntry;
use db::Db;
use engine::EvaluationEngine;
use mqtt::{MqttSensor, Notifier, Route, TopicRoutes};
use pump::{GpioPump, MqttPump, PumpDriver};
use state::SystemState;
use web::{AppState, PlantControl};
use worker::{PlantHandle, PlantWorker};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:plants.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let tick_secs = env_or::<u64>("TICK_INTERVAL_SEC", 600).max(1);
    let retention_days = env_or::<i64>("HISTORY_RETENTION_DAYS", 90).max(1);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    if cfg.plants.is_empty() {
        warn!("no plants configured in {config_path}");
    }
    if cfg.notify.is_none() {
        info!("no notify topic configured, notifications go to the log");
    }

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let names: Vec<(String, String)> = cfg
        .plants
        .iter()
        .map(|p| (p.plant_id.clone(), p.name.clone()))
        .collect();
    let shared = Arc::new(RwLock::new(SystemState::new(&names)));
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── MQTT client (pumps and notifiers publish through it) ────────
    let mut mqttoptions = MqttOptions::new("plant-controller", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Plants ──────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut routes = TopicRoutes::new();
    let mut plants = BTreeMap::new();

    for entry in &cfg.plants {
        let id = entry.plant_id.as_str();
        let (config_tx, config_rx) = watch::channel(entry.plant_config());
        let (sensor_tx, sensor_rx) = watch::channel(None);

        let pump = match &entry.pump {
            PumpEntry::Mqtt {
                command_topic,
                state_topic,
                self_timing,
            } => {
                let (state_tx, state_rx) = watch::channel(None);
                routes.add(
                    state_topic.clone(),
                    Route::PumpState {
                        plant_id: id.to_string(),
                        state: state_tx,
                    },
                );
                PumpDriver::Mqtt(MqttPump::new(
                    client.clone(),
                    command_topic.clone(),
                    state_rx,
                    *self_timing,
                ))
            }
            PumpEntry::Gpio { pin, active_low } => {
                let pin = u8::try_from(*pin)
                    .with_context(|| format!("plant {id}: gpio pin {pin} out of range"))?;
                PumpDriver::Gpio(
                    GpioPump::new(pin, *active_low)
                        .with_context(|| format!("plant {id}: gpio pump init failed"))?,
                )
            }
        };

        let notifier = match &cfg.notify {
            Some(n) => Notifier::Mqtt {
                client: client.clone(),
                topic: n.topic.clone(),
                plant_id: id.to_string(),
            },
            None => Notifier::Log {
                plant_id: id.to_string(),
            },
        };

        let mut engine = EvaluationEngine::new(
            id,
            entry.name.clone(),
            MqttSensor::new(sensor_rx),
            pump,
            notifier,
            config_rx,
        );

        match db.load_snapshot(id).await {
            Ok(Some(snap)) => {
                info!(plant = %id, status = ?snap.status, "restored plant state");
                // The last value stays usable until freshness says otherwise.
                sensor_tx.send_replace(snap.last_moisture);
                shared.write().await.seed_plant(
                    id,
                    snap.status,
                    snap.last_result,
                    snap.last_evaluated,
                );
                engine = engine.restore(snap);
            }
            Ok(None) => debug!(plant = %id, "no stored state, starting fresh"),
            Err(e) => {
                warn!(plant = %id, error = %format!("{e:#}"), "stored state unusable, starting fresh");
                shared
                    .write()
                    .await
                    .record_error(format!("{id}: stored state unusable: {e}"));
            }
        }

        let (handle, _task) =
            PlantWorker::new(engine, Arc::clone(&clock), Some(db.clone()), Arc::clone(&shared))
                .spawn();

        routes.add(
            entry.moisture_topic.clone(),
            Route::Moisture {
                handle: handle.clone(),
                latest: sensor_tx,
            },
        );
        if let Some(topic) = entry.heartbeat_topic() {
            routes.add(
                topic,
                Route::Heartbeat {
                    handle: handle.clone(),
                },
            );
        }

        plants.insert(
            id.to_string(),
            PlantControl {
                handle,
                config: config_tx,
            },
        );
    }

    info!(plants = plants.len(), "plants ready");

    let handles: Vec<PlantHandle> = plants.values().map(|p| p.handle.clone()).collect();

    // ── Web server ──────────────────────────────────────────────────
    let app_state = AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
        plants: Arc::new(plants),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, web_port).await {
            error!(error = %format!("{e:#}"), "web api unavailable");
        }
    });

    // ── Evaluation timer ────────────────────────────────────────────
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; give sensors one period to report.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for handle in &handles {
                handle.tick();
            }
        }
    });

    // ── History retention (at startup, then daily) ──────────────────
    let prune_db = db.clone();
    let prune_clock = Arc::clone(&clock);
    tokio::spawn(async move {
        let mut daily = interval(Duration::from_secs(24 * 60 * 60));
        loop {
            daily.tick().await;
            let cutoff = prune_clock.now() - time::Duration::days(retention_days);
            match prune_db.prune_evaluations(cutoff.unix_timestamp()).await {
                Ok(0) => {}
                Ok(n) => info!(rows = n, retention_days, "pruned evaluation history"),
                Err(e) => warn!(error = %format!("{e:#}"), "history pruning failed"),
            }
        }
    });

    // ── MQTT event loop ─────────────────────────────────────────────
    let topics: Vec<String> = routes.topics().map(str::to_string).collect();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match routes.dispatch(&p.topic, &p.payload, clock.now()) {
                    Ok(0) => debug!(topic = %p.topic, "unhandled topic"),
                    Ok(_) => {}
                    Err(msg) => {
                        warn!("bad payload: {msg}");
                        shared.write().await.record_error(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Non-blocking: the request queue is drained by this loop.
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %topic, error = %e, "subscribe failed");
                    }
                }
                info!(count = topics.len(), "subscribed to plant topics");

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
                error!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

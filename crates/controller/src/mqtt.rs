//! MQTT side of the controller: payload parsing, the sensor and notifier
//! adapters, and the routing table that turns inbound publishes into plant
//! signals and pump-state updates.

use std::collections::HashMap;

use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::capability::{
    CapabilityError, MoistureReading, NotificationSink, NotifyCategory, SensorCapability, Signal,
};
use crate::worker::PlantHandle;

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MoistureMsg {
    moisture: f32,
}

/// Accepts a bare number (`"23.5"`) or JSON `{"moisture": 23.5}`.
pub(crate) fn parse_moisture_payload(payload: &[u8]) -> Result<f32, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();

    let value = match s.parse::<f32>() {
        Ok(v) => v,
        Err(_) => serde_json::from_str::<MoistureMsg>(s)
            .map(|m| m.moisture)
            .map_err(|_| format!("unrecognised moisture payload '{s}'"))?,
    };

    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(format!("moisture {value} outside 0..=100"));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct SwitchMsg {
    state: String,
}

/// Parse a pump state report: a bare word (case-insensitive, trims
/// whitespace) or a JSON object with a `state` field.
pub(crate) fn parse_switch_state(payload: &[u8]) -> Result<bool, String> {
    let raw = String::from_utf8_lossy(payload);
    let raw = raw.trim();
    let word = match serde_json::from_str::<SwitchMsg>(raw) {
        Ok(msg) => msg.state,
        Err(_) => raw.to_string(),
    };
    match word.trim().to_uppercase().as_str() {
        "ON" | "1" | "TRUE" => Ok(true),
        "OFF" | "0" | "FALSE" => Ok(false),
        other => Err(format!("unknown switch state '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// Sensor adapter
// ---------------------------------------------------------------------------

/// Latest reading received on a plant's moisture topic.
pub struct MqttSensor {
    latest: watch::Receiver<Option<MoistureReading>>,
}

impl MqttSensor {
    pub fn new(latest: watch::Receiver<Option<MoistureReading>>) -> Self {
        Self { latest }
    }
}

impl SensorCapability for MqttSensor {
    async fn read_moisture(&self) -> Result<MoistureReading, CapabilityError> {
        let latest = *self.latest.borrow();
        latest.ok_or_else(|| CapabilityError::Unavailable("no moisture reading received".into()))
    }
}

// ---------------------------------------------------------------------------
// Notifier adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NotificationMsg<'a> {
    plant_id: &'a str,
    category: NotifyCategory,
    message: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
}

pub enum Notifier {
    Mqtt {
        client: AsyncClient,
        topic: String,
        plant_id: String,
    },
    /// Used when no notify topic is configured.
    Log { plant_id: String },
}

impl NotificationSink for Notifier {
    async fn send(&self, category: NotifyCategory, message: &str) -> Result<(), CapabilityError> {
        match self {
            Notifier::Mqtt {
                client,
                topic,
                plant_id,
            } => {
                let body = serde_json::to_vec(&NotificationMsg {
                    plant_id,
                    category,
                    message,
                    ts: OffsetDateTime::now_utc(),
                })
                .map_err(|e| CapabilityError::Unavailable(format!("encode notification: {e}")))?;
                client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, body)
                    .await
                    .map_err(|e| CapabilityError::Unavailable(format!("publish to {topic}: {e}")))
            }
            Notifier::Log { plant_id } => {
                info!(plant = %plant_id, category = category.as_str(), "notify: {message}");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

pub enum Route {
    Moisture {
        handle: PlantHandle,
        latest: watch::Sender<Option<MoistureReading>>,
    },
    Heartbeat {
        handle: PlantHandle,
    },
    PumpState {
        plant_id: String,
        state: watch::Sender<Option<bool>>,
    },
}

/// Exact-topic routing table; several plants may share a topic.
#[derive(Default)]
pub struct TopicRoutes {
    routes: HashMap<String, Vec<Route>>,
}

impl TopicRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: impl Into<String>, route: Route) {
        self.routes.entry(topic.into()).or_default().push(route);
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Apply one inbound publish. Returns how many routes accepted it;
    /// `Err` carries every payload problem for the error log.
    pub fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<usize, String> {
        let Some(routes) = self.routes.get(topic) else {
            return Ok(0);
        };

        let mut handled = 0;
        let mut errors = Vec::new();

        for route in routes {
            match route {
                Route::Moisture { handle, latest } => match parse_moisture_payload(payload) {
                    Ok(percent) => {
                        let reading = MoistureReading { percent, at: now };
                        latest.send_replace(Some(reading));
                        handle.signal(Signal::Reading(reading));
                        debug!(plant = %handle.plant_id(), percent, "mqtt: moisture reading");
                        handled += 1;
                    }
                    Err(e) => errors.push(format!("{}: {e} (topic {topic})", handle.plant_id())),
                },
                Route::Heartbeat { handle } => {
                    handle.signal(Signal::Heartbeat(now));
                    handled += 1;
                }
                Route::PumpState { plant_id, state } => match parse_switch_state(payload) {
                    Ok(on) => {
                        state.send_replace(Some(on));
                        debug!(plant = %plant_id, on, "mqtt: pump state");
                        handled += 1;
                    }
                    Err(e) => errors.push(format!("{plant_id}: {e} (topic {topic})")),
                },
            }
        }

        if errors.is_empty() {
            Ok(handled)
        } else {
            Err(errors.join("; "))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

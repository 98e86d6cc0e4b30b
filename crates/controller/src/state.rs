use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::engine::{EvaluationResult, Status};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub plants: BTreeMap<String, PlantSummary>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct PlantSummary {
    pub name: String,
    pub status: Status,
    pub last_result: Option<EvaluationResult>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_evaluated: Option<OffsetDateTime>,
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
    Evaluation,
    Watering,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub plants: BTreeMap<String, PlantSummary>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    /// `plants` is `(plant_id, display name)` for every configured plant.
    pub fn new(plants: &[(String, String)]) -> Self {
        let plants = plants
            .iter()
            .map(|(id, name)| {
                (
                    id.clone(),
                    PlantSummary {
                        name: name.clone(),
                        status: Status::Ok,
                        last_result: None,
                        last_evaluated: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            plants,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the outcome of one evaluation or manual watering.
    pub fn record_evaluation(
        &mut self,
        plant_id: &str,
        result: EvaluationResult,
        status: Status,
        at: OffsetDateTime,
    ) {
        if let Some(plant) = self.plants.get_mut(plant_id) {
            plant.status = status;
            plant.last_result = Some(result);
            plant.last_evaluated = Some(at);
        }

        let kind = match result {
            EvaluationResult::Watered | EvaluationResult::FailedPumpConfirmation => {
                EventKind::Watering
            }
            _ => EventKind::Evaluation,
        };
        self.push_event(kind, format!("{plant_id}: {}", result.as_str()));
    }

    /// Seed a plant's summary from restored state without logging an event.
    pub fn seed_plant(
        &mut self,
        plant_id: &str,
        status: Status,
        last_result: Option<EvaluationResult>,
        last_evaluated: Option<OffsetDateTime>,
    ) {
        if let Some(plant) = self.plants.get_mut(plant_id) {
            plant.status = status;
            plant.last_result = last_result;
            plant.last_evaluated = last_evaluated;
        }
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
            plants: self.plants.clone(),
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

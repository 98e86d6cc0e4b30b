//! Capability seams between the evaluation core and the outside world.
//!
//! The engine only ever talks to a plant through these traits. Concrete
//! adapters (MQTT, GPIO, log-only) live in `mqtt.rs` and `pump.rs` and are
//! picked per plant when the config file is loaded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::config::PlantConfig;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A moisture percentage and the instant it was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoistureReading {
    pub percent: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Anything that proves the sensor is alive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Reading(MoistureReading),
    /// The sensor (or its bridge) is alive but published no new value.
    Heartbeat(OffsetDateTime),
}

impl Signal {
    pub fn at(&self) -> OffsetDateTime {
        match self {
            Signal::Reading(r) => r.at,
            Signal::Heartbeat(at) => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyCategory {
    Watered,
    StaleBlocked,
    WateringFailed,
}

impl NotifyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyCategory::Watered => "watered",
            NotifyCategory::StaleBlocked => "stale_blocked",
            NotifyCategory::WateringFailed => "watering_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait SensorCapability: Send + Sync {
    fn read_moisture(
        &self,
    ) -> impl Future<Output = Result<MoistureReading, CapabilityError>> + Send;
}

pub trait PumpCapability: Send + Sync {
    /// Command the pump. `Ok` means the command was accepted, not that the
    /// pump actually switched.
    fn set_state(&self, on: bool) -> impl Future<Output = Result<(), CapabilityError>> + Send;

    /// Actual state as last reported by the hardware.
    fn is_on(&self) -> impl Future<Output = Result<bool, CapabilityError>> + Send;

    /// Pumps that stop on their own after a run are never sent OFF on the
    /// success path.
    fn self_timing(&self) -> bool {
        false
    }
}

pub trait NotificationSink: Send + Sync {
    fn send(
        &self,
        category: NotifyCategory,
        message: &str,
    ) -> impl Future<Output = Result<(), CapabilityError>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> PlantConfig;
}

impl<T: SensorCapability> SensorCapability for Arc<T> {
    fn read_moisture(
        &self,
    ) -> impl Future<Output = Result<MoistureReading, CapabilityError>> + Send {
        (**self).read_moisture()
    }
}

impl<T: PumpCapability> PumpCapability for Arc<T> {
    fn set_state(&self, on: bool) -> impl Future<Output = Result<(), CapabilityError>> + Send {
        (**self).set_state(on)
    }

    fn is_on(&self) -> impl Future<Output = Result<bool, CapabilityError>> + Send {
        (**self).is_on()
    }

    fn self_timing(&self) -> bool {
        (**self).self_timing()
    }
}

impl<T: NotificationSink> NotificationSink for Arc<T> {
    fn send(
        &self,
        category: NotifyCategory,
        message: &str,
    ) -> impl Future<Output = Result<(), CapabilityError>> + Send {
        (**self).send(category, message)
    }
}

impl ConfigProvider for watch::Receiver<PlantConfig> {
    fn current(&self) -> PlantConfig {
        self.borrow().clone()
    }
}

impl ConfigProvider for PlantConfig {
    fn current(&self) -> PlantConfig {
        self.clone()
    }
}

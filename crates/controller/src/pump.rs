//! Pump drivers. `Mqtt` commands a smart plug or relay bridge and learns
//! the real state from its state topic; `Gpio` drives a relay pin directly.
//! The `gpio` feature gates the real rppal driver; without it, a mock pin
//! logs state changes.
//!
//! A bare relay pin has no feedback line: `GpioPump` confirms by reading
//! back its own output latch, so for GPIO pumps a confirmed run only proves
//! the pin switched, not that water flowed.

use std::sync::{Mutex, MutexGuard};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tracing::info;

use crate::capability::{CapabilityError, PumpCapability};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(not(feature = "gpio"))]
use std::sync::atomic::{AtomicBool, Ordering};

pub enum PumpDriver {
    Mqtt(MqttPump),
    Gpio(GpioPump),
}

impl PumpCapability for PumpDriver {
    async fn set_state(&self, on: bool) -> Result<(), CapabilityError> {
        match self {
            PumpDriver::Mqtt(p) => p.set_state(on).await,
            PumpDriver::Gpio(p) => p.set_state(on).await,
        }
    }

    async fn is_on(&self) -> Result<bool, CapabilityError> {
        match self {
            PumpDriver::Mqtt(p) => p.is_on().await,
            PumpDriver::Gpio(p) => p.is_on().await,
        }
    }

    fn self_timing(&self) -> bool {
        match self {
            PumpDriver::Mqtt(p) => p.self_timing,
            PumpDriver::Gpio(_) => false,
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// MQTT pump (smart plug / relay bridge)
// ---------------------------------------------------------------------------

pub struct MqttPump {
    client: AsyncClient,
    command_topic: String,
    reports: Mutex<Reports>,
    self_timing: bool,
}

/// State-topic reports as seen since the last command. Anything published
/// before that command (a retained message, a plug that went offline while
/// ON) is not evidence of the commanded state.
struct Reports {
    rx: watch::Receiver<Option<bool>>,
    since_command: Option<bool>,
}

impl MqttPump {
    pub fn new(
        client: AsyncClient,
        command_topic: impl Into<String>,
        state: watch::Receiver<Option<bool>>,
        self_timing: bool,
    ) -> Self {
        Self {
            client,
            command_topic: command_topic.into(),
            reports: Mutex::new(Reports {
                rx: state,
                since_command: None,
            }),
            self_timing,
        }
    }

    fn reports(&self) -> Result<MutexGuard<'_, Reports>, CapabilityError> {
        self.reports
            .lock()
            .map_err(|_| CapabilityError::Unavailable("pump state lock poisoned".into()))
    }

    async fn set_state(&self, on: bool) -> Result<(), CapabilityError> {
        {
            // Forget earlier reports before the command can be answered.
            let mut reports = self.reports()?;
            reports.rx.borrow_and_update();
            reports.since_command = None;
        }
        self.client
            .publish(
                self.command_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                on_off(on),
            )
            .await
            .map_err(|e| {
                CapabilityError::Unavailable(format!("publish to {}: {e}", self.command_topic))
            })?;
        info!(topic = %self.command_topic, "pump: sent {}", on_off(on));
        Ok(())
    }

    async fn is_on(&self) -> Result<bool, CapabilityError> {
        let mut reports = self.reports()?;
        if reports.rx.has_changed().unwrap_or(false) {
            let latest = *reports.rx.borrow_and_update();
            reports.since_command = latest;
        }
        reports.since_command.ok_or_else(|| {
            CapabilityError::Unavailable(format!(
                "no state reported for {} since last command",
                self.command_topic
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioPump {
    pin: Mutex<OutputPin>,
    pin_num: u8,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioPump {
    pub fn new(pin_num: u8, active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_num)?.into_output();

        // Fail-safe: relay OFF at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(gpio = pin_num, active_low, "pump: relay pin ready");

        Ok(Self {
            pin: Mutex::new(pin),
            pin_num,
            active_low,
        })
    }

    async fn set_state(&self, on: bool) -> Result<(), CapabilityError> {
        let mut pin = self
            .pin
            .lock()
            .map_err(|_| CapabilityError::Unavailable("gpio pin lock poisoned".into()))?;
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(gpio = self.pin_num, "pump: relay {}", on_off(on));
        Ok(())
    }

    /// Reads back the output latch. This only agrees with the last
    /// `set_state`; there is no feedback from the pump itself.
    async fn is_on(&self) -> Result<bool, CapabilityError> {
        let pin = self
            .pin
            .lock()
            .map_err(|_| CapabilityError::Unavailable("gpio pin lock poisoned".into()))?;
        Ok(if self.active_low {
            pin.is_set_low()
        } else {
            pin.is_set_high()
        })
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO relay (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct GpioPump {
    pin_num: u8,
    on: AtomicBool,
}

#[cfg(not(feature = "gpio"))]
impl GpioPump {
    pub fn new(pin_num: u8, _active_low: bool) -> anyhow::Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] relay registered (not wired)");
        Ok(Self {
            pin_num,
            on: AtomicBool::new(false),
        })
    }

    async fn set_state(&self, on: bool) -> Result<(), CapabilityError> {
        self.on.store(on, Ordering::SeqCst);
        info!(gpio = self.pin_num, "[mock-gpio] relay {}", on_off(on));
        Ok(())
    }

    async fn is_on(&self) -> Result<bool, CapabilityError> {
        Ok(self.on.load(Ordering::SeqCst))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

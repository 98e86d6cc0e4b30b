//! TOML config file loading and validation, plus the per-plant settings the
//! evaluation engine reads on every call.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::capability::NotifyCategory;

// ---------------------------------------------------------------------------
// Defaults and bounds
// ---------------------------------------------------------------------------

pub const DEFAULT_THRESHOLD_PCT: f32 = 35.0;
pub const DEFAULT_PUMP_DURATION_S: i64 = 8;
pub const DEFAULT_COOLDOWN_MIN: i64 = 240;
pub const DEFAULT_STALE_AFTER_MIN: i64 = 120;

const MAX_PUMP_DURATION_S: i64 = 120;
const MAX_COOLDOWN_MIN: i64 = 1440;
const MAX_STALE_AFTER_MIN: i64 = 1440;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD_PCT
}
fn default_pump_duration() -> i64 {
    DEFAULT_PUMP_DURATION_S
}
fn default_cooldown() -> i64 {
    DEFAULT_COOLDOWN_MIN
}
fn default_stale_after() -> i64 {
    DEFAULT_STALE_AFTER_MIN
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Engine-facing settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyToggles {
    pub on_water: bool,
    pub on_stale: bool,
    pub on_failure: bool,
}

impl NotifyToggles {
    pub fn enabled(&self, category: NotifyCategory) -> bool {
        match category {
            NotifyCategory::Watered => self.on_water,
            NotifyCategory::StaleBlocked => self.on_stale,
            NotifyCategory::WateringFailed => self.on_failure,
        }
    }
}

/// User-tunable settings of one plant. Only ever handed to the engine
/// after `validate` passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    pub threshold_pct: f32,
    pub pump_duration_s: u64,
    pub cooldown_min: u64,
    pub stale_after_min: u64,
    pub auto_water: bool,
    pub notify: NotifyToggles,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            threshold_pct: DEFAULT_THRESHOLD_PCT,
            pump_duration_s: DEFAULT_PUMP_DURATION_S as u64,
            cooldown_min: DEFAULT_COOLDOWN_MIN as u64,
            stale_after_min: DEFAULT_STALE_AFTER_MIN as u64,
            auto_water: false,
            notify: NotifyToggles {
                on_water: true,
                on_stale: false,
                on_failure: false,
            },
        }
    }
}

/// Rejected settings, one message per violation.
#[derive(Debug, thiserror::Error)]
#[error("invalid plant config: {}", .0.join("; "))]
pub struct InvalidConfig(pub Vec<String>);

/// Partial update coming from the HTTP API; unset fields keep their value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantConfigPatch {
    pub threshold_pct: Option<f32>,
    pub pump_duration_s: Option<u64>,
    pub cooldown_min: Option<u64>,
    pub stale_after_min: Option<u64>,
    pub auto_water: Option<bool>,
    pub notify_on_water: Option<bool>,
    pub notify_on_stale: Option<bool>,
    pub notify_on_failure: Option<bool>,
}

impl PlantConfig {
    pub fn pump_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pump_duration_s)
    }

    pub fn cooldown(&self) -> time::Duration {
        time::Duration::minutes(clamp_i64(self.cooldown_min))
    }

    pub fn stale_after(&self) -> time::Duration {
        time::Duration::minutes(clamp_i64(self.stale_after_min))
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let mut errors = Vec::new();
        check_settings(
            "plant",
            self.threshold_pct,
            clamp_i64(self.pump_duration_s),
            clamp_i64(self.cooldown_min),
            clamp_i64(self.stale_after_min),
            &mut errors,
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(InvalidConfig(errors))
        }
    }

    /// Apply a patch and validate the result; `self` is left untouched.
    pub fn patched(&self, patch: &PlantConfigPatch) -> Result<PlantConfig, InvalidConfig> {
        let mut next = self.clone();
        if let Some(v) = patch.threshold_pct {
            next.threshold_pct = v;
        }
        if let Some(v) = patch.pump_duration_s {
            next.pump_duration_s = v;
        }
        if let Some(v) = patch.cooldown_min {
            next.cooldown_min = v;
        }
        if let Some(v) = patch.stale_after_min {
            next.stale_after_min = v;
        }
        if let Some(v) = patch.auto_water {
            next.auto_water = v;
        }
        if let Some(v) = patch.notify_on_water {
            next.notify.on_water = v;
        }
        if let Some(v) = patch.notify_on_stale {
            next.notify.on_stale = v;
        }
        if let Some(v) = patch.notify_on_failure {
            next.notify.on_failure = v;
        }
        next.validate()?;
        Ok(next)
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn check_settings(
    ctx: &str,
    threshold_pct: f32,
    pump_duration_s: i64,
    cooldown_min: i64,
    stale_after_min: i64,
    errors: &mut Vec<String>,
) {
    if !(0.0..=100.0).contains(&threshold_pct) {
        errors.push(format!(
            "{ctx}: threshold_pct {threshold_pct} out of range [0, 100]"
        ));
    }
    if pump_duration_s <= 0 {
        errors.push(format!(
            "{ctx}: pump_duration_s must be positive, got {pump_duration_s}"
        ));
    } else if pump_duration_s > MAX_PUMP_DURATION_S {
        errors.push(format!(
            "{ctx}: pump_duration_s {pump_duration_s} exceeds {MAX_PUMP_DURATION_S}"
        ));
    }
    if !(0..=MAX_COOLDOWN_MIN).contains(&cooldown_min) {
        errors.push(format!(
            "{ctx}: cooldown_min {cooldown_min} out of range [0, {MAX_COOLDOWN_MIN}]"
        ));
    }
    if stale_after_min <= 0 {
        errors.push(format!(
            "{ctx}: stale_after_min must be positive, got {stale_after_min}"
        ));
    } else if stale_after_min > MAX_STALE_AFTER_MIN {
        errors.push(format!(
            "{ctx}: stale_after_min {stale_after_min} exceeds {MAX_STALE_AFTER_MIN}"
        ));
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub notify: Option<NotifyEntry>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct NotifyEntry {
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub name: String,
    pub moisture_topic: String,
    #[serde(default)]
    pub heartbeat_topic: Option<String>,
    pub pump: PumpEntry,

    #[serde(default = "default_threshold")]
    pub threshold_pct: f32,
    #[serde(default = "default_pump_duration")]
    pub pump_duration_s: i64,
    #[serde(default = "default_cooldown")]
    pub cooldown_min: i64,
    #[serde(default = "default_stale_after")]
    pub stale_after_min: i64,
    #[serde(default)]
    pub auto_water: bool,

    #[serde(default = "default_true")]
    pub notify_on_water: bool,
    #[serde(default)]
    pub notify_on_stale: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PumpEntry {
    /// Smart plug / relay bridged over MQTT.
    Mqtt {
        command_topic: String,
        state_topic: String,
        #[serde(default)]
        self_timing: bool,
    },
    /// Relay wired to a Raspberry Pi header pin.
    Gpio {
        pin: i64,
        #[serde(default = "default_true")]
        active_low: bool,
    },
}

impl PlantEntry {
    /// A blank heartbeat topic means "no heartbeat".
    pub fn heartbeat_topic(&self) -> Option<&str> {
        self.heartbeat_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Settings as the engine sees them. Only meaningful after `validate`.
    pub fn plant_config(&self) -> PlantConfig {
        PlantConfig {
            threshold_pct: self.threshold_pct,
            pump_duration_s: self.pump_duration_s.max(0) as u64,
            cooldown_min: self.cooldown_min.max(0) as u64,
            stale_after_min: self.stale_after_min.max(0) as u64,
            auto_water: self.auto_water,
            notify: NotifyToggles {
                on_water: self.notify_on_water,
                on_stale: self.notify_on_stale,
                on_failure: self.notify_on_failure,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_topic(ctx: &str, field: &str, topic: &str, errors: &mut Vec<String>) {
    if topic.trim().is_empty() {
        errors.push(format!("{ctx}: {field} is empty"));
    } else if topic.contains(['+', '#']) {
        errors.push(format!(
            "{ctx}: {field} '{topic}' must not contain MQTT wildcards"
        ));
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(n) = &self.notify {
            check_topic("notify", "topic", &n.topic, &mut errors);
        }
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = if p.plant_id.is_empty() {
                format!("plants[{i}]")
            } else {
                format!("plant '{}'", p.plant_id)
            };

            // ── Identity ────────────────────────────────────────
            if p.plant_id.trim().is_empty() {
                errors.push(format!("{ctx}: plant_id is empty"));
            } else if !p
                .plant_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                errors.push(format!(
                    "{ctx}: plant_id may only contain letters, digits, '-' and '_'"
                ));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{ctx}: duplicate plant_id"));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            // ── Topics ──────────────────────────────────────────
            check_topic(&ctx, "moisture_topic", &p.moisture_topic, errors);
            if let Some(hb) = p.heartbeat_topic() {
                check_topic(&ctx, "heartbeat_topic", hb, errors);
            }

            // ── Settings ────────────────────────────────────────
            check_settings(
                &ctx,
                p.threshold_pct,
                p.pump_duration_s,
                p.cooldown_min,
                p.stale_after_min,
                errors,
            );

            // ── Pump ────────────────────────────────────────────
            match &p.pump {
                PumpEntry::Mqtt {
                    command_topic,
                    state_topic,
                    ..
                } => {
                    check_topic(&ctx, "pump.command_topic", command_topic, errors);
                    check_topic(&ctx, "pump.state_topic", state_topic, errors);
                    if !command_topic.is_empty() && command_topic == state_topic {
                        errors.push(format!(
                            "{ctx}: pump.command_topic and pump.state_topic must differ"
                        ));
                    }
                }
                PumpEntry::Gpio { pin, .. } => {
                    if !VALID_GPIO_PINS.contains(pin) {
                        errors.push(format!(
                            "{ctx}: pump.pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                        ));
                    } else if !seen_pins.insert(*pin) {
                        errors.push(format!(
                            "{ctx}: pump.pin {pin} is already used by another plant"
                        ));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

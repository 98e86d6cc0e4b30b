//! Per-plant evaluation engine: decides whether to water, runs the pump
//! through the executor, and derives the plant's OK/Problem status.
//!
//! ## Decision order
//!
//! ```text
//! Evaluate(now, signal?)
//!   ├─ auto-water off ─────────────────▶ SkippedDisabled
//!   ├─ stale data / sensor unavailable ▶ SkippedStale            (stale alert)
//!   ├─ moisture >= threshold ──────────▶ SkippedAboveThreshold
//!   ├─ cooldown running ───────────────▶ SkippedNotDue
//!   └─ pump run ─┬─ confirmed ─────────▶ Watered                 (cooldown stamped)
//!                └─ not confirmed ─────▶ FailedPumpConfirmation  (failure alert)
//! ```
//!
//! "Water Now" skips the enabled, threshold and cooldown checks but is still
//! blocked by stale data.
//!
//! The engine is not `Sync`-shared: it is owned by exactly one worker task
//! (see `worker.rs`), which is what makes each call mutually exclusive.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::capability::{
    ConfigProvider, MoistureReading, NotificationSink, NotifyCategory, PumpCapability,
    SensorCapability, Signal,
};
use crate::config::PlantConfig;
use crate::cooldown::CooldownGate;
use crate::executor::{bounded, WateringExecutor, WateringOutcome};
use crate::freshness::FreshnessTracker;
use crate::throttle::{self, NotificationThrottle};

// ---------------------------------------------------------------------------
// Results and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    Watered,
    SkippedDisabled,
    SkippedNotDue,
    SkippedStale,
    SkippedAboveThreshold,
    FailedPumpConfirmation,
}

impl EvaluationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationResult::Watered => "watered",
            EvaluationResult::SkippedDisabled => "skipped_disabled",
            EvaluationResult::SkippedNotDue => "skipped_not_due",
            EvaluationResult::SkippedStale => "skipped_stale",
            EvaluationResult::SkippedAboveThreshold => "skipped_above_threshold",
            EvaluationResult::FailedPumpConfirmation => "failed_pump_confirmation",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Problem,
}

impl Status {
    /// The only place a status is computed.
    pub fn derive(last: EvaluationResult, auto_water: bool, fresh: bool) -> Status {
        if last == EvaluationResult::FailedPumpConfirmation || (auto_water && !fresh) {
            Status::Problem
        } else {
            Status::Ok
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMark {
    pub category: NotifyCategory,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Everything a restart needs to pick up where the engine left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantSnapshot {
    pub plant_id: String,
    pub status: Status,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_watered: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_evaluated: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_result: Option<EvaluationResult>,
    #[serde(default)]
    pub last_moisture: Option<MoistureReading>,
    #[serde(default)]
    pub last_notified: Vec<NotificationMark>,
}

/// Snapshot plus the live view the API shows.
#[derive(Debug, Clone, Serialize)]
pub struct PlantDiagnostics {
    pub name: String,
    pub fresh: bool,
    pub cooldown_remaining_s: Option<i64>,
    pub config: PlantConfig,
    #[serde(flatten)]
    pub snapshot: PlantSnapshot,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct EvaluationEngine<S, P, N, C> {
    plant_id: String,
    name: String,

    sensor: S,
    pump: P,
    notifier: N,
    config: C,
    executor: WateringExecutor,

    freshness: FreshnessTracker,
    cooldown: CooldownGate,
    throttle: NotificationThrottle,

    status: Status,
    last_result: Option<EvaluationResult>,
    last_moisture: Option<MoistureReading>,
    last_evaluated: Option<OffsetDateTime>,
}

impl<S, P, N, C> EvaluationEngine<S, P, N, C>
where
    S: SensorCapability,
    P: PumpCapability,
    N: NotificationSink,
    C: ConfigProvider,
{
    pub fn new(
        plant_id: impl Into<String>,
        name: impl Into<String>,
        sensor: S,
        pump: P,
        notifier: N,
        config: C,
    ) -> Self {
        Self {
            plant_id: plant_id.into(),
            name: name.into(),
            sensor,
            pump,
            notifier,
            config,
            executor: WateringExecutor::default(),
            freshness: FreshnessTracker::default(),
            cooldown: CooldownGate::default(),
            throttle: NotificationThrottle::default(),
            status: Status::Ok,
            last_result: None,
            last_moisture: None,
            last_evaluated: None,
        }
    }

    /// Rebuild state from a persisted snapshot.
    pub fn restore(mut self, snapshot: PlantSnapshot) -> Self {
        self.freshness = FreshnessTracker::new(snapshot.last_seen);
        self.cooldown = CooldownGate::new(snapshot.last_watered);
        self.throttle = NotificationThrottle::new(
            snapshot
                .last_notified
                .into_iter()
                .map(|m| (m.category, m.at))
                .collect(),
        );
        self.status = snapshot.status;
        self.last_result = snapshot.last_result;
        self.last_moisture = snapshot.last_moisture;
        self.last_evaluated = snapshot.last_evaluated;
        self
    }

    pub fn plant_id(&self) -> &str {
        &self.plant_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_watered(&self) -> Option<OffsetDateTime> {
        self.cooldown.last_watered()
    }

    /// Feed a reading or heartbeat. Only moves freshness forward; a reading
    /// older than the one already held does not replace its value.
    pub fn record_signal(&mut self, signal: Signal) {
        if !self.freshness.record_signal(signal.at()) {
            debug!(plant = %self.plant_id, at = %signal.at(), "engine: out-of-order signal ignored");
        }
        if let Signal::Reading(reading) = signal {
            let newer = self.last_moisture.map_or(true, |held| reading.at >= held.at);
            if newer {
                self.last_moisture = Some(reading);
            }
        }
    }

    /// One evaluation cycle (timer tick or "Evaluate Now"). Never fails:
    /// every capability error ends up as a result variant.
    pub async fn evaluate(&mut self, now: OffsetDateTime, signal: Option<Signal>) -> EvaluationResult {
        let provided = signal.is_some_and(|s| matches!(s, Signal::Reading(_)));
        if let Some(s) = signal {
            self.record_signal(s);
        }

        let cfg = self.config.current();
        let result = if !cfg.auto_water {
            EvaluationResult::SkippedDisabled
        } else {
            match self.trusted_moisture(now, &cfg, provided).await {
                None => self.blocked_stale(now, &cfg).await,
                Some(m) if m.percent >= cfg.threshold_pct => {
                    debug!(
                        plant = %self.plant_id,
                        moisture = m.percent,
                        threshold = cfg.threshold_pct,
                        "engine: moisture above threshold"
                    );
                    EvaluationResult::SkippedAboveThreshold
                }
                Some(_) if !self.cooldown.can_water_now(now, cfg.cooldown()) => {
                    debug!(
                        plant = %self.plant_id,
                        remaining = ?self.cooldown.remaining(now, cfg.cooldown()),
                        "engine: cooldown running"
                    );
                    EvaluationResult::SkippedNotDue
                }
                Some(_) => self.water(now, &cfg).await,
            }
        };

        self.finish(now, &cfg, result)
    }

    /// Manual "Water Now": ignores threshold, cooldown and the auto-water
    /// switch, but refuses to act on stale data.
    pub async fn water_now(&mut self, now: OffsetDateTime) -> EvaluationResult {
        let cfg = self.config.current();
        info!(plant = %self.plant_id, "engine: manual watering requested");

        let result = match self.trusted_moisture(now, &cfg, false).await {
            None => self.blocked_stale(now, &cfg).await,
            Some(_) => self.water(now, &cfg).await,
        };

        self.finish(now, &cfg, result)
    }

    pub fn snapshot(&self) -> PlantSnapshot {
        PlantSnapshot {
            plant_id: self.plant_id.clone(),
            status: self.status,
            last_seen: self.freshness.last_seen(),
            last_watered: self.last_watered(),
            last_evaluated: self.last_evaluated,
            last_result: self.last_result,
            last_moisture: self.last_moisture,
            last_notified: self
                .throttle
                .entries()
                .map(|(category, at)| NotificationMark { category, at })
                .collect(),
        }
    }

    pub fn diagnostics(&self, now: OffsetDateTime) -> PlantDiagnostics {
        let config = self.config.current();
        PlantDiagnostics {
            name: self.name.clone(),
            fresh: self.freshness.is_fresh(now, config.stale_after()),
            cooldown_remaining_s: self
                .cooldown
                .remaining(now, config.cooldown())
                .map(|d| d.whole_seconds()),
            snapshot: self.snapshot(),
            config,
        }
    }

    // -- Internals ----------------------------------------------------------

    /// Moisture to decide on, or `None` when it cannot be trusted: stale
    /// freshness, or a sensor that could not be read this cycle.
    async fn trusted_moisture(
        &mut self,
        now: OffsetDateTime,
        cfg: &PlantConfig,
        provided: bool,
    ) -> Option<MoistureReading> {
        if !provided {
            match bounded(self.executor.call_timeout, self.sensor.read_moisture()).await {
                Ok(reading) => self.record_signal(Signal::Reading(reading)),
                Err(e) => {
                    warn!(plant = %self.plant_id, error = %e, "engine: sensor read failed");
                    return None;
                }
            }
        }

        if !self.freshness.is_fresh(now, cfg.stale_after()) {
            return None;
        }
        self.last_moisture
    }

    async fn blocked_stale(&mut self, now: OffsetDateTime, cfg: &PlantConfig) -> EvaluationResult {
        let age_min = self.freshness.age(now).map(|a| a.whole_minutes());
        warn!(
            plant = %self.plant_id,
            ?age_min,
            stale_after_min = cfg.stale_after_min,
            "engine: moisture data stale, not watering"
        );

        let message = match age_min {
            Some(m) => format!(
                "{}: moisture sensor stale (last seen {m} min ago), watering blocked",
                self.name
            ),
            None => format!("{}: no trusted moisture data, watering blocked", self.name),
        };
        self.notify(NotifyCategory::StaleBlocked, now, cfg, message)
            .await;

        EvaluationResult::SkippedStale
    }

    async fn water(&mut self, now: OffsetDateTime, cfg: &PlantConfig) -> EvaluationResult {
        info!(
            plant = %self.plant_id,
            duration_s = cfg.pump_duration_s,
            "engine: starting pump run"
        );

        match self.executor.run(&self.pump, cfg.pump_duration()).await {
            WateringOutcome::Success => {
                self.cooldown.record_watering(now);
                let message = format!("{}: watered for {}s", self.name, cfg.pump_duration_s);
                self.notify(NotifyCategory::Watered, now, cfg, message).await;
                EvaluationResult::Watered
            }
            WateringOutcome::FailedConfirmation(e) => {
                error!(plant = %self.plant_id, error = %e, "engine: pump run not confirmed");
                let message = format!(
                    "{}: pump did not confirm ON ({e}), plant was not watered",
                    self.name
                );
                self.notify(NotifyCategory::WateringFailed, now, cfg, message)
                    .await;
                EvaluationResult::FailedPumpConfirmation
            }
        }
    }

    async fn notify(
        &mut self,
        category: NotifyCategory,
        now: OffsetDateTime,
        cfg: &PlantConfig,
        message: String,
    ) {
        if !cfg.notify.enabled(category) {
            return;
        }
        if !self
            .throttle
            .should_notify(category, now, throttle::min_interval(category))
        {
            debug!(plant = %self.plant_id, category = category.as_str(), "engine: notification throttled");
            return;
        }
        if let Err(e) = bounded(
            self.executor.call_timeout,
            self.notifier.send(category, &message),
        )
        .await
        {
            warn!(
                plant = %self.plant_id,
                category = category.as_str(),
                error = %e,
                "engine: notification not delivered"
            );
        }
    }

    fn finish(
        &mut self,
        now: OffsetDateTime,
        cfg: &PlantConfig,
        result: EvaluationResult,
    ) -> EvaluationResult {
        let fresh = result != EvaluationResult::SkippedStale
            && self.freshness.is_fresh(now, cfg.stale_after());
        let status = Status::derive(result, cfg.auto_water, fresh);

        if status != self.status {
            info!(plant = %self.plant_id, from = ?self.status, to = ?status, "engine: status changed");
        }
        self.status = status;
        self.last_result = Some(result);
        self.last_evaluated = Some(now);

        info!(
            plant = %self.plant_id,
            result = result.as_str(),
            ?status,
            "engine: evaluation finished"
        );
        result
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyToggles;
    use crate::testing::{MockNotifier, MockPump, MockSensor, PumpBehavior};
    use std::sync::Arc;
    use time::macros::datetime;
    use time::Duration;
    use tokio::sync::watch;

    const T0: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    type TestEngine<C> = EvaluationEngine<Arc<MockSensor>, Arc<MockPump>, Arc<MockNotifier>, C>;

    /// threshold=30%, staleAfter=60min, cooldown=120min, auto-water on.
    fn scenario_cfg() -> PlantConfig {
        PlantConfig {
            threshold_pct: 30.0,
            pump_duration_s: 8,
            cooldown_min: 120,
            stale_after_min: 60,
            auto_water: true,
            notify: NotifyToggles {
                on_water: true,
                on_stale: true,
                on_failure: true,
            },
        }
    }

    fn engine_with<C: ConfigProvider>(
        sensor: &Arc<MockSensor>,
        pump: &Arc<MockPump>,
        notifier: &Arc<MockNotifier>,
        cfg: C,
    ) -> TestEngine<C> {
        EvaluationEngine::new(
            "basil",
            "Basil",
            Arc::clone(sensor),
            Arc::clone(pump),
            Arc::clone(notifier),
            cfg,
        )
    }

    fn reading(percent: f32, at: OffsetDateTime) -> Signal {
        Signal::Reading(MoistureReading { percent, at })
    }

    // -- Scenarios ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn scenario_a_dry_fresh_never_watered_waters() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine.evaluate(T0, Some(reading(20.0, T0))).await;

        assert_eq!(result, EvaluationResult::Watered);
        assert_eq!(engine.status(), Status::Ok);
        assert_eq!(engine.last_watered(), Some(T0));
        assert_eq!(pump.commands(), vec![true, false]);
        assert_eq!(notifier.count(NotifyCategory::Watered), 1);
        // The pushed reading was enough; the sensor was not polled.
        assert_eq!(sensor.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_stale_blocks_and_alerts_once() {
        let sensor = MockSensor::reading(20.0, T0 - Duration::minutes(90));
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::SkippedStale);
        assert_eq!(engine.status(), Status::Problem);
        assert_eq!(notifier.count(NotifyCategory::StaleBlocked), 1);
        assert!(pump.commands().is_empty());

        // Next tick, still stale: same result, alert throttled.
        let again = engine.evaluate(T0 + Duration::minutes(10), None).await;
        assert_eq!(again, EvaluationResult::SkippedStale);
        assert_eq!(notifier.count(NotifyCategory::StaleBlocked), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_recent_watering_not_due() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg()).restore(
            PlantSnapshot {
                plant_id: "basil".into(),
                status: Status::Ok,
                last_seen: None,
                last_watered: Some(T0 - Duration::minutes(10)),
                last_evaluated: None,
                last_result: None,
                last_moisture: None,
                last_notified: vec![],
            },
        );

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::SkippedNotDue);
        assert_eq!(engine.status(), Status::Ok);
        assert!(pump.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_d_unconfirmed_pump_is_a_problem() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::NeverConfirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::FailedPumpConfirmation);
        assert_eq!(engine.status(), Status::Problem);
        assert_eq!(engine.last_watered(), None);
        assert_eq!(notifier.count(NotifyCategory::WateringFailed), 1);
        assert_eq!(notifier.count(NotifyCategory::Watered), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_e_water_now_blocked_when_stale() {
        let sensor = MockSensor::reading(20.0, T0 - Duration::minutes(90));
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine.water_now(T0).await;

        assert_eq!(result, EvaluationResult::SkippedStale);
        assert!(pump.commands().is_empty());
        assert_eq!(engine.last_watered(), None);
    }

    // -- Manual watering ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn water_now_ignores_threshold_cooldown_and_switch() {
        let sensor = MockSensor::reading(80.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let cfg = PlantConfig {
            auto_water: false,
            ..scenario_cfg()
        };
        let mut engine = engine_with(&sensor, &pump, &notifier, cfg).restore(PlantSnapshot {
            plant_id: "basil".into(),
            status: Status::Ok,
            last_seen: None,
            last_watered: Some(T0 - Duration::minutes(5)),
            last_evaluated: None,
            last_result: None,
            last_moisture: None,
            last_notified: vec![],
        });

        let result = engine.water_now(T0).await;

        assert_eq!(result, EvaluationResult::Watered);
        assert_eq!(engine.last_watered(), Some(T0));
    }

    // -- Branches -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn disabled_skips_without_reading_sensor() {
        let sensor = MockSensor::reading(5.0, T0 - Duration::days(2));
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let cfg = PlantConfig {
            auto_water: false,
            ..scenario_cfg()
        };
        let mut engine = engine_with(&sensor, &pump, &notifier, cfg);

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::SkippedDisabled);
        // Stale data alone is not a problem while auto-water is off.
        assert_eq!(engine.status(), Status::Ok);
        assert_eq!(sensor.reads(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wet_soil_skips() {
        let sensor = MockSensor::reading(45.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        assert_eq!(
            engine.evaluate(T0, None).await,
            EvaluationResult::SkippedAboveThreshold
        );
        assert_eq!(engine.status(), Status::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_inclusive() {
        let sensor = MockSensor::reading(30.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        assert_eq!(
            engine.evaluate(T0, None).await,
            EvaluationResult::SkippedAboveThreshold
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_sensor_counts_as_stale() {
        let sensor = MockSensor::unavailable();
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());
        // Heartbeats alone can't stand in for a value.
        engine.record_signal(Signal::Heartbeat(T0));

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::SkippedStale);
        assert_eq!(engine.status(), Status::Problem);
        assert!(pump.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sensor_read_counts_as_stale() {
        let sensor = MockSensor::hanging();
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());
        // Fresh and dry before the tick, but this cycle's read never returns.
        engine.record_signal(reading(20.0, T0));
        let start = tokio::time::Instant::now();

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::SkippedStale);
        assert_eq!(engine.status(), Status::Problem);
        assert_eq!(sensor.reads(), 1);
        assert!(start.elapsed() >= crate::executor::CALL_TIMEOUT);
        assert!(pump.commands().is_empty());
        assert_eq!(notifier.count(NotifyCategory::StaleBlocked), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_notifier_does_not_block_evaluation() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::hanging();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine.evaluate(T0, None).await;

        assert_eq!(result, EvaluationResult::Watered);
        assert_eq!(engine.status(), Status::Ok);
        assert_eq!(engine.last_watered(), Some(T0));
        assert_eq!(notifier.count(NotifyCategory::Watered), 1);
        assert_eq!(pump.commands(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_cached_value_fresh() {
        // Sensor republishes an unchanged value without a new timestamp.
        let sensor = MockSensor::reading(20.0, T0 - Duration::minutes(90));
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let result = engine
            .evaluate(T0, Some(Signal::Heartbeat(T0 - Duration::minutes(1))))
            .await;

        assert_eq!(result, EvaluationResult::Watered);
    }

    // -- Properties ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn repeated_evaluation_is_idempotent() {
        let sensor = MockSensor::reading(45.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        let first = engine.evaluate(T0, Some(reading(45.0, T0))).await;
        let snap = engine.snapshot();
        let second = engine.evaluate(T0, Some(reading(45.0, T0))).await;

        assert_eq!(first, second);
        assert_eq!(engine.snapshot(), snap);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_never_stamps_cooldown() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::NeverConfirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        for i in 0..3 {
            let now = T0 + Duration::minutes(i);
            sensor.set(20.0, now);
            assert_eq!(
                engine.evaluate(now, None).await,
                EvaluationResult::FailedPumpConfirmation
            );
        }

        assert_eq!(engine.last_watered(), None);
        // One ON attempt per call, no retries inside a call.
        assert_eq!(pump.commands().iter().filter(|on| **on).count(), 3);
        // Failure alert throttled to once per window.
        assert_eq!(notifier.count(NotifyCategory::WateringFailed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn problem_clears_once_conditions_recover() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::NeverConfirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        engine.evaluate(T0, None).await;
        assert_eq!(engine.status(), Status::Problem);

        sensor.set(55.0, T0 + Duration::minutes(10));
        let result = engine.evaluate(T0 + Duration::minutes(10), None).await;
        assert_eq!(result, EvaluationResult::SkippedAboveThreshold);
        assert_eq!(engine.status(), Status::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn config_is_read_fresh_each_call() {
        let sensor = MockSensor::reading(40.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let (tx, rx) = watch::channel(scenario_cfg());
        let mut engine = engine_with(&sensor, &pump, &notifier, rx);

        assert_eq!(
            engine.evaluate(T0, None).await,
            EvaluationResult::SkippedAboveThreshold
        );

        tx.send_replace(PlantConfig {
            threshold_pct: 50.0,
            ..scenario_cfg()
        });
        assert_eq!(engine.evaluate(T0, None).await, EvaluationResult::Watered);
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_errors_do_not_escape() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::failing();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        assert_eq!(engine.evaluate(T0, None).await, EvaluationResult::Watered);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_toggles_send_nothing() {
        let sensor = MockSensor::reading(20.0, T0 - Duration::minutes(90));
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let cfg = PlantConfig {
            notify: NotifyToggles {
                on_water: false,
                on_stale: false,
                on_failure: false,
            },
            ..scenario_cfg()
        };
        let mut engine = engine_with(&sensor, &pump, &notifier, cfg);

        assert_eq!(engine.evaluate(T0, None).await, EvaluationResult::SkippedStale);
        assert!(notifier.sent().is_empty());
    }

    // -- Signals, snapshot, restore -----------------------------------------

    #[test]
    fn older_reading_does_not_replace_value() {
        let sensor = MockSensor::unavailable();
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());

        engine.record_signal(reading(25.0, T0));
        engine.record_signal(reading(60.0, T0 - Duration::minutes(5)));

        let snap = engine.snapshot();
        assert_eq!(snap.last_seen, Some(T0));
        assert_eq!(snap.last_moisture.map(|m| m.percent), Some(25.0));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_restores_cooldown_and_status() {
        let sensor = MockSensor::reading(20.0, T0);
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg());
        engine.evaluate(T0, None).await;

        let json = serde_json::to_string(&engine.snapshot()).unwrap();
        let snap: PlantSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap.last_result, Some(EvaluationResult::Watered));
        assert_eq!(snap.last_notified.len(), 1);

        let mut restored = engine_with(&sensor, &pump, &notifier, scenario_cfg()).restore(snap);
        assert_eq!(restored.last_watered(), Some(T0));

        let later = T0 + Duration::minutes(30);
        sensor.set(20.0, later);
        assert_eq!(
            restored.evaluate(later, None).await,
            EvaluationResult::SkippedNotDue
        );
    }

    #[test]
    fn diagnostics_reports_cooldown_remaining() {
        let sensor = MockSensor::unavailable();
        let pump = MockPump::new(PumpBehavior::Confirms);
        let notifier = MockNotifier::new();
        let mut engine = engine_with(&sensor, &pump, &notifier, scenario_cfg()).restore(
            PlantSnapshot {
                plant_id: "basil".into(),
                status: Status::Ok,
                last_seen: None,
                last_watered: Some(T0 - Duration::minutes(20)),
                last_evaluated: None,
                last_result: None,
                last_moisture: None,
                last_notified: vec![],
            },
        );
        engine.record_signal(Signal::Heartbeat(T0));

        let diag = engine.diagnostics(T0);
        assert!(diag.fresh);
        assert_eq!(diag.cooldown_remaining_s, Some(100 * 60));
        assert_eq!(diag.name, "Basil");
    }

    #[test]
    fn status_derivation_table() {
        use EvaluationResult::*;
        assert_eq!(Status::derive(FailedPumpConfirmation, false, true), Status::Problem);
        assert_eq!(Status::derive(SkippedStale, true, false), Status::Problem);
        assert_eq!(Status::derive(SkippedStale, false, false), Status::Ok);
        assert_eq!(Status::derive(SkippedDisabled, false, false), Status::Ok);
        assert_eq!(Status::derive(Watered, true, true), Status::Ok);
    }
}

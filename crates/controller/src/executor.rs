//! One pump run: ON, wait for the pump to confirm, hold for the run
//! duration, OFF.
//!
//! A run only counts as a success once the pump itself reports ON. An
//! actuator that accepts the command but never switches (unplugged relay,
//! bridge offline, stale retained state) yields `FailedConfirmation` and the
//! caller must not touch its cooldown.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, warn};

use crate::capability::{CapabilityError, PumpCapability};

/// Extra time, on top of the run duration, the pump gets to report ON.
pub const CONFIRM_GRACE: Duration = Duration::from_secs(5);

/// How often the pump's reported state is re-read while waiting.
pub const CONFIRM_POLL: Duration = Duration::from_millis(200);

/// Upper bound on any single capability call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum WateringOutcome {
    Success,
    /// Covers a rejected ON command, a hung call and a confirmation timeout.
    FailedConfirmation(CapabilityError),
}

#[derive(Debug, Clone, Copy)]
pub struct WateringExecutor {
    pub confirm_grace: Duration,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
}

impl Default for WateringExecutor {
    fn default() -> Self {
        Self {
            confirm_grace: CONFIRM_GRACE,
            poll_interval: CONFIRM_POLL,
            call_timeout: CALL_TIMEOUT,
        }
    }
}

/// Run a capability call under `limit`; a call that never returns becomes
/// `CapabilityError::Timeout`.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CapabilityError>>,
) -> Result<T, CapabilityError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout(limit)),
    }
}

impl WateringExecutor {
    pub async fn run<P: PumpCapability>(&self, pump: &P, duration: Duration) -> WateringOutcome {
        let started = Instant::now();

        if let Err(e) = bounded(self.call_timeout, pump.set_state(true)).await {
            warn!(error = %e, "executor: pump did not accept ON");
            self.shut_off(pump).await;
            return WateringOutcome::FailedConfirmation(e);
        }

        let window = duration + self.confirm_grace;
        if let Err(e) = self.await_confirmation(pump, window).await {
            warn!(error = %e, "executor: pump never confirmed ON");
            self.shut_off(pump).await;
            return WateringOutcome::FailedConfirmation(e);
        }
        debug!(after = ?started.elapsed(), "executor: pump confirmed ON");

        if pump.self_timing() {
            return WateringOutcome::Success;
        }

        sleep_until(started + duration).await;
        if let Err(e) = bounded(self.call_timeout, pump.set_state(false)).await {
            // The run itself was confirmed; a lost OFF is surfaced in the log
            // but does not turn a real watering into a failed one.
            error!(error = %e, "executor: pump did not accept OFF after run");
        }

        WateringOutcome::Success
    }

    async fn await_confirmation<P: PumpCapability>(
        &self,
        pump: &P,
        window: Duration,
    ) -> Result<(), CapabilityError> {
        let poll = async {
            loop {
                match pump.is_on().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "executor: pump state read failed"),
                }
                sleep(self.poll_interval).await;
            }
        };

        timeout(window, poll)
            .await
            .map_err(|_| CapabilityError::Timeout(window))
    }

    /// Best-effort OFF after a failed start.
    async fn shut_off<P: PumpCapability>(&self, pump: &P) {
        if let Err(e) = bounded(self.call_timeout, pump.set_state(false)).await {
            error!(error = %e, "executor: OFF after failed start not accepted");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Minimum spacing between two confirmed waterings.
#[derive(Debug, Clone, Default)]
pub struct CooldownGate {
    last_watered: Option<OffsetDateTime>,
}

impl CooldownGate {
    pub fn new(last_watered: Option<OffsetDateTime>) -> Self {
        Self { last_watered }
    }

    pub fn last_watered(&self) -> Option<OffsetDateTime> {
        self.last_watered
    }

    /// Stamp a confirmed watering. last-watered never moves backwards; an
    /// older `at` is dropped and `false` returned.
    pub fn record_watering(&mut self, at: OffsetDateTime) -> bool {
        if let Some(prev) = self.last_watered {
            if at < prev {
                warn!(%at, %prev, "cooldown: ignoring watering older than last-watered");
                return false;
            }
        }
        self.last_watered = Some(at);
        true
    }

    pub fn can_water_now(&self, now: OffsetDateTime, cooldown: Duration) -> bool {
        match self.last_watered {
            Some(prev) => now - prev >= cooldown,
            None => true,
        }
    }

    /// Time left until the gate opens; `None` when it already is.
    pub fn remaining(&self, now: OffsetDateTime, cooldown: Duration) -> Option<Duration> {
        let prev = self.last_watered?;
        let left = cooldown - (now - prev);
        (left > Duration::ZERO).then_some(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T1: OffsetDateTime = datetime!(2025-06-01 08:00 UTC);

    #[test]
    fn never_watered_is_open() {
        let gate = CooldownGate::default();
        assert!(gate.can_water_now(T1, Duration::minutes(120)));
        assert_eq!(gate.remaining(T1, Duration::minutes(120)), None);
    }

    #[test]
    fn closed_inside_window_open_at_boundary() {
        let mut gate = CooldownGate::default();
        gate.record_watering(T1);
        let cooldown = Duration::minutes(120);

        for mins in [0, 10, 60, 119] {
            assert!(
                !gate.can_water_now(T1 + Duration::minutes(mins), cooldown),
                "gate should be closed {mins} min after watering"
            );
        }
        assert!(gate.can_water_now(T1 + cooldown, cooldown));
        assert!(gate.can_water_now(T1 + Duration::minutes(500), cooldown));
    }

    #[test]
    fn zero_cooldown_always_open() {
        let gate = CooldownGate::new(Some(T1));
        assert!(gate.can_water_now(T1, Duration::ZERO));
    }

    #[test]
    fn older_watering_rejected() {
        let mut gate = CooldownGate::new(Some(T1));
        assert!(!gate.record_watering(T1 - Duration::minutes(1)));
        assert_eq!(gate.last_watered(), Some(T1));
    }

    #[test]
    fn remaining_counts_down() {
        let gate = CooldownGate::new(Some(T1));
        let left = gate.remaining(T1 + Duration::minutes(10), Duration::minutes(120));
        assert_eq!(left, Some(Duration::minutes(110)));
    }
}

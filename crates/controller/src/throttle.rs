use std::collections::BTreeMap;

use time::{Duration, OffsetDateTime};

use crate::capability::NotifyCategory;

/// Minimum spacing between two notifications of one category.
pub fn min_interval(category: NotifyCategory) -> Duration {
    match category {
        // Already bounded by the watering cooldown.
        NotifyCategory::Watered => Duration::ZERO,
        NotifyCategory::StaleBlocked => Duration::minutes(60),
        NotifyCategory::WateringFailed => Duration::minutes(30),
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationThrottle {
    last_notified: BTreeMap<NotifyCategory, OffsetDateTime>,
}

impl NotificationThrottle {
    pub fn new(last_notified: BTreeMap<NotifyCategory, OffsetDateTime>) -> Self {
        Self { last_notified }
    }

    /// Returns `true` and records `now` when a notification may go out;
    /// otherwise leaves state untouched.
    pub fn should_notify(
        &mut self,
        category: NotifyCategory,
        now: OffsetDateTime,
        min_interval: Duration,
    ) -> bool {
        if let Some(last) = self.last_notified.get(&category) {
            if now - *last < min_interval {
                return false;
            }
        }
        self.last_notified.insert(category, now);
        true
    }

    #[cfg(test)]
    pub fn last_notified(&self, category: NotifyCategory) -> Option<OffsetDateTime> {
        self.last_notified.get(&category).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (NotifyCategory, OffsetDateTime)> + '_ {
        self.last_notified.iter().map(|(c, at)| (*c, *at))
    }
}

//! IdGenerator port.
//!
//! IDs are ULIDs stamped with the injected clock, so they sort roughly by
//! creation time and stay deterministic in their timestamp part under
//! `FixedClock`.

use ulid::Ulid;

use crate::domain::ids::{CustomerId, EventId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn customer_id(&self) -> CustomerId;

    fn event_id(&self) -> EventId;
}

/// ULID generator over a clock.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn customer_id(&self) -> CustomerId {
        CustomerId::from(self.next())
    }

    fn event_id(&self) -> EventId {
        EventId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let ids = UlidGenerator::new(SystemClock);
        let a = ids.event_id();
        let b = ids.event_id();
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_part_follows_the_clock() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));

        let a = ids.customer_id();
        let b = ids.customer_id();
        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
    }

    #[test]
    fn display_prefix_differs_per_kind() {
        let ids = UlidGenerator::new(SystemClock);
        assert!(ids.customer_id().to_string().starts_with("cus-"));
        assert!(ids.event_id().to_string().starts_with("evt-"));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Hybrid Logical Clock: a `(wall, counter, node)` triple used to order and timestamp
//! messages across distributed invokers, executors, and telemetry senders/receivers without
//! relying on synchronized wall clocks.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

use crate::common::aio_protocol_error::AIOProtocolError;

/// The default maximum allowed drift between a clock's wall component and the local system
/// clock before an update is rejected.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A Hybrid Logical Clock value.
///
/// Ordered lexicographically on `(timestamp, counter, node_id)`. Encodes to a fixed-width,
/// lexicographically-sortable string via [`Display`], and parses back via [`FromStr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridLogicalClock {
    /// The wall-clock component, truncated to millisecond precision.
    pub timestamp: SystemTime,
    /// Disambiguates multiple events sharing the same `timestamp`.
    pub counter: u64,
    /// Identifies the clock's owning node. Two clocks with the same `node_id` are never merged.
    pub node_id: String,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Constructs a new clock at the current system time, counter zero, with a fresh random
    /// node id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: SystemTime::now(),
            counter: 0,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    /// Returns a copy of this clock without advancing it. Used to read the current value
    /// without recording a new event.
    #[must_use]
    pub fn now(&self) -> Self {
        self.clone()
    }

    /// Advances this clock to record a local event: bumps the wall time to the current system
    /// time (resetting the counter to zero) if the system clock has moved forward, otherwise
    /// increments the counter.
    ///
    /// # Errors
    /// Returns [`AIOProtocolError`] of kind
    /// [`InternalLogicError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::InternalLogicError)
    /// if the counter would overflow.
    pub fn tick(&mut self, max_clock_drift: Duration) -> Result<(), AIOProtocolError> {
        self.update_now(max_clock_drift)
    }

    /// Merges `other` into this clock per the HLC merge rule, validating the result against
    /// `max_clock_drift`. A clock never merges with a clock sharing its own `node_id`.
    ///
    /// # Errors
    /// Returns [`AIOProtocolError`] of kind
    /// [`InternalLogicError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::InternalLogicError)
    /// if the counter would overflow, or
    /// [`StateInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::StateInvalid)
    /// if the resulting clock would drift from the local system clock by more than
    /// `max_clock_drift`.
    pub fn update(
        &mut self,
        other: &HybridLogicalClock,
        max_clock_drift: Duration,
    ) -> Result<(), AIOProtocolError> {
        if self.node_id == other.node_id {
            return Ok(());
        }

        let now = SystemTime::now();
        let self_wall = self.timestamp;
        let other_wall = other.timestamp;
        let max_wall = self_wall.max(other_wall).max(now);

        if max_wall > self_wall && max_wall > other_wall {
            self.timestamp = max_wall;
            self.counter = 0;
            self.validate(now, max_clock_drift)?;
        } else if self_wall == other_wall {
            self.counter = self.counter.max(other.counter).checked_add(1).ok_or_else(|| {
                AIOProtocolError::new_internal_logic_error(
                    false,
                    Some("counter".to_string()),
                    Some("HybridLogicalClock counter overflow".to_string()),
                )
            })?;
            self.validate(now, max_clock_drift)?;
        } else if self_wall > other_wall {
            self.counter = self.counter.checked_add(1).ok_or_else(|| {
                AIOProtocolError::new_internal_logic_error(
                    false,
                    Some("counter".to_string()),
                    Some("HybridLogicalClock counter overflow".to_string()),
                )
            })?;
            self.validate(now, max_clock_drift)?;
        } else {
            self.timestamp = other.timestamp;
            self.counter = other.counter.checked_add(1).ok_or_else(|| {
                AIOProtocolError::new_internal_logic_error(
                    false,
                    Some("counter".to_string()),
                    Some("HybridLogicalClock counter overflow".to_string()),
                )
            })?;
            other.validate(now, max_clock_drift)?;
        }
        Ok(())
    }

    /// Updates this clock against the current system time, as if merging with a clock reading
    /// exactly `now()` on the same node. Always advances the clock.
    ///
    /// # Errors
    /// See [`HybridLogicalClock::update`].
    pub fn update_now(&mut self, max_clock_drift: Duration) -> Result<(), AIOProtocolError> {
        let now = SystemTime::now();
        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.counter = self.counter.checked_add(1).ok_or_else(|| {
                AIOProtocolError::new_internal_logic_error(
                    false,
                    Some("counter".to_string()),
                    Some("HybridLogicalClock counter overflow".to_string()),
                )
            })?;
        }
        self.validate(now, max_clock_drift)
    }

    /// Validates that this clock's counter has not overflowed and that its drift from `now`
    /// does not exceed `max_clock_drift`.
    ///
    /// # Errors
    /// See [`HybridLogicalClock::update`].
    pub fn validate(
        &self,
        now: SystemTime,
        max_clock_drift: Duration,
    ) -> Result<(), AIOProtocolError> {
        if self.counter == u64::MAX {
            return Err(AIOProtocolError::new_internal_logic_error(
                false,
                Some("counter".to_string()),
                Some("HybridLogicalClock counter has reached its maximum value".to_string()),
            ));
        }
        if let Ok(drift) = self.timestamp.duration_since(now) {
            if drift > max_clock_drift {
                return Err(AIOProtocolError::new_state_invalid_error(
                    "timestamp",
                    Some(format!(
                        "HybridLogicalClock timestamp drifts {drift:?} ahead of local clock, exceeding max of {max_clock_drift:?}"
                    )),
                    false,
                ));
            }
        }
        Ok(())
    }
}

impl Display for HybridLogicalClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let millis = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        write!(f, "{millis:0>15}:{:0>5}:{}", self.counter, self.node_id)
    }
}

impl FromStr for HybridLogicalClock {
    type Err = AIOProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(AIOProtocolError::new_header_invalid_error(
                "timestamp",
                s,
                Some("HybridLogicalClock string must have 3 colon-separated parts".to_string()),
                true,
            ));
        }
        let millis: u64 = parts[0].parse().map_err(|_| {
            AIOProtocolError::new_header_invalid_error(
                "timestamp",
                s,
                Some("HybridLogicalClock timestamp component is not a valid integer".to_string()),
                true,
            )
        })?;
        let counter: u64 = parts[1].parse().map_err(|_| {
            AIOProtocolError::new_header_invalid_error(
                "timestamp",
                s,
                Some("HybridLogicalClock counter component is not a valid integer".to_string()),
                true,
            )
        })?;
        let node_id = parts[2].to_string();
        if node_id.is_empty() {
            return Err(AIOProtocolError::new_header_invalid_error(
                "timestamp",
                s,
                Some("HybridLogicalClock node_id component is empty".to_string()),
                true,
            ));
        }
        Ok(HybridLogicalClock {
            timestamp: UNIX_EPOCH + Duration::from_millis(millis),
            counter,
            node_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_zero_counter() {
        let hlc = HybridLogicalClock::new();
        assert_eq!(hlc.counter, 0);
        assert!(!hlc.node_id.is_empty());
    }

    #[test]
    fn display_then_parse_round_trips() {
        let hlc = HybridLogicalClock::new();
        let s = hlc.to_string();
        let parsed: HybridLogicalClock = s.parse().unwrap();
        assert_eq!(hlc.node_id, parsed.node_id);
        assert_eq!(hlc.counter, parsed.counter);
    }

    #[test]
    fn from_str_rejects_wrong_part_count() {
        assert!("123:456".parse::<HybridLogicalClock>().is_err());
        assert!("123:456:n:extra".parse::<HybridLogicalClock>().is_err());
    }

    #[test]
    fn update_with_same_node_is_noop() {
        let mut a = HybridLogicalClock::new();
        let mut b = a.clone();
        b.counter = 9;
        let before = a.clone();
        a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn update_with_later_remote_adopts_remote_timestamp() {
        let mut a = HybridLogicalClock::new();
        a.timestamp = UNIX_EPOCH + Duration::from_secs(1);
        let mut b = HybridLogicalClock::new();
        b.timestamp = UNIX_EPOCH + Duration::from_secs(2);
        b.counter = 3;
        a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.counter, 4);
    }

    #[test]
    fn update_rejects_excess_drift() {
        let mut a = HybridLogicalClock::new();
        let mut b = HybridLogicalClock::new();
        b.timestamp = SystemTime::now() + Duration::from_secs(600);
        let result = a.update(&b, Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn counter_overflow_is_rejected() {
        let mut a = HybridLogicalClock::new();
        a.counter = u64::MAX;
        let result = a.validate(SystemTime::now(), DEFAULT_MAX_CLOCK_DRIFT);
        assert!(result.is_err());
    }
}

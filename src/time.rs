//! Tick-based timeouts
//!
//! The driver has no wall clock. All it gets from the host is a free-running
//! 8-bit counter that wraps every 256 ticks, so every timeout is a deadline
//! relative to the current count. A deadline can be at most 128 ticks away,
//! otherwise the wrapping comparison in [`Timeout::is_expired`] becomes
//! ambiguous.

/// Default tick rate of the host counter (Hz)
pub const TICK_FREQ_HZ: u32 = 60;

/// Furthest a deadline may be set into the future
const MAX_TIMEOUT_TICKS: u32 = 128;

/// Source of the free-running 8-bit tick count
pub trait TickSource {
    /// Current counter value
    fn now(&self) -> u8;

    /// Counter rate in Hz
    fn frequency(&self) -> u32 {
        TICK_FREQ_HZ
    }
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> u8 {
        (**self).now()
    }

    fn frequency(&self) -> u32 {
        (**self).frequency()
    }
}

/// Convert milliseconds to ticks, rounding up
pub fn millis_to_ticks(ms: u32, frequency: u32) -> u32 {
    ((ms as u64 * frequency as u64 + 999) / 1000) as u32
}

/// A relative deadline on a [`TickSource`]
pub struct Timeout<'a, T: TickSource + ?Sized> {
    /// Counter the deadline is measured on
    clock: &'a T,
    /// Counter value at which the timeout expires
    deadline: u8,
}

impl<'a, T: TickSource + ?Sized> Timeout<'a, T> {
    /// Start a timeout that expires `ms` milliseconds from now
    ///
    /// Durations beyond the 128-tick horizon are clamped to it.
    pub fn from_ms(clock: &'a T, ms: u32) -> Self {
        Self::from_ticks(clock, millis_to_ticks(ms, clock.frequency()))
    }

    /// Start a timeout that expires `ticks` ticks from now
    pub fn from_ticks(clock: &'a T, ticks: u32) -> Self {
        let ticks = ticks.min(MAX_TIMEOUT_TICKS) as u8;
        Self {
            clock,
            deadline: clock.now().wrapping_add(ticks),
        }
    }

    /// Check whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        // Within 127 ticks at or after the deadline counts as expired; the
        // other half of the counter range is "still in the future".
        self.clock.now().wrapping_sub(self.deadline) <= 127
    }
}

/// Busy-wait for `ms` milliseconds
///
/// The wait is capped at 255 ticks (a little over four seconds at 60 Hz).
pub fn wait_ms<T: TickSource + ?Sized>(clock: &T, ms: u32) {
    let ticks = millis_to_ticks(ms, clock.frequency()).min(u8::MAX as u32) as u8;
    let start = clock.now();
    while clock.now().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClock;

    #[test]
    fn test_millis_to_ticks_rounds_up() {
        assert_eq!(millis_to_ticks(0, 60), 0);
        assert_eq!(millis_to_ticks(1, 60), 1);
        assert_eq!(millis_to_ticks(20, 60), 2);
        assert_eq!(millis_to_ticks(500, 60), 30);
        assert_eq!(millis_to_ticks(1000, 60), 60);
        assert_eq!(millis_to_ticks(1000, 1000), 1000);
    }

    #[test]
    fn test_timeout_expires_after_deadline() {
        let clock = FakeClock::frozen(10);
        let timeout = Timeout::from_ms(&clock, 500);

        clock.set(39);
        assert!(!timeout.is_expired());
        clock.set(40);
        assert!(timeout.is_expired());
        clock.set(100);
        assert!(timeout.is_expired());
    }

    #[test]
    fn test_timeout_across_counter_wrap() {
        let clock = FakeClock::frozen(250);
        let timeout = Timeout::from_ticks(&clock, 20);

        clock.set(255);
        assert!(!timeout.is_expired());
        clock.set(13);
        assert!(!timeout.is_expired());
        clock.set(14);
        assert!(timeout.is_expired());
    }

    #[test]
    fn test_timeout_horizon_is_clamped() {
        let clock = FakeClock::frozen(0);
        let timeout = Timeout::from_ms(&clock, 60_000);

        clock.set(127);
        assert!(!timeout.is_expired());
        clock.set(128);
        assert!(timeout.is_expired());
    }

    #[test]
    fn test_wait_ms_consumes_ticks() {
        let clock = FakeClock::new(0);
        wait_ms(&clock, 20);
        assert!(clock.peek() >= 2);
    }
}

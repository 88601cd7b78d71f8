//! Tick/nanosecond conversions between the guest clock, the host clock and
//! wall time (spec §6).

use derive_more::{Add, From, Into, Sub};

/// The guest clock runs at a fixed 19.2 MHz, matching the reference guest
/// kernel's hardware timer.
const GUEST_TICKS_PER_SECOND: u64 = 19_200_000;
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// A tick of the host's `PerformanceCounter` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Add, Sub, From, Into)]
pub struct HostTick(pub u64);

/// A tick of the emulated guest clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Add, Sub, From, Into)]
pub struct GuestTick(pub u64);

/// Monotonic tick source collaborator (spec §6, "Performance counter").
pub trait PerformanceCounter: Send + Sync {
    /// Ticks elapsed since an arbitrary, fixed epoch.
    fn elapsed_ticks(&self) -> HostTick;
    /// Ticks per second of [`Self::elapsed_ticks`].
    fn ticks_per_second(&self) -> u64;
}

/// Converts a nanosecond duration to host ticks, splitting into whole
/// seconds and a sub-second remainder to preserve precision at high `tps`
/// (spec §6: "using integer arithmetic that preserves precision").
#[must_use]
pub fn nanos_to_host_ticks(nanos: u64, ticks_per_second: u64) -> HostTick {
    let seconds = nanos / NANOS_PER_SECOND;
    let sub_nanos = nanos % NANOS_PER_SECOND;
    let whole = seconds.saturating_mul(ticks_per_second);
    let remainder = (u128::from(sub_nanos) * u128::from(ticks_per_second) / u128::from(NANOS_PER_SECOND))
        .min(u128::from(u64::MAX)) as u64;
    HostTick(whole.saturating_add(remainder))
}

/// `guestTicksToNanos(t) = ceil(t * 1e9 / 19_200_000)` (spec §6).
#[must_use]
pub fn guest_ticks_to_nanos(ticks: GuestTick) -> u64 {
    let numerator = u128::from(ticks.0) * u128::from(NANOS_PER_SECOND);
    let denominator = u128::from(GUEST_TICKS_PER_SECOND);
    (numerator.div_ceil(denominator)) as u64
}

/// `hostTicksToGuestTicks(t) = t * 19_200_000 / tps`, double precision
/// permitted by spec §6.
#[must_use]
pub fn host_ticks_to_guest_ticks(ticks: HostTick, ticks_per_second: u64) -> GuestTick {
    let result = (ticks.0 as f64) * (GUEST_TICKS_PER_SECOND as f64) / (ticks_per_second as f64);
    GuestTick(result as u64)
}

/// Converts nanoseconds to milliseconds, saturating at `i32::MAX` (spec §6).
#[must_use]
pub fn nanos_to_millis(nanos: u64) -> u32 {
    let millis = nanos / 1_000_000;
    millis.min(u64::from(i32::MAX as u32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_to_host_ticks_matches_simple_ratio_at_one_ghz() {
        assert_eq!(nanos_to_host_ticks(1_000_000_000, 1_000_000_000), HostTick(1_000_000_000));
        assert_eq!(nanos_to_host_ticks(500, 1_000_000_000), HostTick(500));
    }

    #[test]
    fn guest_ticks_to_nanos_rounds_up() {
        // 1 guest tick = 1e9 / 19_200_000 ns ≈ 52.08ns, must round up to 53.
        assert_eq!(guest_ticks_to_nanos(GuestTick(1)), 53);
        assert_eq!(guest_ticks_to_nanos(GuestTick(0)), 0);
    }

    #[test]
    fn host_ticks_to_guest_ticks_round_trip_is_approximate() {
        let tps = 1_000_000_000;
        let guest = host_ticks_to_guest_ticks(HostTick(1_000_000_000), tps);
        assert_eq!(guest, GuestTick(GUEST_TICKS_PER_SECOND));
    }

    #[test]
    fn nanos_to_millis_saturates() {
        assert_eq!(nanos_to_millis(1_000_000), 1);
        assert_eq!(nanos_to_millis(u64::MAX), i32::MAX as u32);
    }
}

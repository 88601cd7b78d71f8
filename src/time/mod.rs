//! Clock conversions and the future-wake-up scheduler (spec §4.F, §6).

pub mod conversions;
pub mod manager;

pub use conversions::{
    guest_ticks_to_nanos, host_ticks_to_guest_ticks, nanos_to_host_ticks, nanos_to_millis,
    GuestTick, HostTick, PerformanceCounter,
};
pub use manager::{TimeManager, TimerCallback};

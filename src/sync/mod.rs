//! The critical section scheduling gate and the multi-object wait built on
//! top of it (spec §4.E, §4.G).

pub mod critical_section;
pub mod wait;

pub use critical_section::{CoresChangedMask, CriticalSection, Scheduler};
pub use wait::{wait_for, SynchronizationObject};

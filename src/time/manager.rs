//! Orders future wake-ups on the host clock (spec §4.F).
//!
//! The entry list is manipulated only while the core's single
//! [`CriticalSection`] is held (spec §5: "only one lock in the core ...
//! TimeManager's worker takes that lock"), so a scheduled timer firing can
//! never interleave with a guest thread's own signal/wait bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::conversions::{nanos_to_host_ticks, HostTick, PerformanceCounter};
use crate::sync::critical_section::CriticalSection;

/// Sub-millisecond deadlines bypass the coarse OS sleep and spin from the
/// start (spec §4.F: "if timeoutNs < 1 ms, set enforceWakeupFromSpinWait").
const SHORT_DEADLINE_NANOS: u64 = 1_000_000;

/// A scheduled wake-up target (spec §3, "Waiting object"). Implemented by
/// whatever the caller is waiting on — typically a [`crate::thread::Thread`]
/// via a thin adapter.
pub trait TimerCallback: Send + Sync {
    /// Called exactly once when this entry's deadline elapses and it has
    /// not been unscheduled first.
    fn time_up(&self);
}

struct Entry {
    callback: Arc<dyn TimerCallback>,
    deadline: HostTick,
}

struct Shared {
    entries: Mutex<Vec<Entry>>,
    enforce_wakeup_from_spin_wait: AtomicBool,
    keep_running: AtomicBool,
    counter: Arc<dyn PerformanceCounter>,
    critical_section: Arc<CriticalSection>,
}

/// Picks the entry to wait on: last-to-first scan, `deadline <= best`,
/// preserving the earliest-inserted entry among ties (spec §4.F, §9
/// "Open questions" — this selection rule is a documented source anomaly,
/// preserved exactly rather than "fixed" to strict `<`).
fn select_next_entry(entries: &[Entry]) -> Option<(Arc<dyn TimerCallback>, HostTick)> {
    let mut best: Option<usize> = None;
    for i in (0..entries.len()).rev() {
        let take = match best {
            None => true,
            Some(b) => entries[i].deadline <= entries[b].deadline,
        };
        if take {
            best = Some(i);
        }
    }
    best.map(|i| (Arc::clone(&entries[i].callback), entries[i].deadline))
}

/// Sleeps until `deadline`: a coarse `park_timeout` for the bulk of the
/// wait, then a busy-spin tail to land on the deadline precisely (spec §4.F,
/// "precise-sleep hybrid"; SPEC_FULL §A).
fn sleep_until(shared: &Shared, deadline: HostTick) {
    let tps = shared.counter.ticks_per_second().max(1);
    loop {
        let now = shared.counter.elapsed_ticks();
        if now >= deadline {
            return;
        }
        let remaining_ticks = deadline.0 - now.0;
        let remaining_nanos = u128::from(remaining_ticks) * 1_000_000_000 / u128::from(tps);
        if remaining_nanos > u128::from(SHORT_DEADLINE_NANOS) {
            let coarse = remaining_nanos - u128::from(SHORT_DEADLINE_NANOS);
            std::thread::park_timeout(Duration::from_nanos(coarse.min(u128::from(u64::MAX)) as u64));
            continue;
        }
        while shared.counter.elapsed_ticks() < deadline {
            std::hint::spin_loop();
        }
        return;
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if !shared.keep_running.load(Ordering::Acquire) {
            return;
        }
        shared.enforce_wakeup_from_spin_wait.store(false, Ordering::Release);

        let next = select_next_entry(&shared.entries.lock().unwrap());
        let Some((callback, deadline)) = next else {
            std::thread::park();
            continue;
        };

        if shared.counter.elapsed_ticks() < deadline {
            sleep_until(&shared, deadline);
        }

        // Fire under the core's single lock: `callback.time_up()` mutates
        // guest thread state (spec §4.G), which must not interleave with a
        // concurrent `SynchronizationObject::signal` on the same thread.
        shared.critical_section.enter();
        let mut entries = shared.entries.lock().unwrap();
        let fired = if let Some(pos) = entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.callback, &callback) && e.deadline == deadline)
        {
            entries.remove(pos);
            true
        } else {
            false
        };
        drop(entries);
        if fired {
            log::trace!("timer entry fired");
            callback.time_up();
        }
        shared.critical_section.leave_as_foreign_thread();
    }
}

/// The background worker that fires [`TimerCallback`]s at their deadlines.
pub struct TimeManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TimeManager {
    /// Spawns the worker thread, ticking against `counter`. `critical_section`
    /// is the core's single lock (spec §5); the worker takes it for the
    /// duration of each entry-list manipulation and callback firing.
    #[must_use]
    pub fn new(counter: Arc<dyn PerformanceCounter>, critical_section: Arc<CriticalSection>) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Vec::new()),
            enforce_wakeup_from_spin_wait: AtomicBool::new(false),
            keep_running: AtomicBool::new(true),
            counter,
            critical_section,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("vkernel-time-manager".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn time manager worker thread");
        log::debug!("time manager worker started");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Arms `callback` to fire `timeout_nanos` from now (spec §4.F). Acts
    /// under the core's single critical section (spec §4.F, §5); reentrant,
    /// so this is safe to call whether or not the caller already holds it
    /// (as `wait_for` does).
    pub fn schedule_future_invocation(&self, callback: Arc<dyn TimerCallback>, timeout_nanos: u64) {
        self.shared.critical_section.enter();
        let tps = self.shared.counter.ticks_per_second();
        let now = self.shared.counter.elapsed_ticks();
        let offset = nanos_to_host_ticks(timeout_nanos, tps);
        let deadline = HostTick(now.0.saturating_add(offset.0));

        {
            let mut entries = self.shared.entries.lock().unwrap();
            entries.push(Entry {
                callback,
                deadline,
            });
            if timeout_nanos < SHORT_DEADLINE_NANOS {
                self.shared
                    .enforce_wakeup_from_spin_wait
                    .store(true, Ordering::Release);
            }
        }
        self.shared.critical_section.leave_as_foreign_thread();
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
    }

    /// Removes every still-pending entry whose callback is `callback`
    /// (spec §4.F: "iterate end-to-start; equal-reference match" — order
    /// does not matter for a remove-all, so a single retain pass suffices).
    /// Acts under the core's single critical section, same as
    /// [`Self::schedule_future_invocation`].
    pub fn unschedule_future_invocation(&self, callback: &Arc<dyn TimerCallback>) {
        self.shared.critical_section.enter();
        let mut entries = self.shared.entries.lock().unwrap();
        entries.retain(|e| !Arc::ptr_eq(&e.callback, callback));
        drop(entries);
        self.shared.critical_section.leave_as_foreign_thread();
    }

    /// Stops the worker thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        self.shared.keep_running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}

impl Drop for TimeManager {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

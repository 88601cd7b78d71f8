//! The process-wide recursive gate that doubles as the scheduling point
//! (spec §4.E).

use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use crate::thread::{ScheduleState, Thread};

/// A cores-changed mask computed by [`Scheduler::select_threads`] and handed
/// to whichever `enable_scheduling*` call follows it.
pub type CoresChangedMask = u64;

/// Polymorphic scheduler hook invoked on the outermost `leave()` (spec §9:
/// "express as a capability parameter injected at construction").
pub trait Scheduler: Send + Sync {
    /// Picks which guest threads should run next; returns a mask describing
    /// which cores changed assignment.
    fn select_threads(&self) -> CoresChangedMask;
    /// Applies `mask` when the releasing thread is itself schedulable.
    fn enable_scheduling(&self, mask: CoresChangedMask);
    /// Applies `mask` when the releasing thread is a foreign (non-guest)
    /// host thread, such as the time manager's worker.
    fn enable_scheduling_from_foreign_thread(&self, mask: CoresChangedMask);
}

struct Holder {
    thread_id: ThreadId,
    depth: u32,
}

/// A recursive mutual-exclusion region; only the current holder's host
/// thread may ever mutate the recursion depth (spec §3, §4.E).
pub struct CriticalSection {
    state: Mutex<Option<Holder>>,
    condvar: Condvar,
    scheduler: Box<dyn Scheduler>,
}

impl CriticalSection {
    #[must_use]
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            state: Mutex::new(None),
            condvar: Condvar::new(),
            scheduler,
        }
    }

    /// Enters the critical section, blocking if another host thread holds
    /// it. Reentrant: the same thread may call `enter` any number of times,
    /// bounded only by the recursion counter's width.
    pub fn enter(&self) {
        let mut guard = self.state.lock().unwrap();
        let current = std::thread::current().id();
        loop {
            match &mut *guard {
                Some(holder) if holder.thread_id == current => {
                    holder.depth += 1;
                    return;
                }
                Some(_) => {
                    log::trace!("critical section contended, blocking");
                    guard = self.condvar.wait(guard).unwrap();
                }
                None => {
                    *guard = Some(Holder {
                        thread_id: current,
                        depth: 1,
                    });
                    return;
                }
            }
        }
    }

    /// Releases one level of recursion on behalf of a guest thread. No-op at
    /// depth 0 (spec §4.E: "defensive"). At the outermost release, runs the
    /// scheduler handshake before any other thread can re-enter.
    pub fn leave(&self, current_thread: &Thread) {
        let mut guard = self.state.lock().unwrap();
        let Some(holder) = guard.as_mut() else {
            return;
        };
        debug_assert_eq!(holder.thread_id, std::thread::current().id());
        holder.depth -= 1;
        if holder.depth > 0 {
            return;
        }

        let mask = self.scheduler.select_threads();
        *guard = None;
        drop(guard);
        self.condvar.notify_one();

        if current_thread.is_schedulable() {
            self.scheduler.enable_scheduling(mask);
        } else {
            self.scheduler.enable_scheduling_from_foreign_thread(mask);
            // "non-schedulable but running" (spec §4.E) excludes a thread
            // that has fully terminated: its host thread is on its way out
            // and must not be parked waiting for a signal nobody will send.
            if current_thread.schedule_state() != ScheduleState::Terminated {
                current_thread.wake_event.wait();
            }
        }
    }

    /// Releases one level of recursion on behalf of a host-infrastructure
    /// caller that is not a guest thread at all — the time manager's worker,
    /// or the server loop (spec §5: "TimeManager's worker takes that lock").
    /// Never blocks the caller: there is no guest wake event to wait on.
    pub fn leave_as_foreign_thread(&self) {
        let mut guard = self.state.lock().unwrap();
        let Some(holder) = guard.as_mut() else {
            return;
        };
        debug_assert_eq!(holder.thread_id, std::thread::current().id());
        holder.depth -= 1;
        if holder.depth > 0 {
            return;
        }

        let mask = self.scheduler.select_threads();
        *guard = None;
        drop(guard);
        self.condvar.notify_one();
        self.scheduler.enable_scheduling_from_foreign_thread(mask);
    }

    /// Diagnostic: is the calling host thread the current holder (SPEC_FULL
    /// §C.4).
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|holder| holder.thread_id == std::thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct NullScheduler {
        select_calls: AtomicU64,
    }

    impl Scheduler for NullScheduler {
        fn select_threads(&self) -> CoresChangedMask {
            self.select_calls.fetch_add(1, Ordering::SeqCst);
            0
        }
        fn enable_scheduling(&self, _mask: CoresChangedMask) {}
        fn enable_scheduling_from_foreign_thread(&self, _mask: CoresChangedMask) {}
    }

    #[test]
    fn leave_at_depth_zero_is_a_noop() {
        let cs = CriticalSection::new(Box::new(NullScheduler { select_calls: AtomicU64::new(0) }));
        let thread = Thread::new();
        cs.leave(&thread); // must not panic
        assert!(!cs.is_held_by_current_thread());
    }

    #[test]
    fn reentrant_enter_requires_matching_leave_count() {
        let cs = CriticalSection::new(Box::new(NullScheduler { select_calls: AtomicU64::new(0) }));
        let thread = Thread::new();
        cs.enter();
        cs.enter();
        assert!(cs.is_held_by_current_thread());
        cs.leave(&thread);
        assert!(cs.is_held_by_current_thread());
        cs.leave(&thread);
        assert!(!cs.is_held_by_current_thread());
    }

    #[test]
    fn outermost_leave_runs_select_threads_exactly_once() {
        let scheduler = Arc::new(NullScheduler { select_calls: AtomicU64::new(0) });
        struct Wrapper(Arc<NullScheduler>);
        impl Scheduler for Wrapper {
            fn select_threads(&self) -> CoresChangedMask {
                self.0.select_threads()
            }
            fn enable_scheduling(&self, mask: CoresChangedMask) {
                self.0.enable_scheduling(mask)
            }
            fn enable_scheduling_from_foreign_thread(&self, mask: CoresChangedMask) {
                self.0.enable_scheduling_from_foreign_thread(mask)
            }
        }
        let cs = CriticalSection::new(Box::new(Wrapper(Arc::clone(&scheduler))));
        let thread = Thread::new();
        cs.enter();
        cs.enter();
        cs.leave(&thread);
        assert_eq!(scheduler.select_calls.load(Ordering::SeqCst), 0);
        cs.leave(&thread);
        assert_eq!(scheduler.select_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_second_thread_blocks_until_the_first_leaves() {
        let cs = Arc::new(CriticalSection::new(Box::new(NullScheduler {
            select_calls: AtomicU64::new(0),
        })));
        let thread = Thread::new();
        cs.enter();

        let cs2 = Arc::clone(&cs);
        let entered = Arc::new(AtomicU64::new(0));
        let entered2 = Arc::clone(&entered);
        let handle = std::thread::spawn(move || {
            cs2.enter();
            entered2.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        cs.leave(&thread);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}

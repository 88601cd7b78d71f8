//! Guest-visible thread state this core touches (spec §3, §9 "Thread wake
//! event").
//!
//! Only the fields the critical section, time manager and synchronization
//! wait path actually read or write live here. Everything else about a
//! guest thread (registers, stack, scheduling priority) belongs to the
//! embedding emulator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::KernelError;

/// The scheduler's view of a thread (spec §3).
///
/// Derives a stable numeric round-trip (`num_derive`, as the teacher's
/// `MemoryAttribute`/`Shareability` enums do) for embedders that need to
/// pass this state across an ABI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ScheduleState {
    Running,
    Paused,
    Terminated,
}

/// A level-remembering binary semaphore: `signal()` before `wait()` is
/// remembered, so the next `wait()` returns immediately exactly once (spec
/// §9, "the critical invariant").
#[derive(Default)]
pub struct WakeEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WakeEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the waiter, or arms the event if nobody is waiting yet.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Blocks until signaled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// One guest thread's core-visible state.
pub struct Thread {
    /// Numerical ID, for logging only.
    pub id: u64,
    /// Personal wake event; signaled from anywhere, waited only by this
    /// thread's own host thread (spec §5).
    pub wake_event: WakeEvent,
    state: Mutex<ThreadState>,
}

struct ThreadState {
    schedule_state: ScheduleState,
    waiting_sync: bool,
    sync_cancelled: bool,
    signaled_obj: Option<usize>,
    obj_sync_result: Option<KernelError>,
    is_schedulable: bool,
    termination_pending: bool,
}

impl Thread {
    /// Creates a new, runnable, schedulable thread.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("thread {id} created");
        Arc::new(Self {
            id,
            wake_event: WakeEvent::new(),
            state: Mutex::new(ThreadState {
                schedule_state: ScheduleState::Running,
                waiting_sync: false,
                sync_cancelled: false,
                signaled_obj: None,
                obj_sync_result: None,
                is_schedulable: true,
                termination_pending: false,
            }),
        })
    }

    #[must_use]
    pub fn schedule_state(&self) -> ScheduleState {
        self.state.lock().unwrap().schedule_state
    }

    /// Moves the thread to `state`; reschedule to `Running` also signals
    /// its wake event (spec §4.G, "reschedule to Running ... signals").
    pub fn set_schedule_state(&self, state: ScheduleState) {
        self.state.lock().unwrap().schedule_state = state;
        if state == ScheduleState::Running {
            self.wake_event.signal();
        } else if state == ScheduleState::Terminated {
            log::trace!("thread {} terminated", self.id);
        }
    }

    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.state.lock().unwrap().is_schedulable
    }

    pub fn set_schedulable(&self, schedulable: bool) {
        self.state.lock().unwrap().is_schedulable = schedulable;
    }

    #[must_use]
    pub fn termination_pending(&self) -> bool {
        self.state.lock().unwrap().termination_pending
    }

    pub fn set_termination_pending(&self, pending: bool) {
        self.state.lock().unwrap().termination_pending = pending;
    }

    /// Observes and clears the sync-cancel flag (spec §4.G: "clear the
    /// flag" on observation).
    #[must_use]
    pub fn take_sync_cancelled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.sync_cancelled)
    }

    pub fn set_sync_cancelled(&self, cancelled: bool) {
        self.state.lock().unwrap().sync_cancelled = cancelled;
    }

    #[must_use]
    pub fn waiting_sync(&self) -> bool {
        self.state.lock().unwrap().waiting_sync
    }

    pub fn set_waiting_sync(&self, waiting: bool) {
        self.state.lock().unwrap().waiting_sync = waiting;
    }

    /// The opaque identity of the object that woke this thread, if any,
    /// compared by the waiter to find its index among watched objects.
    #[must_use]
    pub fn signaled_obj(&self) -> Option<usize> {
        self.state.lock().unwrap().signaled_obj
    }

    pub fn set_signaled_obj(&self, obj: Option<usize>) {
        self.state.lock().unwrap().signaled_obj = obj;
    }

    #[must_use]
    pub fn obj_sync_result(&self) -> Option<KernelError> {
        self.state.lock().unwrap().obj_sync_result
    }

    pub fn set_obj_sync_result(&self, result: Option<KernelError>) {
        self.state.lock().unwrap().obj_sync_result = result;
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Thread {}

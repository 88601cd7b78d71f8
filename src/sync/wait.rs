//! Multi-object wait with timeout, cancel and signal (spec §4.G).

use std::sync::{Arc, Mutex};

use crate::error::KernelError;
use crate::sync::critical_section::CriticalSection;
use crate::thread::{ScheduleState, Thread};
use crate::time::{TimeManager, TimerCallback};

/// Something threads can wait on: a signaled predicate plus an ordered,
/// FIFO waiting list (spec §3, §9 "intrusive doubly-linked lists" —
/// expressed here as a `Vec` guarded by the object's own lock, since the
/// O(1)-removal motivation in the teacher's corpus is an intrusive-list
/// concern for bare-metal allocation, not one this hosted crate has).
pub struct SynchronizationObject {
    signaled: Mutex<bool>,
    waiters: Mutex<Vec<Arc<Thread>>>,
}

impl SynchronizationObject {
    #[must_use]
    pub fn new(initially_signaled: bool) -> Arc<Self> {
        Arc::new(Self {
            signaled: Mutex::new(initially_signaled),
            waiters: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    fn add_waiter(&self, thread: &Arc<Thread>) {
        self.waiters.lock().unwrap().push(Arc::clone(thread));
    }

    fn remove_waiter(&self, thread: &Arc<Thread>) {
        self.waiters.lock().unwrap().retain(|t| !Arc::ptr_eq(t, thread));
    }

    /// Marks this object signaled and wakes every waiting thread still
    /// `Paused` (spec §4.G): walks the list head-to-tail, broadcasting —
    /// not the usual single-waiter signal semantics (spec §9 "Fairness").
    ///
    /// Framed, like the rest of §4.G, as `enter; ...; Leave`: the core's
    /// single critical section serializes this against a concurrent
    /// [`WaitTimeout::time_up`] firing for one of the same waiters, so the
    /// two can never race to leave a thread's `obj_sync_result` and
    /// `signaled_obj` inconsistent with each other.
    pub fn signal(self: &Arc<Self>, critical_section: &CriticalSection, current_thread: &Thread) {
        critical_section.enter();
        *self.signaled.lock().unwrap() = true;
        let waiters = self.waiters.lock().unwrap().clone();
        for thread in waiters {
            if thread.schedule_state() == ScheduleState::Paused {
                thread.set_signaled_obj(Some(Arc::as_ptr(self) as usize));
                thread.set_obj_sync_result(None);
                thread.set_schedulable(true);
                thread.set_schedule_state(ScheduleState::Running);
            }
        }
        critical_section.leave(current_thread);
    }
}

/// Adapts a [`Thread`] to the time manager's [`TimerCallback`] so a wait
/// timeout can be armed and cancelled by reference (spec §4.F/§4.G
/// collaboration).
///
/// `time_up` is only ever invoked by the time manager's worker while it
/// holds the core's single critical section (see `time::manager`), so it
/// never races [`SynchronizationObject::signal`] for the same thread.
struct WaitTimeout {
    thread: Arc<Thread>,
}

impl TimerCallback for WaitTimeout {
    fn time_up(&self) {
        self.thread.set_obj_sync_result(Some(KernelError::TimedOut));
        self.thread.set_schedulable(true);
        self.thread.set_schedule_state(ScheduleState::Running);
    }
}

/// Waits on any of `objects`, returning the index of the one that woke the
/// caller, or a [`KernelError`] (spec §4.G).
///
/// `critical_section` and `time_manager` are the caller's shared instances;
/// `current_thread` must be the thread belonging to the calling host
/// thread.
pub fn wait_for(
    objects: &[Arc<SynchronizationObject>],
    timeout_nanos: u64,
    critical_section: &CriticalSection,
    time_manager: &TimeManager,
    current_thread: &Arc<Thread>,
) -> Result<usize, KernelError> {
    critical_section.enter();

    for (i, obj) in objects.iter().enumerate() {
        if obj.is_signaled() {
            critical_section.leave(current_thread);
            return Ok(i);
        }
    }

    if timeout_nanos == 0 {
        critical_section.leave(current_thread);
        return Err(KernelError::TimedOut);
    }

    if current_thread.termination_pending() {
        critical_section.leave(current_thread);
        return Err(KernelError::ThreadTerminating);
    }
    if current_thread.take_sync_cancelled() {
        critical_section.leave(current_thread);
        return Err(KernelError::Cancelled);
    }

    for obj in objects {
        obj.add_waiter(current_thread);
    }
    current_thread.set_waiting_sync(true);
    current_thread.set_signaled_obj(None);
    current_thread.set_obj_sync_result(Some(KernelError::TimedOut));
    current_thread.set_schedulable(false);
    current_thread.set_schedule_state(ScheduleState::Paused);

    let timeout_callback: Option<Arc<dyn TimerCallback>> = if timeout_nanos > 0 {
        let callback: Arc<dyn TimerCallback> = Arc::new(WaitTimeout {
            thread: Arc::clone(current_thread),
        });
        time_manager.schedule_future_invocation(Arc::clone(&callback), timeout_nanos);
        Some(callback)
    } else {
        None
    };

    // The caller's host thread blocks here, inside `leave`, until the
    // scheduler runs this thread again (on a signal or a timeout).
    critical_section.leave(current_thread);

    if let Some(callback) = &timeout_callback {
        time_manager.unschedule_future_invocation(callback);
    }

    critical_section.enter();
    current_thread.set_waiting_sync(false);

    let result = current_thread.obj_sync_result();
    let signaled_obj = current_thread.signaled_obj();
    let mut index = None;
    for (i, obj) in objects.iter().enumerate() {
        obj.remove_waiter(current_thread);
        if signaled_obj == Some(Arc::as_ptr(obj) as usize) {
            index = Some(i);
        }
    }

    critical_section.leave(current_thread);

    match result {
        None => Ok(index.expect("a null sync result implies an object signaled this wait")),
        Some(err) => Err(err),
    }
}

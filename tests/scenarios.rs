//! Black-box integration tests for the numbered concrete scenarios, wiring
//! multiple components together through the public API the way an embedding
//! emulator would.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vkernel_core::memory::PageHeap;
use vkernel_core::page_table::{GuestVirtualAddress, PageTable};
use vkernel_core::sync::critical_section::{CoresChangedMask, CriticalSection, Scheduler};
use vkernel_core::sync::{wait_for, SynchronizationObject};
use vkernel_core::thread::Thread;
use vkernel_core::time::conversions::{HostTick, PerformanceCounter};
use vkernel_core::time::{TimeManager, TimerCallback};

struct NullScheduler;

impl Scheduler for NullScheduler {
    fn select_threads(&self) -> CoresChangedMask {
        0
    }
    fn enable_scheduling(&self, _mask: CoresChangedMask) {}
    fn enable_scheduling_from_foreign_thread(&self, _mask: CoresChangedMask) {}
}

struct WallClockCounter {
    start: Instant,
}

impl PerformanceCounter for WallClockCounter {
    fn elapsed_ticks(&self) -> HostTick {
        HostTick(self.start.elapsed().as_nanos() as u64)
    }
    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }
}

fn rng() -> rand::rngs::StdRng {
    use rand::SeedableRng;
    rand::rngs::StdRng::seed_from_u64(7)
}

fn init_logging() {
    let _ = env_logger::try_init();
}

// Scenario 1: one gibibyte heap, two page allocations, free both back.
#[test]
fn scenario_1_one_gib_heap_two_page_frees_restore_capacity() {
    init_logging();
    let mut heap = PageHeap::new(0x8000_0000, 0x4000_0000, &vkernel_core::memory::heap::DEFAULT_SHIFTS);
    let mut rng = rng();
    let initial = heap.free_page_count();

    let a = heap.allocate_block(0, false, &mut rng).unwrap();
    assert_eq!(a, 0x8000_0000);
    let b = heap.allocate_block(0, false, &mut rng).unwrap();
    assert_eq!(b, 0x8000_1000);

    heap.free(a, 1);
    heap.free(b, 1);
    assert_eq!(heap.free_page_count(), initial);
}

// Scenario 2: same heap, a 2 MiB block then a page, freed back.
#[test]
fn scenario_2_mixed_tier_allocations_restore_capacity() {
    init_logging();
    let shifts = &vkernel_core::memory::heap::DEFAULT_SHIFTS;
    let mut heap = PageHeap::new(0x8000_0000, 0x4000_0000, shifts);
    let mut rng = rng();
    let initial = heap.free_page_count();

    let tier2 = shifts.iter().position(|&s| s == 21).unwrap();
    let two_mib = heap.allocate_block(tier2, false, &mut rng).unwrap();
    assert_eq!(two_mib, 0x8000_0000);
    let page = heap.allocate_block(0, false, &mut rng).unwrap();
    assert_eq!(page, 0x8020_0000);

    heap.free(two_mib, (1 << 21) >> 12);
    heap.free(page, 1);
    assert_eq!(heap.free_page_count(), initial);
}

// Scenario 3: B (+5ms) fires before A (+10ms) before C (+20ms).
#[test]
fn scenario_3_time_manager_fires_in_deadline_order() {
    init_logging();
    let cs = Arc::new(CriticalSection::new(Box::new(NullScheduler)));
    let manager = TimeManager::new(Arc::new(WallClockCounter { start: Instant::now() }), cs);
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Recorder {
        order: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }
    impl TimerCallback for Recorder {
        fn time_up(&self) {
            self.order.lock().unwrap().push(self.name);
        }
    }

    manager.schedule_future_invocation(
        Arc::new(Recorder { order: Arc::clone(&order), name: "A" }),
        10_000_000,
    );
    manager.schedule_future_invocation(
        Arc::new(Recorder { order: Arc::clone(&order), name: "B" }),
        5_000_000,
    );
    manager.schedule_future_invocation(
        Arc::new(Recorder { order: Arc::clone(&order), name: "C" }),
        20_000_000,
    );

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(*order.lock().unwrap(), vec!["B", "A", "C"]);
}

// Scenario 4: two threads wait on X with a 100ms timeout; signalObject(X)
// after 10ms wakes both with index 0, wired through a real CriticalSection
// and TimeManager rather than the unit-level NullScheduler-only path.
#[test]
fn scenario_4_two_waiters_wake_on_signal_with_index_zero() {
    init_logging();
    let cs = Arc::new(CriticalSection::new(Box::new(NullScheduler)));
    let tm = Arc::new(TimeManager::new(
        Arc::new(WallClockCounter { start: Instant::now() }),
        Arc::clone(&cs),
    ));
    let x = SynchronizationObject::new(false);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let cs = Arc::clone(&cs);
            let tm = Arc::clone(&tm);
            let x = Arc::clone(&x);
            std::thread::spawn(move || {
                let thread = Thread::new();
                wait_for(&[x], 100_000_000, &cs, &tm, &thread)
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(10));
    let signaling_thread = Thread::new();
    x.signal(&cs, &signaling_thread);

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(0));
    }
}

// Scenario 5: a thread waits on X, Y, Z where Y is already signaled; returns
// Success with index 1 immediately, without ever registering as a waiter.
#[test]
fn scenario_5_already_signaled_middle_object_returns_its_index_immediately() {
    init_logging();
    let cs = Arc::new(CriticalSection::new(Box::new(NullScheduler)));
    let tm = TimeManager::new(Arc::new(WallClockCounter { start: Instant::now() }), Arc::clone(&cs));
    let thread = Thread::new();

    let x = SynchronizationObject::new(false);
    let y = SynchronizationObject::new(true);
    let z = SynchronizationObject::new(false);

    let result = wait_for(&[Arc::clone(&x), Arc::clone(&y), Arc::clone(&z)], 100_000_000, &cs, &tm, &thread);
    assert_eq!(result, Ok(1));
}

// Scenario 6: page table round trip through map/read/unmap.
#[test]
fn scenario_6_page_table_map_read_unmap_round_trips() {
    init_logging();
    let mut table: PageTable<u64> = PageTable::new();
    let va = GuestVirtualAddress::from(0x0000_1234_5678_9ABC_u64);

    table.map(va, 99);
    assert_eq!(table.read(va), 99);

    table.unmap(va);
    assert_eq!(table.read(va), 0);
}

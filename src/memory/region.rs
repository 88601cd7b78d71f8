//! DRAM partitioning into named pools (spec §3, §4.D).
//!
//! Region boundaries are computed deterministically, downward from the end
//! of DRAM: `application`, then `applet`, then `nv_services` at a fixed
//! minimum, and everything left above the slab heap goes to `service`.

use super::heap::{PageHeap, DEFAULT_SHIFTS};

/// Fixed minimum reserved for `nv_services` (graphics/display services),
/// regardless of arrangement (spec §4.D, §6 "DRAM map constants").
const NV_SERVICES_POOL_MIN: u64 = 0x0334_0000;

/// Selects how much of DRAM is handed to `application` vs `applet`, mirroring
/// the reference kernel's small family of supported memory layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryArrangement {
    /// Default split: most of DRAM to `application`, a modest `applet` pool.
    Standard,
    /// More headroom for `applet` (background applications), less for
    /// `application`.
    AppletHeavy,
}

impl MemoryArrangement {
    fn application_pool_size(self, dram_size: u64) -> u64 {
        match self {
            Self::Standard => dram_size * 5 / 8,
            Self::AppletHeavy => dram_size / 2,
        }
    }

    fn applet_pool_size(self, dram_size: u64) -> u64 {
        match self {
            Self::Standard => dram_size / 8,
            Self::AppletHeavy => dram_size / 4,
        }
    }
}

/// Which named pool an address belongs to (spec §4.D, supplemented
/// `region_for` lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Application,
    Applet,
    NvServices,
    Service,
}

struct Region {
    kind: PoolKind,
    heap: PageHeap,
}

/// The four named DRAM pools, each backed by its own [`PageHeap`].
pub struct MemoryRegionSet {
    regions: Vec<Region>,
}

impl MemoryRegionSet {
    /// Carves `[dram_base, dram_base + dram_size)` into pools per
    /// `arrangement`, largest-address-first: `application`, `applet`,
    /// `nv_services`, then `service` with whatever remains.
    ///
    /// # Panics
    /// Panics if `dram_size` is too small to fit `nv_services`'s fixed
    /// minimum alongside the arrangement's application/applet split.
    #[must_use]
    pub fn new(dram_base: u64, dram_size: u64, arrangement: MemoryArrangement) -> Self {
        let application_size = arrangement.application_pool_size(dram_size);
        let applet_size = arrangement.applet_pool_size(dram_size);
        let reserved = application_size + applet_size + NV_SERVICES_POOL_MIN;
        assert!(
            reserved <= dram_size,
            "dram_size too small for this arrangement"
        );
        let service_size = dram_size - reserved;

        let dram_end = dram_base + dram_size;
        let application_base = dram_end - application_size;
        let applet_base = application_base - applet_size;
        let nv_services_base = applet_base - NV_SERVICES_POOL_MIN;
        let service_base = dram_base;
        debug_assert_eq!(service_base + service_size, nv_services_base);

        let regions = vec![
            Region {
                kind: PoolKind::Service,
                heap: PageHeap::new(service_base, service_size, &DEFAULT_SHIFTS),
            },
            Region {
                kind: PoolKind::NvServices,
                heap: PageHeap::new(nv_services_base, NV_SERVICES_POOL_MIN, &DEFAULT_SHIFTS),
            },
            Region {
                kind: PoolKind::Applet,
                heap: PageHeap::new(applet_base, applet_size, &DEFAULT_SHIFTS),
            },
            Region {
                kind: PoolKind::Application,
                heap: PageHeap::new(application_base, application_size, &DEFAULT_SHIFTS),
            },
        ];

        Self { regions }
    }

    /// The pool owning `addr`, or `None` if it falls outside every region.
    #[must_use]
    pub fn region_for(&self, addr: u64) -> Option<PoolKind> {
        self.regions
            .iter()
            .find(|r| addr >= r.heap.base() && addr < r.heap.base() + r.heap.size())
            .map(|r| r.kind)
    }

    /// Mutable access to the heap backing `kind`.
    #[must_use]
    pub fn heap_mut(&mut self, kind: PoolKind) -> &mut PageHeap {
        &mut self
            .regions
            .iter_mut()
            .find(|r| r.kind == kind)
            .expect("every PoolKind has a backing region")
            .heap
    }

    /// Shared access to the heap backing `kind`.
    #[must_use]
    pub fn heap(&self, kind: PoolKind) -> &PageHeap {
        &self
            .regions
            .iter()
            .find(|r| r.kind == kind)
            .expect("every PoolKind has a backing region")
            .heap
    }
}

//! Sparse 4-level guest page table (spec §3, §4.A).
//!
//! Maps a 48-bit guest virtual address to a fixed-size, `Copy` descriptor
//! `T`. Interior levels are allocated lazily on `map` and released eagerly
//! on `unmap` once empty, so an all-unmapped table costs nothing beyond the
//! `PageTable` handle itself.
//!
//! Not thread-safe: per spec §4.A, "the caller serializes" concurrent
//! `map`/`unmap` on overlapping addresses.

use bitfield_struct::bitfield;

/// Number of slots per table level (9 index bits).
const ENTRIES: usize = 512;

/// Guest VA bit layout (spec §6):
/// `[63:48 unused][47:39 L0][38:30 L1][29:21 L2][20:12 L3][11:0 offset]`.
#[bitfield(u64)]
pub struct GuestVirtualAddress {
    #[bits(12)]
    offset: u16,
    #[bits(9)]
    l3: u16,
    #[bits(9)]
    l2: u16,
    #[bits(9)]
    l1: u16,
    #[bits(9)]
    l0: u16,
    #[bits(16)]
    __unused: u16,
}

enum Node<T> {
    /// An interior level: each slot is the unmapped sentinel (`None`) or an
    /// owning reference to the next level.
    Branch(Box<[Option<Box<Node<T>>>; ENTRIES]>),
    /// A level-3 leaf: each slot directly holds a descriptor.
    Leaf(Box<[T; ENTRIES]>),
}

impl<T: Copy + Default> Node<T> {
    fn new_branch() -> Box<Self> {
        Box::new(Self::Branch(Box::new(std::array::from_fn(|_| None))))
    }

    fn new_leaf() -> Box<Self> {
        Box::new(Self::Leaf(Box::new([T::default(); ENTRIES])))
    }

    fn as_branch_mut(&mut self) -> &mut [Option<Box<Node<T>>>; ENTRIES] {
        match self {
            Self::Branch(children) => children,
            Self::Leaf(_) => unreachable!("page table level depth mismatch"),
        }
    }
}

/// Sparse 4-level lookup from guest VA to descriptor `T`.
///
/// `T` must be bit-pattern-copyable, and `T::default()` must be the
/// "unmapped" sentinel (spec §3).
pub struct PageTable<T> {
    root: Option<Box<Node<T>>>,
}

impl<T: Copy + Default> Default for PageTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default + PartialEq> PageTable<T> {
    /// Creates an empty page table with no levels allocated.
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Reads the descriptor mapped at `va`, or `T::default()` if unmapped.
    #[must_use]
    pub fn read(&self, va: GuestVirtualAddress) -> T {
        let Some(l0) = &self.root else {
            return T::default();
        };
        let Node::Branch(l0_children) = l0.as_ref() else {
            unreachable!("root is always a branch")
        };
        let Some(l1) = &l0_children[usize::from(va.l0())] else {
            return T::default();
        };
        let Node::Branch(l1_children) = l1.as_ref() else {
            unreachable!("level 1 is always a branch")
        };
        let Some(l2) = &l1_children[usize::from(va.l1())] else {
            return T::default();
        };
        let Node::Branch(l2_children) = l2.as_ref() else {
            unreachable!("level 2 is always a branch")
        };
        let Some(l3) = &l2_children[usize::from(va.l2())] else {
            return T::default();
        };
        let Node::Leaf(leaf) = l3.as_ref() else {
            unreachable!("level 3 is always a leaf")
        };
        leaf[usize::from(va.l3())]
    }

    /// Maps `va` to `v`, allocating any missing intermediate levels.
    /// Repeated maps of the same VA overwrite the prior value.
    pub fn map(&mut self, va: GuestVirtualAddress, v: T) {
        if self.root.is_none() {
            log::trace!("page table: allocating level 0");
        }
        let l0 = self.root.get_or_insert_with(Node::new_branch);
        let l0_children = l0.as_branch_mut();

        if l0_children[usize::from(va.l0())].is_none() {
            log::trace!("page table: allocating level 1");
        }
        let l1 = l0_children[usize::from(va.l0())].get_or_insert_with(Node::new_branch);
        let l1_children = l1.as_branch_mut();

        if l1_children[usize::from(va.l1())].is_none() {
            log::trace!("page table: allocating level 2");
        }
        let l2 = l1_children[usize::from(va.l1())].get_or_insert_with(Node::new_branch);
        let l2_children = l2.as_branch_mut();

        if l2_children[usize::from(va.l2())].is_none() {
            log::trace!("page table: allocating level 3 leaf");
        }
        let l3 = l2_children[usize::from(va.l2())].get_or_insert_with(Node::new_leaf);
        let Node::Leaf(leaf) = l3.as_mut() else {
            unreachable!("level 3 is always a leaf")
        };
        leaf[usize::from(va.l3())] = v;
    }

    /// Unmaps `va`, releasing any interior level left fully empty.
    ///
    /// Silently returns if any ancestor is already absent.
    pub fn unmap(&mut self, va: GuestVirtualAddress) {
        let Some(l0) = &mut self.root else {
            return;
        };
        let l0_children = l0.as_branch_mut();
        let Some(l1) = &mut l0_children[usize::from(va.l0())] else {
            return;
        };
        let l1_children = l1.as_branch_mut();
        let Some(l2) = &mut l1_children[usize::from(va.l1())] else {
            return;
        };
        let l2_children = l2.as_branch_mut();
        let Some(l3) = &mut l2_children[usize::from(va.l2())] else {
            return;
        };
        let Node::Leaf(leaf) = l3.as_mut() else {
            unreachable!("level 3 is always a leaf")
        };

        leaf[usize::from(va.l3())] = T::default();
        if !leaf.iter().all(|entry| *entry == T::default()) {
            return;
        }

        log::trace!("page table: releasing level 3 leaf");
        l2_children[usize::from(va.l2())] = None;
        if !l2_children.iter().all(Option::is_none) {
            return;
        }

        log::trace!("page table: releasing level 2");
        l1_children[usize::from(va.l1())] = None;
        if !l1_children.iter().all(Option::is_none) {
            return;
        }

        log::trace!("page table: releasing level 1");
        l0_children[usize::from(va.l0())] = None;
        if l0_children.iter().all(Option::is_none) {
            log::trace!("page table: releasing level 0");
            self.root = None;
        }
    }

    /// Counts allocated interior/leaf nodes, for testing the
    /// no-empty-interior-node invariant (spec §8).
    #[must_use]
    pub fn live_node_count(&self) -> usize {
        fn count<T>(node: &Node<T>) -> usize {
            match node {
                Node::Leaf(_) => 1,
                Node::Branch(children) => {
                    1 + children
                        .iter()
                        .filter_map(Option::as_ref)
                        .map(|child| count(child))
                        .sum::<usize>()
                }
            }
        }
        self.root.as_deref().map_or(0, count)
    }
}

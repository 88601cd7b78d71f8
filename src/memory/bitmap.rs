//! Hierarchical free-bit bitmap (spec §3, §4.B).
//!
//! A stack of up to 4 layers, each summarizing 64:1 the layer below. The
//! bottom layer is the actual free/used map (`1` = free); every layer above
//! it holds, bit-for-bit, "does the corresponding 64-bit word one layer down
//! have any bit set".
//!
//! Like the rest of this module, a `PageBitmap` is not thread-safe; callers
//! serialize access (spec §5).

use rand::RngCore;

/// Maximum bitmap depth (spec §4.B: "clamped to 4").
const MAX_DEPTH: usize = 4;

/// A 32-bit entropy register refilled one `u32` at a time from an injected
/// RNG, one bit consumed per branch of `findFreeBlock`'s random mode (spec
/// §9, "Random bit consumption").
///
/// The register starts empty (`bits_remaining == 0`), so the very first call
/// refills from the RNG rather than reading the zero-initialized register —
/// see `DESIGN.md` for why this crate resolves that open question by not
/// preserving the original's "deterministic first draw from zero" quirk.
pub struct Entropy<'rng> {
    register: u32,
    bits_remaining: u8,
    rng: &'rng mut dyn RngCore,
}

impl<'rng> Entropy<'rng> {
    /// Creates an entropy source drawing refills from `rng`.
    pub fn new(rng: &'rng mut dyn RngCore) -> Self {
        Self {
            register: 0,
            bits_remaining: 0,
            rng,
        }
    }

    fn next_bit(&mut self) -> u32 {
        if self.bits_remaining == 0 {
            self.register = self.rng.next_u32();
            self.bits_remaining = 32;
        }
        let bit = self.register & 1;
        self.register >>= 1;
        self.bits_remaining -= 1;
        bit
    }
}

/// Picks a set bit out of a nonzero `word`, linearly (lowest index first).
fn select_linear_bit(word: u64) -> u32 {
    word.trailing_zeros()
}

/// Picks a set bit out of a nonzero `word` by recursive halving, consuming
/// one entropy bit per branch where both halves are nonzero (spec §4.B).
fn select_random_bit(word: u64, entropy: &mut Entropy<'_>) -> u32 {
    debug_assert_ne!(word, 0);
    let mut word = word;
    let mut width = 64u32;
    let mut base = 0u32;
    while width > 1 {
        let half = width / 2;
        let low_mask: u64 = if half == 64 { u64::MAX } else { (1u64 << half) - 1 };
        let low = word & low_mask;
        let high = word >> half;
        let choose_high = match (low != 0, high != 0) {
            (true, true) => entropy.next_bit() != 0,
            (false, true) => true,
            (true, false) => false,
            (false, false) => unreachable!("word was nonzero"),
        };
        if choose_high {
            word = high;
            base += half;
        } else {
            word = low;
        }
        width = half;
    }
    base
}

/// A hierarchical free-bit bitmap over `n_bits` cells.
pub struct PageBitmap {
    /// `layers[0]` is the top (coarsest) layer; the last entry is the
    /// bottom (1 bit per cell) layer.
    layers: Vec<Vec<u64>>,
    n_bits: usize,
    bits_count: usize,
}

impl PageBitmap {
    /// `D = ceil(log64(n_bits))`, clamped to `MAX_DEPTH`.
    fn depth_for(n_bits: usize) -> usize {
        let mut depth = 1;
        let mut capacity: u128 = 64;
        while capacity < n_bits as u128 && depth < MAX_DEPTH {
            depth += 1;
            capacity *= 64;
        }
        depth
    }

    /// Creates a bitmap over `n_bits` cells, all initially cleared (used).
    #[must_use]
    pub fn new(n_bits: usize) -> Self {
        let depth = Self::depth_for(n_bits);
        let mut counts = vec![n_bits.div_ceil(64).max(1)];
        for _ in 1..depth {
            let prev = *counts.last().unwrap();
            counts.push(prev.div_ceil(64).max(1));
        }
        counts.reverse();
        let layers = counts.into_iter().map(|c| vec![0u64; c]).collect();
        Self {
            layers,
            n_bits,
            bits_count: 0,
        }
    }

    /// Number of cells this bitmap covers.
    #[must_use]
    pub fn n_bits(&self) -> usize {
        self.n_bits
    }

    /// Popcount of the bottom layer (spec §3, `BitsCount`).
    #[must_use]
    pub fn bits_count(&self) -> usize {
        self.bits_count
    }

    fn bottom(&self) -> usize {
        self.layers.len() - 1
    }

    /// Sets the bit at `offset` (marks a cell free).
    pub fn set_bit(&mut self, offset: usize) {
        debug_assert!(offset < self.n_bits);
        let bottom = self.bottom();
        let word_idx = offset / 64;
        let bit = 1u64 << (offset % 64);
        let was_zero = self.layers[bottom][word_idx] == 0;
        let already_set = self.layers[bottom][word_idx] & bit != 0;
        self.layers[bottom][word_idx] |= bit;
        if !already_set {
            self.bits_count += 1;
        }
        if was_zero {
            self.propagate_set(bottom, word_idx);
        }
    }

    /// Clears the bit at `offset` (marks a cell used).
    pub fn clear_bit(&mut self, offset: usize) {
        debug_assert!(offset < self.n_bits);
        let bottom = self.bottom();
        let word_idx = offset / 64;
        let bit = 1u64 << (offset % 64);
        let was_set = self.layers[bottom][word_idx] & bit != 0;
        self.layers[bottom][word_idx] &= !bit;
        if was_set {
            self.bits_count -= 1;
        }
        if self.layers[bottom][word_idx] == 0 {
            self.propagate_clear(bottom, word_idx);
        }
    }

    /// Propagates a word going from zero to nonzero up through the layers,
    /// stopping once a parent word was already nonzero.
    fn propagate_set(&mut self, layer: usize, word_idx: usize) {
        let mut layer = layer;
        let mut idx = word_idx;
        while layer > 0 {
            let parent_layer = layer - 1;
            let parent_word = idx / 64;
            let parent_bit = 1u64 << (idx % 64);
            let parent_was_zero = self.layers[parent_layer][parent_word] == 0;
            self.layers[parent_layer][parent_word] |= parent_bit;
            if !parent_was_zero {
                break;
            }
            layer = parent_layer;
            idx = parent_word;
        }
    }

    /// Propagates a word going to zero up through the layers, stopping once
    /// a parent word remains nonzero after the clear.
    fn propagate_clear(&mut self, layer: usize, word_idx: usize) {
        let mut layer = layer;
        let mut idx = word_idx;
        while layer > 0 {
            let parent_layer = layer - 1;
            let parent_word = idx / 64;
            let parent_bit = 1u64 << (idx % 64);
            self.layers[parent_layer][parent_word] &= !parent_bit;
            if self.layers[parent_layer][parent_word] != 0 {
                break;
            }
            layer = parent_layer;
            idx = parent_word;
        }
    }

    /// Finds a free cell, or `None` if the bitmap is fully used.
    ///
    /// `entropy` is only consulted in random mode; pass `None` for linear
    /// (deterministic, lowest-address-first) mode.
    #[must_use]
    pub fn find_free_block(&self, mut entropy: Option<&mut Entropy<'_>>) -> Option<usize> {
        let depth = self.layers.len();
        let mut word_idx = 0usize;
        for layer in 0..depth {
            let word = self.layers[layer][word_idx];
            if word == 0 {
                return None;
            }
            let bit = match entropy.as_deref_mut() {
                Some(entropy) => select_random_bit(word, entropy),
                None => select_linear_bit(word),
            };
            if layer + 1 < depth {
                word_idx = word_idx * 64 + bit as usize;
            } else {
                return Some(word_idx * 64 + bit as usize);
            }
        }
        unreachable!("depth is always >= 1")
    }

    /// Attempts to clear `count` consecutive bits starting at `offset`.
    ///
    /// Fails (returns `false`, no mutation) unless every targeted bit was
    /// set. `count < 64` clears within a single word; `count >= 64` must be
    /// a multiple of 64 and spans whole words.
    pub fn clear_range(&mut self, offset: usize, count: usize) -> bool {
        debug_assert!(offset + count <= self.n_bits);
        let bottom = self.bottom();

        if count < 64 {
            let word_idx = offset / 64;
            let mask = ((1u64 << count) - 1) << (offset % 64);
            if self.layers[bottom][word_idx] & mask != mask {
                return false;
            }
            self.layers[bottom][word_idx] &= !mask;
            self.bits_count -= count;
            if self.layers[bottom][word_idx] == 0 {
                self.propagate_clear(bottom, word_idx);
            }
            true
        } else {
            debug_assert_eq!(count % 64, 0);
            debug_assert_eq!(offset % 64, 0);
            let first_word = offset / 64;
            let num_words = count / 64;
            let all_ones = (first_word..first_word + num_words)
                .all(|w| self.layers[bottom][w] == u64::MAX);
            if !all_ones {
                return false;
            }
            for w in first_word..first_word + num_words {
                self.layers[bottom][w] = 0;
                self.propagate_clear(bottom, w);
            }
            self.bits_count -= count;
            true
        }
    }
}

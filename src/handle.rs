// src/handle.rs
//
// Generation-checked object handles.
//
// A handle packs a slot index and the slot's generation into one positive
// 31-bit value, so it survives the C ABI where negative values are errors.

use std::fmt;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (31 - INDEX_BITS)) - 1;

/// Maximum number of slots a handle table can address.
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

/// Opaque reference to a handle table slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The root bank, present in every handle table.
    pub const ROOT_BANK: Handle = Handle(0);

    #[inline]
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        debug_assert!(index < MAX_SLOTS);
        Handle(((generation & GENERATION_MASK) << INDEX_BITS) | (index as u32 & INDEX_MASK))
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }

    /// Raw non-negative value, as seen by C callers.
    #[inline]
    pub fn to_raw(self) -> i32 {
        self.0 as i32
    }

    /// Rebuild a handle from a raw value. Negative values are error codes.
    #[inline]
    pub fn from_raw(raw: i32) -> Option<Self> {
        (raw >= 0).then_some(Handle(raw as u32))
    }
}

/// Next generation for a recycled slot.
#[inline]
pub(crate) fn next_generation(generation: u32) -> u32 {
    (generation + 1) & GENERATION_MASK
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Emulated GPU memory for AUB trace replay.
//!
//! A trace describes memory as a sequence of page-granular writes into three
//! address spaces: physical memory, the flat global GTT and per-context
//! 4-level PPGTTs. This crate keeps enough state to answer "what bytes live
//! at this GPU address" after any prefix of a trace:
//!
//! - [`PhysicalArena`]: a growable store of zeroed 4KiB page slots. Pages are
//!   realized lazily on first write and never move once allocated.
//! - [`AddressSpace`]: the GGTT index, the physical page index, the PPGTT
//!   walker and the direct-map overlay used to hand out contiguous views of
//!   page-scattered buffers.
//!
//! Nothing here interprets GPU commands; bytes are opaque payload.

#![forbid(unsafe_code)]

mod address_space;
mod arena;
mod direct_map;
mod error;
mod ppgtt;

pub use address_space::{AddressSpace, AddressSpaceOptions, GgttEntry, PageSource, Region};
pub use arena::{ArenaOptions, ArenaSlot, PhysicalArena};
pub use direct_map::{DirectMap, DirectMapEntry, MapSpace};
pub use error::{MemError, Result};
pub use ppgtt::{ppgtt_index, PteFlags, PPGTT_ENTRIES, PPGTT_LEVEL_SHIFTS};


pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round `addr` down to its 4KiB page.
#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Drop everything above bit 47.
///
/// GPU virtual addresses are 48 bits wide; traces may carry sign-extended or
/// garbage high bits in both memory-write records and PPGTT entries.
#[inline]
pub const fn canonical_48(addr: u64) -> u64 {
    addr & ((1u64 << 48) - 1)
}

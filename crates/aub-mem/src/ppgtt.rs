//! 4-level, 512-way PPGTT radix walk.

use crate::{canonical_48, page_base};
use bitflags::bitflags;

pub const PPGTT_ENTRIES: usize = 512;

/// Bit position of the 9-bit table index at each level, root (level 4) first.
pub const PPGTT_LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

bitflags! {
    /// Low bits of a PPGTT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Table index selected by `address` at `level` (4 = root, 1 = leaf table).
#[inline]
pub const fn ppgtt_index(address: u64, level: u32) -> usize {
    let shift = 12 + 9 * (level - 1);
    ((address >> shift) & 0x1ff) as usize
}

/// Translate `address` through the tree rooted at physical page `root`.
///
/// `read_entry(table_phys_addr, index)` returns the raw 64-bit entry or `None` when the table
/// page itself has never been written. Any missing table or entry without
/// [`PteFlags::PRESENT`] aborts the walk; there are no partial results.
pub(crate) fn walk(
    root: u64,
    address: u64,
    mut read_entry: impl FnMut(u64, usize) -> Option<u64>,
) -> Option<u64> {
    let mut table = page_base(root);
    for shift in PPGTT_LEVEL_SHIFTS {
        let index = ((address >> shift) & 0x1ff) as usize;
        let entry = read_entry(table, index)?;
        if !PteFlags::from_bits_truncate(entry).contains(PteFlags::PRESENT) {
            return None;
        }
        table = canonical_48(page_base(entry));
    }
    Some(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn index_extraction_matches_level_shifts() {
        let address = (3u64 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123;
        assert_eq!(ppgtt_index(address, 4), 3);
        assert_eq!(ppgtt_index(address, 3), 5);
        assert_eq!(ppgtt_index(address, 2), 7);
        assert_eq!(ppgtt_index(address, 1), 9);
    }

    #[test]
    fn walk_stops_at_first_invalid_level() {
        let mut tables: HashMap<(u64, usize), u64> = HashMap::new();
        tables.insert((0x1000, 0), 0x2000 | 3);
        tables.insert((0x2000, 0), 0x3000 | 3);
        tables.insert((0x3000, 0), 0x4000 | 3);
        tables.insert((0x4000, 1), 0x9000 | 3);
        tables.insert((0x4000, 2), 0xa000);

        let read = |t: u64, i: usize| tables.get(&(t, i)).copied().or(Some(0));
        assert_eq!(walk(0x1000, 0x1000, read), Some(0x9000));
        assert_eq!(walk(0x1000, 0x2000, read), None);
        assert_eq!(walk(0x1000, 0x3000, read), None);
        assert_eq!(walk(0x1000, 1 << 39, read), None);
    }
}

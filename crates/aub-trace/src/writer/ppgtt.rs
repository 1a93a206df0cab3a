//! Writer-side mirror of the PPGTT the trace builds, so page-table pages are only re-emitted
//! where they changed.

use aub_mem::{ppgtt_index, PteFlags, PAGE_SIZE, PPGTT_ENTRIES, PPGTT_LEVEL_SHIFTS};

/// Monotonic physical page allocator. Pages are never reused.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PageAllocator {
    next_page: u64,
}

impl PageAllocator {
    /// Reserve `pages` consecutive pages and return the address of the first.
    pub(crate) fn alloc(&mut self, pages: u64) -> u64 {
        let addr = self.next_page * PAGE_SIZE;
        self.next_page += pages;
        addr
    }

    pub(crate) fn next_page(&self) -> u64 {
        self.next_page
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Leaf(u64),
    Table(Box<PpgttTable>),
}

impl Slot {
    fn entry(&self) -> u64 {
        let flags = (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
        match self {
            Slot::Empty => 0,
            Slot::Leaf(phys) => phys | flags,
            Slot::Table(table) => table.phys_addr | flags,
        }
    }
}

/// Page-table bytes that must be written to physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableUpdate {
    pub(crate) phys_addr: u64,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct PpgttTable {
    phys_addr: u64,
    slots: Vec<Slot>,
}

impl PpgttTable {
    pub(crate) fn new(phys_addr: u64) -> Self {
        let mut slots = Vec::with_capacity(PPGTT_ENTRIES);
        slots.resize_with(PPGTT_ENTRIES, || Slot::Empty);
        Self { phys_addr, slots }
    }

    pub(crate) fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Populate every slot covering `[start, end]` (inclusive, canonical) at `level` and below.
    ///
    /// Each table whose slots changed contributes one update spanning only its dirty index
    /// range. Updates are produced parent first.
    pub(crate) fn map_range(
        &mut self,
        level: u32,
        start: u64,
        end: u64,
        alloc: &mut PageAllocator,
        updates: &mut Vec<TableUpdate>,
    ) {
        let first = ppgtt_index(start, level);
        let last = ppgtt_index(end, level);

        let mut dirty: Option<(usize, usize)> = None;
        for index in first..=last {
            if !matches!(self.slots[index], Slot::Empty) {
                continue;
            }
            let page = alloc.alloc(1);
            self.slots[index] = if level == 1 {
                Slot::Leaf(page)
            } else {
                Slot::Table(Box::new(PpgttTable::new(page)))
            };
            dirty = Some(match dirty {
                None => (index, index),
                Some((lo, _)) => (lo, index),
            });
        }

        if let Some((lo, hi)) = dirty {
            let mut bytes = Vec::with_capacity((hi - lo + 1) * 8);
            for slot in &self.slots[lo..=hi] {
                bytes.extend_from_slice(&slot.entry().to_le_bytes());
            }
            updates.push(TableUpdate {
                phys_addr: self.phys_addr + lo as u64 * 8,
                bytes,
            });
        }

        if level == 1 {
            return;
        }

        let shift = PPGTT_LEVEL_SHIFTS[4 - level as usize];
        let span = 1u64 << shift;
        let table_base = start & !((span << 9) - 1);
        for index in first..=last {
            let slot_base = table_base + ((index as u64) << shift);
            let child_start = start.max(slot_base);
            let child_end = end.min(slot_base + span - 1);
            if let Slot::Table(child) = &mut self.slots[index] {
                child.map_range(level - 1, child_start, child_end, alloc, updates);
            }
        }
    }

    /// Physical page backing `address`, if the mirror maps it.
    pub(crate) fn lookup(&self, address: u64) -> Option<u64> {
        let mut table = self;
        for level in (1..=4).rev() {
            match &table.slots[ppgtt_index(address, level)] {
                Slot::Empty => return None,
                Slot::Leaf(phys) => return Some(*phys),
                Slot::Table(child) => table = &**child,
            }
        }
        None
    }
}

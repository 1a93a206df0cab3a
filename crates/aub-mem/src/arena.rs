use crate::{MemError, Result, PAGE_SIZE};

const PAGE_BYTES: usize = PAGE_SIZE as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaOptions {
    /// Upper bound on the number of pages the arena may hold. `None` grows until the host
    /// allocator refuses.
    pub max_pages: Option<usize>,
}

/// Location of one page inside a [`PhysicalArena`].
///
/// The offset is assigned once, when the page is allocated, and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaSlot(u64);

impl ArenaSlot {
    #[inline]
    pub fn offset(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 / PAGE_SIZE) as usize
    }
}

/// Monotonically growing, page-granular backing store.
///
/// Every allocation appends exactly one zeroed page. Pages allocated back to back are adjacent
/// in the arena, which is what lets [`PhysicalArena::map_view`] hand out a single slice for a
/// run of them.
#[derive(Debug, Default)]
pub struct PhysicalArena {
    data: Vec<u8>,
    options: ArenaOptions,
}

impl PhysicalArena {
    pub fn new() -> Self {
        Self::with_options(ArenaOptions::default())
    }

    pub fn with_options(options: ArenaOptions) -> Self {
        Self {
            data: Vec::new(),
            options,
        }
    }

    #[inline]
    pub fn allocated_pages(&self) -> usize {
        self.data.len() / PAGE_BYTES
    }

    /// Append one zero-filled page.
    pub fn allocate_page(&mut self) -> Result<ArenaSlot> {
        let pages = self.allocated_pages();
        if self.options.max_pages.is_some_and(|max| pages >= max) {
            return Err(MemError::OutOfMemory { pages });
        }
        self.data
            .try_reserve(PAGE_BYTES)
            .map_err(|_| MemError::OutOfMemory { pages })?;

        let offset = self.data.len() as u64;
        self.data.resize(self.data.len() + PAGE_BYTES, 0);
        Ok(ArenaSlot(offset))
    }

    pub fn page(&self, slot: ArenaSlot) -> Result<&[u8]> {
        self.map_view(slot, 1)
    }

    pub fn page_mut(&mut self, slot: ArenaSlot) -> Result<&mut [u8]> {
        self.map_view_mut(slot, 1)
    }

    /// Borrow `pages` consecutive arena pages starting at `first`.
    ///
    /// The arena knows nothing about physical addresses; callers must check that the physical
    /// pages they want are arena-contiguous before asking for a multi-page view.
    pub fn map_view(&self, first: ArenaSlot, pages: usize) -> Result<&[u8]> {
        let range = self.range(first, pages)?;
        Ok(&self.data[range])
    }

    pub fn map_view_mut(&mut self, first: ArenaSlot, pages: usize) -> Result<&mut [u8]> {
        let range = self.range(first, pages)?;
        Ok(&mut self.data[range])
    }

    fn range(&self, first: ArenaSlot, pages: usize) -> Result<std::ops::Range<usize>> {
        let out_of_range = MemError::SlotOutOfRange {
            offset: first.0,
            pages,
        };
        let start = usize::try_from(first.0).map_err(|_| out_of_range.clone())?;
        let len = pages
            .checked_mul(PAGE_BYTES)
            .ok_or_else(|| out_of_range.clone())?;
        let end = start.checked_add(len).ok_or_else(|| out_of_range.clone())?;
        if start % PAGE_BYTES != 0 || end > self.data.len() {
            return Err(out_of_range);
        }
        Ok(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_grows_by_one_zeroed_page() {
        let mut arena = PhysicalArena::new();
        let a = arena.allocate_page().unwrap();
        let b = arena.allocate_page().unwrap();

        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), PAGE_SIZE);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.allocated_pages(), 2);
        assert!(arena.page(b).unwrap().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn multi_page_view_spans_adjacent_slots() {
        let mut arena = PhysicalArena::new();
        let first = arena.allocate_page().unwrap();
        let second = arena.allocate_page().unwrap();
        arena.page_mut(second).unwrap()[0] = 0x5a;

        let view = arena.map_view(first, 2).unwrap();
        assert_eq!(view.len(), 2 * PAGE_BYTES);
        assert_eq!(view[PAGE_BYTES], 0x5a);

        assert_eq!(
            arena.map_view(second, 2),
            Err(MemError::SlotOutOfRange {
                offset: PAGE_SIZE,
                pages: 2
            })
        );
    }

    #[test]
    fn page_cap_reports_out_of_memory() {
        let mut arena = PhysicalArena::with_options(ArenaOptions { max_pages: Some(1) });
        arena.allocate_page().unwrap();
        assert_eq!(
            arena.allocate_page(),
            Err(MemError::OutOfMemory { pages: 1 })
        );
        assert_eq!(arena.allocated_pages(), 1);
    }
}

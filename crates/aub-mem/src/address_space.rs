use std::collections::BTreeMap;

use crate::arena::{ArenaOptions, ArenaSlot, PhysicalArena};
use crate::direct_map::{DirectMap, DirectMapEntry, MapSpace};
use crate::{canonical_48, page_base, ppgtt, MemError, Result, PAGE_MASK, PAGE_SIZE};

const PAGE_BYTES: usize = PAGE_SIZE as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSpaceOptions {
    pub arena: ArenaOptions,
}

/// One GGTT translation as it was written by the trace.
///
/// `phys_addr` is the raw entry: the page address with the validity flag in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgttEntry {
    pub virt_addr: u64,
    pub phys_addr: u64,
}

impl GgttEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.phys_addr & 1 != 0
    }

    #[inline]
    pub fn phys_page(&self) -> u64 {
        canonical_48(page_base(self.phys_addr))
    }
}

/// Where the last write into a physical page came from.
///
/// Bytes `[page_offset, page_offset + len)` of the page were copied from the trace stream at
/// `trace_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSource {
    pub trace_offset: u64,
    pub page_offset: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy)]
struct PhysPage {
    slot: ArenaSlot,
    source: Option<PageSource>,
}

/// A contiguous view handed out from the direct-map overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    pub address: u64,
    pub data: &'a [u8],
    pub space: MapSpace,
}

impl<'a> Region<'a> {
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size()
    }

    /// Bytes from `address` to the end of the region.
    pub fn tail(&self, address: u64) -> Option<&'a [u8]> {
        if !self.contains(address) {
            return None;
        }
        Some(&self.data[(address - self.address) as usize..])
    }
}

/// Consumer-side model of everything a trace has written so far.
///
/// Owns the page arena, the GGTT and physical page indices (both ordered by page address), the
/// current PPGTT root and the direct-map overlay. Every address is page-masked before it hits an
/// index; sub-page offsets are resolved against the returned page or region.
#[derive(Debug, Default)]
pub struct AddressSpace {
    arena: PhysicalArena,
    ggtt: BTreeMap<u64, u64>,
    phys: BTreeMap<u64, PhysPage>,
    maps: DirectMap,
    ppgtt_root: Option<u64>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::with_options(AddressSpaceOptions::default())
    }

    pub fn with_options(options: AddressSpaceOptions) -> Self {
        Self {
            arena: PhysicalArena::with_options(options.arena),
            ..Self::default()
        }
    }

    pub fn arena(&self) -> &PhysicalArena {
        &self.arena
    }

    pub fn direct_maps(&self) -> &DirectMap {
        &self.maps
    }

    pub fn ppgtt_root(&self) -> Option<u64> {
        self.ppgtt_root
    }

    pub fn set_ppgtt_root(&mut self, root: u64) {
        self.ppgtt_root = Some(canonical_48(page_base(root)));
    }

    // -------------------------------------------------------------------------------------------
    // Physical pages
    // -------------------------------------------------------------------------------------------

    /// Return the arena slot backing `phys_addr`, allocating a zeroed page on first touch.
    pub fn ensure_phys_page(&mut self, phys_addr: u64) -> Result<ArenaSlot> {
        let page = page_base(phys_addr);
        if let Some(existing) = self.phys.get(&page) {
            return Ok(existing.slot);
        }
        let slot = self.arena.allocate_page()?;
        self.phys.insert(page, PhysPage { slot, source: None });
        Ok(slot)
    }

    pub fn phys_slot(&self, phys_addr: u64) -> Option<ArenaSlot> {
        self.phys.get(&page_base(phys_addr)).map(|p| p.slot)
    }

    pub fn is_resident(&self, phys_addr: u64) -> bool {
        self.phys.contains_key(&page_base(phys_addr))
    }

    pub fn resident_pages(&self) -> usize {
        self.phys.len()
    }

    /// The whole 4KiB page containing `phys_addr`, if it was ever written.
    pub fn phys_page(&self, phys_addr: u64) -> Option<&[u8]> {
        let page = self.phys.get(&page_base(phys_addr))?;
        self.arena.page(page.slot).ok()
    }

    pub fn phys_source(&self, phys_addr: u64) -> Option<PageSource> {
        self.phys.get(&page_base(phys_addr))?.source
    }

    /// Copy `data` into physical memory, allocating pages as needed.
    ///
    /// `trace_offset` is the stream offset of `data[0]`, if the bytes came from a trace.
    pub fn phys_write(
        &mut self,
        phys_addr: u64,
        data: &[u8],
        trace_offset: Option<u64>,
    ) -> Result<()> {
        let mut addr = phys_addr;
        let mut remaining = data;
        let mut source_offset = trace_offset;
        while !remaining.is_empty() {
            let page = page_base(addr);
            let in_page = (addr & PAGE_MASK) as usize;
            let len = remaining.len().min(PAGE_BYTES - in_page);

            let slot = self.ensure_phys_page(page)?;
            self.arena.page_mut(slot)?[in_page..in_page + len].copy_from_slice(&remaining[..len]);

            if let Some(offset) = source_offset {
                if let Some(entry) = self.phys.get_mut(&page) {
                    entry.source = Some(PageSource {
                        trace_offset: offset,
                        page_offset: in_page as u32,
                        len: len as u32,
                    });
                }
                source_offset = Some(offset + len as u64);
            }

            remaining = &remaining[len..];
            addr += len as u64;
        }
        Ok(())
    }

    /// Copy physical memory into `dst`. Pages never written read as zero.
    pub fn read_phys(&self, phys_addr: u64, dst: &mut [u8]) {
        let mut addr = phys_addr;
        let mut out = dst;
        while !out.is_empty() {
            let in_page = (addr & PAGE_MASK) as usize;
            let len = out.len().min(PAGE_BYTES - in_page);
            let (chunk, rest) = std::mem::take(&mut out).split_at_mut(len);
            match self.phys_page(addr) {
                Some(page) => chunk.copy_from_slice(&page[in_page..in_page + len]),
                None => chunk.fill(0),
            }
            out = rest;
            addr += len as u64;
        }
    }

    /// Borrow `pages` physical pages starting at `phys_addr` as one slice.
    ///
    /// Succeeds only when every page is resident and the pages sit back to back in the arena.
    pub fn map_physical(&self, phys_addr: u64, pages: usize) -> Result<&[u8]> {
        let first_page = page_base(phys_addr);
        let first = self
            .phys_slot(first_page)
            .ok_or(MemError::NotResident {
                phys_addr: first_page,
            })?;
        for i in 1..pages {
            let page = first_page + i as u64 * PAGE_SIZE;
            let slot = self
                .phys_slot(page)
                .ok_or(MemError::NotResident { phys_addr: page })?;
            if slot.offset() != first.offset() + i as u64 * PAGE_SIZE {
                return Err(MemError::NotContiguous {
                    phys_addr: first_page,
                    pages,
                });
            }
        }
        self.arena.map_view(first, pages)
    }

    // -------------------------------------------------------------------------------------------
    // GGTT
    // -------------------------------------------------------------------------------------------

    /// Apply a write into the GGTT entry table.
    ///
    /// `address` is a byte offset into the table: entry `address / 8` translates virtual page
    /// `address / 8`. Each entry is a little-endian u64.
    pub fn ggtt_entry_write(&mut self, address: u64, data: &[u8]) {
        let mut virt_addr = (address / 8) << 12;
        for entry in data.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(entry);
            self.ggtt.insert(virt_addr, u64::from_le_bytes(raw));
            virt_addr += PAGE_SIZE;
        }
    }

    pub fn set_ggtt_entry(&mut self, virt_addr: u64, phys_addr: u64) {
        self.ggtt.insert(page_base(virt_addr), phys_addr);
    }

    pub fn ggtt_entry(&self, virt_addr: u64) -> Option<GgttEntry> {
        let virt_addr = page_base(virt_addr);
        self.ggtt.get(&virt_addr).map(|&phys_addr| GgttEntry {
            virt_addr,
            phys_addr,
        })
    }

    pub fn ggtt_entries(&self) -> impl Iterator<Item = GgttEntry> + '_ {
        self.ggtt.iter().map(|(&virt_addr, &phys_addr)| GgttEntry {
            virt_addr,
            phys_addr,
        })
    }

    /// Physical page behind a GGTT address, if a valid entry exists.
    pub fn ggtt_translate(&self, virt_addr: u64) -> Option<u64> {
        self.ggtt_entry(virt_addr)
            .filter(GgttEntry::is_valid)
            .map(|e| e.phys_page())
    }

    /// Write through the GGTT. Every touched page must already have a valid entry; nothing is
    /// written otherwise.
    pub fn ggtt_write(
        &mut self,
        virt_addr: u64,
        data: &[u8],
        trace_offset: Option<u64>,
    ) -> Result<()> {
        let end = virt_addr + data.len() as u64;
        let mut page = page_base(virt_addr);
        while page < end {
            if self.ggtt_translate(page).is_none() {
                return Err(MemError::UnmappedGgtt { address: page });
            }
            page += PAGE_SIZE;
        }

        let mut addr = virt_addr;
        let mut remaining = data;
        let mut source_offset = trace_offset;
        while !remaining.is_empty() {
            let in_page = (addr & PAGE_MASK) as usize;
            let len = remaining.len().min(PAGE_BYTES - in_page);
            let phys = self
                .ggtt_translate(addr)
                .ok_or(MemError::UnmappedGgtt { address: addr })?;
            self.phys_write(phys + in_page as u64, &remaining[..len], source_offset)?;
            source_offset = source_offset.map(|o| o + len as u64);
            remaining = &remaining[len..];
            addr += len as u64;
        }
        Ok(())
    }

    /// Copy GGTT memory into `dst`. Mapped pages whose physical page was never written read as
    /// zero; a missing translation is an error.
    pub fn read_ggtt(&self, virt_addr: u64, dst: &mut [u8]) -> Result<()> {
        let mut addr = virt_addr;
        let mut out = dst;
        while !out.is_empty() {
            let in_page = (addr & PAGE_MASK) as usize;
            let len = out.len().min(PAGE_BYTES - in_page);
            let phys = self
                .ggtt_translate(addr)
                .ok_or(MemError::UnmappedGgtt { address: addr })?;
            let (chunk, rest) = std::mem::take(&mut out).split_at_mut(len);
            self.read_phys(phys + in_page as u64, chunk);
            out = rest;
            addr += len as u64;
        }
        Ok(())
    }

    /// Contiguous view of the GGTT buffer at or after `address`.
    ///
    /// Starting from the first GGTT entry at or above the page of `address`, the run extends
    /// while entries are exactly one page apart. Entries whose physical page was never written
    /// stay zero-filled holes inside the run. The view is registered as an ephemeral direct map,
    /// so later lookups inside it are answered from the overlay until
    /// [`AddressSpace::clear_ephemeral_maps`].
    pub fn reconstruct_region(&mut self, address: u64) -> Option<Region<'_>> {
        if let Some(index) = self.maps.find(MapSpace::Ggtt, address) {
            return self.region(index);
        }

        let (&first, _) = self.ggtt.range(page_base(address)..).next()?;
        let mut last = first;
        for (&virt, _) in self.ggtt.range(first + PAGE_SIZE..) {
            if virt != last + PAGE_SIZE {
                break;
            }
            last = virt;
        }

        let mut data = vec![0u8; (last - first + PAGE_SIZE) as usize];
        for (&virt, &entry) in self.ggtt.range(first..=last) {
            let phys = canonical_48(page_base(entry));
            let Some(page) = self.phys_page(phys) else {
                continue;
            };
            let offset = (virt - first) as usize;
            data[offset..offset + PAGE_BYTES].copy_from_slice(page);
        }

        tracing::trace!(
            address = first,
            size = data.len(),
            "reconstructed GGTT region"
        );
        let index = self.maps.insert(DirectMapEntry {
            address: first,
            data,
            space: MapSpace::Ggtt,
            ephemeral: true,
        });
        self.region(index)
    }

    // -------------------------------------------------------------------------------------------
    // PPGTT
    // -------------------------------------------------------------------------------------------

    /// Walk the PPGTT rooted at `root` and return the physical page mapped at `virt_addr`.
    ///
    /// The leaf page itself does not have to be resident.
    pub fn ppgtt_translate(&self, root: u64, virt_addr: u64) -> Option<u64> {
        ppgtt::walk(root, canonical_48(virt_addr), |table, index| {
            let page = self.phys_page(table)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&page[index * 8..index * 8 + 8]);
            Some(u64::from_le_bytes(raw))
        })
    }

    /// The resident page mapped at `virt_addr` in the current PPGTT.
    pub fn ppgtt_page(&self, virt_addr: u64) -> Option<&[u8]> {
        let phys = self.ppgtt_translate(self.ppgtt_root?, virt_addr)?;
        self.phys_page(phys)
    }

    pub fn read_ppgtt(&self, virt_addr: u64, dst: &mut [u8]) -> Result<()> {
        let root = self.ppgtt_root.ok_or(MemError::UnmappedPpgtt { address: virt_addr })?;
        let mut addr = virt_addr;
        let mut out = dst;
        while !out.is_empty() {
            let in_page = (addr & PAGE_MASK) as usize;
            let len = out.len().min(PAGE_BYTES - in_page);
            let phys = self
                .ppgtt_translate(root, addr)
                .ok_or(MemError::UnmappedPpgtt { address: addr })?;
            let (chunk, rest) = std::mem::take(&mut out).split_at_mut(len);
            self.read_phys(phys + in_page as u64, chunk);
            out = rest;
            addr += len as u64;
        }
        Ok(())
    }

    /// PPGTT counterpart of [`AddressSpace::reconstruct_region`]: the run starts at the page of
    /// `address` and extends while the current root translates the next page.
    pub fn ppgtt_region(&mut self, address: u64) -> Option<Region<'_>> {
        let address = canonical_48(address);
        if let Some(index) = self.maps.find(MapSpace::Ppgtt, address) {
            return self.region(index);
        }

        let root = self.ppgtt_root?;
        let start = page_base(address);
        let mut pages = Vec::new();
        let mut virt = start;
        while virt < (1u64 << 48) {
            let Some(phys) = self.ppgtt_translate(root, virt) else {
                break;
            };
            pages.push(phys);
            virt += PAGE_SIZE;
        }
        if pages.is_empty() {
            return None;
        }

        let mut data = vec![0u8; pages.len() * PAGE_BYTES];
        for (chunk, &phys) in data.chunks_exact_mut(PAGE_BYTES).zip(&pages) {
            if let Some(page) = self.phys_page(phys) {
                chunk.copy_from_slice(page);
            }
        }

        tracing::trace!(address = start, size = data.len(), "reconstructed PPGTT region");
        let index = self.maps.insert(DirectMapEntry {
            address: start,
            data,
            space: MapSpace::Ppgtt,
            ephemeral: true,
        });
        self.region(index)
    }

    // -------------------------------------------------------------------------------------------
    // Direct maps
    // -------------------------------------------------------------------------------------------

    /// Register caller-supplied payload that shadows the page tables for its range. These
    /// entries persist until the address space is dropped.
    pub fn add_direct_map(&mut self, space: MapSpace, address: u64, data: Vec<u8>) {
        self.maps.insert(DirectMapEntry {
            address,
            data,
            space,
            ephemeral: false,
        });
    }

    /// Local memory writes carry buffer contents out of band; keep them as GGTT direct maps.
    pub fn local_write(&mut self, address: u64, data: &[u8]) {
        self.add_direct_map(MapSpace::Ggtt, address, data.to_vec());
    }

    /// Lookup in the overlay only, without reconstructing anything.
    pub fn find_region(&self, space: MapSpace, address: u64) -> Option<Region<'_>> {
        self.region(self.maps.find(space, address)?)
    }

    /// Release every reconstructed view. Call between submissions so stale views never
    /// shadow memory the next submission rewrote.
    pub fn clear_ephemeral_maps(&mut self) -> usize {
        let released = self.maps.clear_ephemeral();
        if released > 0 {
            tracing::debug!(released, "released ephemeral direct maps");
        }
        released
    }

    fn region(&self, index: usize) -> Option<Region<'_>> {
        let entry = self.maps.get(index)?;
        Some(Region {
            address: entry.address,
            data: &entry.data,
            space: entry.space,
        })
    }
}

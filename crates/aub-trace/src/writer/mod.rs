//! Trace encoder.
//!
//! [`AubWriter`] turns high-level intents (map memory, write a buffer, run a batch) into wire
//! records for one target device. It owns the physical and GGTT allocators and a mirror of the
//! PPGTT it has built, so page tables are written once and only where they change.

mod ppgtt;

use std::collections::BTreeMap;
use std::io::Write;

use aub_mem::{canonical_48, page_base, PAGE_SIZE};
use bitflags::bitflags;

use crate::context::{
    build_context_image, context_size, ContextParams, PPHWSP_SIZE, RING_HEAD_DWORD,
    RING_TAIL_DWORD,
};
use crate::device::{DeviceInfo, DeviceLookup, KnownDevices};
use crate::format::*;
use ppgtt::{PageAllocator, PpgttTable};

pub const MAX_CONTEXTS: usize = 64;
pub const DEFAULT_RING_SIZE: u32 = 4096;
pub const DEFAULT_LEGACY_GTT_SIZE: u64 = 64 << 20;

const GFX_MODE_EXECLIST_ENABLE: u32 = 0x8000_8000;
const LEGACY_GTT_ENTRY: u64 = 0x0020_0003;

bitflags! {
    /// Low bits of an execlist context descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextDescriptorFlags: u64 {
        const VALID = 1 << 0;
        const ADDRESSING_LEGACY_64BIT = 3 << 3;
        const L3_LLC_COHERENT = 1 << 5;
        const PPGTT = 1 << 8;
        const PRIORITY_NORMAL = 1 << 9;
    }
}

impl ContextDescriptorFlags {
    pub const fn submit_default() -> Self {
        Self::VALID
            .union(Self::ADDRESSING_LEGACY_64BIT)
            .union(Self::L3_LLC_COHERENT)
            .union(Self::PPGTT)
            .union(Self::PRIORITY_NORMAL)
    }
}

/// Descriptor the encoder submits for a context whose status page sits at `pphwsp_addr`.
pub fn context_descriptor(engine: Engine, pphwsp_addr: u64) -> u64 {
    (engine.hw_class() << 61) | pphwsp_addr | ContextDescriptorFlags::submit_default().bits()
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown PCI device id 0x{pci_id:x}")]
    UnknownDevice { pci_id: u32 },
    #[error("unknown context {id}")]
    UnknownContext { id: u32 },
    #[error("context limit of {max} reached")]
    TooManyContexts { max: usize },
    #[error("address 0x{address:x} is not mapped in the PPGTT")]
    UnmappedPpgtt { address: u64 },
    #[error("address 0x{address:x} is not page aligned")]
    Unaligned { address: u64 },
    #[error("range 0x{address:x}+0x{size:x} does not fit in 48 bits")]
    AddressOutOfRange { address: u64, size: u64 },
    #[error("payload of {available} bytes is shorter than the requested {size}")]
    ShortPayload { size: u64, available: usize },
    #[error("ring size {size} must be a non-zero multiple of the page size")]
    InvalidRingSize { size: u32 },
    #[error("{count} writes exceed the {max} slots of a discontiguous write")]
    TooManyWrites { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, WriteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AubWriterOptions {
    /// Span of the identity GTT written by [`AubWriter::default_setup`] on legacy profiles.
    pub legacy_gtt_size: u64,
    /// Bytes reserved for each context's ring buffer.
    pub ring_size: u32,
}

impl Default for AubWriterOptions {
    fn default() -> Self {
        Self {
            legacy_gtt_size: DEFAULT_LEGACY_GTT_SIZE,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

/// Placement of one engine's ring, status page and context image in the GGTT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwContext {
    pub ring_addr: u64,
    pub pphwsp_addr: u64,
    pub initialized: bool,
}

impl HwContext {
    /// The context image follows the status page.
    pub fn image_addr(&self) -> u64 {
        self.pphwsp_addr + PPHWSP_SIZE
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Context {
    engines: [HwContext; 3],
}

pub struct AubWriter<W: Write> {
    out: W,
    device: DeviceInfo,
    options: AubWriterOptions,
    phys: PageAllocator,
    ggtt_next: u64,
    ggtt: BTreeMap<u64, u64>,
    pml4: PpgttTable,
    contexts: Vec<Context>,
    bytes_written: u64,
}

impl<W: Write> AubWriter<W> {
    /// Start a trace for the device `pci_id` from the built-in device table.
    pub fn open(out: W, pci_id: u32, app_name: &str) -> Result<Self> {
        Self::open_with_lookup(out, &KnownDevices, pci_id, app_name, AubWriterOptions::default())
    }

    pub fn open_with_lookup(
        out: W,
        lookup: &dyn DeviceLookup,
        pci_id: u32,
        app_name: &str,
        options: AubWriterOptions,
    ) -> Result<Self> {
        let device = lookup
            .lookup(pci_id)
            .ok_or(WriteError::UnknownDevice { pci_id })?;
        Self::with_device(out, device, app_name, options)
    }

    /// Start a trace for an explicit profile. Writes the header record immediately.
    pub fn with_device(
        out: W,
        device: DeviceInfo,
        app_name: &str,
        options: AubWriterOptions,
    ) -> Result<Self> {
        if options.ring_size == 0 || u64::from(options.ring_size) % PAGE_SIZE != 0 {
            return Err(WriteError::InvalidRingSize {
                size: options.ring_size,
            });
        }

        let mut phys = PageAllocator::default();
        let pml4 = PpgttTable::new(phys.alloc(1));
        let mut writer = Self {
            out,
            device,
            options,
            phys,
            ggtt_next: 0,
            ggtt: BTreeMap::new(),
            pml4,
            contexts: Vec::new(),
            bytes_written: 0,
        };
        writer.write_header(app_name)?;
        Ok(writer)
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn options(&self) -> &AubWriterOptions {
        &self.options
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Next physical page number the allocator will hand out.
    pub fn phys_allocator(&self) -> u64 {
        self.phys.next_page()
    }

    /// Lowest GGTT address not yet handed out.
    pub fn ggtt_allocator(&self) -> u64 {
        self.ggtt_next
    }

    /// Physical address of the PPGTT root table.
    pub fn ppgtt_root(&self) -> u64 {
        self.pml4.phys_addr()
    }

    /// Physical page the PPGTT mirror maps `address` to.
    pub fn ppgtt_lookup(&self, address: u64) -> Option<u64> {
        self.pml4.lookup(canonical_48(address))
    }

    /// Physical page the GGTT maps `address` to.
    pub fn ggtt_lookup(&self, address: u64) -> Option<u64> {
        self.ggtt.get(&page_base(address)).copied()
    }

    pub fn hw_context(&self, context_id: u32, engine: Engine) -> Option<HwContext> {
        self.contexts
            .get(context_id as usize)
            .map(|ctx| ctx.engines[engine.index()])
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        tracing::debug!(bytes = self.bytes_written, "trace finished");
        Ok(self.out)
    }

    fn emit(&mut self, record: &[u8]) -> Result<()> {
        tracing::trace!(offset = self.bytes_written, len = record.len(), "emit record");
        self.out.write_all(record)?;
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    fn write_header(&mut self, app_name: &str) -> Result<()> {
        let record = if self.device.uses_execlists() {
            let name = format!("PCI-ID=0x{:X} {}", self.device.pci_id, app_name);
            version_record(self.device.simulator_id, &name)
        } else {
            let comment = format!("PCI-ID=0x{:x}", self.device.pci_id);
            classic_header_record(app_name, &comment)
        };
        tracing::debug!(
            pci_id = self.device.pci_id,
            ver = self.device.ver,
            app_name,
            "trace header"
        );
        self.emit(&record)
    }

    pub fn write_comment(&mut self, text: &str) -> Result<()> {
        let record = if self.device.uses_execlists() {
            comment_record(text)
        } else {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            trace_block_record(AUB_TRACE_OP_COMMENT, 0, &bytes, self.device.addr_bits())
        };
        self.emit(&record)
    }

    /// Enable execlists on every engine, or on legacy profiles write an identity GTT.
    pub fn default_setup(&mut self) -> Result<()> {
        if self.device.uses_execlists() {
            for engine in Engine::ALL {
                self.emit(&register_write_record(
                    engine.gfx_mode(),
                    GFX_MODE_EXECLIST_ENABLE,
                ))?;
            }
        } else {
            let entries = self.options.legacy_gtt_size / PAGE_SIZE;
            let wide = self.device.addr_bits() > 32;
            let mut table = Vec::with_capacity(entries as usize * if wide { 8 } else { 4 });
            for i in 0..entries {
                push_u32(&mut table, (LEGACY_GTT_ENTRY + i * PAGE_SIZE) as u32);
                if wide {
                    push_u32(&mut table, 0);
                }
            }
            let record = trace_block_record(
                AUB_TRACE_MEMTYPE_GTT_ENTRY | AUB_TRACE_OP_DATA_WRITE,
                0,
                &table,
                self.device.addr_bits(),
            );
            self.emit(&record)?;
        }
        tracing::debug!(execlists = self.device.uses_execlists(), "default setup");
        Ok(())
    }

    /// Write `data` to `address` in `space`, one record per 8 pages.
    pub fn write_region(&mut self, space: MemorySpace, address: u64, data: &[u8]) -> Result<()> {
        let mut addr = address;
        for chunk in data.chunks(MAX_WRITE_RECORD_BYTES) {
            self.emit(&memory_write_record(addr, space, chunk))?;
            addr += chunk.len() as u64;
        }
        Ok(())
    }

    /// Several small writes in one record.
    pub fn write_discontiguous(&mut self, space: MemorySpace, writes: &[(u64, &[u8])]) -> Result<()> {
        if writes.len() > DISCONTIGUOUS_SLOTS {
            return Err(WriteError::TooManyWrites {
                count: writes.len(),
                max: DISCONTIGUOUS_SLOTS,
            });
        }
        self.emit(&discontiguous_write_record(space, writes))
    }

    /// Back `size` bytes of GGTT at `virt_addr` with freshly allocated physical pages.
    pub fn map_ggtt(&mut self, virt_addr: u64, size: u64) -> Result<()> {
        if virt_addr % PAGE_SIZE != 0 {
            return Err(WriteError::Unaligned { address: virt_addr });
        }
        let pages = size.div_ceil(PAGE_SIZE);
        if pages == 0 {
            return Ok(());
        }
        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| virt_addr.checked_add(len))
            .filter(|&end| end <= 1 << 48)
            .ok_or(WriteError::AddressOutOfRange {
                address: virt_addr,
                size,
            })?;

        let phys = self.phys.alloc(pages);
        let mut entries = Vec::with_capacity(pages as usize * 8);
        for i in 0..pages {
            let page_phys = phys + i * PAGE_SIZE;
            entries.extend_from_slice(&(page_phys | 1).to_le_bytes());
            self.ggtt.insert(virt_addr + i * PAGE_SIZE, page_phys);
        }
        tracing::debug!(virt_addr, pages, phys, "map ggtt");

        self.write_region(MemorySpace::GgttEntry, virt_addr / PAGE_SIZE * 8, &entries)?;
        self.ggtt_next = self.ggtt_next.max(end);
        Ok(())
    }

    /// Write `size` bytes of `data` through the GGTT, mapping any page not mapped yet.
    pub fn write_ggtt(&mut self, virt_addr: u64, size: u64, data: &[u8]) -> Result<()> {
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= data.len())
            .ok_or(WriteError::ShortPayload {
                size,
                available: data.len(),
            })?;

        let end = virt_addr
            .checked_add(size)
            .ok_or(WriteError::AddressOutOfRange {
                address: virt_addr,
                size,
            })?;
        let mut page = page_base(virt_addr);
        while page < end {
            if self.ggtt.contains_key(&page) {
                page += PAGE_SIZE;
                continue;
            }
            let run_start = page;
            while page < end && !self.ggtt.contains_key(&page) {
                page += PAGE_SIZE;
            }
            self.map_ggtt(run_start, page - run_start)?;
        }

        self.write_region(MemorySpace::Ggtt, virt_addr, &data[..len])
    }

    /// Populate the PPGTT for `[start, start + size)`, emitting only changed table entries.
    pub fn map_ppgtt(&mut self, start: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let begin = canonical_48(start);
        let end = begin
            .checked_add(size - 1)
            .filter(|&end| end < 1 << 48)
            .ok_or(WriteError::AddressOutOfRange {
                address: start,
                size,
            })?;

        let mut updates = Vec::new();
        self.pml4
            .map_range(4, begin, end, &mut self.phys, &mut updates);
        tracing::debug!(start = begin, size, tables = updates.len(), "map ppgtt");

        for update in updates {
            self.write_region(MemorySpace::Physical, update.phys_addr, &update.bytes)?;
        }
        Ok(())
    }

    /// Write buffer contents at `gtt_offset`.
    ///
    /// Execlist profiles resolve the address through the PPGTT mirror and write physical memory;
    /// legacy profiles emit typed classic trace blocks.
    pub fn write_trace_block(
        &mut self,
        kind: TraceBlockKind,
        data: &[u8],
        gtt_offset: u64,
    ) -> Result<()> {
        tracing::trace!(?kind, gtt_offset, len = data.len(), "trace block");

        if !self.device.uses_execlists() {
            let flags = AUB_TRACE_MEMTYPE_GTT | kind.type_bits() | AUB_TRACE_OP_DATA_WRITE;
            let addr_bits = self.device.addr_bits();
            let mut address = gtt_offset;
            for chunk in data.chunks(MAX_WRITE_RECORD_BYTES) {
                self.emit(&trace_block_record(flags, address, chunk, addr_bits))?;
                address += chunk.len() as u64;
            }
            return Ok(());
        }

        let mut offset = 0;
        while offset < data.len() {
            let address = gtt_offset + offset as u64;
            let in_page = address % PAGE_SIZE;
            let len = (data.len() - offset).min((PAGE_SIZE - in_page) as usize);
            let phys = self
                .ppgtt_lookup(address)
                .ok_or(WriteError::UnmappedPpgtt { address })?;
            self.write_region(
                MemorySpace::Physical,
                phys + in_page,
                &data[offset..offset + len],
            )?;
            offset += len;
        }
        Ok(())
    }

    pub fn create_context(&mut self) -> Result<u32> {
        if self.contexts.len() >= MAX_CONTEXTS {
            return Err(WriteError::TooManyContexts { max: MAX_CONTEXTS });
        }
        let id = self.contexts.len() as u32;
        self.contexts.push(Context::default());
        tracing::debug!(id, "context created");
        Ok(id)
    }

    fn check_context(&self, context_id: u32) -> Result<()> {
        if (context_id as usize) < self.contexts.len() {
            Ok(())
        } else {
            Err(WriteError::UnknownContext { id: context_id })
        }
    }

    /// Place the ring, status page and context image for one engine of a context.
    pub fn emit_context_setup(&mut self, context_id: u32, engine: Engine) -> Result<HwContext> {
        self.check_context(context_id)?;

        let ring_size = u64::from(self.options.ring_size);
        let image_size = context_size(self.device.ver, engine);
        let ring_addr = self.ggtt_next;
        self.map_ggtt(ring_addr, ring_size + PPHWSP_SIZE + image_size)?;
        let pphwsp_addr = ring_addr + ring_size;

        self.write_region(MemorySpace::Ggtt, ring_addr, &vec![0u8; ring_size as usize])?;

        let image = build_context_image(
            self.device.ver,
            engine,
            &ContextParams {
                ring_addr,
                ring_size: self.options.ring_size,
                pml4_addr: self.pml4.phys_addr(),
            },
        );
        let mut blob = vec![0u8; PPHWSP_SIZE as usize];
        blob.extend_from_slice(&image);
        self.write_region(MemorySpace::Ggtt, pphwsp_addr, &blob)?;

        let hw = HwContext {
            ring_addr,
            pphwsp_addr,
            initialized: true,
        };
        self.contexts[context_id as usize].engines[engine.index()] = hw;
        tracing::debug!(
            context_id,
            engine = engine.name(),
            ring_addr,
            pphwsp_addr,
            "context setup"
        );
        Ok(hw)
    }

    /// Execute the batch at `batch_addr` on `engine`.
    ///
    /// On legacy profiles the ring is written in line at `offset`; execlist profiles use the
    /// context's own ring and ignore `offset`.
    pub fn submit(
        &mut self,
        context_id: u32,
        batch_addr: u64,
        offset: u64,
        engine: Engine,
    ) -> Result<()> {
        self.check_context(context_id)?;
        if self.device.uses_execlists() {
            self.submit_execlist(context_id, batch_addr, engine)
        } else {
            self.submit_legacy(batch_addr, offset, engine)
        }
    }

    fn submit_execlist(&mut self, context_id: u32, batch_addr: u64, engine: Engine) -> Result<()> {
        let mut hw = self.contexts[context_id as usize].engines[engine.index()];
        if !hw.initialized {
            hw = self.emit_context_setup(context_id, engine)?;
        }

        let mut ring = Vec::with_capacity(16);
        push_u32(
            &mut ring,
            MI_BATCH_BUFFER_START | MI_BATCH_BUFFER_START_ADDRESS_SPACE_PPGTT | (3 - 2),
        );
        push_u32(&mut ring, batch_addr as u32);
        push_u32(&mut ring, (batch_addr >> 32) as u32);
        push_u32(&mut ring, MI_NOOP);
        self.write_region(MemorySpace::Ggtt, hw.ring_addr, &ring)?;

        let image = hw.image_addr();
        self.write_region(
            MemorySpace::Ggtt,
            image + RING_HEAD_DWORD as u64 * 4,
            &0u32.to_le_bytes(),
        )?;
        self.write_region(
            MemorySpace::Ggtt,
            image + RING_TAIL_DWORD as u64 * 4,
            &(ring.len() as u32).to_le_bytes(),
        )?;

        let descriptor = context_descriptor(engine, hw.pphwsp_addr);
        tracing::debug!(engine = engine.name(), descriptor, batch_addr, "execlist submit");
        if self.device.uses_elsq() {
            let sq = engine.execlist_sq_contents();
            self.emit(&register_write_record(sq, descriptor as u32))?;
            self.emit(&register_write_record(sq + 4, (descriptor >> 32) as u32))?;
            self.emit(&register_write_record(engine.execlist_control(), 1))?;
            self.emit(&register_poll_record(engine.execlist_status(), 1, 1))
        } else {
            let port = engine.execlist_submit_port();
            self.emit(&register_write_record(port, 0))?;
            self.emit(&register_write_record(port, 0))?;
            self.emit(&register_write_record(port, (descriptor >> 32) as u32))?;
            self.emit(&register_write_record(port, descriptor as u32))?;
            self.emit(&register_poll_record(engine.execlist_status(), 0x10, 0))
        }
    }

    fn submit_legacy(&mut self, batch_addr: u64, offset: u64, engine: Engine) -> Result<()> {
        let addr_bits = self.device.addr_bits();
        let bbs_len: u32 = if addr_bits > 32 { 3 } else { 2 };

        let mut ring = Vec::with_capacity(12);
        push_u32(&mut ring, MI_BATCH_BUFFER_START | (bbs_len - 2));
        push_u32(&mut ring, batch_addr as u32);
        if addr_bits > 32 {
            push_u32(&mut ring, (batch_addr >> 32) as u32);
        }

        tracing::debug!(engine = engine.name(), batch_addr, offset, "ring submit");
        let flags = AUB_TRACE_MEMTYPE_GTT | engine.ring_type() | AUB_TRACE_OP_COMMAND_WRITE;
        self.emit(&trace_block_record(flags, offset, &ring, addr_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skylake() -> AubWriter<Vec<u8>> {
        AubWriter::open(Vec::new(), 0x1912, "writer-test").unwrap()
    }

    #[test]
    fn descriptor_flags_match_wire_value() {
        assert_eq!(ContextDescriptorFlags::submit_default().bits(), 0x339);
        assert_eq!(
            context_descriptor(Engine::Copy, 0x5000),
            (2u64 << 61) | 0x5339
        );
    }

    #[test]
    fn open_rejects_unknown_device_and_bad_ring() {
        assert!(matches!(
            AubWriter::open(Vec::new(), 0xbeef, "x"),
            Err(WriteError::UnknownDevice { pci_id: 0xbeef })
        ));

        let device = KnownDevices.lookup(0x1912).unwrap();
        let options = AubWriterOptions {
            ring_size: 100,
            ..AubWriterOptions::default()
        };
        assert!(matches!(
            AubWriter::with_device(Vec::new(), device, "x", options),
            Err(WriteError::InvalidRingSize { size: 100 })
        ));
    }

    #[test]
    fn pml4_is_the_first_physical_page() {
        let writer = skylake();
        assert_eq!(writer.ppgtt_root(), 0);
        assert_eq!(writer.phys_allocator(), 1);
        assert!(writer.bytes_written() > 0);
    }

    #[test]
    fn write_ggtt_maps_only_missing_pages() {
        let mut writer = skylake();
        writer.map_ggtt(0x1000, 0x1000).unwrap();
        let mapped = writer.ggtt_lookup(0x1000).unwrap();
        let before = writer.phys_allocator();

        writer.write_ggtt(0x1800, 0x1000, &[7u8; 0x1000]).unwrap();
        assert_eq!(writer.ggtt_lookup(0x1000), Some(mapped));
        assert_eq!(writer.phys_allocator(), before + 1);
        assert!(writer.ggtt_lookup(0x2000).is_some());
        assert_eq!(writer.ggtt_allocator(), 0x3000);
    }

    #[test]
    fn write_ggtt_rejects_short_payload() {
        let mut writer = skylake();
        assert!(matches!(
            writer.write_ggtt(0, 16, &[0u8; 8]),
            Err(WriteError::ShortPayload { size: 16, available: 8 })
        ));
    }

    #[test]
    fn map_ggtt_requires_alignment() {
        let mut writer = skylake();
        assert!(matches!(
            writer.map_ggtt(0x1234, 0x1000),
            Err(WriteError::Unaligned { address: 0x1234 })
        ));
    }

    #[test]
    fn ggtt_ranges_past_the_address_space_are_rejected() {
        let mut writer = skylake();
        let top = u64::MAX & !(PAGE_SIZE - 1);
        assert!(matches!(
            writer.map_ggtt(top, 2 * PAGE_SIZE),
            Err(WriteError::AddressOutOfRange { address, .. }) if address == top
        ));
        assert!(matches!(
            writer.map_ggtt(0, u64::MAX),
            Err(WriteError::AddressOutOfRange { address: 0, .. })
        ));
        assert!(matches!(
            writer.write_ggtt(u64::MAX - 4, 16, &[0u8; 16]),
            Err(WriteError::AddressOutOfRange { size: 16, .. })
        ));
        assert_eq!(writer.ggtt_allocator(), 0);
        assert_eq!(writer.phys_allocator(), 1);
    }

    #[test]
    fn trace_block_needs_ppgtt_mapping() {
        let mut writer = skylake();
        assert!(matches!(
            writer.write_trace_block(TraceBlockKind::Batch, &[0u8; 4], 0x7000_0000),
            Err(WriteError::UnmappedPpgtt { address: 0x7000_0000 })
        ));

        writer.map_ppgtt(0x7000_0000, 0x1000).unwrap();
        writer
            .write_trace_block(TraceBlockKind::Batch, &[0u8; 4], 0x7000_0000)
            .unwrap();
    }

    #[test]
    fn contexts_are_limited_and_checked() {
        let mut writer = skylake();
        for expected in 0..MAX_CONTEXTS as u32 {
            assert_eq!(writer.create_context().unwrap(), expected);
        }
        assert!(matches!(
            writer.create_context(),
            Err(WriteError::TooManyContexts { max: MAX_CONTEXTS })
        ));
        assert!(matches!(
            writer.submit(MAX_CONTEXTS as u32, 0, 0, Engine::Render),
            Err(WriteError::UnknownContext { .. })
        ));
    }

    #[test]
    fn context_setup_allocates_ring_status_page_and_image() {
        let mut writer = skylake();
        let ctx = writer.create_context().unwrap();
        let hw = writer.emit_context_setup(ctx, Engine::Copy).unwrap();

        assert_eq!(hw.ring_addr, 0);
        assert_eq!(hw.pphwsp_addr, 0x1000);
        assert_eq!(hw.image_addr(), 0x2000);
        assert_eq!(
            writer.ggtt_allocator(),
            0x2000 + context_size(9, Engine::Copy)
        );
        assert_eq!(writer.hw_context(ctx, Engine::Copy), Some(hw));
        assert!(!writer.hw_context(ctx, Engine::Render).unwrap().initialized);
    }

    #[test]
    fn finish_returns_everything_written() {
        let mut writer = skylake();
        writer.default_setup().unwrap();
        let written = writer.bytes_written();
        let out = writer.finish().unwrap();
        assert_eq!(out.len() as u64, written);
    }
}

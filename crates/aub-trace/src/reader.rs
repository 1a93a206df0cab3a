//! Trace decoder: walks a byte buffer record by record and reports what each record means
//! through a [`TraceHandler`].
//!
//! The buffer is untrusted. Every length field is checked against the bytes actually available
//! before anything is read, and a record that does not fit is reported as [`ReadError::Truncated`]
//! without touching memory past the end of the buffer.

use crate::device::{parse_pci_id_tag, DeviceInfo, DeviceLookup, KnownDevices};
use crate::execlist::ExeclistTracker;
use crate::format::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("record at offset {offset} needs {needed} bytes but only {available} remain")]
    Truncated {
        offset: u64,
        needed: usize,
        available: usize,
    },
    #[error("unknown record 0x{header:08x} at offset {offset}")]
    UnknownRecord { offset: u64, header: u32 },
    #[error("unknown PCI device id 0x{pci_id:x}")]
    UnknownDevice { pci_id: u32 },
    #[error("record at offset {offset} needs a device profile but none is known yet")]
    MissingDevice { offset: u64 },
    #[error("unknown ring type 0x{ring:x} at offset {offset}")]
    UnknownRing { offset: u64, ring: u32 },
    #[error("malformed record at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: &'static str },
}

/// A block of bytes written to some address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWrite<'a> {
    pub address: u64,
    pub data: &'a [u8],
    /// Stream offset of `data[0]`.
    pub trace_offset: u64,
}

/// Callbacks invoked while decoding. Every method has a no-op default, so implementors only
/// override what they care about.
pub trait TraceHandler {
    /// Called once for the record that stopped decoding.
    fn on_error(&mut self, _offset: u64, _record: &[u8], _message: &str) {}

    /// `pci_id` is the id tagged in the header, or 0 when the header carries none. `device` is
    /// the profile the reader decodes with, whether resolved from the tag or forced up front.
    fn on_session_info(&mut self, _pci_id: u32, _app_name: &str, _device: Option<&DeviceInfo>) {}

    fn on_comment(&mut self, _text: &str) {}

    /// Any memory write. The default routes by address space to the specific callbacks below.
    fn on_write(&mut self, space: MemorySpace, write: MemoryWrite<'_>) {
        match space {
            MemorySpace::Ggtt => self.on_ggtt_write(write),
            MemorySpace::Local => self.on_local_write(write),
            MemorySpace::Physical => self.on_phys_write(write),
            MemorySpace::GgttEntry => self.on_ggtt_entry_write(write),
        }
    }

    fn on_ggtt_write(&mut self, _write: MemoryWrite<'_>) {}

    /// `write.address` is the byte offset into the GGTT entry table.
    fn on_ggtt_entry_write(&mut self, _write: MemoryWrite<'_>) {}

    fn on_local_write(&mut self, _write: MemoryWrite<'_>) {}

    fn on_phys_write(&mut self, _write: MemoryWrite<'_>) {}

    fn on_register_write(&mut self, _offset: u32, _value: u32) {}

    /// Ring contents submitted directly on profiles without execlists.
    fn on_ring_submit(&mut self, _engine: Engine, _commands: &[u8]) {}

    fn on_execlist_submit(&mut self, _engine: Engine, _context_descriptor: u64) {}
}

/// Bounds-checked view of one record.
struct Record<'a> {
    offset: u64,
    bytes: &'a [u8],
}

impl<'a> Record<'a> {
    fn dword(&self, index: usize) -> Result<u32, ReadError> {
        let start = index * 4;
        let raw = self
            .bytes
            .get(start..start + 4)
            .ok_or(ReadError::Truncated {
                offset: self.offset,
                needed: start + 4,
                available: self.bytes.len(),
            })?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn slice(&self, start: usize, len: usize) -> Result<&'a [u8], ReadError> {
        start
            .checked_add(len)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(ReadError::Malformed {
                offset: self.offset,
                reason: "payload extends past the record",
            })
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// 32-bit profiles pack GTT entries in four bytes; handlers always see eight-byte entries.
fn widen_gtt_entries(table: &[u8]) -> Vec<u8> {
    let mut wide = Vec::with_capacity(table.len() * 2);
    for entry in table.chunks_exact(4) {
        wide.extend_from_slice(entry);
        wide.extend_from_slice(&[0; 4]);
    }
    wide
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub records: u64,
    pub bytes: u64,
}

/// Stateful decoder for one trace stream.
pub struct AubReader {
    lookup: Box<dyn DeviceLookup>,
    device: Option<DeviceInfo>,
    execlists: ExeclistTracker,
    position: u64,
    records: u64,
}

impl Default for AubReader {
    fn default() -> Self {
        Self::new()
    }
}

impl AubReader {
    /// Reader that resolves devices from [`KnownDevices`].
    pub fn new() -> Self {
        Self::with_lookup(KnownDevices)
    }

    pub fn with_lookup(lookup: impl DeviceLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            device: None,
            execlists: ExeclistTracker::new(),
            position: 0,
            records: 0,
        }
    }

    /// Reader with a profile fixed up front, for streams whose header carries no device id.
    pub fn with_device(device: DeviceInfo) -> Self {
        let mut reader = Self::new();
        reader.device = Some(device);
        reader
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Stream offset of the next record.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stats(&self) -> ReadStats {
        ReadStats {
            records: self.records,
            bytes: self.position,
        }
    }

    /// Decode every record in `data`. Stops at the first failing record, after reporting it to
    /// [`TraceHandler::on_error`].
    pub fn read_all<H: TraceHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<ReadStats, ReadError> {
        let mut rest = data;
        while !rest.is_empty() {
            let consumed = self.read_command(rest, handler)?;
            rest = &rest[consumed..];
        }
        Ok(self.stats())
    }

    /// Decode the record at the start of `data`. Returns the number of bytes it occupied.
    pub fn read_command<H: TraceHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<usize, ReadError> {
        let offset = self.position;
        match self.decode(data, handler) {
            Ok(consumed) => {
                self.position += consumed as u64;
                self.records += 1;
                Ok(consumed)
            }
            Err(err) => {
                tracing::warn!(offset, error = %err, "trace decoding stopped");
                handler.on_error(offset, data, &err.to_string());
                Err(err)
            }
        }
    }

    fn decode<H: TraceHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<usize, ReadError> {
        let offset = self.position;
        let truncated = |needed: usize| ReadError::Truncated {
            offset,
            needed,
            available: data.len(),
        };

        let raw = data.get(..4).ok_or_else(|| truncated(4))?;
        let header = RecordHeader(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));

        let mut total = header.total_dwords() * 4;
        if header.command() == CMD_AUB_TRACE_HEADER_BLOCK {
            let size = data.get(16..20).ok_or_else(|| truncated(20))?;
            let payload = u32::from_le_bytes([size[0], size[1], size[2], size[3]]);
            total += (payload as usize).div_ceil(4) * 4;
        }
        if total > data.len() {
            return Err(truncated(total));
        }

        let record = Record {
            offset,
            bytes: &data[..total],
        };
        tracing::trace!(offset, header = header.0, len = total, "record");

        match header.command() {
            CMD_AUB_HEADER => self.handle_classic_header(&record, handler)?,
            CMD_AUB_TRACE_HEADER_BLOCK => self.handle_trace_block(&record, handler)?,
            CMD_AUB_DUMP_BMP => {}
            CMD_MEM_TRACE_VERSION => self.handle_version(&record, handler)?,
            CMD_MEM_TRACE_REGISTER_WRITE => self.handle_register_write(&record, handler)?,
            CMD_MEM_TRACE_MEMORY_WRITE => self.handle_memory_write(&record, handler)?,
            CMD_MEM_TRACE_MEMORY_WRITE_DISCONTIGUOUS => {
                self.handle_discontiguous_write(&record, handler)?
            }
            CMD_MEM_TRACE_COMMENT => {
                let text = until_nul(record.bytes.get(4..).unwrap_or_default());
                handler.on_comment(&String::from_utf8_lossy(text));
            }
            CMD_MEM_TRACE_MEMORY_COMPARE
            | CMD_MEM_TRACE_REGISTER_POLL
            | CMD_MEM_TRACE_REGISTER_COMPARE
            | CMD_MEM_TRACE_MEMORY_POLL
            | CMD_MEM_TRACE_FRAME_BEGIN
            | CMD_MEM_TRACE_DELAY => {}
            _ => {
                return Err(ReadError::UnknownRecord {
                    offset,
                    header: header.0,
                })
            }
        }
        Ok(total)
    }

    fn resolve_device(&mut self, pci_id: u32) -> Result<(), ReadError> {
        let device = self
            .lookup
            .lookup(pci_id)
            .ok_or(ReadError::UnknownDevice { pci_id })?;
        tracing::debug!(pci_id, name = device.name, ver = device.ver, "device profile");
        self.device = Some(device);
        Ok(())
    }

    fn handle_classic_header<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        let app = until_nul(record.slice(8, 32)?);

        // The comment (and the PCI-ID tag inside it) is optional.
        let mut pci_id = 0;
        if record.bytes.len() > 13 * 4 {
            let comment_len = record.dword(12)? as usize;
            let available = record.bytes.len() - 13 * 4;
            let comment = until_nul(record.slice(13 * 4, comment_len.min(available))?);
            if let Some((id, _)) = parse_pci_id_tag(comment) {
                pci_id = id;
                self.resolve_device(id)?;
            }
        }

        handler.on_session_info(pci_id, &String::from_utf8_lossy(app), self.device.as_ref());
        Ok(())
    }

    fn handle_version<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        // Records shorter than the fixed part are malformed.
        record.dword(4)?;
        let name = until_nul(record.slice(20, record.bytes.len() - 20)?);

        let (pci_id, app) = match parse_pci_id_tag(name) {
            Some((id, consumed)) => {
                self.resolve_device(id)?;
                let rest = &name[consumed..];
                let skip = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
                (id, &rest[skip..])
            }
            None => {
                if self.device.is_none() {
                    return Err(ReadError::UnknownDevice { pci_id: 0 });
                }
                (0, name)
            }
        };

        handler.on_session_info(pci_id, &String::from_utf8_lossy(app), self.device.as_ref());
        Ok(())
    }

    fn handle_trace_block<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        let offset = record.offset;
        let device = self.device.ok_or(ReadError::MissingDevice { offset })?;

        let flags = record.dword(1)?;
        let operation = flags & AUB_TRACE_OPERATION_MASK;
        let ty = flags & AUB_TRACE_TYPE_MASK;
        let space = flags & AUB_TRACE_ADDRESS_SPACE_MASK;

        let lo = record.dword(3)?;
        let size = record.dword(4)? as usize;
        let hi = if device.addr_bits() > 32 {
            record.dword(5)?
        } else {
            0
        };
        let address = address_from_dwords(lo, hi);

        let header = RecordHeader(record.dword(0)?);
        let data_start = header.total_dwords() * 4;
        let data = record.slice(data_start, size)?;
        let write = MemoryWrite {
            address,
            data,
            trace_offset: offset + data_start as u64,
        };

        match operation {
            AUB_TRACE_OP_COMMENT => handler.on_comment(&String::from_utf8_lossy(until_nul(data))),
            AUB_TRACE_OP_DATA_WRITE => match space {
                AUB_TRACE_MEMTYPE_GTT => handler.on_write(MemorySpace::Ggtt, write),
                AUB_TRACE_MEMTYPE_LOCAL => handler.on_write(MemorySpace::Local, write),
                AUB_TRACE_MEMTYPE_GTT_ENTRY if device.addr_bits() > 32 => {
                    handler.on_write(MemorySpace::GgttEntry, write)
                }
                AUB_TRACE_MEMTYPE_GTT_ENTRY => {
                    let wide = widen_gtt_entries(data);
                    handler.on_write(
                        MemorySpace::GgttEntry,
                        MemoryWrite {
                            address: address * 2,
                            data: &wide,
                            trace_offset: write.trace_offset,
                        },
                    )
                }
                other => tracing::trace!(offset, space = other, "data write to unmodelled space"),
            },
            AUB_TRACE_OP_COMMAND_WRITE => {
                let engine = Engine::from_ring_type(ty)
                    .ok_or(ReadError::UnknownRing { offset, ring: ty })?;
                handler.on_ring_submit(engine, data);
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_register_write<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        let register = record.dword(1)?;
        let value = record.dword(5)?;
        handler.on_register_write(register, value);

        if let Some(submit) = self.execlists.register_write(register, value) {
            tracing::debug!(
                engine = submit.engine.name(),
                descriptor = submit.context_descriptor,
                "execlist submit"
            );
            handler.on_execlist_submit(submit.engine, submit.context_descriptor);
        }
        Ok(())
    }

    fn handle_memory_write<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        let address = address_from_dwords(record.dword(1)?, record.dword(2)?);
        let nibble = record.dword(3)? >> 28;
        let size = record.dword(4)? as usize;
        let data = record.slice(20, size)?;

        match MemorySpace::from_nibble(nibble) {
            Some(space) => handler.on_write(
                space,
                MemoryWrite {
                    address,
                    data,
                    trace_offset: record.offset + 20,
                },
            ),
            None => tracing::trace!(offset = record.offset, nibble, "write to unmodelled space"),
        }
        Ok(())
    }

    fn handle_discontiguous_write<H: TraceHandler + ?Sized>(
        &mut self,
        record: &Record<'_>,
        handler: &mut H,
    ) -> Result<(), ReadError> {
        let nibble = record.dword(1)? >> 28;
        let space = MemorySpace::from_nibble(nibble);

        let payload_start = (2 + DISCONTIGUOUS_SLOTS * 3) * 4;
        let mut cursor = payload_start;
        for slot in 0..DISCONTIGUOUS_SLOTS {
            let base = 2 + slot * 3;
            let address = address_from_dwords(record.dword(base)?, record.dword(base + 1)?);
            let size = record.dword(base + 2)? as usize;
            if size == 0 {
                continue;
            }

            let data = record.slice(cursor, size)?;
            if let Some(space) = space {
                handler.on_write(
                    space,
                    MemoryWrite {
                        address,
                        data,
                        trace_offset: record.offset + cursor as u64,
                    },
                );
            }
            cursor += size;
        }
        Ok(())
    }
}

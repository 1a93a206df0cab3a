//! AUB wire format: record headers, field encodings and record builders.
//!
//! Every record is a sequence of little-endian dwords. The first dword is the header:
//!
//! ```text
//! [31:29] type   [28:23] opcode   [22:16] subopcode   [15:0] length
//! ```
//!
//! The record spans `length + bias` dwords, where the bias depends on the dialect: the classic
//! opcode family (`OPCODE_AUB`) uses 2, the memtrace family uses 1. Classic trace blocks are
//! followed by an additional payload whose size is carried in dword 4.

use aub_mem::{canonical_48, PAGE_SIZE};

pub const TYPE_AUB: u32 = 0x7;

pub const OPCODE_AUB: u32 = 0x01;
pub const SUBOPCODE_HEADER: u32 = 0x05;
pub const SUBOPCODE_BLOCK: u32 = 0x41;
pub const SUBOPCODE_BMP: u32 = 0x1e;

pub const OPCODE_MEMTRACE: u32 = 0x2e;
pub const SUBOPCODE_MEM_COMPARE: u32 = 0x01;
pub const SUBOPCODE_REG_POLL: u32 = 0x02;
pub const SUBOPCODE_REG_WRITE: u32 = 0x03;
pub const SUBOPCODE_REG_COMPARE: u32 = 0x04;
pub const SUBOPCODE_MEM_POLL: u32 = 0x05;
pub const SUBOPCODE_MEM_WRITE: u32 = 0x06;
pub const SUBOPCODE_FRAME_BEGIN: u32 = 0x07;
pub const SUBOPCODE_COMMENT: u32 = 0x08;
pub const SUBOPCODE_DELAY: u32 = 0x09;
pub const SUBOPCODE_MEM_WRITE_DISCONTIGUOUS: u32 = 0x0b;
pub const SUBOPCODE_VERSION: u32 = 0x0e;

pub const fn make_header(ty: u32, opcode: u32, subopcode: u32) -> u32 {
    (ty << 29) | (opcode << 23) | (subopcode << 16)
}

pub const CMD_AUB_HEADER: u32 = make_header(TYPE_AUB, OPCODE_AUB, SUBOPCODE_HEADER);
pub const CMD_AUB_TRACE_HEADER_BLOCK: u32 = make_header(TYPE_AUB, OPCODE_AUB, SUBOPCODE_BLOCK);
pub const CMD_AUB_DUMP_BMP: u32 = make_header(TYPE_AUB, OPCODE_AUB, SUBOPCODE_BMP);

pub const CMD_MEM_TRACE_MEMORY_COMPARE: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_MEM_COMPARE);
pub const CMD_MEM_TRACE_REGISTER_POLL: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_REG_POLL);
pub const CMD_MEM_TRACE_REGISTER_WRITE: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_REG_WRITE);
pub const CMD_MEM_TRACE_REGISTER_COMPARE: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_REG_COMPARE);
pub const CMD_MEM_TRACE_MEMORY_POLL: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_MEM_POLL);
pub const CMD_MEM_TRACE_MEMORY_WRITE: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_MEM_WRITE);
pub const CMD_MEM_TRACE_FRAME_BEGIN: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_FRAME_BEGIN);
pub const CMD_MEM_TRACE_COMMENT: u32 = make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_COMMENT);
pub const CMD_MEM_TRACE_DELAY: u32 = make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_DELAY);
pub const CMD_MEM_TRACE_MEMORY_WRITE_DISCONTIGUOUS: u32 =
    make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_MEM_WRITE_DISCONTIGUOUS);
pub const CMD_MEM_TRACE_VERSION: u32 = make_header(TYPE_AUB, OPCODE_MEMTRACE, SUBOPCODE_VERSION);

/// Largest payload a single memory-write record may carry.
pub const MAX_WRITE_RECORD_BYTES: usize = 8 * PAGE_SIZE as usize;

/// Descriptor slots in a discontiguous memory write.
pub const DISCONTIGUOUS_SLOTS: usize = 63;

// Classic trace block, dword 1.
pub const AUB_TRACE_OPERATION_MASK: u32 = 0x0000_00ff;
pub const AUB_TRACE_OP_COMMENT: u32 = 0x0000_0000;
pub const AUB_TRACE_OP_DATA_WRITE: u32 = 0x0000_0001;
pub const AUB_TRACE_OP_COMMAND_WRITE: u32 = 0x0000_0002;
pub const AUB_TRACE_OP_MMIO_WRITE: u32 = 0x0000_0003;

pub const AUB_TRACE_TYPE_MASK: u32 = 0x0000_ff00;
pub const AUB_TRACE_TYPE_RING_HWB: u32 = 1 << 8;
pub const AUB_TRACE_TYPE_RING_PRB0: u32 = 2 << 8;
pub const AUB_TRACE_TYPE_RING_PRB1: u32 = 3 << 8;
pub const AUB_TRACE_TYPE_RING_PRB2: u32 = 4 << 8;

pub const AUB_TRACE_ADDRESS_SPACE_MASK: u32 = 0x00ff_0000;
pub const AUB_TRACE_MEMTYPE_GTT: u32 = 0 << 16;
pub const AUB_TRACE_MEMTYPE_LOCAL: u32 = 1 << 16;
pub const AUB_TRACE_MEMTYPE_NONLOCAL: u32 = 2 << 16;
pub const AUB_TRACE_MEMTYPE_PCI: u32 = 3 << 16;
pub const AUB_TRACE_MEMTYPE_GTT_ENTRY: u32 = 4 << 16;

pub const AUB_HEADER_MAJOR_SHIFT: u32 = 24;
pub const AUB_HEADER_MINOR_SHIFT: u32 = 16;

// Memtrace fields.
pub const AUB_MEM_TRACE_VERSION_FILE_VERSION: u32 = 0;
pub const AUB_MEM_TRACE_VERSION_DEVICE_SHIFT: u32 = 8;
pub const AUB_MEM_TRACE_REGISTER_SIZE_DWORD: u32 = 2 << 16;
pub const AUB_MEM_TRACE_REGISTER_SPACE_MMIO: u32 = 0 << 28;

// GPU commands the encoder has to place in rings and context images.
pub const MI_NOOP: u32 = 0;
pub const MI_BATCH_BUFFER_END: u32 = 0x0a << 23;
pub const MI_BATCH_BUFFER_START: u32 = 0x31 << 23;
pub const MI_BATCH_BUFFER_START_ADDRESS_SPACE_PPGTT: u32 = 1 << 8;
pub const MI_LOAD_REGISTER_IMM: u32 = 0x22 << 23;
pub const MI_LRI_FORCE_POSTED: u32 = 1 << 12;

/// The two header dialects, distinguished by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Classic,
    Memtrace,
}

impl Dialect {
    /// Dwords in a record beyond its declared length.
    pub fn bias(self) -> usize {
        match self {
            Dialect::Classic => 2,
            Dialect::Memtrace => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader(pub u32);

impl RecordHeader {
    #[inline]
    pub fn ty(self) -> u32 {
        (self.0 >> 29) & 0x7
    }

    #[inline]
    pub fn opcode(self) -> u32 {
        (self.0 >> 23) & 0x3f
    }

    #[inline]
    pub fn subopcode(self) -> u32 {
        (self.0 >> 16) & 0x7f
    }

    #[inline]
    pub fn length(self) -> u32 {
        self.0 & 0xffff
    }

    /// The header with its length field cleared, comparable against `CMD_*` constants.
    #[inline]
    pub fn command(self) -> u32 {
        self.0 & 0xffff_0000
    }

    pub fn dialect(self) -> Dialect {
        if self.opcode() == OPCODE_AUB {
            Dialect::Classic
        } else {
            Dialect::Memtrace
        }
    }

    /// Record size in dwords, excluding a classic trace block's trailing payload.
    pub fn total_dwords(self) -> usize {
        self.length() as usize + self.dialect().bias()
    }
}

/// Address-space selector of a memtrace memory write (top nibble of dword 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Ggtt,
    Local,
    Physical,
    GgttEntry,
}

impl MemorySpace {
    pub fn from_nibble(nibble: u32) -> Option<Self> {
        match nibble {
            0 => Some(MemorySpace::Ggtt),
            1 => Some(MemorySpace::Local),
            2 => Some(MemorySpace::Physical),
            4 => Some(MemorySpace::GgttEntry),
            _ => None,
        }
    }

    pub fn nibble(self) -> u32 {
        match self {
            MemorySpace::Ggtt => 0,
            MemorySpace::Local => 1,
            MemorySpace::Physical => 2,
            MemorySpace::GgttEntry => 4,
        }
    }

    #[inline]
    pub fn to_dword(self) -> u32 {
        self.nibble() << 28
    }
}

/// Content type of a classic data-write trace block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TraceBlockKind {
    NoType = 0,
    Batch = 1,
    VertexBuffer = 5,
    Map2d = 6,
    CubeMap = 7,
    VolumeMap = 9,
    Map1d = 10,
    ConstantBuffer = 11,
    ConstantUrb = 12,
    IndexBuffer = 13,
    General = 14,
    Surface = 15,
}

impl TraceBlockKind {
    #[inline]
    pub fn type_bits(self) -> u32 {
        (self as u32) << 8
    }
}

/// Hardware engines a trace can submit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Render,
    Video,
    Copy,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Render, Engine::Video, Engine::Copy];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Engine::Render => 0,
            Engine::Video => 1,
            Engine::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Engine::Render => "RENDER",
            Engine::Video => "VIDEO",
            Engine::Copy => "BLITTER",
        }
    }

    /// Engine class code carried in the top bits of a context descriptor.
    pub fn hw_class(self) -> u64 {
        match self {
            Engine::Render => 1,
            Engine::Video => 3,
            Engine::Copy => 2,
        }
    }

    pub fn mmio_base(self) -> u32 {
        match self {
            Engine::Render => 0x0_2000,
            Engine::Video => 0x1c_0000,
            Engine::Copy => 0x2_2000,
        }
    }

    pub fn ring_type(self) -> u32 {
        match self {
            Engine::Render => AUB_TRACE_TYPE_RING_PRB0,
            Engine::Video => AUB_TRACE_TYPE_RING_PRB1,
            Engine::Copy => AUB_TRACE_TYPE_RING_PRB2,
        }
    }

    pub fn from_ring_type(ring: u32) -> Option<Self> {
        match ring {
            AUB_TRACE_TYPE_RING_PRB0 => Some(Engine::Render),
            AUB_TRACE_TYPE_RING_PRB1 => Some(Engine::Video),
            AUB_TRACE_TYPE_RING_PRB2 => Some(Engine::Copy),
            _ => None,
        }
    }

    #[inline]
    pub fn execlist_submit_port(self) -> u32 {
        self.mmio_base() + 0x230
    }

    #[inline]
    pub fn execlist_status(self) -> u32 {
        self.mmio_base() + 0x234
    }

    #[inline]
    pub fn gfx_mode(self) -> u32 {
        self.mmio_base() + 0x29c
    }

    /// Low dword of the submission queue; the high dword follows at `+4`.
    #[inline]
    pub fn execlist_sq_contents(self) -> u32 {
        self.mmio_base() + 0x510
    }

    #[inline]
    pub fn execlist_control(self) -> u32 {
        self.mmio_base() + 0x550
    }
}

/// Stable identity of a submitted context: which engine and which descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExeclistSubmit {
    pub engine: Engine,
    pub context_descriptor: u64,
}

// -------------------------------------------------------------------------------------------------
// Record builders
// -------------------------------------------------------------------------------------------------

pub(crate) fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn pad_to_dword(out: &mut Vec<u8>) {
    let pad_len = (4 - (out.len() % 4)) % 4;
    out.extend(std::iter::repeat(0u8).take(pad_len));
}

/// Header dword for a record of `dwords` total dwords.
fn header_for(command: u32, dwords: usize) -> u32 {
    let bias = RecordHeader(command).dialect().bias();
    let length = dwords - bias;
    debug_assert!(length <= 0xffff, "record too long for the length field");
    command | (length as u32 & 0xffff)
}

/// Memtrace memory write. `data` is padded to a dword boundary; the size field keeps the
/// unpadded length.
pub fn memory_write_record(address: u64, space: MemorySpace, data: &[u8]) -> Vec<u8> {
    let dwords = 5 + data.len().div_ceil(4);
    let mut out = Vec::with_capacity(dwords * 4);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_MEMORY_WRITE, dwords));
    push_u32(&mut out, address as u32);
    push_u32(&mut out, (address >> 32) as u32);
    push_u32(&mut out, space.to_dword());
    push_u32(&mut out, data.len() as u32);
    out.extend_from_slice(data);
    pad_to_dword(&mut out);
    out
}

/// Memtrace discontiguous memory write: all `DISCONTIGUOUS_SLOTS` descriptors are always
/// present, unused ones zeroed, followed by the concatenated payloads.
pub fn discontiguous_write_record(space: MemorySpace, writes: &[(u64, &[u8])]) -> Vec<u8> {
    debug_assert!(writes.len() <= DISCONTIGUOUS_SLOTS);
    let payload_len: usize = writes.iter().map(|(_, data)| data.len()).sum();
    let dwords = 2 + DISCONTIGUOUS_SLOTS * 3 + payload_len.div_ceil(4);

    let mut out = Vec::with_capacity(dwords * 4);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_MEMORY_WRITE_DISCONTIGUOUS, dwords));
    push_u32(&mut out, space.to_dword());
    for slot in 0..DISCONTIGUOUS_SLOTS {
        let (address, len) = writes
            .get(slot)
            .map(|(address, data)| (*address, data.len()))
            .unwrap_or((0, 0));
        push_u32(&mut out, address as u32);
        push_u32(&mut out, (address >> 32) as u32);
        push_u32(&mut out, len as u32);
    }
    for (_, data) in writes {
        out.extend_from_slice(data);
    }
    pad_to_dword(&mut out);
    out
}

pub fn register_write_record(offset: u32, value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_REGISTER_WRITE, 6));
    push_u32(&mut out, offset);
    push_u32(
        &mut out,
        AUB_MEM_TRACE_REGISTER_SIZE_DWORD | AUB_MEM_TRACE_REGISTER_SPACE_MMIO,
    );
    push_u32(&mut out, 0xffff_ffff); // mask lo
    push_u32(&mut out, 0); // mask hi
    push_u32(&mut out, value);
    out
}

pub fn register_poll_record(offset: u32, mask: u32, value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_REGISTER_POLL, 6));
    push_u32(&mut out, offset);
    push_u32(
        &mut out,
        AUB_MEM_TRACE_REGISTER_SIZE_DWORD | AUB_MEM_TRACE_REGISTER_SPACE_MMIO,
    );
    push_u32(&mut out, mask);
    push_u32(&mut out, 0); // mask hi
    push_u32(&mut out, value);
    out
}

pub fn comment_record(text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    body.push(0);
    pad_to_dword(&mut body);

    let dwords = 1 + body.len() / 4;
    let mut out = Vec::with_capacity(dwords * 4);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_COMMENT, dwords));
    out.extend_from_slice(&body);
    out
}

/// Memtrace version record. `app_name` is usually `PCI-ID=0x<id> <name>`.
pub fn version_record(simulator_id: u32, app_name: &str) -> Vec<u8> {
    let mut name = app_name.as_bytes().to_vec();
    pad_to_dword(&mut name);

    let dwords = 5 + name.len() / 4;
    let mut out = Vec::with_capacity(dwords * 4);
    push_u32(&mut out, header_for(CMD_MEM_TRACE_VERSION, dwords));
    push_u32(&mut out, AUB_MEM_TRACE_VERSION_FILE_VERSION);
    push_u32(
        &mut out,
        simulator_id << AUB_MEM_TRACE_VERSION_DEVICE_SHIFT,
    );
    push_u32(&mut out, 0); // version
    push_u32(&mut out, 0); // version
    out.extend_from_slice(&name);
    out
}

/// Classic header: version, 32-byte application name, timestamp and a comment that carries the
/// `PCI-ID=` tag.
pub fn classic_header_record(app_name: &str, comment: &str) -> Vec<u8> {
    let mut comment_bytes = comment.as_bytes().to_vec();
    let comment_len = comment_bytes.len();
    pad_to_dword(&mut comment_bytes);

    let dwords = 13 + comment_bytes.len() / 4;
    let mut out = Vec::with_capacity(dwords * 4);
    push_u32(&mut out, header_for(CMD_AUB_HEADER, dwords));
    push_u32(
        &mut out,
        (4 << AUB_HEADER_MAJOR_SHIFT) | (0 << AUB_HEADER_MINOR_SHIFT),
    );

    let mut name = [0u8; 32];
    let len = app_name.len().min(name.len() - 1);
    name[..len].copy_from_slice(&app_name.as_bytes()[..len]);
    out.extend_from_slice(&name);

    push_u32(&mut out, 0); // timestamp
    push_u32(&mut out, 0); // timestamp
    push_u32(&mut out, comment_len as u32);
    out.extend_from_slice(&comment_bytes);
    out
}

/// Classic trace block. `addr_bits > 32` adds the high address dword.
pub fn trace_block_record(flags: u32, address: u64, data: &[u8], addr_bits: u32) -> Vec<u8> {
    let wide = addr_bits > 32;
    let dwords = if wide { 6 } else { 5 };
    let mut out = Vec::with_capacity(dwords * 4 + data.len() + 3);
    push_u32(&mut out, header_for(CMD_AUB_TRACE_HEADER_BLOCK, dwords));
    push_u32(&mut out, flags);
    push_u32(&mut out, 0); // subtype
    push_u32(&mut out, address as u32);
    push_u32(&mut out, data.len().next_multiple_of(4) as u32);
    if wide {
        push_u32(&mut out, (address >> 32) as u32);
    }
    out.extend_from_slice(data);
    pad_to_dword(&mut out);
    out
}

/// Assemble a 48-bit address from two dwords.
#[inline]
pub fn address_from_dwords(lo: u32, hi: u32) -> u64 {
    canonical_48(((hi as u64) << 32) | lo as u64)
}

//! Logical ring context images.
//!
//! An image is a sequence of `MI_LOAD_REGISTER_IMM` blocks separated by `MI_NOOP` padding and
//! terminated by `MI_BATCH_BUFFER_END`. The hardware reloads the listed engine registers from
//! it when the context is scheduled. The block layout depends on the generation bucket and the
//! engine; values that are not fixed (ring placement, page-table root) are substituted at
//! build time.
//!
//! The first block always begins at dword 1 with the context control, ring head and ring tail
//! pairs, so the head value sits at dword [`RING_HEAD_DWORD`] and the tail value at
//! [`RING_TAIL_DWORD`]. Submissions patch those two dwords in place.

use crate::format::{
    push_u32, Engine, MI_BATCH_BUFFER_END, MI_LOAD_REGISTER_IMM, MI_LRI_FORCE_POSTED, MI_NOOP,
};
use aub_mem::PAGE_SIZE;

/// Per-process hardware status page that precedes every context image.
pub const PPHWSP_SIZE: u64 = PAGE_SIZE;

pub const RING_HEAD_DWORD: usize = 5;
pub const RING_TAIL_DWORD: usize = 7;

// Engine-relative register offsets.
const CONTEXT_CONTROL: u32 = 0x244;
const RING_HEAD: u32 = 0x34;
const RING_TAIL: u32 = 0x30;
const RING_START: u32 = 0x38;
const RING_CTL: u32 = 0x3c;
const BB_HEAD_U: u32 = 0x168;
const BB_HEAD_L: u32 = 0x140;
const BB_STATE: u32 = 0x110;
const SBB_HEAD_U: u32 = 0x11c;
const SBB_HEAD_L: u32 = 0x114;
const SBB_STATE: u32 = 0x118;
const BB_OFFSET: u32 = 0x158;
const BB_PER_CTX_PTR: u32 = 0x1c0;
const INDIRECT_CTX: u32 = 0x1c4;
const INDIRECT_CTX_OFFSET: u32 = 0x1c8;
const CCID: u32 = 0x180;
const CTX_TIMESTAMP: u32 = 0x3a8;
const PDP3_UDW: u32 = 0x28c;
const PDP3_LDW: u32 = 0x288;
const PDP2_UDW: u32 = 0x284;
const PDP2_LDW: u32 = 0x280;
const PDP1_UDW: u32 = 0x27c;
const PDP1_LDW: u32 = 0x278;
const PDP0_UDW: u32 = 0x274;
const PDP0_LDW: u32 = 0x270;
const R_PWR_CLK_STATE: u32 = 0xc8;

const CONTEXT_CONTROL_VALUE: u32 = 0x0009_0009;
const GEN11_CONTEXT_CONTROL_VALUE: u32 = 0x000d_000d;
const INDIRECT_CTX_OFFSET_VALUE: u32 = 0x0000_0d00;
const GEN10_INDIRECT_CTX_OFFSET_VALUE: u32 = 0x0000_1300;
const R_PWR_CLK_STATE_VALUE: u32 = 0x7fff_ffff;

/// Placement inputs substituted into an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub ring_addr: u64,
    pub ring_size: u32,
    pub pml4_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenBucket {
    Gen8,
    Gen10,
    Gen11,
}

impl GenBucket {
    pub fn for_ver(ver: u32) -> Self {
        match ver {
            0..=9 => GenBucket::Gen8,
            10 => GenBucket::Gen10,
            _ => GenBucket::Gen11,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Value {
    Const(u32),
    RingStart,
    RingControl,
    Pml4Upper,
    Pml4Lower,
}

#[derive(Debug, Clone, Copy)]
enum Block {
    Noop(usize),
    Lri(&'static [(u32, Value)]),
}

struct ContextLayout {
    pages: u64,
    blocks: &'static [Block],
}

use Value::*;

const RING_REGS: &[(u32, Value)] = &[
    (CONTEXT_CONTROL, Const(CONTEXT_CONTROL_VALUE)),
    (RING_HEAD, Const(0)),
    (RING_TAIL, Const(0)),
    (RING_START, RingStart),
    (RING_CTL, RingControl),
    (BB_HEAD_U, Const(0)),
    (BB_HEAD_L, Const(0)),
    (BB_STATE, Const(0)),
    (SBB_HEAD_U, Const(0)),
    (SBB_HEAD_L, Const(0)),
    (SBB_STATE, Const(0)),
];

const RENDER_RING_REGS: &[(u32, Value)] = &[
    (CONTEXT_CONTROL, Const(CONTEXT_CONTROL_VALUE)),
    (RING_HEAD, Const(0)),
    (RING_TAIL, Const(0)),
    (RING_START, RingStart),
    (RING_CTL, RingControl),
    (BB_HEAD_U, Const(0)),
    (BB_HEAD_L, Const(0)),
    (BB_STATE, Const(0)),
    (SBB_HEAD_U, Const(0)),
    (SBB_HEAD_L, Const(0)),
    (SBB_STATE, Const(0)),
    (BB_PER_CTX_PTR, Const(0)),
    (INDIRECT_CTX, Const(0)),
    (INDIRECT_CTX_OFFSET, Const(INDIRECT_CTX_OFFSET_VALUE)),
    (CCID, Const(0)),
];

const GEN10_RENDER_RING_REGS: &[(u32, Value)] = &[
    (CONTEXT_CONTROL, Const(CONTEXT_CONTROL_VALUE)),
    (RING_HEAD, Const(0)),
    (RING_TAIL, Const(0)),
    (RING_START, RingStart),
    (RING_CTL, RingControl),
    (BB_HEAD_U, Const(0)),
    (BB_HEAD_L, Const(0)),
    (BB_STATE, Const(0)),
    (SBB_HEAD_U, Const(0)),
    (SBB_HEAD_L, Const(0)),
    (SBB_STATE, Const(0)),
    (BB_PER_CTX_PTR, Const(0)),
    (INDIRECT_CTX, Const(0)),
    (INDIRECT_CTX_OFFSET, Const(GEN10_INDIRECT_CTX_OFFSET_VALUE)),
    (CCID, Const(0)),
];

const GEN11_RING_REGS: &[(u32, Value)] = &[
    (CONTEXT_CONTROL, Const(GEN11_CONTEXT_CONTROL_VALUE)),
    (RING_HEAD, Const(0)),
    (RING_TAIL, Const(0)),
    (RING_START, RingStart),
    (RING_CTL, RingControl),
    (BB_HEAD_U, Const(0)),
    (BB_HEAD_L, Const(0)),
    (BB_STATE, Const(0)),
    (SBB_HEAD_U, Const(0)),
    (SBB_HEAD_L, Const(0)),
    (SBB_STATE, Const(0)),
    (BB_OFFSET, Const(0)),
];

const GEN11_RENDER_RING_REGS: &[(u32, Value)] = &[
    (CONTEXT_CONTROL, Const(GEN11_CONTEXT_CONTROL_VALUE)),
    (RING_HEAD, Const(0)),
    (RING_TAIL, Const(0)),
    (RING_START, RingStart),
    (RING_CTL, RingControl),
    (BB_HEAD_U, Const(0)),
    (BB_HEAD_L, Const(0)),
    (BB_STATE, Const(0)),
    (SBB_HEAD_U, Const(0)),
    (SBB_HEAD_L, Const(0)),
    (SBB_STATE, Const(0)),
    (BB_OFFSET, Const(0)),
    (BB_PER_CTX_PTR, Const(0)),
    (INDIRECT_CTX, Const(0)),
    (INDIRECT_CTX_OFFSET, Const(GEN10_INDIRECT_CTX_OFFSET_VALUE)),
];

const PPGTT_REGS: &[(u32, Value)] = &[
    (CTX_TIMESTAMP, Const(0)),
    (PDP3_UDW, Const(0)),
    (PDP3_LDW, Const(0)),
    (PDP2_UDW, Const(0)),
    (PDP2_LDW, Const(0)),
    (PDP1_UDW, Const(0)),
    (PDP1_LDW, Const(0)),
    (PDP0_UDW, Pml4Upper),
    (PDP0_LDW, Pml4Lower),
];

const POWER_REGS: &[(u32, Value)] = &[(R_PWR_CLK_STATE, Const(R_PWR_CLK_STATE_VALUE))];

static GEN8_RENDER: ContextLayout = ContextLayout {
    pages: 20,
    blocks: &[
        Block::Noop(1),
        Block::Lri(RENDER_RING_REGS),
        Block::Noop(1),
        Block::Lri(PPGTT_REGS),
        Block::Noop(13),
        Block::Lri(POWER_REGS),
    ],
};

static GEN8_OTHER: ContextLayout = ContextLayout {
    pages: 2,
    blocks: &[
        Block::Noop(1),
        Block::Lri(RING_REGS),
        Block::Noop(5),
        Block::Lri(PPGTT_REGS),
    ],
};

static GEN10_RENDER: ContextLayout = ContextLayout {
    pages: 19,
    blocks: &[
        Block::Noop(1),
        Block::Lri(GEN10_RENDER_RING_REGS),
        Block::Noop(1),
        Block::Lri(PPGTT_REGS),
        Block::Noop(13),
        Block::Lri(POWER_REGS),
    ],
};

static GEN10_OTHER: ContextLayout = ContextLayout {
    pages: 2,
    blocks: &[
        Block::Noop(1),
        Block::Lri(RING_REGS),
        Block::Noop(5),
        Block::Lri(PPGTT_REGS),
    ],
};

static GEN11_RENDER: ContextLayout = ContextLayout {
    pages: 14,
    blocks: &[
        Block::Noop(1),
        Block::Lri(GEN11_RENDER_RING_REGS),
        Block::Noop(3),
        Block::Lri(PPGTT_REGS),
        Block::Noop(13),
        Block::Lri(POWER_REGS),
    ],
};

static GEN11_OTHER: ContextLayout = ContextLayout {
    pages: 2,
    blocks: &[
        Block::Noop(1),
        Block::Lri(GEN11_RING_REGS),
        Block::Noop(3),
        Block::Lri(PPGTT_REGS),
    ],
};

fn layout(bucket: GenBucket, engine: Engine) -> &'static ContextLayout {
    match (bucket, engine) {
        (GenBucket::Gen8, Engine::Render) => &GEN8_RENDER,
        (GenBucket::Gen8, _) => &GEN8_OTHER,
        (GenBucket::Gen10, Engine::Render) => &GEN10_RENDER,
        (GenBucket::Gen10, _) => &GEN10_OTHER,
        (GenBucket::Gen11, Engine::Render) => &GEN11_RENDER,
        (GenBucket::Gen11, _) => &GEN11_OTHER,
    }
}

#[inline]
pub fn lri_header(pairs: usize) -> u32 {
    MI_LOAD_REGISTER_IMM | MI_LRI_FORCE_POSTED | (2 * pairs as u32 - 1)
}

/// Size in bytes of the image for this generation and engine.
pub fn context_size(ver: u32, engine: Engine) -> u64 {
    layout(GenBucket::for_ver(ver), engine).pages * PAGE_SIZE
}

/// Build the full image, zero-padded to [`context_size`].
pub fn build_context_image(ver: u32, engine: Engine, params: &ContextParams) -> Vec<u8> {
    let layout = layout(GenBucket::for_ver(ver), engine);
    let size = (layout.pages * PAGE_SIZE) as usize;
    let base = engine.mmio_base();

    let mut out = Vec::with_capacity(size);
    for block in layout.blocks {
        match *block {
            Block::Noop(count) => {
                for _ in 0..count {
                    push_u32(&mut out, MI_NOOP);
                }
            }
            Block::Lri(regs) => {
                push_u32(&mut out, lri_header(regs.len()));
                for &(reg, value) in regs {
                    push_u32(&mut out, base + reg);
                    push_u32(&mut out, resolve(value, params));
                }
            }
        }
    }
    push_u32(&mut out, MI_BATCH_BUFFER_END);
    out.resize(size, 0);
    out
}

fn resolve(value: Value, params: &ContextParams) -> u32 {
    match value {
        Const(v) => v,
        RingStart => params.ring_addr as u32,
        RingControl => params.ring_size.saturating_sub(PAGE_SIZE as u32) | 1,
        Pml4Upper => (params.pml4_addr >> 32) as u32,
        Pml4Lower => params.pml4_addr as u32,
    }
}

/// Register state recovered from an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextState {
    pub ring_start: Option<u32>,
    pub ring_head: Option<u32>,
    pub ring_tail: Option<u32>,
    pub ring_ctl: Option<u32>,
    pub pml4_addr: Option<u64>,
}

impl ContextState {
    /// Ring size encoded in the ring control register.
    pub fn ring_size(&self) -> Option<u32> {
        self.ring_ctl
            .map(|ctl| (ctl & 0x001f_f000) + PAGE_SIZE as u32)
    }
}

/// Walk the register-load blocks of an image and pick out the ring and page-table registers.
/// Parsing stops at `MI_BATCH_BUFFER_END` or at the end of `image`.
pub fn parse_context_image(image: &[u8], engine: Engine) -> ContextState {
    let dwords: Vec<u32> = image
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let base = engine.mmio_base();

    let mut state = ContextState::default();
    let (mut pml4_hi, mut pml4_lo) = (None, None);
    let mut i = 0;
    while i < dwords.len() {
        let dw = dwords[i];
        if dw == MI_BATCH_BUFFER_END {
            break;
        }
        if dw & 0xff80_0000 != MI_LOAD_REGISTER_IMM {
            i += 1;
            continue;
        }

        let pairs = ((dw & 0xff) as usize + 1) / 2;
        for pair in dwords[i + 1..].chunks_exact(2).take(pairs) {
            let (reg, value) = (pair[0], pair[1]);
            match reg.wrapping_sub(base) {
                RING_HEAD => state.ring_head = Some(value),
                RING_TAIL => state.ring_tail = Some(value),
                RING_START => state.ring_start = Some(value),
                RING_CTL => state.ring_ctl = Some(value),
                PDP0_UDW => pml4_hi = Some(value),
                PDP0_LDW => pml4_lo = Some(value),
                _ => {}
            }
        }
        i += 1 + 2 * pairs;
    }

    if let (Some(hi), Some(lo)) = (pml4_hi, pml4_lo) {
        state.pml4_addr = Some(((hi as u64) << 32) | lo as u64);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: ContextParams = ContextParams {
        ring_addr: 0x0004_0000,
        ring_size: 0x1000,
        pml4_addr: 0x0000_0001_2345_6000,
    };

    fn dword(image: &[u8], index: usize) -> u32 {
        u32::from_le_bytes(image[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(GenBucket::for_ver(8), GenBucket::Gen8);
        assert_eq!(GenBucket::for_ver(9), GenBucket::Gen8);
        assert_eq!(GenBucket::for_ver(10), GenBucket::Gen10);
        assert_eq!(GenBucket::for_ver(11), GenBucket::Gen11);
        assert_eq!(GenBucket::for_ver(12), GenBucket::Gen11);
    }

    #[test]
    fn head_and_tail_dwords_are_fixed_for_every_layout() {
        for ver in [8, 9, 10, 11, 12] {
            for engine in Engine::ALL {
                let image = build_context_image(ver, engine, &PARAMS);
                let base = engine.mmio_base();
                assert_eq!(dword(&image, 0), MI_NOOP);
                assert_eq!(dword(&image, RING_HEAD_DWORD - 1), base + RING_HEAD);
                assert_eq!(dword(&image, RING_TAIL_DWORD - 1), base + RING_TAIL);
            }
        }
    }

    #[test]
    fn image_size_matches_table() {
        assert_eq!(context_size(9, Engine::Render), 20 * PAGE_SIZE);
        assert_eq!(context_size(9, Engine::Copy), 2 * PAGE_SIZE);
        assert_eq!(context_size(11, Engine::Render), 14 * PAGE_SIZE);
        for ver in [8, 10, 11] {
            for engine in Engine::ALL {
                assert_eq!(
                    build_context_image(ver, engine, &PARAMS).len() as u64,
                    context_size(ver, engine)
                );
            }
        }
    }

    #[test]
    fn render_image_header_and_power_state() {
        let image = build_context_image(8, Engine::Render, &PARAMS);
        assert_eq!(dword(&image, 1), lri_header(15));
        assert_eq!(dword(&image, 1), 0x1100_101d);

        let words: Vec<u32> = (0..image.len() / 4).map(|i| dword(&image, i)).collect();
        let pwr = words
            .windows(2)
            .position(|w| w[0] == 0x2000 + R_PWR_CLK_STATE)
            .unwrap();
        assert_eq!(words[pwr + 1], R_PWR_CLK_STATE_VALUE);
        assert_eq!(words[pwr + 2], MI_BATCH_BUFFER_END);
    }

    #[test]
    fn parse_recovers_substituted_values() {
        for ver in [8, 10, 11] {
            for engine in Engine::ALL {
                let image = build_context_image(ver, engine, &PARAMS);
                let state = parse_context_image(&image, engine);
                assert_eq!(state.ring_start, Some(0x0004_0000));
                assert_eq!(state.ring_head, Some(0));
                assert_eq!(state.ring_tail, Some(0));
                assert_eq!(state.ring_size(), Some(0x1000));
                assert_eq!(state.pml4_addr, Some(PARAMS.pml4_addr));
            }
        }
    }

    #[test]
    fn parse_reads_patched_tail() {
        let mut image = build_context_image(9, Engine::Video, &PARAMS);
        image[RING_TAIL_DWORD * 4..RING_TAIL_DWORD * 4 + 4].copy_from_slice(&16u32.to_le_bytes());
        assert_eq!(parse_context_image(&image, Engine::Video).ring_tail, Some(16));
    }

    #[test]
    fn parse_tolerates_truncated_image() {
        let image = build_context_image(9, Engine::Render, &PARAMS);
        let state = parse_context_image(&image[..24], Engine::Render);
        assert_eq!(state.ring_head, Some(0));
        assert_eq!(state.ring_tail, None);
        assert_eq!(state.pml4_addr, None);
    }
}

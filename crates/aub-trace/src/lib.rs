//! Reading and writing AUB GPU command traces.
//!
//! An AUB stream is a flat sequence of dword records describing memory writes, register
//! writes and command submissions for one GPU. Two header dialects coexist: the classic
//! records used by pre-execlist hardware and the memtrace records used from generation 8 on.
//!
//! - [`AubReader`] decodes a byte buffer and reports each record through a [`TraceHandler`].
//! - [`AubWriter`] produces a stream from high-level intents and maintains the page tables
//!   and hardware contexts those intents need.
//! - [`MemoryReplay`] is a handler that rebuilds GPU memory in an [`aub_mem::AddressSpace`].

#![forbid(unsafe_code)]

pub mod context;
pub mod device;
mod execlist;
pub mod format;
mod reader;
mod replay;
mod writer;

pub use context::{
    build_context_image, context_size, parse_context_image, ContextParams, ContextState,
};
pub use device::{DeviceInfo, DeviceLookup, KnownDevices};
pub use execlist::ExeclistTracker;
pub use format::{Engine, ExeclistSubmit, MemorySpace, TraceBlockKind};
pub use reader::{AubReader, MemoryWrite, ReadError, ReadStats, TraceHandler};
pub use replay::{MemoryReplay, ReplayError, Submission};
pub use writer::{
    context_descriptor, AubWriter, AubWriterOptions, ContextDescriptorFlags, HwContext,
    WriteError, MAX_CONTEXTS,
};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemError {
    /// Growing the page arena failed, either because the host allocator refused or because the
    /// configured page cap was reached.
    #[error("out of memory: cannot grow page arena beyond {pages} pages")]
    OutOfMemory { pages: usize },

    #[error("physical page 0x{phys_addr:x} has never been written")]
    NotResident { phys_addr: u64 },

    #[error("physical pages 0x{phys_addr:x}..+{pages} are not contiguous in the arena")]
    NotContiguous { phys_addr: u64, pages: usize },

    #[error("GGTT address 0x{address:x} has no valid translation")]
    UnmappedGgtt { address: u64 },

    #[error("PPGTT address 0x{address:x} has no valid translation")]
    UnmappedPpgtt { address: u64 },

    #[error("arena slot at offset 0x{offset:x} (+{pages} pages) is out of range")]
    SlotOutOfRange { offset: u64, pages: usize },
}

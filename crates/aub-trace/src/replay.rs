//! A [`TraceHandler`] that mirrors a decoded trace into an [`AddressSpace`].

use aub_mem::{AddressSpace, AddressSpaceOptions, MemError};

use crate::context::{parse_context_image, ContextState, PPHWSP_SIZE};
use crate::device::DeviceInfo;
use crate::format::Engine;
use crate::reader::{MemoryWrite, TraceHandler};

/// Bytes of a context image read back to recover its registers. The register blocks the
/// encoder cares about all live in the first page.
const CONTEXT_PROBE_BYTES: usize = 4096;

/// One submission seen in the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Execlist {
        engine: Engine,
        context_descriptor: u64,
        /// Registers read back from the submitted context image, if it was readable.
        context: Option<ContextState>,
    },
    Ring {
        engine: Engine,
        commands: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayError {
    pub offset: u64,
    pub message: String,
}

pub struct MemoryReplay {
    memory: AddressSpace,
    legacy: bool,
    session: Option<(u32, String)>,
    comments: Vec<String>,
    submissions: Vec<Submission>,
    errors: Vec<ReplayError>,
    memory_errors: Vec<MemError>,
}

impl Default for MemoryReplay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReplay {
    pub fn new() -> Self {
        Self::with_options(AddressSpaceOptions::default())
    }

    pub fn with_options(options: AddressSpaceOptions) -> Self {
        Self {
            memory: AddressSpace::with_options(options),
            legacy: false,
            session: None,
            comments: Vec::new(),
            submissions: Vec::new(),
            errors: Vec::new(),
            memory_errors: Vec::new(),
        }
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    pub fn into_memory(self) -> AddressSpace {
        self.memory
    }

    /// `(pci_id, app_name)` from the trace header.
    pub fn session(&self) -> Option<(u32, &str)> {
        self.session
            .as_ref()
            .map(|(pci_id, name)| (*pci_id, name.as_str()))
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Decode failures reported by the reader.
    pub fn errors(&self) -> &[ReplayError] {
        &self.errors
    }

    /// Writes the address space refused, e.g. because the arena hit its cap.
    pub fn memory_errors(&self) -> &[MemError] {
        &self.memory_errors
    }

    fn note(&mut self, result: Result<(), MemError>) {
        if let Err(err) = result {
            tracing::warn!(error = %err, "memory write dropped");
            self.memory_errors.push(err);
        }
    }

    fn probe_context(&self, engine: Engine, context_descriptor: u64) -> Option<ContextState> {
        let pphwsp = context_descriptor & 0xffff_f000;
        let mut image = vec![0u8; CONTEXT_PROBE_BYTES];
        match self.memory.read_ggtt(pphwsp + PPHWSP_SIZE, &mut image) {
            Ok(()) => Some(parse_context_image(&image, engine)),
            Err(err) => {
                tracing::warn!(context_descriptor, error = %err, "context image unreadable");
                None
            }
        }
    }
}

impl TraceHandler for MemoryReplay {
    fn on_error(&mut self, offset: u64, _record: &[u8], message: &str) {
        self.errors.push(ReplayError {
            offset,
            message: message.to_string(),
        });
    }

    fn on_session_info(&mut self, pci_id: u32, app_name: &str, device: Option<&DeviceInfo>) {
        if let Some(device) = device {
            self.legacy = !device.uses_execlists();
        }
        self.session = Some((pci_id, app_name.to_string()));
    }

    fn on_comment(&mut self, text: &str) {
        self.comments.push(text.to_string());
    }

    fn on_ggtt_write(&mut self, write: MemoryWrite<'_>) {
        let result = self
            .memory
            .ggtt_write(write.address, write.data, Some(write.trace_offset));
        match result {
            // Legacy traces may carry buffer contents with no GGTT entries behind them.
            Err(MemError::UnmappedGgtt { .. }) if self.legacy => {
                self.memory.local_write(write.address, write.data);
            }
            other => self.note(other),
        }
    }

    fn on_ggtt_entry_write(&mut self, write: MemoryWrite<'_>) {
        self.memory.ggtt_entry_write(write.address, write.data);
    }

    fn on_local_write(&mut self, write: MemoryWrite<'_>) {
        self.memory.local_write(write.address, write.data);
    }

    fn on_phys_write(&mut self, write: MemoryWrite<'_>) {
        let result = self
            .memory
            .phys_write(write.address, write.data, Some(write.trace_offset));
        self.note(result);
    }

    fn on_ring_submit(&mut self, engine: Engine, commands: &[u8]) {
        self.memory.clear_ephemeral_maps();
        self.submissions.push(Submission::Ring {
            engine,
            commands: commands.to_vec(),
        });
    }

    fn on_execlist_submit(&mut self, engine: Engine, context_descriptor: u64) {
        self.memory.clear_ephemeral_maps();

        let context = self.probe_context(engine, context_descriptor);
        if let Some(root) = context.and_then(|state| state.pml4_addr) {
            self.memory.set_ppgtt_root(root);
        }
        self.submissions.push(Submission::Execlist {
            engine,
            context_descriptor,
            context,
        });
    }
}

use std::fmt;
use std::sync::Arc;

use ioctlrpc_wire::{BufferKind, CommandDescriptor};
use tracing::trace;

use crate::error::{Result, SessionError};

/// Source of the per-request buffers on the daemon side.
///
/// Every buffer handed out by [`allocate`](Self::allocate) comes back through
/// [`release`](Self::release) exactly once, when its [`BufferSet`] is dropped.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a zeroed buffer of exactly `size` bytes, or `None` on failure.
    fn allocate(&self, kind: BufferKind, size: usize) -> Option<Vec<u8>>;

    /// Take back a buffer previously returned by `allocate`.
    fn release(&self, kind: BufferKind, buf: Vec<u8>) {
        let _ = kind;
        drop(buf);
    }
}

/// Fallible heap allocation, no reuse across requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, _kind: BufferKind, size: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf)
    }
}

/// Scoped owner of the four buffers of one in-flight request.
///
/// Whatever has been attached is released on drop, on every exit path.
/// Zero-size buffers are never allocated and read back as empty slices.
pub struct BufferSet {
    allocator: Arc<dyn BufferAllocator>,
    slots: [Option<Vec<u8>>; 4],
}

impl BufferSet {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            slots: [None, None, None, None],
        }
    }

    /// Allocate `size` bytes for `kind`, releasing any previous buffer first.
    pub fn allocate(&mut self, kind: BufferKind, size: usize) -> Result<()> {
        if let Some(old) = self.slots[slot(kind)].take() {
            self.allocator.release(kind, old);
        }
        if size == 0 {
            return Ok(());
        }
        let buf = self
            .allocator
            .allocate(kind, size)
            .ok_or(SessionError::Allocation { kind, size })?;
        trace!(%kind, size, "allocated request buffer");
        self.slots[slot(kind)] = Some(buf);
        Ok(())
    }

    pub fn is_allocated(&self, kind: BufferKind) -> bool {
        self.slots[slot(kind)].is_some()
    }

    pub fn len(&self, kind: BufferKind) -> usize {
        self.slots[slot(kind)].as_ref().map_or(0, Vec::len)
    }

    pub fn get(&self, kind: BufferKind) -> &[u8] {
        self.slots[slot(kind)].as_deref().unwrap_or(&[])
    }

    pub fn get_mut(&mut self, kind: BufferKind) -> &mut [u8] {
        match &mut self.slots[slot(kind)] {
            Some(buf) => buf.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for BufferSet {
    fn drop(&mut self) {
        for kind in BufferKind::ALL {
            if let Some(buf) = self.slots[slot(kind)].take() {
                trace!(%kind, size = buf.len(), "releasing request buffer");
                self.allocator.release(kind, buf);
            }
        }
    }
}

impl fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSet")
            .field("input", &self.len(BufferKind::Input))
            .field("config", &self.len(BufferKind::Config))
            .field("output", &self.len(BufferKind::Output))
            .field("history", &self.len(BufferKind::History))
            .finish()
    }
}

fn slot(kind: BufferKind) -> usize {
    match kind {
        BufferKind::Input => 0,
        BufferKind::Config => 1,
        BufferKind::Output => 2,
        BufferKind::History => 3,
    }
}

/// Caller-owned buffers for one client call.
///
/// These never travel on the wire; only their declared sizes in the
/// [`CommandDescriptor`] do. `history` is `None` when the command carries no
/// history at all.
#[derive(Debug, Default)]
pub struct ClientBuffers<'a> {
    pub input: &'a [u8],
    pub config: &'a [u8],
    pub output: &'a mut [u8],
    pub history: Option<&'a mut [u8]>,
}

impl<'a> ClientBuffers<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, input: &'a [u8]) -> Self {
        self.input = input;
        self
    }

    pub fn config(mut self, config: &'a [u8]) -> Self {
        self.config = config;
        self
    }

    pub fn output(mut self, output: &'a mut [u8]) -> Self {
        self.output = output;
        self
    }

    pub fn history(mut self, history: &'a mut [u8]) -> Self {
        self.history = Some(history);
        self
    }

    /// Declare input, config and output sizes in `desc` from the slice lengths.
    pub fn declare(&self, desc: &mut CommandDescriptor) {
        desc.input_size = self.input.len() as u64;
        desc.config_size = self.config.len() as u64;
        desc.output_size = self.output.len() as u64;
    }
}

//! Host reference backend
//!
//! Drives a flat host-memory address space with a registered kernel
//! function table. Submissions execute synchronously in submission order,
//! so per-stream FIFO semantics hold trivially; markers complete as soon as
//! they are posted. Useful as the always-available backend and as the
//! execution target for host-visible memories.

use crate::backend::{CompletionHook, DeviceBackend};
use crate::error::{BackendError, Result};
use crate::types::{
    CompletionRecord, CopyDescriptor, DeviceId, DeviceMarker, FillDescriptor, KernelLaunch,
    StreamId,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A host kernel implementation, keyed by function id
pub type KernelFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Backend executing everything immediately on the calling thread
pub struct HostBackend {
    device: DeviceId,
    memory: Vec<u8>,
    kernels: HashMap<u64, KernelFn>,
    pinned: Vec<(u64, usize)>,
    peers: HashSet<DeviceId>,
    next_marker: u64,
    ready: Vec<CompletionRecord>,
    hook: Option<CompletionHook>,
    context_depth: usize,
}

impl HostBackend {
    /// Create a backend with `memory_bytes` of device-visible memory
    pub fn new(device: DeviceId, memory_bytes: usize) -> Self {
        Self {
            device,
            memory: vec![0u8; memory_bytes],
            kernels: HashMap::new(),
            pinned: Vec::new(),
            peers: HashSet::new(),
            next_marker: 1,
            ready: Vec::new(),
            hook: None,
            context_depth: 0,
        }
    }

    /// Register a kernel implementation under `func_id`
    pub fn register_kernel(&mut self, func_id: u64, f: KernelFn) {
        self.kernels.insert(func_id, f);
    }

    /// Read back a memory range (tests and host-visible instances)
    pub fn read_memory(&self, base: u64, len: usize) -> Result<&[u8]> {
        self.check_range(base, len)?;
        Ok(&self.memory[base as usize..base as usize + len])
    }

    /// Write a memory range directly
    pub fn write_memory(&mut self, base: u64, data: &[u8]) -> Result<()> {
        self.check_range(base, data.len())?;
        self.memory[base as usize..base as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn check_range(&self, base: u64, len: usize) -> Result<()> {
        let end = base as usize + len;
        if end > self.memory.len() {
            return Err(BackendError::AddressOutOfBounds { base, len });
        }
        Ok(())
    }

    fn check_context(&self) -> Result<()> {
        if self.context_depth == 0 {
            return Err(BackendError::api(self.device.0, "no context current"));
        }
        Ok(())
    }
}

impl DeviceBackend for HostBackend {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn push_context(&mut self) -> Result<()> {
        self.context_depth += 1;
        Ok(())
    }

    fn pop_context(&mut self) -> Result<()> {
        if self.context_depth == 0 {
            return Err(BackendError::api(self.device.0, "context pop without push"));
        }
        self.context_depth -= 1;
        Ok(())
    }

    fn submit_kernel(&mut self, _stream: StreamId, launch: &KernelLaunch) -> Result<()> {
        self.check_context()?;
        let f = self
            .kernels
            .get(&launch.func_id)
            .cloned()
            .ok_or(BackendError::UnknownKernel(launch.func_id))?;
        f(&launch.args);
        Ok(())
    }

    fn submit_copy(&mut self, _stream: StreamId, copy: &CopyDescriptor) -> Result<()> {
        self.check_context()?;
        self.check_range(copy.src, copy.bytes)?;
        self.check_range(copy.dst, copy.bytes)?;
        self.memory
            .copy_within(copy.src as usize..copy.src as usize + copy.bytes, copy.dst as usize);
        Ok(())
    }

    fn submit_fill(&mut self, _stream: StreamId, fill: &FillDescriptor) -> Result<()> {
        self.check_context()?;
        self.check_range(fill.dst, fill.bytes)?;
        if fill.pattern.is_empty() {
            return Err(BackendError::api(self.device.0, "empty fill pattern"));
        }
        let dst = fill.dst as usize;
        for i in 0..fill.bytes {
            self.memory[dst + i] = fill.pattern[i % fill.pattern.len()];
        }
        Ok(())
    }

    fn post_marker(&mut self, stream: StreamId) -> Result<DeviceMarker> {
        self.check_context()?;
        let marker = DeviceMarker(self.next_marker);
        self.next_marker += 1;
        // everything ahead of the marker already ran synchronously
        self.ready.push(CompletionRecord {
            stream,
            marker,
            error: None,
        });
        if let Some(hook) = &self.hook {
            hook();
        }
        Ok(marker)
    }

    fn drain_completions(&mut self, sink: &mut Vec<CompletionRecord>) -> usize {
        let n = self.ready.len();
        sink.append(&mut self.ready);
        n
    }

    fn set_completion_hook(&mut self, hook: CompletionHook) {
        self.hook = Some(hook);
    }

    fn register_host_memory(&mut self, base: u64, size: usize) -> Result<()> {
        if !self.pinned.contains(&(base, size)) {
            self.pinned.push((base, size));
        }
        Ok(())
    }

    fn enable_peer(&mut self, peer: DeviceId) -> Result<()> {
        self.peers.insert(peer);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        // synchronous execution: nothing outstanding
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

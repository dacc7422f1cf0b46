//! Device backend capability
//!
//! The runtime never calls a vendor API directly. Instead each device is
//! driven through the [`DeviceBackend`] trait: submissions go down, and a
//! stream of [`CompletionRecord`] items comes back. The backend may learn
//! about completions on any thread (a driver callback, a polling thread);
//! it must only queue the record and invoke the registered completion hook,
//! which wakes the scheduler's worker. Completion hooks must not call back
//! into the backend.
//!
//! ```text
//! scheduler worker ──submit──▶ DeviceBackend ──(device)──▶ hardware
//!        ▲                          │
//!        └──── drain_completions ◀──┘  (hook() wakes the worker)
//! ```

use crate::error::Result;
use crate::types::{
    CompletionRecord, CopyDescriptor, DeviceId, DeviceMarker, FillDescriptor, KernelLaunch,
    StreamId,
};
use std::any::Any;
use std::sync::Arc;

/// Callback used by backends to wake the scheduler worker
pub type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// Capability interface one device exposes to its stream scheduler
pub trait DeviceBackend: Send {
    /// The device this backend drives
    fn device(&self) -> DeviceId;

    /// Make the device context current on this thread
    ///
    /// Every sequence of device calls must be bracketed by push/pop; use
    /// [`AutoContext`] to guarantee the pop on all exit paths.
    fn push_context(&mut self) -> Result<()>;

    /// Restore the previous context
    fn pop_context(&mut self) -> Result<()>;

    /// Enqueue a kernel on a task stream
    fn submit_kernel(&mut self, stream: StreamId, launch: &KernelLaunch) -> Result<()>;

    /// Enqueue a copy on a DMA stream
    fn submit_copy(&mut self, stream: StreamId, copy: &CopyDescriptor) -> Result<()>;

    /// Enqueue a pattern fill on a DMA stream
    fn submit_fill(&mut self, stream: StreamId, fill: &FillDescriptor) -> Result<()>;

    /// Post a completion marker behind everything queued on `stream`
    fn post_marker(&mut self, stream: StreamId) -> Result<DeviceMarker>;

    /// Move all pending completion records into `sink`; returns the count
    ///
    /// Non-blocking; safe to call with no completions outstanding.
    fn drain_completions(&mut self, sink: &mut Vec<CompletionRecord>) -> usize;

    /// Register the hook invoked whenever new completions become drainable
    fn set_completion_hook(&mut self, hook: CompletionHook);

    /// Pin a host memory range for fast transfers; idempotent per range
    fn register_host_memory(&mut self, base: u64, size: usize) -> Result<()>;

    /// Enable peer-to-peer access from this device to `peer`
    fn enable_peer(&mut self, peer: DeviceId) -> Result<()>;

    /// Block until every queued submission has completed
    fn sync(&mut self) -> Result<()>;

    /// Downcast support for backend-specific access in tests
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Scoped device-context acquisition
///
/// Pushes the device context on construction and pops it when dropped, so
/// the pop happens on every exit path, early returns and panics included.
pub struct AutoContext<'a> {
    backend: &'a mut dyn DeviceBackend,
    active: bool,
}

impl<'a> AutoContext<'a> {
    pub fn new(backend: &'a mut dyn DeviceBackend) -> Result<Self> {
        backend.push_context()?;
        Ok(Self {
            backend,
            active: true,
        })
    }

    /// Access the backend while the context is held
    pub fn backend(&mut self) -> &mut dyn DeviceBackend {
        self.backend
    }
}

impl Drop for AutoContext<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.backend.pop_context() {
                tracing::error!(device = %self.backend.device(), error = %err, "context pop failed");
            }
            self.active = false;
        }
    }
}

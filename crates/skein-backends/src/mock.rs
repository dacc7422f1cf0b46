//! Deterministic backend for scheduler tests
//!
//! Queues every submission without executing it and completes markers only
//! when a test calls [`MockBackend::advance`]. A shared submission/completion
//! log lets tests assert cross-stream ordering precisely.

use crate::backend::{CompletionHook, DeviceBackend};
use crate::error::{BackendError, Result};
use crate::types::{
    CompletionRecord, CopyDescriptor, DeviceId, DeviceMarker, FillDescriptor, KernelLaunch,
    StreamId,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

enum QueuedItem {
    Work(String),
    Marker(DeviceMarker),
}

/// Shared ordered log of everything the backend saw
pub type MockLog = Arc<Mutex<Vec<String>>>;

/// Backend that executes nothing and completes on demand
pub struct MockBackend {
    device: DeviceId,
    queues: HashMap<StreamId, VecDeque<QueuedItem>>,
    log: MockLog,
    ready: Vec<CompletionRecord>,
    hook: Option<CompletionHook>,
    next_marker: u64,
    context_depth: usize,
    pinned: Vec<(u64, usize)>,
    peers: HashSet<DeviceId>,
    broken: bool,
    next_marker_error: Option<String>,
}

impl MockBackend {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            queues: HashMap::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            ready: Vec::new(),
            hook: None,
            next_marker: 1,
            context_depth: 0,
            pinned: Vec::new(),
            peers: HashSet::new(),
            broken: false,
            next_marker_error: None,
        }
    }

    /// Handle to the shared submission/completion log
    pub fn log(&self) -> MockLog {
        Arc::clone(&self.log)
    }

    /// Make every subsequent submission fail with a device API error
    pub fn break_device(&mut self) {
        self.broken = true;
    }

    /// Make the next posted marker complete with the given error
    pub fn poison_next_marker(&mut self, message: impl Into<String>) {
        self.next_marker_error = Some(message.into());
    }

    /// Complete up to `markers` markers on `stream`, in queue order
    ///
    /// Returns how many markers actually completed. Invokes the completion
    /// hook if any did.
    pub fn advance(&mut self, stream: StreamId, markers: usize) -> usize {
        let mut completed = 0;
        if let Some(queue) = self.queues.get_mut(&stream) {
            while completed < markers {
                match queue.pop_front() {
                    None => break,
                    Some(QueuedItem::Work(desc)) => {
                        self.log.lock().push(format!("run {desc}"));
                    }
                    Some(QueuedItem::Marker(marker)) => {
                        self.log.lock().push(format!("complete {stream} m{}", marker.0));
                        self.ready.push(CompletionRecord {
                            stream,
                            marker,
                            error: None,
                        });
                        completed += 1;
                    }
                }
            }
        }
        if completed > 0 {
            if let Some(hook) = &self.hook {
                hook();
            }
        }
        completed
    }

    /// Complete everything queued on every stream
    pub fn advance_all(&mut self) {
        let streams: Vec<_> = self.queues.keys().copied().collect();
        for s in streams {
            self.advance(s, usize::MAX);
        }
    }

    fn enqueue(&mut self, stream: StreamId, item: QueuedItem) -> Result<()> {
        if self.broken {
            return Err(BackendError::api(self.device.0, "simulated device failure"));
        }
        if self.context_depth == 0 {
            return Err(BackendError::api(self.device.0, "no context current"));
        }
        self.queues.entry(stream).or_default().push_back(item);
        Ok(())
    }
}

impl DeviceBackend for MockBackend {
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

    fn submit_kernel(&mut self, stream: StreamId, launch: &KernelLaunch) -> Result<()> {
        self.log
            .lock()
            .push(format!("submit {stream} kernel f{}", launch.func_id));
        self.enqueue(stream, QueuedItem::Work(format!("kernel f{}", launch.func_id)))
    }

    fn submit_copy(&mut self, stream: StreamId, copy: &CopyDescriptor) -> Result<()> {
        self.log
            .lock()
            .push(format!("submit {stream} copy {}b", copy.bytes));
        self.enqueue(stream, QueuedItem::Work(format!("copy {}b", copy.bytes)))
    }

    fn submit_fill(&mut self, stream: StreamId, fill: &FillDescriptor) -> Result<()> {
        self.log
            .lock()
            .push(format!("submit {stream} fill {}b", fill.bytes));
        self.enqueue(stream, QueuedItem::Work(format!("fill {}b", fill.bytes)))
    }

    fn post_marker(&mut self, stream: StreamId) -> Result<DeviceMarker> {
        let marker = DeviceMarker(self.next_marker);
        if let Some(err) = self.next_marker_error.take() {
            // complete the marker in the failed state immediately
            self.next_marker += 1;
            self.ready.push(CompletionRecord {
                stream,
                marker,
                error: Some(err),
            });
            if let Some(hook) = &self.hook {
                hook();
            }
            return Ok(marker);
        }
        self.enqueue(stream, QueuedItem::Marker(marker))?;
        self.next_marker += 1;
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
        self.advance_all();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

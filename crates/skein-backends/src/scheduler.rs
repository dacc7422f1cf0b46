//! Per-device stream scheduler
//!
//! One [`StreamScheduler`] instance multiplexes kernels and DMA copies onto
//! a bounded pool of device streams: N task streams assigned round-robin
//! plus four dedicated DMA streams, one per copy direction. Completion flows
//! back through markers the backend posts behind each submission; the
//! scheduler's worker drains them and triggers the bound host events.
//!
//! ## Ordering
//!
//! - Work submitted to the same stream executes in submission order.
//! - Work on different streams is unordered unless chained through events.
//! - [`StreamScheduler::memory_fence`] posts a sentinel to every stream and
//!   completes only after all sentinels fire.
//!
//! ## Failure
//!
//! A device error on the submit path is fatal to the scheduler: it is
//! marked dead, every in-flight and pending fence is poisoned, and later
//! submissions are rejected. A completion-side error poisons only the fence
//! bound to that marker.

use crate::backend::{AutoContext, DeviceBackend};
use crate::error::{BackendError, Result};
use crate::types::{
    CompletionRecord, CopyDescriptor, DeviceId, DeviceMarker, FillDescriptor, KernelLaunch,
    StreamId, StreamKind,
};
use parking_lot::{Condvar, Mutex};
use skein_base::{Event, EventTable, RuntimeError};
use std::collections::VecDeque;
use std::sync::Arc;

enum Submission {
    Kernel { launch: KernelLaunch, completion: Event },
    Copy { desc: CopyDescriptor, completion: Event },
    Fill { desc: FillDescriptor, completion: Event },
    /// Marker-only sentinel, used by fences
    Sentinel { completion: Event },
}

impl Submission {
    fn completion(&self) -> Event {
        match self {
            Submission::Kernel { completion, .. }
            | Submission::Copy { completion, .. }
            | Submission::Fill { completion, .. }
            | Submission::Sentinel { completion } => *completion,
        }
    }
}

struct CompletionBinding {
    marker: DeviceMarker,
    fence: Event,
}

struct StreamSlot {
    id: StreamId,
    pending: VecDeque<Submission>,
    in_flight: VecDeque<CompletionBinding>,
}

/// Pinned staging buffer for kernel arguments, grown by doubling
struct ArgStaging {
    buf: Vec<u8>,
    used: usize,
}

impl ArgStaging {
    fn new(initial: usize) -> Self {
        Self {
            buf: vec![0u8; initial.max(1)],
            used: 0,
        }
    }

    fn stage(&mut self, args: &[u8]) -> (usize, usize) {
        while self.used + args.len() > self.buf.len() {
            self.buf.resize(self.buf.len() * 2, 0);
        }
        let off = self.used;
        self.buf[off..off + args.len()].copy_from_slice(args);
        self.used += args.len();
        (off, args.len())
    }

    fn reset(&mut self) {
        self.used = 0;
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

struct SchedState {
    streams: Vec<StreamSlot>,
    task_count: usize,
    next_task: usize,
    dead: Option<RuntimeError>,
    kill_event: Option<Event>,
    exited: bool,
    wake_pending: bool,
    peers: Vec<DeviceId>,
    arg_staging: ArgStaging,
}

impl SchedState {
    fn slot_index(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Task(i) => i,
            StreamKind::HostToDevice => self.task_count,
            StreamKind::DeviceToHost => self.task_count + 1,
            StreamKind::DeviceToDevice => self.task_count + 2,
            StreamKind::Peer => self.task_count + 3,
        }
    }

    fn all_idle(&self) -> bool {
        self.streams
            .iter()
            .all(|s| s.pending.is_empty() && s.in_flight.is_empty())
    }
}

/// Scheduler for one accelerator device
pub struct StreamScheduler {
    device: DeviceId,
    events: Arc<EventTable>,
    backend: Mutex<Box<dyn DeviceBackend>>,
    state: Mutex<SchedState>,
    work_ready: Condvar,
    /// Back-reference for deferred-submission waiters
    self_ref: std::sync::Weak<StreamScheduler>,
}

impl StreamScheduler {
    /// Build a scheduler over `backend` with `task_streams` task streams
    pub fn new(
        mut backend: Box<dyn DeviceBackend>,
        events: Arc<EventTable>,
        task_streams: usize,
        kernel_arg_initial_bytes: usize,
    ) -> Arc<Self> {
        let device = backend.device();
        let mut streams = Vec::with_capacity(task_streams + 4);
        for i in 0..task_streams.max(1) {
            streams.push(StreamSlot {
                id: StreamId {
                    device,
                    kind: StreamKind::Task(i),
                },
                pending: VecDeque::new(),
                in_flight: VecDeque::new(),
            });
        }
        for kind in [
            StreamKind::HostToDevice,
            StreamKind::DeviceToHost,
            StreamKind::DeviceToDevice,
            StreamKind::Peer,
        ] {
            streams.push(StreamSlot {
                id: StreamId { device, kind },
                pending: VecDeque::new(),
                in_flight: VecDeque::new(),
            });
        }

        let task_count = task_streams.max(1);
        let scheduler = Arc::new_cyclic(|weak| Self {
            device,
            events,
            backend: Mutex::new(backend),
            state: Mutex::new(SchedState {
                streams,
                task_count,
                next_task: 0,
                dead: None,
                kill_event: None,
                exited: false,
                wake_pending: false,
                peers: Vec::new(),
                arg_staging: ArgStaging::new(kernel_arg_initial_bytes),
            }),
            work_ready: Condvar::new(),
            self_ref: weak.clone(),
        });

        // device callbacks may arrive on any thread; they only flip a flag
        // and wake the worker
        let weak = Arc::downgrade(&scheduler);
        scheduler
            .backend
            .lock()
            .set_completion_hook(Arc::new(move || {
                if let Some(sched) = weak.upgrade() {
                    sched.state.lock().wake_pending = true;
                    sched.work_ready.notify_all();
                }
            }));

        scheduler
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Peers with enabled P2P access
    pub fn peers(&self) -> Vec<DeviceId> {
        self.state.lock().peers.clone()
    }

    fn enqueue(&self, kind: StreamKind, sub: Submission) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.dead {
                self.events.poison(sub.completion(), err.clone());
                return Err(BackendError::SchedulerDead(self.device.0));
            }
            if state.kill_event.is_some() {
                self.events.poison(
                    sub.completion(),
                    RuntimeError::device(self.device.0, "scheduler shut down"),
                );
                return Err(BackendError::SchedulerShutdown(self.device.0));
            }
            let idx = state.slot_index(kind);
            state.streams[idx].pending.push_back(sub);
        }
        self.work_ready.notify_all();
        Ok(())
    }

    /// Submit a kernel to the next task stream (round-robin)
    ///
    /// `completion` triggers when the kernel's stream marker fires. A kernel
    /// with func id 0 is the kill sentinel: the worker synchronizes the
    /// device and exits, triggering `completion` last.
    #[tracing::instrument(skip(self, launch), fields(device = self.device.0, func = launch.func_id))]
    pub fn submit_kernel(&self, launch: KernelLaunch, completion: Event) -> Result<()> {
        let kind = {
            let mut state = self.state.lock();
            let kind = StreamKind::Task(state.next_task);
            state.next_task = (state.next_task + 1) % state.task_count;
            kind
        };
        if launch.is_kill() {
            let mut state = self.state.lock();
            if let Some(err) = state.dead.clone() {
                // the context is unusable; just stop the worker
                state.exited = true;
                drop(state);
                self.work_ready.notify_all();
                self.events.poison(completion, err);
                return Err(BackendError::SchedulerDead(self.device.0));
            }
            if state.kill_event.is_some() {
                drop(state);
                self.events.poison(
                    completion,
                    RuntimeError::device(self.device.0, "scheduler shut down"),
                );
                return Err(BackendError::SchedulerShutdown(self.device.0));
            }
            state.kill_event = Some(completion);
            drop(state);
            self.work_ready.notify_all();
            return Ok(());
        }
        self.enqueue(kind, Submission::Kernel { launch, completion })
    }

    /// Submit a kernel once `wait_on` has triggered
    pub fn submit_kernel_after(&self, wait_on: Event, launch: KernelLaunch, completion: Event) {
        let sched = self.self_ref.upgrade().expect("scheduler alive");
        let events = Arc::clone(&self.events);
        self.events.add_waiter(wait_on, move |outcome| match outcome {
            Ok(()) => {
                let _ = sched.submit_kernel(launch, completion);
            }
            Err(err) => events.poison(completion, err),
        });
    }

    /// Submit a copy to the DMA stream of its kind
    #[tracing::instrument(skip(self, desc), fields(device = self.device.0, bytes = desc.bytes))]
    pub fn submit_copy(&self, desc: CopyDescriptor, completion: Event) -> Result<()> {
        self.enqueue(desc.kind.stream_kind(), Submission::Copy { desc, completion })
    }

    /// Submit a copy once `wait_on` has triggered
    pub fn submit_copy_after(&self, wait_on: Event, desc: CopyDescriptor, completion: Event) {
        let sched = self.self_ref.upgrade().expect("scheduler alive");
        let events = Arc::clone(&self.events);
        self.events.add_waiter(wait_on, move |outcome| match outcome {
            Ok(()) => {
                let _ = sched.submit_copy(desc, completion);
            }
            Err(err) => events.poison(completion, err),
        });
    }

    /// Submit a device-side fill on the host-to-device DMA stream
    pub fn submit_fill(&self, desc: FillDescriptor, completion: Event) -> Result<()> {
        self.enqueue(StreamKind::HostToDevice, Submission::Fill { desc, completion })
    }

    /// Post a sentinel to every stream; the result completes after all fire
    pub fn memory_fence(&self) -> Event {
        let sentinels: Vec<Event> = {
            let state = self.state.lock();
            if let Some(err) = &state.dead {
                let ev = self.events.create();
                self.events.poison(ev, err.clone());
                return ev;
            }
            (0..state.streams.len())
                .map(|_| self.events.create())
                .collect()
        };
        {
            let mut state = self.state.lock();
            for (slot, &ev) in state.streams.iter_mut().zip(&sentinels) {
                slot.pending.push_back(Submission::Sentinel { completion: ev });
            }
        }
        self.work_ready.notify_all();
        self.events.merge(&sentinels)
    }

    /// Pin a host memory range for fast transfers; idempotent per range
    pub fn register_host_memory(&self, base: u64, size: usize) -> Result<()> {
        let mut backend = self.backend.lock();
        let mut ctx = AutoContext::new(backend.as_mut())?;
        ctx.backend().register_host_memory(base, size)
    }

    /// Enable peer access between this scheduler and `other`, both ways
    pub fn enable_peer(&self, other: &StreamScheduler) -> Result<()> {
        {
            let mut backend = self.backend.lock();
            let mut ctx = AutoContext::new(backend.as_mut())?;
            ctx.backend().enable_peer(other.device)?;
        }
        {
            let mut backend = other.backend.lock();
            let mut ctx = AutoContext::new(backend.as_mut())?;
            ctx.backend().enable_peer(self.device)?;
        }
        self.state.lock().peers.push(other.device);
        other.state.lock().peers.push(self.device);
        Ok(())
    }

    /// Request shutdown; the returned event triggers when the worker exits
    pub fn shutdown(&self) -> Event {
        let completion = self.events.create();
        let _ = self.submit_kernel(KernelLaunch::new(crate::types::KILL_FUNC_ID, Vec::new()), completion);
        completion
    }

    /// Access the backend under its lock (test support)
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn DeviceBackend) -> R) -> R {
        f(self.backend.lock().as_mut())
    }

    /// Current capacity of the kernel-argument staging buffer
    pub fn arg_staging_capacity(&self) -> usize {
        self.state.lock().arg_staging.capacity()
    }

    /// Process pending submissions and drain completions once
    ///
    /// Returns `true` once the scheduler has exited. Tests drive this
    /// directly; production use runs [`StreamScheduler::run_worker`] on a
    /// dedicated thread.
    pub fn pump(&self) -> bool {
        // phase 1: collect the submission batch under the state lock
        let (batch, kill_requested) = {
            let mut state = self.state.lock();
            if state.exited {
                return true;
            }
            state.wake_pending = false;
            if let Some(err) = state.dead.clone() {
                // anything enqueued after death fails immediately
                let mut doomed = Vec::new();
                for slot in &mut state.streams {
                    doomed.extend(slot.pending.drain(..).map(|s| s.completion()));
                }
                drop(state);
                for ev in doomed {
                    self.events.poison(ev, err.clone());
                }
                return false;
            }
            let mut batch: Vec<(usize, Submission)> = Vec::new();
            for idx in 0..state.streams.len() {
                while let Some(sub) = state.streams[idx].pending.pop_front() {
                    if let Submission::Kernel { launch, .. } = &sub {
                        state.arg_staging.stage(&launch.args);
                    }
                    batch.push((idx, sub));
                }
            }
            (batch, state.kill_event)
        };

        // phase 2: drive the device under the backend lock
        let mut new_bindings: Vec<(usize, CompletionBinding)> = Vec::new();
        let mut poisoned: Vec<(Event, RuntimeError)> = Vec::new();
        let mut fatal: Option<RuntimeError> = None;
        let mut records: Vec<CompletionRecord> = Vec::new();
        {
            let mut backend = self.backend.lock();
            let mut ctx = match AutoContext::new(backend.as_mut()) {
                Ok(ctx) => ctx,
                Err(err) => {
                    let err: RuntimeError = err.into();
                    for (_, sub) in &batch {
                        poisoned.push((sub.completion(), err.clone()));
                    }
                    fatal = Some(err);
                    self.apply_pump_results(Vec::new(), Vec::new(), poisoned, fatal, kill_requested);
                    return self.state.lock().exited;
                }
            };
            let backend = ctx.backend();

            for (idx, sub) in batch {
                if let Some(err) = &fatal {
                    poisoned.push((sub.completion(), err.clone()));
                    continue;
                }
                let stream = self.stream_id_for(idx);
                let submit_result = match &sub {
                    Submission::Kernel { launch, .. } => backend.submit_kernel(stream, launch),
                    Submission::Copy { desc, .. } => backend.submit_copy(stream, desc),
                    Submission::Fill { desc, .. } => backend.submit_fill(stream, desc),
                    Submission::Sentinel { .. } => Ok(()),
                };
                let marker = submit_result.and_then(|()| backend.post_marker(stream));
                match marker {
                    Ok(marker) => new_bindings.push((
                        idx,
                        CompletionBinding {
                            marker,
                            fence: sub.completion(),
                        },
                    )),
                    Err(err) => {
                        // the device context is unsafe to reuse
                        let err: RuntimeError = err.into();
                        tracing::error!(device = self.device.0, error = %err, "device submit failed");
                        poisoned.push((sub.completion(), err.clone()));
                        fatal = Some(err);
                    }
                }
            }

            if kill_requested.is_some() && fatal.is_none() {
                if let Err(err) = backend.sync() {
                    fatal = Some(err.into());
                }
            }
            backend.drain_completions(&mut records);
        }

        self.apply_pump_results(new_bindings, records, poisoned, fatal, kill_requested);
        self.state.lock().exited
    }

    fn stream_id_for(&self, idx: usize) -> StreamId {
        self.state.lock().streams[idx].id
    }

    fn apply_pump_results(
        &self,
        new_bindings: Vec<(usize, CompletionBinding)>,
        records: Vec<CompletionRecord>,
        poisoned: Vec<(Event, RuntimeError)>,
        fatal: Option<RuntimeError>,
        kill_requested: Option<Event>,
    ) {
        let mut to_trigger: Vec<Event> = Vec::new();
        let mut to_poison: Vec<(Event, RuntimeError)> = poisoned;
        let mut exited_event = None;
        {
            let mut state = self.state.lock();
            for (idx, binding) in new_bindings {
                state.streams[idx].in_flight.push_back(binding);
            }
            for rec in records {
                let idx = state.slot_index(rec.stream.kind);
                let slot = &mut state.streams[idx];
                match slot.in_flight.pop_front() {
                    Some(binding) => {
                        debug_assert_eq!(binding.marker, rec.marker);
                        match rec.error {
                            None => to_trigger.push(binding.fence),
                            Some(msg) => to_poison
                                .push((binding.fence, RuntimeError::device(self.device.0, msg))),
                        }
                    }
                    None => {
                        tracing::warn!(stream = %rec.stream, marker = rec.marker.0, "completion with no binding");
                    }
                }
            }
            if let Some(err) = fatal {
                state.dead = Some(err.clone());
                for slot in &mut state.streams {
                    for binding in slot.in_flight.drain(..) {
                        to_poison.push((binding.fence, err.clone()));
                    }
                    for sub in slot.pending.drain(..) {
                        to_poison.push((sub.completion(), err.clone()));
                    }
                }
                if let Some(kill) = kill_requested {
                    state.exited = true;
                    to_poison.push((kill, err));
                }
            } else if let Some(kill) = kill_requested {
                if state.all_idle() {
                    state.exited = true;
                    exited_event = Some(kill);
                }
            }
            if state.all_idle() {
                state.arg_staging.reset();
            }
        }
        for ev in to_trigger {
            self.events.trigger(ev);
        }
        for (ev, err) in to_poison {
            self.events.poison(ev, err);
        }
        if let Some(ev) = exited_event {
            tracing::info!(device = self.device.0, "scheduler exited");
            self.events.trigger(ev);
        }
    }

    /// Worker loop: pump until shutdown, yielding while idle
    pub fn run_worker(&self) {
        loop {
            if self.pump() {
                return;
            }
            let mut state = self.state.lock();
            if state.exited {
                return;
            }
            let runnable = state.wake_pending
                || state.kill_event.is_some()
                || state.streams.iter().any(|s| !s.pending.is_empty());
            if !runnable {
                self.work_ready.wait(&mut state);
            }
        }
    }
}

// ================================================================================================
// Tests
// ================================================================================================

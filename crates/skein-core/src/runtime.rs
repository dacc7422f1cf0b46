//! Runtime front door
//!
//! [`Runtime::initialize`] builds the per-process services: the event
//! table, the CPU worker pool, the memory store, the partitioning engine,
//! and one stream scheduler per configured device. Everything is reached
//! through explicit handles; there are no hidden globals. `shutdown` tears
//! the pieces down in reverse order.

use crate::context::ParentContext;
use crate::region::{Privilege, RegionHandle};
use parking_lot::{Condvar, Mutex, RwLock};
use skein_backends::{DeviceId, DeviceMemory, HostBackend, StreamScheduler};
use skein_base::{EventTable, Result, RuntimeConfig, RuntimeError};
use skein_dma::{MemoryKind, MemoryStore, NodeId, PartitionEngine, ReductionOps};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A registered task function
pub type TaskFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Registry mapping task function ids to host implementations
#[derive(Default)]
pub struct TaskTable {
    fns: RwLock<HashMap<u64, TaskFn>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, func_id: u64, f: TaskFn) {
        self.fns.write().insert(func_id, f);
    }

    pub fn get(&self, func_id: u64) -> Option<TaskFn> {
        self.fns.read().get(&func_id).cloned()
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// Fixed pool of OS worker threads running pipeline stages
///
/// Stages run to completion without yielding; suspension is expressed by
/// registering an event waiter and returning.
pub struct WorkPool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl WorkPool {
    /// Create the pool and spawn `threads` workers
    pub fn start(threads: usize) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let pool = Arc::new(WorkPool {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(threads.max(1));
        for _ in 0..threads.max(1) {
            let pool2 = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || pool2.worker_loop()));
        }
        (pool, handles)
    }

    /// Enqueue a job
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                tracing::warn!("job submitted after pool shutdown");
                return;
            }
            st.jobs.push_back(Box::new(job));
        }
        self.cond.notify_one();
    }

    fn worker_loop(&self) {
        loop {
            let job = {
                let mut st = self.state.lock();
                loop {
                    if let Some(job) = st.jobs.pop_front() {
                        break job;
                    }
                    if st.shutdown {
                        return;
                    }
                    self.cond.wait(&mut st);
                }
            };
            job();
        }
    }

    /// Stop accepting jobs; workers exit once the queue drains
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}

/// Shared service handles threaded through contexts and operations
#[derive(Clone)]
pub struct RuntimeHandles {
    pub events: Arc<EventTable>,
    pub pool: Arc<WorkPool>,
    pub store: Arc<MemoryStore>,
    pub partition: Arc<PartitionEngine>,
    pub redops: Arc<ReductionOps>,
    pub tasks: Arc<TaskTable>,
    pub local_node: NodeId,
}

// device-visible user regions past the configured reserves
const FB_USER_BYTES: usize = 8 << 20;
const ZC_USER_BYTES: usize = 4 << 20;

/// One runtime instance per process
pub struct Runtime {
    config: RuntimeConfig,
    handles: RuntimeHandles,
    schedulers: Vec<Arc<StreamScheduler>>,
    device_memories: Vec<Mutex<DeviceMemory>>,
    pool_workers: Mutex<Vec<JoinHandle<()>>>,
    device_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Bring up the runtime: event table, worker pool, device schedulers
    #[tracing::instrument(skip(config), fields(devices = config.device_count))]
    pub fn initialize(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        let events = EventTable::new();
        let store = Arc::new(MemoryStore::new());
        let partition = Arc::new(PartitionEngine::new(
            Arc::clone(&events),
            Arc::clone(&store),
        ));
        let redops = Arc::new(ReductionOps::default());
        let tasks = Arc::new(TaskTable::new());

        let threads = 2 + config.context_sync_threads;
        let (pool, pool_workers) = WorkPool::start(threads);

        let mut schedulers = Vec::with_capacity(config.device_count);
        let mut device_memories = Vec::with_capacity(config.device_count);
        let mut device_workers = Vec::new();
        for i in 0..config.device_count {
            let fb_total = config.framebuffer_reserve_bytes + FB_USER_BYTES;
            let zc_total = config.zerocopy_reserve_bytes + ZC_USER_BYTES;
            let backend = Box::new(HostBackend::new(DeviceId(i), fb_total + zc_total));
            let sched = StreamScheduler::new(
                backend,
                Arc::clone(&events),
                config.task_streams_per_device,
                config.kernel_arg_initial_bytes,
            );
            device_memories.push(Mutex::new(
                DeviceMemory::new(
                    0,
                    fb_total,
                    config.framebuffer_reserve_bytes,
                    fb_total as u64,
                    zc_total,
                    config.zerocopy_reserve_bytes,
                )
                .map_err(RuntimeError::from)?,
            ));
            let sched2 = Arc::clone(&sched);
            device_workers.push(std::thread::spawn(move || sched2.run_worker()));
            schedulers.push(sched);
        }

        tracing::info!(
            devices = config.device_count,
            pool_threads = threads,
            "runtime_initialized"
        );

        Ok(Arc::new(Runtime {
            handles: RuntimeHandles {
                events,
                pool,
                store,
                partition,
                redops,
                tasks,
                local_node: NodeId(0),
            },
            config,
            schedulers,
            device_memories,
            pool_workers: Mutex::new(pool_workers),
            device_workers: Mutex::new(device_workers),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn handles(&self) -> &RuntimeHandles {
        &self.handles
    }

    pub fn events(&self) -> &Arc<EventTable> {
        &self.handles.events
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.handles.store
    }

    pub fn partition_engine(&self) -> &Arc<PartitionEngine> {
        &self.handles.partition
    }

    pub fn scheduler(&self, device: usize) -> Option<&Arc<StreamScheduler>> {
        self.schedulers.get(device)
    }

    /// Allocate framebuffer memory on a device
    pub fn alloc_framebuffer(&self, device: usize, bytes: usize) -> Result<u64> {
        let mem = self
            .device_memories
            .get(device)
            .ok_or_else(|| RuntimeError::InvalidHandle(format!("device {device}")))?;
        mem.lock().framebuffer.alloc(bytes)
    }

    /// Allocate zero-copy memory on a device
    pub fn alloc_zerocopy(&self, device: usize, bytes: usize) -> Result<u64> {
        let mem = self
            .device_memories
            .get(device)
            .ok_or_else(|| RuntimeError::InvalidHandle(format!("device {device}")))?;
        mem.lock().zerocopy.alloc(bytes)
    }

    /// Register a host task implementation
    pub fn register_task(&self, func_id: u64, f: TaskFn) {
        self.handles.tasks.register(func_id, f);
    }

    /// Create a parent context holding the given region privileges
    pub fn create_context(
        &self,
        privileges: Vec<(RegionHandle, Privilege)>,
    ) -> Arc<ParentContext> {
        ParentContext::new(self.handles.clone(), privileges)
    }

    /// Create a host memory for instances
    pub fn create_memory(&self, kind: MemoryKind, bytes: usize) -> skein_dma::MemoryId {
        self.handles
            .store
            .create_memory(self.handles.local_node, kind, bytes)
    }

    /// Tear everything down in reverse initialization order
    pub fn shutdown(&self) {
        // stop device schedulers first; each synchronizes before exiting
        let exits: Vec<_> = self.schedulers.iter().map(|s| s.shutdown()).collect();
        for ev in exits {
            let _ = self.handles.events.wait(ev);
        }
        for worker in self.device_workers.lock().drain(..) {
            let _ = worker.join();
        }
        self.handles.pool.shutdown();
        for worker in self.pool_workers.lock().drain(..) {
            let _ = worker.join();
        }
        tracing::info!("runtime_shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_runs_jobs() {
        let (pool, workers) = WorkPool::start(2);
        let counter = Arc::new(Mutex::new(0u32));
        let done = EventTable::new();
        let evs: Vec<_> = (0..8).map(|_| done.create()).collect();
        for ev in &evs {
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            let ev = *ev;
            pool.submit(move || {
                *counter.lock() += 1;
                done.trigger(ev);
            });
        }
        for ev in evs {
            done.wait(ev).unwrap();
        }
        assert_eq!(*counter.lock(), 8);
        pool.shutdown();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_runtime_lifecycle() {
        let config = RuntimeConfig {
            device_count: 1,
            framebuffer_reserve_bytes: 1 << 16,
            zerocopy_reserve_bytes: 1 << 16,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::initialize(config).unwrap();
        assert!(rt.scheduler(0).is_some());
        assert!(rt.scheduler(1).is_none());

        // carved memories respect their reserves
        let fb = rt.alloc_framebuffer(0, 1024).unwrap();
        assert!(fb >= (1 << 16));
        rt.shutdown();
    }

    #[test]
    fn test_task_table() {
        let t = TaskTable::new();
        assert!(t.get(7).is_none());
        t.register(7, Arc::new(|args| args.to_vec()));
        let f = t.get(7).unwrap();
        assert_eq!(f(&[1, 2]), vec![1, 2]);
    }
}

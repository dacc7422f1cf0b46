//! Runtime configuration
//!
//! A plain struct with sensible defaults plus environment overrides, so
//! embedding programs can construct it directly and operators can tweak a
//! deployment without recompiling.
//!
//! # Environment Variables
//!
//! - `SKEIN_DEVICE_COUNT` - number of accelerators to drive
//! - `SKEIN_TASK_STREAMS` - task streams per device
//! - `SKEIN_FB_RESERVE` - framebuffer reserved header, bytes
//! - `SKEIN_ZC_RESERVE` - zero-copy reserved header, bytes
//! - `SKEIN_KERNEL_ARG_BYTES` - initial kernel-argument staging buffer, bytes
//! - `SKEIN_DMA_WORKER` - `shared` or `per-device`
//! - `SKEIN_SYNC_THREADS` - thread pool size for explicit device sync
//! - `SKEIN_RANDOM_SEED`, `SKEIN_SHOW_GRAPH`, `SKEIN_SKIP_CHECK` - testing

use std::env;

/// How DMA completions are drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaWorkerMode {
    /// One worker thread shared by every device
    Shared,
    /// A dedicated worker thread per device
    PerDeviceThread,
}

/// Configuration for a runtime instance
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of accelerator devices to use
    pub device_count: usize,
    /// Task streams per device
    pub task_streams_per_device: usize,
    /// Reserved header at the base of each framebuffer allocation
    pub framebuffer_reserve_bytes: usize,
    /// Reserved header at the base of each zero-copy allocation
    pub zerocopy_reserve_bytes: usize,
    /// Initial size of the pinned kernel-argument staging buffer
    pub kernel_arg_initial_bytes: usize,
    /// DMA completion drain strategy
    pub dma_worker_mode: DmaWorkerMode,
    /// Thread pool size for explicit device synchronization
    pub context_sync_threads: usize,
    /// Seed for test data generation
    pub random_seed: u64,
    /// Dump dependence graphs while running (testing)
    pub show_graph: bool,
    /// Skip result checking (testing)
    pub skip_check: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_count: 0,
            task_streams_per_device: 4,
            framebuffer_reserve_bytes: 32 << 20,
            zerocopy_reserve_bytes: 16 << 20,
            kernel_arg_initial_bytes: 8192,
            dma_worker_mode: DmaWorkerMode::Shared,
            context_sync_threads: 1,
            random_seed: 12345,
            show_graph: false,
            skip_check: false,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from defaults plus environment hints
    pub fn from_env() -> Self {
        let mut config = Self::default();

        fn parse_usize(var: &str, into: &mut usize) {
            if let Ok(v) = env::var(var) {
                if let Ok(n) = v.trim().parse() {
                    *into = n;
                }
            }
        }
        fn parse_bool(var: &str, into: &mut bool) {
            if let Ok(v) = env::var(var) {
                *into = v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes");
            }
        }

        parse_usize("SKEIN_DEVICE_COUNT", &mut config.device_count);
        parse_usize("SKEIN_TASK_STREAMS", &mut config.task_streams_per_device);
        parse_usize("SKEIN_FB_RESERVE", &mut config.framebuffer_reserve_bytes);
        parse_usize("SKEIN_ZC_RESERVE", &mut config.zerocopy_reserve_bytes);
        parse_usize("SKEIN_KERNEL_ARG_BYTES", &mut config.kernel_arg_initial_bytes);
        parse_usize("SKEIN_SYNC_THREADS", &mut config.context_sync_threads);

        if let Ok(mode) = env::var("SKEIN_DMA_WORKER") {
            config.dma_worker_mode = match mode.to_ascii_lowercase().as_str() {
                "per-device" | "per-device-thread" => DmaWorkerMode::PerDeviceThread,
                _ => DmaWorkerMode::Shared,
            };
        }
        if let Ok(seed) = env::var("SKEIN_RANDOM_SEED") {
            if let Ok(n) = seed.trim().parse() {
                config.random_seed = n;
            }
        }
        parse_bool("SKEIN_SHOW_GRAPH", &mut config.show_graph);
        parse_bool("SKEIN_SKIP_CHECK", &mut config.skip_check);

        config
    }
}

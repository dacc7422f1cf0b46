//! Device backends and stream schedulers for the skein runtime
//!
//! This crate provides:
//! - **DeviceBackend**: pluggable capability interface a device exposes
//! - **HostBackend / MockBackend**: reference and test implementations
//! - **StreamScheduler**: one per device, multiplexing kernels and DMA
//!   copies onto a bounded stream pool with event-based completion
//! - **Device memory carving**: reserved headers plus a first-fit
//!   sub-allocator over each large device allocation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  StreamScheduler                      │
//! │   task streams (round-robin)   4 DMA streams          │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ submit / markers / drain
//!                         ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                  DeviceBackend trait                  │
//! └───────┬──────────────────┬───────────────────────────┘
//!         ▼                  ▼
//!   ┌──────────┐       ┌──────────┐
//!   │   Host   │       │   Mock   │     (vendor backends plug in here)
//!   │ Backend  │       │ Backend  │
//!   └──────────┘       └──────────┘
//! ```
//!
//! The runtime never calls a vendor API directly; everything flows through
//! the backend trait, which keeps the scheduler testable with a mock.

pub mod backend;
pub mod error;
pub mod host;
pub mod memory;
pub mod mock;
pub mod scheduler;
pub mod types;

pub use backend::{AutoContext, CompletionHook, DeviceBackend};
pub use error::{BackendError, Result};
pub use host::{HostBackend, KernelFn};
pub use memory::{CarvedMemory, DeviceMemory, Suballocator};
pub use mock::MockBackend;
pub use scheduler::StreamScheduler;
pub use types::{
    CompletionRecord, CopyDescriptor, CopyKind, DeviceId, DeviceMarker, FillDescriptor,
    KernelLaunch, StreamId, StreamKind, KILL_FUNC_ID,
};

//! # skein-base - Foundations of the skein runtime
//!
//! Leaf crate holding the primitives every other part of the runtime builds
//! on:
//!
//! - **Events**: generational one-shot futures with waiters, merging and
//!   failure propagation ([`event`])
//! - **Reservations**: non-blocking, event-returning locks ([`reservation`])
//! - **Index spaces**: bounded N-dimensional integer sets with deferred
//!   sparsity maps ([`space`], [`sparsity`])
//! - **Wire envelopes**: tagged payload framing for remote operations
//!   ([`wire`])
//! - **Configuration**: runtime options with environment overrides
//!   ([`config`])
//!
//! Nothing in this crate spawns threads or touches devices; the higher
//! layers own all scheduling.

pub mod config;
pub mod error;
pub mod event;
pub mod reservation;
pub mod space;
pub mod sparsity;
pub mod wire;

pub use config::{DmaWorkerMode, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use event::{Event, EventState, EventTable};
pub use reservation::{Acquire, Reservation};
pub use space::{Coord, IndexSpace, Point, Rect};
pub use sparsity::{SparsityEntry, SparsityMap};
pub use wire::{PayloadRegistry, RemoteCopyArgs, RemoteFillArgs, RemotePayload, WireHeader};

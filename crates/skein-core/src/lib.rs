//! # skein-core - Operation pipeline and dependence graph
//!
//! The heart of the runtime: every submitted operation (task, copy, fill,
//! fence, inline mapping, acquire/release, deletion, predicate) becomes a
//! pooled record in its parent context and flows through
//!
//! ```text
//! initialize → dependence analysis → mapping → execution
//!            → resolution → completion → commit
//! ```
//!
//! while the context tracks mapping, speculation and commit dependences in
//! program order. Predicates let operations speculate ahead of an
//! unresolved condition and be quashed when the guess was wrong.
//!
//! ## Guarantees
//!
//! - Program-order dependence analysis per context
//! - Each trigger stage runs at most once per record generation
//! - The completion event fires exactly once
//! - A record is not reused until its generation commits
//!
//! Device work routes through `skein-backends` stream schedulers; copies,
//! fills and dependent partitioning route through `skein-dma`.

pub mod context;
pub mod future;
pub mod op;
pub mod region;
pub mod runtime;

pub use context::{
    CopyLaunch, FillLaunch, ParentContext, PhysicalRegion, PredicateHandle, TaskLaunch,
};
pub use future::Future;
pub use op::{
    DeletionKind, FenceKind, OpKindTag, OpPayload, OpRef, OpSlot, OperationRecord, SpecState,
};
pub use region::{Privilege, RegionHandle, RegionRequirement};
pub use runtime::{Runtime, RuntimeHandles, TaskFn, TaskTable, WorkPool};

pub use skein_base::{Event, EventState, EventTable, Result, RuntimeConfig, RuntimeError};

//! Transfer and dependent-partitioning core for the skein runtime
//!
//! This crate lowers logical copy/fill/reduce requests into executable
//! plans, iterates them as contiguous address chunks, and computes derived
//! index spaces from field data:
//!
//! - [`memory`] - memory ids, kinds and host-visible byte arenas
//! - [`instance`] - region instances, affine layouts, typed accessors
//! - [`iterator`] - the chunked transfer cursor with tentative stepping
//! - [`plan`] - copy/reduce/fill planning, node selection and execution
//! - [`deppart`] - deferred partitioning operators and set algebra
//!
//! # Data flow
//!
//! ```text
//! copy request ──▶ TransferPlan::plan_copy ──▶ [plans by memory pair]
//!                                                   │ per plan
//!                                                   ▼
//!                                  TransferIterator pump (src ⇄ dst)
//!                                                   │
//!                                                   ▼
//!                                      completion event (merged)
//! ```

pub mod deppart;
pub mod instance;
pub mod iterator;
pub mod memory;
pub mod plan;

pub use deppart::PartitionEngine;
pub use instance::{AffineAccessor, FieldDataDescriptor, InstanceLayout, RegionInstance};
pub use iterator::{AddressInfo, FieldSlice, TransferIterator};
pub use memory::{MemoryId, MemoryKind, MemoryStore, NodeId};
pub use plan::{
    execute_plans, issue_copy, issue_fill, select_dma_node, CopySrcDstField, OffsetsAndSize,
    ReductionOps, TransferPlan, REDOP_MAX_I32, REDOP_SUM_I32,
};

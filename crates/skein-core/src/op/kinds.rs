//! Operation kinds
//!
//! The payload variant carried by each record. The common trigger pipeline
//! lives on the parent context; per-kind behavior is dispatched by matching
//! on the payload at the stages a kind overrides. [`OpPayload::kind`]
//! projects the tag for pooling and logging.

use super::predicate::PredicateState;
use crate::future::Future;
use crate::region::RegionRequirement;
use skein_dma::CopySrcDstField;
use skein_base::IndexSpace;

/// Kind tag, used for free-list pooling and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKindTag {
    Task,
    Copy,
    Fill,
    Fence,
    Deletion,
    Close,
    Map,
    Acquire,
    Release,
    Predicate,
}

impl OpKindTag {
    /// Logging name, stable across releases
    pub fn name(self) -> &'static str {
        match self {
            OpKindTag::Task => "task",
            OpKindTag::Copy => "copy",
            OpKindTag::Fill => "fill",
            OpKindTag::Fence => "fence",
            OpKindTag::Deletion => "deletion",
            OpKindTag::Close => "close",
            OpKindTag::Map => "map",
            OpKindTag::Acquire => "acquire",
            OpKindTag::Release => "release",
            OpKindTag::Predicate => "predicate",
        }
    }
}

/// Fences order either mapping or full execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Later operations may not map before earlier operations have mapped
    Mapping,
    /// Completes only after every earlier operation has completed
    Execution,
}

/// What a deletion operation deletes; the destructive step runs at commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionKind {
    IndexSpace(u64),
    IndexPartition(u64),
    FieldSpace(u64),
    Fields(u64, Vec<u32>),
    Region(u64),
}

/// A task launch
#[derive(Clone)]
pub struct TaskOp {
    pub func_id: u64,
    pub args: Vec<u8>,
    pub requirements: Vec<RegionRequirement>,
    /// Receives the task function's return bytes
    pub result: Future,
}

/// An explicit copy (or reduction) between instance fields
#[derive(Clone)]
pub struct CopyOp {
    pub srcs: Vec<CopySrcDstField<1>>,
    pub dsts: Vec<CopySrcDstField<1>>,
    pub redop: Option<(u32, bool)>,
    pub domain: IndexSpace<1>,
    pub src_requirements: Vec<RegionRequirement>,
    pub dst_requirements: Vec<RegionRequirement>,
}

/// A fill of one or more destination fields
#[derive(Clone)]
pub struct FillOp {
    pub dsts: Vec<CopySrcDstField<1>>,
    pub value: Vec<u8>,
    pub domain: IndexSpace<1>,
    pub requirement: RegionRequirement,
}

/// An inline mapping; completes and commits immediately after mapping
/// because mapped data escapes to the application and cannot be rolled back
#[derive(Clone)]
pub struct MapOp {
    pub requirement: RegionRequirement,
}

/// Runtime-internal close of region state back into a prior instance
#[derive(Clone)]
pub struct CloseOp {
    pub requirement: RegionRequirement,
}

/// User-level coherence acquire
#[derive(Clone)]
pub struct AcquireOp {
    pub requirement: RegionRequirement,
}

/// User-level coherence release
#[derive(Clone)]
pub struct ReleaseOp {
    pub requirement: RegionRequirement,
}

/// The variant a record carries
pub enum OpPayload {
    Task(TaskOp),
    Copy(CopyOp),
    Fill(FillOp),
    Fence(FenceKind),
    Deletion(DeletionKind),
    Close(CloseOp),
    Map(MapOp),
    Acquire(AcquireOp),
    Release(ReleaseOp),
    Predicate(PredicateState),
}

impl OpPayload {
    /// Project the kind tag
    pub fn kind(&self) -> OpKindTag {
        match self {
            OpPayload::Task(_) => OpKindTag::Task,
            OpPayload::Copy(_) => OpKindTag::Copy,
            OpPayload::Fill(_) => OpKindTag::Fill,
            OpPayload::Fence(_) => OpKindTag::Fence,
            OpPayload::Deletion(_) => OpKindTag::Deletion,
            OpPayload::Close(_) => OpKindTag::Close,
            OpPayload::Map(_) => OpKindTag::Map,
            OpPayload::Acquire(_) => OpKindTag::Acquire,
            OpPayload::Release(_) => OpKindTag::Release,
            OpPayload::Predicate(_) => OpKindTag::Predicate,
        }
    }

    /// Whether this kind may be controlled by a predicate
    pub fn speculable(&self) -> bool {
        matches!(
            self,
            OpPayload::Task(_) | OpPayload::Copy(_) | OpPayload::Acquire(_) | OpPayload::Release(_)
        )
    }

    /// Region requirements this operation analyzes, in index order
    pub fn requirements(&self) -> Vec<RegionRequirement> {
        match self {
            OpPayload::Task(t) => t.requirements.clone(),
            OpPayload::Copy(c) => {
                let mut reqs = c.src_requirements.clone();
                reqs.extend(c.dst_requirements.iter().cloned());
                reqs
            }
            OpPayload::Fill(f) => vec![f.requirement.clone()],
            OpPayload::Map(m) => vec![m.requirement.clone()],
            OpPayload::Close(c) => vec![c.requirement.clone()],
            OpPayload::Acquire(a) => vec![a.requirement.clone()],
            OpPayload::Release(r) => vec![r.requirement.clone()],
            OpPayload::Fence(_) | OpPayload::Deletion(_) | OpPayload::Predicate(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_projection() {
        assert_eq!(OpPayload::Fence(FenceKind::Mapping).kind(), OpKindTag::Fence);
        assert_eq!(
            OpPayload::Deletion(DeletionKind::Region(1)).kind(),
            OpKindTag::Deletion
        );
        assert_eq!(OpKindTag::Task.name(), "task");
    }

    #[test]
    fn test_speculable_kinds() {
        assert!(OpPayload::Task(TaskOp {
            func_id: 1,
            args: vec![],
            requirements: vec![],
            result: Future::new(skein_base::Event::NONE),
        })
        .speculable());
        assert!(!OpPayload::Fence(FenceKind::Mapping).speculable());
        assert!(!OpPayload::Deletion(DeletionKind::Region(0)).speculable());
    }
}

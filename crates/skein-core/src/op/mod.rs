//! Operation records
//!
//! A record is one node of the dependence graph. Records are pool-allocated
//! by their parent context and reused: deactivation bumps the generation so
//! a stale `(slot, generation)` reference resolves to "already committed"
//! instead of dangling.
//!
//! ## Stage flags
//!
//! Flags advance monotonically and are never cleared while a generation is
//! live:
//!
//! ```text
//! mapped ──▶ executed ──▶ resolved ──▶ completed ──▶ committed
//!                          (predicates only)         (record freed)
//! ```
//!
//! Commit additionally requires that no external holder can still add
//! dependences (`outstanding_mapping_references == 0`) and that every
//! registered dependent has committed or verified its regions
//! (`outstanding_commit_deps == 0`).

pub mod kinds;
pub mod predicate;

pub use kinds::{DeletionKind, FenceKind, OpKindTag, OpPayload};
pub use predicate::{PredKind, PredicateState, PredicateWaiter};

use parking_lot::Mutex;
use skein_base::Event;
use std::collections::{HashMap, HashSet};

/// Unique, never-reused operation id
pub type UniqueId = u64;

/// Per-slot reuse counter
pub type Generation = u32;

/// Index of a record in its context's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpSlot(pub usize);

/// A possibly-stale reference to an operation
///
/// Dereferencing checks the generation; a mismatch means the referenced
/// generation has already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRef {
    pub slot: OpSlot,
    pub gen: Generation,
}

/// Speculation state of a predicated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecState {
    /// Not predicated, or predicate not yet sampled
    PendingMap,
    /// Sampled an unresolved predicate that refused to speculate
    PendingPred,
    /// Running on a speculated true value
    SpeculateTrue,
    /// Skipped on a speculated false value
    SpeculateFalse,
    /// Predicate known true
    ResolveTrue,
    /// Predicate known false
    ResolveFalse,
}

/// Mutable state of one live record generation
pub struct OpState {
    pub gen: Generation,
    pub unique_id: UniqueId,
    pub payload: OpPayload,
    pub completion_event: Event,
    pub need_completion_trigger: bool,
    pub track_parent: bool,

    // stage flags (monotonic)
    pub mapped: bool,
    pub executed: bool,
    pub resolved: bool,
    pub hardened: bool,
    pub completed: bool,
    pub committed: bool,

    // dependence counters
    pub outstanding_mapping_deps: u32,
    pub outstanding_speculation_deps: u32,
    pub outstanding_commit_deps: u32,
    /// External holders that may still add dependences; the outgoing edge
    /// set is fixed once this reaches zero
    pub outstanding_mapping_references: u32,

    /// Operations this one depends on
    pub incoming: HashMap<OpSlot, Generation>,
    /// Operations depending on this one
    pub outgoing: HashMap<OpSlot, Generation>,

    /// Region indices not yet verified by any dependent
    pub unverified_regions: HashSet<u32>,
    /// For each predecessor, the regions we can verify for it on completion
    pub verify_regions: HashMap<OpSlot, (Generation, HashSet<u32>)>,
    /// Predecessors already sent their commit notification (via verify)
    pub commit_notified: HashSet<OpSlot>,

    // one-shot guards for the trigger stages
    pub trigger_mapping_invoked: bool,
    pub trigger_resolution_invoked: bool,
    pub trigger_complete_invoked: bool,
    pub trigger_commit_invoked: bool,

    /// Dependence analysis has finished (self-dependence released)
    pub analysis_done: bool,

    // speculation
    pub spec_state: SpecState,
    pub predicate: Option<OpRef>,

    /// Completion events of dependence targets; gates execution
    pub precondition_events: Vec<Event>,

    /// Set when the operation failed; commit never runs
    pub failed: bool,
}

impl OpState {
    fn fresh(gen: Generation) -> Self {
        OpState {
            gen,
            unique_id: 0,
            payload: OpPayload::Fence(FenceKind::Mapping),
            completion_event: Event::NONE,
            need_completion_trigger: false,
            track_parent: false,
            mapped: false,
            executed: false,
            resolved: false,
            hardened: false,
            completed: false,
            committed: false,
            outstanding_mapping_deps: 0,
            outstanding_speculation_deps: 0,
            outstanding_commit_deps: 0,
            outstanding_mapping_references: 0,
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            unverified_regions: HashSet::new(),
            verify_regions: HashMap::new(),
            commit_notified: HashSet::new(),
            trigger_mapping_invoked: false,
            trigger_resolution_invoked: false,
            trigger_complete_invoked: false,
            trigger_commit_invoked: false,
            analysis_done: false,
            spec_state: SpecState::PendingMap,
            predicate: None,
            precondition_events: Vec::new(),
            failed: false,
        }
    }

    /// Check the stage-flag invariants; called in debug builds
    pub fn check_invariants(&self) {
        if self.committed {
            debug_assert!(self.completed, "committed before completed");
            debug_assert!(self.mapped, "committed before mapped");
            debug_assert_eq!(
                self.outstanding_mapping_references, 0,
                "committed with live mapping references"
            );
        }
        if self.completed && !self.failed {
            debug_assert!(self.mapped && self.executed && self.resolved);
        }
    }
}

/// One pooled record slot
///
/// The record owns its own lock; cross-record operations take locks in
/// ascending `unique_id` order. The id is mirrored outside the lock so the
/// ordering can be established before locking.
pub struct OperationRecord {
    pub slot: OpSlot,
    pub uid: std::sync::atomic::AtomicU64,
    pub state: Mutex<OpState>,
}

impl OperationRecord {
    pub fn new(slot: OpSlot) -> Self {
        OperationRecord {
            slot,
            uid: std::sync::atomic::AtomicU64::new(0),
            state: Mutex::new(OpState::fresh(0)),
        }
    }

    /// Reinitialize the slot for a new generation
    ///
    /// The generation was already bumped by deactivation; everything else
    /// resets.
    pub fn activate(
        &self,
        unique_id: UniqueId,
        payload: OpPayload,
        completion_event: Event,
        need_completion_trigger: bool,
        track_parent: bool,
        num_regions: u32,
    ) -> Generation {
        self.uid
            .store(unique_id, std::sync::atomic::Ordering::Relaxed);
        let mut st = self.state.lock();
        let gen = st.gen;
        let mut fresh = OpState::fresh(gen);
        fresh.unique_id = unique_id;
        fresh.payload = payload;
        fresh.completion_event = completion_event;
        fresh.need_completion_trigger = need_completion_trigger;
        fresh.track_parent = track_parent;
        fresh.unverified_regions = (0..num_regions).collect();
        // the parent holds one mapping reference while the record is live
        fresh.outstanding_mapping_references = if track_parent { 1 } else { 0 };
        *st = fresh;
        gen
    }

    /// Bump the generation, making all outstanding references stale
    pub fn deactivate(&self) {
        let mut st = self.state.lock();
        st.gen += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_resets_state() {
        let rec = OperationRecord::new(OpSlot(0));
        let g0 = rec.activate(
            1,
            OpPayload::Fence(FenceKind::Mapping),
            Event::NONE,
            true,
            true,
            2,
        );
        {
            let mut st = rec.state.lock();
            st.mapped = true;
            st.outstanding_mapping_deps = 3;
        }
        rec.deactivate();
        let g1 = rec.activate(
            2,
            OpPayload::Fence(FenceKind::Execution),
            Event::NONE,
            true,
            true,
            0,
        );
        assert_eq!(g1, g0 + 1);
        let st = rec.state.lock();
        assert!(!st.mapped);
        assert_eq!(st.outstanding_mapping_deps, 0);
        assert_eq!(st.unique_id, 2);
        assert!(st.unverified_regions.is_empty());
    }

    #[test]
    fn test_track_parent_holds_reference() {
        let rec = OperationRecord::new(OpSlot(0));
        rec.activate(
            1,
            OpPayload::Fence(FenceKind::Mapping),
            Event::NONE,
            true,
            true,
            0,
        );
        assert_eq!(rec.state.lock().outstanding_mapping_references, 1);
        rec.deactivate();
        rec.activate(
            2,
            OpPayload::Fence(FenceKind::Mapping),
            Event::NONE,
            true,
            false,
            0,
        );
        assert_eq!(rec.state.lock().outstanding_mapping_references, 0);
    }
}

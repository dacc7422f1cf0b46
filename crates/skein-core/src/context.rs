//! Parent contexts and the trigger pipeline
//!
//! A [`ParentContext`] owns an arena of pooled operation records, dispenses
//! unique ids, and drives every submitted operation through the stages
//!
//! ```text
//! initialize → dependence analysis → mapping → execution
//!            → resolution → completion → commit
//! ```
//!
//! Dependence analysis runs in program order behind the context's queue
//! reservation. Each stage trigger runs at most once per record generation;
//! the completion event fires exactly once; the record is not reused until
//! commit bumps its generation.
//!
//! ## Locking
//!
//! Every record is guarded by its own lock. The only place two record locks
//! are held together is dependence registration, which takes them in
//! ascending unique-id order. All other cross-record work snapshots under
//! one lock, releases, then notifies.

use crate::future::Future;
use crate::op::kinds::{
    AcquireOp, CloseOp, CopyOp, FillOp, MapOp, ReleaseOp, TaskOp,
};
use crate::op::{
    DeletionKind, FenceKind, OpKindTag, OpPayload, OpRef, OpSlot, OperationRecord, PredKind,
    PredicateState, PredicateWaiter, SpecState,
};
use crate::region::{Privilege, RegionHandle, RegionRequirement};
use crate::runtime::RuntimeHandles;
use parking_lot::Mutex;
use skein_base::{Event, IndexSpace, Reservation, Result, RuntimeError};
use skein_dma::CopySrcDstField;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A mapped physical view of a region, handed back by inline mapping
#[derive(Clone, Copy)]
pub struct PhysicalRegion {
    pub region: RegionHandle,
    /// Triggers when the mapping is ready to use
    pub ready: Event,
}

/// User-held handle to a predicate operation
///
/// The holder owns one reference; call
/// [`ParentContext::release_predicate`] after the last sample so the
/// predicate record can eventually commit.
#[derive(Debug, Clone, Copy)]
pub struct PredicateHandle {
    pub(crate) op: OpRef,
}

/// Launch description for a task
pub struct TaskLaunch {
    pub func_id: u64,
    pub args: Vec<u8>,
    pub requirements: Vec<RegionRequirement>,
    pub predicate: Option<PredicateHandle>,
}

/// Launch description for an explicit copy or reduction
pub struct CopyLaunch {
    pub srcs: Vec<CopySrcDstField<1>>,
    pub dsts: Vec<CopySrcDstField<1>>,
    pub src_requirements: Vec<RegionRequirement>,
    pub dst_requirements: Vec<RegionRequirement>,
    pub redop: Option<(u32, bool)>,
    pub domain: IndexSpace<1>,
    pub predicate: Option<PredicateHandle>,
}

/// Launch description for a fill
pub struct FillLaunch {
    pub dsts: Vec<CopySrcDstField<1>>,
    pub value: Vec<u8>,
    pub domain: IndexSpace<1>,
    pub requirement: RegionRequirement,
}

#[derive(Default)]
struct RegionState {
    last_writer: Option<(OpRef, u32)>,
    /// Readers (or commuting reducers) since the last writer
    readers: Vec<(OpRef, u32)>,
    /// Set when `readers` are reducers of this operator
    reduction_op: Option<u32>,
}

struct CtxInner {
    arena: Vec<Arc<OperationRecord>>,
    free: HashMap<OpKindTag, Vec<OpSlot>>,
    next_unique: u64,
    region_state: HashMap<RegionHandle, RegionState>,
    privileges: HashMap<RegionHandle, Privilege>,
    /// Uncommitted tracked operations, program order
    window: Vec<OpRef>,
    aborted: Option<RuntimeError>,
}

/// The enclosing context every operation is submitted into
pub struct ParentContext {
    handles: RuntimeHandles,
    inner: Mutex<CtxInner>,
    /// Serializes enqueue + dependence analysis in program order
    queue: Reservation,
    /// Back-reference captured by deferred stage closures
    self_ref: std::sync::Weak<ParentContext>,
}

impl ParentContext {
    pub fn new(
        handles: RuntimeHandles,
        privileges: Vec<(RegionHandle, Privilege)>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            handles,
            inner: Mutex::new(CtxInner {
                arena: Vec::new(),
                free: HashMap::new(),
                next_unique: 0,
                region_state: HashMap::new(),
                privileges: privileges.into_iter().collect(),
                window: Vec::new(),
                aborted: None,
            }),
            queue: Reservation::new(),
            self_ref: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<ParentContext> {
        self.self_ref.upgrade().expect("context alive")
    }

    pub fn handles(&self) -> &RuntimeHandles {
        &self.handles
    }

    /// Whether this context still holds a privilege on `region`
    pub fn has_privilege(&self, region: RegionHandle) -> bool {
        self.inner.lock().privileges.contains_key(&region)
    }

    /// Whether the referenced operation generation has committed
    ///
    /// Stale references (the slot moved on) read as committed.
    pub fn has_committed(&self, op: OpRef) -> bool {
        let rec = self.record(op.slot);
        let st = rec.state.lock();
        st.gen != op.gen || st.committed
    }

    fn check_live(&self) -> Result<()> {
        match &self.inner.lock().aborted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record(&self, slot: OpSlot) -> Arc<OperationRecord> {
        Arc::clone(&self.inner.lock().arena[slot.0])
    }

    // ============================================================================================
    // Record allocation and reuse
    // ============================================================================================

    fn alloc_op(
        &self,
        payload: OpPayload,
        completion: Event,
        need_completion_trigger: bool,
        track: bool,
    ) -> OpRef {
        let kind = payload.kind();
        let num_regions = payload.requirements().len() as u32;
        let (rec, uid) = {
            let mut inner = self.inner.lock();
            let slot = match inner.free.get_mut(&kind).and_then(|v| v.pop()) {
                Some(slot) => slot,
                None => {
                    let slot = OpSlot(inner.arena.len());
                    inner.arena.push(Arc::new(OperationRecord::new(slot)));
                    slot
                }
            };
            inner.next_unique += 1;
            (Arc::clone(&inner.arena[slot.0]), inner.next_unique)
        };
        let gen = rec.activate(
            uid,
            payload,
            completion,
            need_completion_trigger,
            track,
            num_regions,
        );
        let op = OpRef {
            slot: rec.slot,
            gen,
        };
        if track {
            self.inner.lock().window.push(op);
        }
        tracing::trace!(op = uid, kind = kind.name(), "op_initialized");
        op
    }

    fn deactivate(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let (kind, predicate, pred_children) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            let children = match &st.payload {
                OpPayload::Predicate(p) => match p.kind {
                    PredKind::Not(a) => vec![a],
                    PredKind::And(a, b) | PredKind::Or(a, b) => vec![a, b],
                    PredKind::Future(_) => Vec::new(),
                },
                _ => Vec::new(),
            };
            (st.payload.kind(), st.predicate.take(), children)
        };
        rec.deactivate();
        {
            let mut inner = self.inner.lock();
            inner.window.retain(|w| *w != op);
            inner.free.entry(kind).or_default().push(op.slot);
        }
        if let Some(p) = predicate {
            self.remove_predicate_reference(p);
        }
        for c in pred_children {
            self.remove_predicate_reference(c);
        }
    }

    // ============================================================================================
    // Dependence analysis
    // ============================================================================================

    fn analyze(&self, op: OpRef) -> Result<()> {
        self.queue.acquire_blocking(&self.handles.events);
        let result = self.analyze_inner(op);
        self.queue.release(&self.handles.events);
        if let Err(err) = &result {
            // privilege violations abort the whole context
            self.inner.lock().aborted = Some(err.clone());
            self.fail_operation(op, err.clone());
        }
        result
    }

    fn analyze_inner(&self, op: OpRef) -> Result<()> {
        self.begin_dependence_analysis(op);

        let rec = self.record(op.slot);
        enum Shape {
            // fences and deletions order against everything in flight;
            // completion preconditions accumulate via edge registration
            Barrier,
            Regions(Vec<RegionRequirement>),
        }
        let shape = {
            let st = rec.state.lock();
            match &st.payload {
                OpPayload::Fence(_) | OpPayload::Deletion(_) => Shape::Barrier,
                p => Shape::Regions(p.requirements()),
            }
        };

        match shape {
            Shape::Barrier => {
                let window: Vec<OpRef> = {
                    let inner = self.inner.lock();
                    inner.window.iter().filter(|w| **w != op).copied().collect()
                };
                for target in window {
                    let _ = self.register_dependence(op, target);
                }
            }
            Shape::Regions(reqs) => {
                for (idx, req) in reqs.iter().enumerate() {
                    self.analyze_requirement(op, idx as u32, req)?;
                }
            }
        }

        self.end_dependence_analysis(op);
        Ok(())
    }

    fn analyze_requirement(
        &self,
        op: OpRef,
        idx: u32,
        req: &RegionRequirement,
    ) -> Result<()> {
        let allowed = self
            .inner
            .lock()
            .privileges
            .get(&req.region)
            .is_some_and(|held| held.covers(req.privilege));
        if !allowed {
            return Err(RuntimeError::PrivilegeViolation(format!(
                "requirement {idx} needs {:?} on {}",
                req.privilege, req.region
            )));
        }

        // walk the open region state: pick dependence targets and update
        // the state for future operations
        let (writer_edge, plain_edges) = {
            let mut inner = self.inner.lock();
            let st = inner.region_state.entry(req.region).or_default();
            let mut writer_edge = st.last_writer;
            let mut plain = Vec::new();
            match req.privilege {
                Privilege::ReadOnly => {
                    if st.reduction_op.is_some() {
                        // a read closes a reduction epoch
                        plain.extend(st.readers.iter().map(|(r, _)| *r));
                        st.readers = vec![(op, idx)];
                        st.reduction_op = None;
                    } else {
                        st.readers.push((op, idx));
                    }
                }
                Privilege::ReadWrite | Privilege::WriteDiscard => {
                    plain.extend(st.readers.iter().map(|(r, _)| *r));
                    st.last_writer = Some((op, idx));
                    st.readers.clear();
                    st.reduction_op = None;
                }
                Privilege::Reduce(redop) => {
                    if st.reduction_op == Some(redop) {
                        // commuting reductions need no mutual ordering
                        st.readers.push((op, idx));
                        writer_edge = st.last_writer;
                    } else {
                        plain.extend(st.readers.iter().map(|(r, _)| *r));
                        st.readers = vec![(op, idx)];
                        st.reduction_op = Some(redop);
                    }
                }
            }
            (writer_edge, plain)
        };

        if let Some((writer, widx)) = writer_edge {
            if writer != op {
                let _ = self.register_region_dependence(op, writer, widx);
            }
        }
        for target in plain_edges {
            if target != op {
                let _ = self.register_dependence(op, target);
            }
        }
        Ok(())
    }

    fn begin_dependence_analysis(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        debug_assert_eq!(st.gen, op.gen);
        // temporary self-dependence so analysis cannot race mapping
        st.outstanding_mapping_deps += 1;
    }

    fn end_dependence_analysis(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let ready = {
            let mut st = rec.state.lock();
            debug_assert_eq!(st.gen, op.gen);
            st.analysis_done = true;
            st.outstanding_mapping_deps -= 1;
            st.outstanding_mapping_deps == 0 && !st.trigger_mapping_invoked
        };
        if ready {
            self.enqueue_trigger_mapping(op);
        }
    }

    /// Register a mapping dependence from `our` on `target`
    ///
    /// Returns true when the target has already committed (or can accept no
    /// more dependences) and the edge was pruned.
    pub fn register_dependence(&self, our: OpRef, target: OpRef) -> bool {
        self.register_edge(our, target, None)
    }

    /// Like [`ParentContext::register_dependence`], additionally recording
    /// that `our` can verify `target`'s region `target_idx` on completion,
    /// letting the target commit early
    pub fn register_region_dependence(&self, our: OpRef, target: OpRef, target_idx: u32) -> bool {
        self.register_edge(our, target, Some(target_idx))
    }

    fn register_edge(&self, our: OpRef, target: OpRef, verify_idx: Option<u32>) -> bool {
        debug_assert_ne!(our.slot, target.slot);
        let rec_a = self.record(our.slot);
        let rec_b = self.record(target.slot);
        // lock both records in ascending unique-id order
        let uid_a = rec_a.uid.load(Ordering::Relaxed);
        let uid_b = rec_b.uid.load(Ordering::Relaxed);
        let (mut st_ours, mut st_target);
        if uid_a < uid_b {
            st_ours = rec_a.state.lock();
            st_target = rec_b.state.lock();
        } else {
            st_target = rec_b.state.lock();
            st_ours = rec_a.state.lock();
        }
        if st_ours.gen != our.gen {
            return true;
        }
        if st_target.gen != target.gen || st_target.committed {
            // stale generation: the operation already committed
            return true;
        }
        if st_target.outstanding_mapping_references == 0 {
            // the outgoing edge set is fixed; effects are observable
            return true;
        }
        debug_assert!(!st_ours.mapped, "dependence added after mapping");
        if st_ours.incoming.contains_key(&target.slot) {
            // duplicate edges count once
            if let Some(idx) = verify_idx {
                st_ours
                    .verify_regions
                    .entry(target.slot)
                    .or_insert_with(|| (target.gen, HashSet::new()))
                    .1
                    .insert(idx);
            }
            return false;
        }
        st_ours.incoming.insert(target.slot, target.gen);
        st_ours
            .precondition_events
            .push(st_target.completion_event);
        st_target.outstanding_commit_deps += 1;
        if st_target.mapped {
            // the target mapped already: nothing to wait for on the
            // mapping chain, only commit tracking remains
        } else {
            st_ours.outstanding_mapping_deps += 1;
            st_target.outgoing.insert(our.slot, our.gen);
        }
        if let Some(idx) = verify_idx {
            st_ours
                .verify_regions
                .entry(target.slot)
                .or_insert_with(|| (target.gen, HashSet::new()))
                .1
                .insert(idx);
        }
        false
    }

    // ============================================================================================
    // Notifications
    // ============================================================================================

    /// A predecessor mapped (or restarted); may make this operation ready
    pub fn notify_mapping_dependence(&self, op: OpRef, restart: bool) {
        let rec = self.record(op.slot);
        let ready = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            if restart {
                tracing::debug!(op = st.unique_id, "mapping dependence restarted");
            }
            debug_assert!(st.outstanding_mapping_deps > 0);
            st.outstanding_mapping_deps -= 1;
            st.outstanding_mapping_deps == 0 && st.analysis_done && !st.trigger_mapping_invoked
        };
        if ready {
            self.enqueue_trigger_mapping(op);
        }
    }

    /// A speculation predecessor resolved; gates the resolution stage
    pub fn notify_speculation_dependence(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let ready = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            debug_assert!(st.outstanding_speculation_deps > 0);
            st.outstanding_speculation_deps -= 1;
            st.outstanding_speculation_deps == 0 && st.analysis_done
        };
        if ready {
            self.resolve_speculation(op);
        }
    }

    /// A dependent committed; commit readiness flows up the graph
    pub fn notify_commit_dependence(&self, op: OpRef) {
        let rec = self.record(op.slot);
        {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            debug_assert!(st.outstanding_commit_deps > 0);
            st.outstanding_commit_deps -= 1;
        }
        self.try_commit(op);
    }

    /// A dependent confirmed it observed our writes for these regions,
    /// permitting an earlier commit
    pub fn notify_regions_verified(&self, op: OpRef, regions: HashSet<u32>) {
        let rec = self.record(op.slot);
        {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            for r in &regions {
                st.unverified_regions.remove(r);
            }
            debug_assert!(st.outstanding_commit_deps > 0);
            st.outstanding_commit_deps -= 1;
        }
        self.try_commit(op);
    }

    /// External holders call these around windows where they may still add
    /// dependences; once the count drains the outgoing edge set is fixed
    pub fn add_mapping_reference(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        if st.gen != op.gen {
            return;
        }
        st.outstanding_mapping_references += 1;
    }

    pub fn remove_mapping_reference(&self, op: OpRef) {
        let rec = self.record(op.slot);
        {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            debug_assert!(st.outstanding_mapping_references > 0);
            st.outstanding_mapping_references -= 1;
        }
        self.try_commit(op);
    }

    // ============================================================================================
    // Trigger pipeline
    // ============================================================================================

    fn enqueue_trigger_mapping(&self, op: OpRef) {
        let ctx = self.arc();
        self.handles.pool.submit(move || ctx.trigger_mapping(op));
    }

    fn trigger_mapping(&self, op: OpRef) {
        let rec = self.record(op.slot);
        enum Action {
            Normal,
            Speculate(OpRef),
        }
        let action = {
            let mut st = rec.state.lock();
            if st.gen != op.gen || st.trigger_mapping_invoked {
                return;
            }
            st.trigger_mapping_invoked = true;
            match (st.payload.speculable(), st.predicate) {
                (true, Some(p)) => Action::Speculate(p),
                _ => Action::Normal,
            }
        };
        match action {
            Action::Normal => self.continue_mapping(op, true),
            Action::Speculate(pred) => self.trigger_mapping_speculative(op, pred),
        }
    }

    fn trigger_mapping_speculative(&self, op: OpRef, pred: OpRef) {
        let pred_rec = self.record(pred.slot);
        let sample = {
            let mut pst = pred_rec.state.lock();
            if pst.gen != pred.gen {
                // a referenced predicate never commits; a stale ref is a bug
                drop(pst);
                self.fail_operation(
                    op,
                    RuntimeError::InvalidHandle("stale predicate reference".to_string()),
                );
                return;
            }
            let OpPayload::Predicate(p) = &mut pst.payload else {
                drop(pst);
                self.fail_operation(
                    op,
                    RuntimeError::InvalidHandle("predicate handle names a non-predicate".into()),
                );
                return;
            };
            let sample = p.sample();
            if !sample.valid {
                // park (or speculate) until the predicate resolves
                p.waiters.push(PredicateWaiter {
                    op,
                    guess: sample.speculated.then_some(sample.value),
                });
            }
            sample
        };

        if sample.valid {
            if sample.value {
                self.mark_spec(op, SpecState::ResolveTrue);
                self.resolve_speculation(op);
                self.continue_mapping(op, false);
            } else {
                self.mark_spec(op, SpecState::ResolveFalse);
                self.skip_complete(op);
            }
        } else if sample.speculated {
            if sample.value {
                // run ahead; resolution confirms or quashes later
                self.mark_spec(op, SpecState::SpeculateTrue);
                self.continue_mapping(op, false);
            } else {
                // skip optimistically; dependents proceed, resolution
                // either confirms the skip or restarts them
                self.mark_spec(op, SpecState::SpeculateFalse);
                self.complete_mapping(op);
                self.complete_execution(op);
            }
        } else {
            self.mark_spec(op, SpecState::PendingPred);
        }
    }

    fn mark_spec(&self, op: OpRef, state: SpecState) {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        if st.gen == op.gen {
            st.spec_state = state;
        }
    }

    fn continue_mapping(&self, op: OpRef, resolve: bool) {
        self.complete_mapping(op);
        if resolve {
            self.resolve_speculation(op);
        }
        self.trigger_execution(op);
    }

    /// Predicated-false path: all stages bump with no observable effects
    fn skip_complete(&self, op: OpRef) {
        self.complete_mapping(op);
        self.complete_execution(op);
        self.resolve_speculation(op);
    }

    fn complete_mapping(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let notify: Vec<OpRef> = {
            let mut st = rec.state.lock();
            if st.gen != op.gen || st.mapped {
                return;
            }
            st.mapped = true;
            tracing::trace!(op = st.unique_id, "op_mapped");
            st.outgoing
                .iter()
                .map(|(slot, gen)| OpRef {
                    slot: *slot,
                    gen: *gen,
                })
                .collect()
        };
        for target in notify {
            self.notify_mapping_dependence(target, false);
        }
    }

    fn trigger_execution(&self, op: OpRef) {
        let rec = self.record(op.slot);
        enum Exec {
            Done,
            WaitPre(Event),
            Task {
                pre: Event,
                func_id: u64,
                args: Vec<u8>,
                result: Future,
            },
            Copy {
                pre: Event,
                body: Box<CopyOp>,
            },
            Fill {
                pre: Event,
                body: Box<FillOp>,
            },
            PredFuture(Future),
            PredChildren(Vec<OpRef>),
        }
        let action = {
            let st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            let pre = self.handles.events.merge(&st.precondition_events);
            match &st.payload {
                OpPayload::Task(t) => Exec::Task {
                    pre,
                    func_id: t.func_id,
                    args: t.args.clone(),
                    result: t.result.clone(),
                },
                OpPayload::Copy(c) => Exec::Copy {
                    pre,
                    body: Box::new(c.clone()),
                },
                OpPayload::Fill(f) => Exec::Fill {
                    pre,
                    body: Box::new(f.clone()),
                },
                // execution fences and deletions drain everything issued
                // earlier before they advance
                OpPayload::Fence(FenceKind::Execution) | OpPayload::Deletion(_) => {
                    Exec::WaitPre(pre)
                }
                OpPayload::Fence(FenceKind::Mapping)
                | OpPayload::Close(_)
                | OpPayload::Map(_)
                | OpPayload::Acquire(_)
                | OpPayload::Release(_) => Exec::Done,
                OpPayload::Predicate(p) => match &p.kind {
                    PredKind::Future(f) => Exec::PredFuture(f.clone()),
                    PredKind::Not(a) => Exec::PredChildren(vec![*a]),
                    PredKind::And(a, b) | PredKind::Or(a, b) => Exec::PredChildren(vec![*a, *b]),
                },
            }
        };

        let events = Arc::clone(&self.handles.events);
        match action {
            Exec::Done => self.complete_execution(op),
            Exec::WaitPre(pre) => {
                let ctx = self.arc();
                events.add_waiter(pre, move |outcome| match outcome {
                    Ok(()) => ctx.complete_execution(op),
                    Err(err) => ctx.fail_operation(op, err),
                });
            }
            Exec::Task {
                pre,
                func_id,
                args,
                result,
            } => {
                let ctx = self.arc();
                events.add_waiter(pre, move |outcome| match outcome {
                    Err(err) => ctx.fail_operation(op, err),
                    Ok(()) => match ctx.handles.tasks.get(func_id) {
                        None => ctx.fail_operation(
                            op,
                            RuntimeError::InvalidHandle(format!("task function {func_id}")),
                        ),
                        Some(f) => {
                            let bytes = f(&args);
                            result.set(bytes);
                            ctx.complete_execution(op);
                        }
                    },
                });
            }
            Exec::Copy { pre, body } => {
                let done = skein_dma::issue_copy(
                    body.srcs,
                    body.dsts,
                    body.redop,
                    body.domain,
                    Arc::clone(&self.handles.store),
                    Arc::clone(&self.handles.redops),
                    &events,
                    pre,
                    self.handles.local_node,
                );
                match done {
                    Err(err) => self.fail_operation(op, err),
                    Ok(done) => {
                        let ctx = self.arc();
                        events.add_waiter(done, move |outcome| match outcome {
                            Ok(()) => ctx.complete_execution(op),
                            Err(err) => ctx.fail_operation(op, err),
                        });
                    }
                }
            }
            Exec::Fill { pre, body } => {
                let done = skein_dma::issue_fill(
                    body.dsts,
                    &body.value,
                    body.domain,
                    Arc::clone(&self.handles.store),
                    &events,
                    pre,
                    self.handles.local_node,
                );
                match done {
                    Err(err) => self.fail_operation(op, err),
                    Ok(done) => {
                        let ctx = self.arc();
                        events.add_waiter(done, move |outcome| match outcome {
                            Ok(()) => ctx.complete_execution(op),
                            Err(err) => ctx.fail_operation(op, err),
                        });
                    }
                }
            }
            Exec::PredFuture(fut) => {
                let ctx = self.arc();
                let ev = fut.event();
                events.add_waiter(ev, move |outcome| match outcome {
                    Ok(()) => {
                        let value = fut.get_bool().unwrap_or(false);
                        ctx.resolve_predicate(op, value);
                    }
                    Err(err) => ctx.fail_operation(op, err),
                });
            }
            Exec::PredChildren(children) => {
                let mut observed = Vec::new();
                for (pos, child) in children.iter().enumerate() {
                    let crec = self.record(child.slot);
                    let mut cst = crec.state.lock();
                    if cst.gen != child.gen {
                        continue;
                    }
                    if let OpPayload::Predicate(cp) = &mut cst.payload {
                        match cp.value {
                            Some(v) => observed.push((pos, v)),
                            None => cp.parents.push(op),
                        }
                    }
                }
                let mut determined = None;
                if !observed.is_empty() {
                    let mut st = rec.state.lock();
                    if st.gen == op.gen {
                        if let OpPayload::Predicate(p) = &mut st.payload {
                            for (pos, v) in observed {
                                if let Some(v) = p.observe_child(pos, v) {
                                    determined = Some(v);
                                    break;
                                }
                            }
                        }
                    }
                }
                if let Some(v) = determined {
                    self.resolve_predicate(op, v);
                }
            }
        }
    }

    fn complete_execution(&self, op: OpRef) {
        self.stage_done(op, false);
    }

    /// Indicate the speculation for this operation has been resolved
    pub fn resolve_speculation(&self, op: OpRef) {
        self.stage_done(op, true);
    }

    fn stage_done(&self, op: OpRef, resolution: bool) {
        let rec = self.record(op.slot);
        let fire = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            if resolution {
                st.resolved = true;
            } else {
                st.executed = true;
            }
            let ready = st.mapped
                && st.executed
                && st.resolved
                && !st.failed
                && !st.trigger_complete_invoked;
            if ready {
                st.trigger_complete_invoked = true;
            }
            ready
        };
        if fire {
            self.complete_operation(op);
        }
    }

    fn complete_operation(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let (completion, verify_list, had_parent_ref) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            st.completed = true;
            st.check_invariants();
            tracing::trace!(op = st.unique_id, "op_completed");
            let verify: Vec<(OpRef, HashSet<u32>)> = st
                .verify_regions
                .drain()
                .map(|(slot, (gen, set))| (OpRef { slot, gen }, set))
                .collect();
            for (r, _) in &verify {
                st.commit_notified.insert(r.slot);
            }
            let ev = st.need_completion_trigger.then_some(st.completion_event);
            (ev, verify, st.track_parent)
        };
        if let Some(ev) = completion {
            self.handles.events.trigger(ev);
        }
        for (target, regions) in verify_list {
            self.notify_regions_verified(target, regions);
        }
        if had_parent_ref {
            // the parent no longer needs to add dependences to this op
            self.remove_mapping_reference(op);
        } else {
            self.try_commit(op);
        }
    }

    fn try_commit(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let commit = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            let ready = st.completed
                && !st.failed
                && !st.committed
                && st.outstanding_mapping_references == 0
                && st.outstanding_commit_deps == 0
                && !st.trigger_commit_invoked;
            if !ready {
                false
            } else if let OpPayload::Predicate(p) = &mut st.payload {
                if p.references > 0 {
                    // users may still sample; retried when the count drains
                    p.commit_deferred = true;
                    false
                } else {
                    st.trigger_commit_invoked = true;
                    true
                }
            } else {
                st.trigger_commit_invoked = true;
                true
            }
        };
        if commit {
            self.commit_operation(op);
        }
    }

    /// Win the race to call commit outside the normal flow
    ///
    /// Used by long-lived operations that manage commit externally.
    pub fn request_early_commit(&self, op: OpRef) -> bool {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        if st.gen != op.gen || st.trigger_commit_invoked {
            return false;
        }
        st.trigger_commit_invoked = true;
        true
    }

    /// Mark the operation's outputs copied to resilient storage
    ///
    /// Hardening is optional; commit never waits for it.
    pub fn harden_operation(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        if st.gen != op.gen {
            return;
        }
        debug_assert!(st.completed, "hardening before completion");
        st.hardened = true;
    }

    pub(crate) fn commit_operation(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let (commit_notify, deletion) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            st.committed = true;
            st.check_invariants();
            tracing::trace!(op = st.unique_id, "op_committed");
            let notify: Vec<OpRef> = st
                .incoming
                .iter()
                .filter(|(slot, _)| !st.commit_notified.contains(slot))
                .map(|(slot, gen)| OpRef {
                    slot: *slot,
                    gen: *gen,
                })
                .collect();
            let del = match &st.payload {
                OpPayload::Deletion(k) => Some(k.clone()),
                _ => None,
            };
            (notify, del)
        };
        for target in commit_notify {
            self.notify_commit_dependence(target);
        }
        if let Some(kind) = deletion {
            self.perform_deletion(&kind);
        }
        self.deactivate(op);
    }

    fn perform_deletion(&self, kind: &DeletionKind) {
        // the destructive step was deferred to commit
        if let DeletionKind::Region(id) = kind {
            let region = RegionHandle(*id);
            self.inner.lock().privileges.remove(&region);
            self.inner.lock().region_state.remove(&region);
        }
        tracing::debug!(?kind, "deletion_committed");
    }

    /// Fail the operation: poison its completion event, release dependents
    /// and reclaim the record without committing
    pub fn fail_operation(&self, op: OpRef, err: RuntimeError) {
        let rec = self.record(op.slot);
        let (completion, map_notify, commit_notify) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen || st.completed {
                return;
            }
            st.failed = true;
            st.completed = true;
            tracing::debug!(op = st.unique_id, error = %err, "op_failed");
            let map_notify: Vec<OpRef> = if st.mapped {
                Vec::new()
            } else {
                st.mapped = true;
                st.outgoing
                    .iter()
                    .map(|(slot, gen)| OpRef {
                        slot: *slot,
                        gen: *gen,
                    })
                    .collect()
            };
            let commit_notify: Vec<OpRef> = st
                .incoming
                .iter()
                .filter(|(slot, _)| !st.commit_notified.contains(slot))
                .map(|(slot, gen)| OpRef {
                    slot: *slot,
                    gen: *gen,
                })
                .collect();
            (st.completion_event, map_notify, commit_notify)
        };
        self.handles.events.poison(completion, err);
        for target in map_notify {
            self.notify_mapping_dependence(target, false);
        }
        for target in commit_notify {
            self.notify_commit_dependence(target);
        }
        self.deactivate(op);
    }

    /// Undo a speculative operation: its completion event fires in the
    /// failed state, dependents are re-notified (with the restart flag when
    /// the speculation skipped work that must now run), the generation is
    /// bumped and the record returns to the pool
    pub fn quash_operation(&self, op: OpRef, restart: bool) {
        let rec = self.record(op.slot);
        let (completion, map_notify, commit_notify, already_mapped) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            tracing::debug!(op = st.unique_id, restart, "op_quashed");
            let already_mapped = st.mapped;
            let map_notify: Vec<OpRef> = if st.mapped {
                Vec::new()
            } else {
                st.mapped = true;
                st.outgoing
                    .iter()
                    .map(|(slot, gen)| OpRef {
                        slot: *slot,
                        gen: *gen,
                    })
                    .collect()
            };
            let commit_notify: Vec<OpRef> = st
                .incoming
                .iter()
                .filter(|(slot, _)| !st.commit_notified.contains(slot))
                .map(|(slot, gen)| OpRef {
                    slot: *slot,
                    gen: *gen,
                })
                .collect();
            st.failed = true;
            st.completed = true;
            (st.completion_event, map_notify, commit_notify, already_mapped)
        };
        self.handles.events.poison(
            completion,
            RuntimeError::invalid("operation quashed by false predicate"),
        );
        if restart && already_mapped {
            // dependents were already released by the optimistic mapping;
            // they re-observe through the poisoned completion event
            tracing::warn!("mis-speculated skip: dependents cannot be rolled back");
        }
        for target in map_notify {
            self.notify_mapping_dependence(target, restart);
        }
        for target in commit_notify {
            self.notify_commit_dependence(target);
        }
        self.deactivate(op);
    }

    // ============================================================================================
    // Predicate resolution
    // ============================================================================================

    pub(crate) fn resolve_predicate(&self, op: OpRef, value: bool) {
        let rec = self.record(op.slot);
        let (waiters, parents) = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            let unique_id = st.unique_id;
            let OpPayload::Predicate(p) = &mut st.payload else {
                return;
            };
            if p.value.is_some() {
                return;
            }
            p.value = Some(value);
            tracing::debug!(op = unique_id, value, "predicate_resolved");
            (std::mem::take(&mut p.waiters), p.parents.clone())
        };
        // resolution is the predicate's execution
        self.complete_execution(op);

        for w in waiters {
            match w.guess {
                None => {
                    if value {
                        self.mark_spec(w.op, SpecState::ResolveTrue);
                        self.resolve_speculation(w.op);
                        self.continue_mapping(w.op, false);
                    } else {
                        self.mark_spec(w.op, SpecState::ResolveFalse);
                        self.skip_complete(w.op);
                    }
                }
                Some(guess) if guess == value => {
                    self.mark_spec(
                        w.op,
                        if value {
                            SpecState::ResolveTrue
                        } else {
                            SpecState::ResolveFalse
                        },
                    );
                    self.resolve_speculation(w.op);
                }
                // ran ahead on true, but the predicate came back false
                Some(true) => self.quash_operation(w.op, false),
                // skipped on false, but the work must actually run
                Some(false) => self.quash_operation(w.op, true),
            }
        }
        for parent in parents {
            self.observe_child_resolution(parent, op, value);
        }
    }

    fn observe_child_resolution(&self, parent: OpRef, child: OpRef, value: bool) {
        let rec = self.record(parent.slot);
        let determined = {
            let mut st = rec.state.lock();
            if st.gen != parent.gen {
                return;
            }
            let OpPayload::Predicate(p) = &mut st.payload else {
                return;
            };
            let pos = match &p.kind {
                PredKind::Not(a) => (*a == child).then_some(0),
                PredKind::And(a, b) | PredKind::Or(a, b) => {
                    if *a == child {
                        Some(0)
                    } else if *b == child {
                        Some(1)
                    } else {
                        None
                    }
                }
                PredKind::Future(_) => None,
            };
            pos.and_then(|pos| p.observe_child(pos, value))
        };
        if let Some(v) = determined {
            self.resolve_predicate(parent, v);
        }
    }

    fn add_predicate_reference(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let mut st = rec.state.lock();
        if st.gen != op.gen {
            return;
        }
        if let OpPayload::Predicate(p) = &mut st.payload {
            p.references += 1;
        }
    }

    fn remove_predicate_reference(&self, op: OpRef) {
        let rec = self.record(op.slot);
        let retry = {
            let mut st = rec.state.lock();
            if st.gen != op.gen {
                return;
            }
            let OpPayload::Predicate(p) = &mut st.payload else {
                return;
            };
            debug_assert!(p.references > 0);
            p.references -= 1;
            p.references == 0
        };
        if retry {
            self.try_commit(op);
        }
    }

    // ============================================================================================
    // Verbs
    // ============================================================================================

    /// Launch a task; the returned future carries its result bytes
    #[tracing::instrument(skip(self, launch), fields(func = launch.func_id))]
    pub fn spawn_task(&self, launch: TaskLaunch) -> Result<Future> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let future = Future::new(completion);
        let payload = OpPayload::Task(TaskOp {
            func_id: launch.func_id,
            args: launch.args,
            requirements: launch.requirements,
            result: future.clone(),
        });
        let op = self.alloc_op(payload, completion, true, true);
        self.attach_predicate(op, launch.predicate);
        self.analyze(op)?;
        Ok(future)
    }

    /// Issue an explicit copy (or reduction); completion via the event
    pub fn issue_copy(&self, launch: CopyLaunch) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let predicate = launch.predicate;
        let payload = OpPayload::Copy(CopyOp {
            srcs: launch.srcs,
            dsts: launch.dsts,
            redop: launch.redop,
            domain: launch.domain,
            src_requirements: launch.src_requirements,
            dst_requirements: launch.dst_requirements,
        });
        let op = self.alloc_op(payload, completion, true, true);
        self.attach_predicate(op, predicate);
        self.analyze(op)?;
        Ok(completion)
    }

    /// Issue a fill of one or more destination fields
    pub fn issue_fill(&self, launch: FillLaunch) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let payload = OpPayload::Fill(FillOp {
            dsts: launch.dsts,
            value: launch.value,
            domain: launch.domain,
            requirement: launch.requirement,
        });
        let op = self.alloc_op(payload, completion, true, true);
        self.analyze(op)?;
        Ok(completion)
    }

    /// Issue a mapping or execution fence
    pub fn issue_fence(&self, kind: FenceKind) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(OpPayload::Fence(kind), completion, true, true);
        self.analyze(op)?;
        Ok(completion)
    }

    /// Inline-map a region; the result is usable when `ready` triggers
    ///
    /// Inline mappings complete and commit immediately after mapping;
    /// mapped data escapes to the application and cannot be rolled back.
    pub fn map_region(&self, requirement: RegionRequirement) -> Result<PhysicalRegion> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(
            OpPayload::Map(MapOp { requirement }),
            completion,
            true,
            true,
        );
        self.analyze(op)?;
        Ok(PhysicalRegion {
            region: requirement.region,
            ready: completion,
        })
    }

    /// User-level coherence acquire
    pub fn acquire(
        &self,
        requirement: RegionRequirement,
        predicate: Option<PredicateHandle>,
    ) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(
            OpPayload::Acquire(AcquireOp { requirement }),
            completion,
            true,
            true,
        );
        self.attach_predicate(op, predicate);
        self.analyze(op)?;
        Ok(completion)
    }

    /// User-level coherence release
    pub fn release(
        &self,
        requirement: RegionRequirement,
        predicate: Option<PredicateHandle>,
    ) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(
            OpPayload::Release(ReleaseOp { requirement }),
            completion,
            true,
            true,
        );
        self.attach_predicate(op, predicate);
        self.analyze(op)?;
        Ok(completion)
    }

    /// Close region state back into a prior instance
    ///
    /// Normally runtime-internal; exposed for embedding runtimes that
    /// manage physical state themselves.
    pub fn issue_close(&self, requirement: RegionRequirement) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(
            OpPayload::Close(CloseOp { requirement }),
            completion,
            true,
            true,
        );
        self.analyze(op)?;
        Ok(completion)
    }

    /// Defer a deletion until every earlier operation is done with the
    /// resource; the destructive step runs at commit
    pub fn delete(&self, kind: DeletionKind) -> Result<Event> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(OpPayload::Deletion(kind), completion, true, true);
        self.analyze(op)?;
        Ok(completion)
    }

    fn attach_predicate(&self, op: OpRef, predicate: Option<PredicateHandle>) {
        if let Some(h) = predicate {
            // the op holds its own reference until it deactivates
            self.add_predicate_reference(h.op);
            let rec = self.record(op.slot);
            let mut st = rec.state.lock();
            if st.gen == op.gen {
                st.predicate = Some(h.op);
            }
        }
    }

    // ============================================================================================
    // Predicate verbs
    // ============================================================================================

    /// Build a predicate from a boolean future
    pub fn create_future_predicate(&self, future: Future) -> Result<PredicateHandle> {
        self.make_predicate(PredKind::Future(future), &[])
    }

    /// Negate a predicate
    pub fn predicate_not(&self, p: PredicateHandle) -> Result<PredicateHandle> {
        self.make_predicate(PredKind::Not(p.op), &[p])
    }

    /// Conjoin two predicates
    pub fn predicate_and(
        &self,
        a: PredicateHandle,
        b: PredicateHandle,
    ) -> Result<PredicateHandle> {
        self.make_predicate(PredKind::And(a.op, b.op), &[a, b])
    }

    /// Disjoin two predicates
    pub fn predicate_or(
        &self,
        a: PredicateHandle,
        b: PredicateHandle,
    ) -> Result<PredicateHandle> {
        self.make_predicate(PredKind::Or(a.op, b.op), &[a, b])
    }

    fn make_predicate(
        &self,
        kind: PredKind,
        children: &[PredicateHandle],
    ) -> Result<PredicateHandle> {
        self.check_live()?;
        let completion = self.handles.events.create();
        let op = self.alloc_op(
            OpPayload::Predicate(PredicateState::new(kind)),
            completion,
            true,
            true,
        );
        // the combinator holds its children; released at deactivation
        for c in children {
            self.add_predicate_reference(c.op);
        }
        // the caller's sampling reference
        self.add_predicate_reference(op);
        self.analyze(op)?;
        Ok(PredicateHandle { op })
    }

    /// Allow (or forbid) speculation on an unresolved predicate
    pub fn set_predicate_speculation(&self, p: PredicateHandle, guess: Option<bool>) {
        let rec = self.record(p.op.slot);
        let mut st = rec.state.lock();
        if st.gen != p.op.gen {
            return;
        }
        if let OpPayload::Predicate(ps) = &mut st.payload {
            ps.speculate_guess = guess;
        }
    }

    /// Drop the caller's sampling reference
    pub fn release_predicate(&self, p: PredicateHandle) {
        self.remove_predicate_reference(p.op);
    }

    // ============================================================================================
    // Partitioning verbs (routed to the engine)
    // ============================================================================================

    /// Split an index space into pieces keyed by a scalar field value
    pub fn create_partition_by_field<T>(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<skein_dma::FieldDataDescriptor<1>>,
        colors: Vec<T>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event)
    where
        T: bytemuck::Pod + PartialEq + Send + Sync + 'static,
    {
        self.handles
            .partition
            .by_field(parent, field_data, colors, wait_on)
    }

    /// Forward-map source subsets through a pointer field
    pub fn create_partition_by_image(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<skein_dma::FieldDataDescriptor<1>>,
        sources: Vec<IndexSpace<1>>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        self.handles
            .partition
            .by_image(parent, field_data, sources, wait_on)
    }

    /// Inverse-map target subsets through a pointer field
    pub fn create_partition_by_preimage(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<skein_dma::FieldDataDescriptor<1>>,
        targets: Vec<IndexSpace<1>>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        self.handles
            .partition
            .by_preimage(parent, field_data, targets, wait_on)
    }

    /// Split an index space into pieces of the given point counts
    pub fn create_partition_by_weights(
        &self,
        parent: &IndexSpace<1>,
        weights: Vec<usize>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        self.handles.partition.weighted_subspaces(parent, weights, wait_on)
    }

    /// Split an index space into near-equal pieces
    pub fn create_partition_by_equal(
        &self,
        parent: &IndexSpace<1>,
        count: usize,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        self.handles.partition.equal_subspaces(parent, count, wait_on)
    }

    /// Union of two index spaces
    pub fn compute_union(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        self.handles.partition.union(lhs, rhs, wait_on)
    }

    /// Intersection of two index spaces
    pub fn compute_intersection(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        self.handles.partition.intersection(lhs, rhs, wait_on)
    }

    /// Difference of two index spaces
    pub fn compute_difference(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        self.handles.partition.difference(lhs, rhs, wait_on)
    }

    // ============================================================================================
    // Draining
    // ============================================================================================

    /// Number of tracked operations that have not yet committed
    pub fn in_flight(&self) -> usize {
        self.inner.lock().window.len()
    }

    /// An event covering completion of everything currently in flight
    pub fn drain(&self) -> Event {
        let window: Vec<OpRef> = self.inner.lock().window.clone();
        let mut events = Vec::new();
        for op in window {
            let rec = self.record(op.slot);
            let st = rec.state.lock();
            if st.gen == op.gen {
                events.push(st.completion_event);
            }
        }
        self.handles.events.merge(&events)
    }
}

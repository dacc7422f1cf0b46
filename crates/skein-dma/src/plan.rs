//! Transfer planning and execution
//!
//! A logical copy/fill/reduce request is lowered to one or more
//! [`TransferPlan`]s before anything moves:
//!
//! - **Copy plans** group fields by `(source memory, destination memory)`
//!   pair; within a pair, source and destination field runs are concatenated
//!   by suboffset until either run is exhausted. A field with a serdez id
//!   always gets a plan of its own.
//! - **Reduce plans** require every source on one node and exactly one
//!   destination field.
//! - **Fill plans** take one destination field each, with a packed walk of
//!   the fill value.
//!
//! Each plan picks its executing node from the source/destination memory
//! kinds; execution completes a per-plan event and the request completes on
//! the merge of all of them.

use crate::instance::RegionInstance;
use crate::iterator::{AddressInfo, FieldSlice, TransferIterator};
use crate::memory::{MemoryId, MemoryStore, NodeId};
use skein_base::{Event, EventTable, IndexSpace, Result, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;

/// Byte budget per dual-iterator step during execution
const EXEC_CHUNK_BYTES: usize = 1 << 16;

/// One side of a copy/reduce/fill request: an instance field
#[derive(Clone)]
pub struct CopySrcDstField<const N: usize> {
    pub inst: RegionInstance<N>,
    pub field: usize,
    pub size: usize,
    /// Non-zero routes the field through its own serialization plan
    pub serdez_id: u32,
}

impl<const N: usize> CopySrcDstField<N> {
    pub fn new(inst: RegionInstance<N>, field: usize) -> Self {
        let size = inst.layout.fields[field].size;
        Self {
            inst,
            field,
            size,
            serdez_id: 0,
        }
    }

    pub fn with_serdez(mut self, serdez_id: u32) -> Self {
        self.serdez_id = serdez_id;
        self
    }
}

/// A matched byte run between one source field and one destination field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetsAndSize {
    pub src_field: usize,
    pub src_suboffset: usize,
    pub dst_field: usize,
    pub dst_suboffset: usize,
    pub size: usize,
    pub serdez_id: u32,
}

/// Reduction operator table
///
/// Operators combine a source element into a destination element in place;
/// `fold` selects the fold variant for deferred reduction buffers.
pub struct ReductionOps {
    ops: HashMap<u32, fn(&mut [u8], &[u8], bool)>,
}

/// Built-in reduction op: 32-bit integer sum
pub const REDOP_SUM_I32: u32 = 1;
/// Built-in reduction op: 32-bit integer max
pub const REDOP_MAX_I32: u32 = 2;

fn red_sum_i32(dst: &mut [u8], src: &[u8], _fold: bool) {
    let d = i32::from_le_bytes(dst[..4].try_into().unwrap());
    let s = i32::from_le_bytes(src[..4].try_into().unwrap());
    dst[..4].copy_from_slice(&(d.wrapping_add(s)).to_le_bytes());
}

fn red_max_i32(dst: &mut [u8], src: &[u8], _fold: bool) {
    let d = i32::from_le_bytes(dst[..4].try_into().unwrap());
    let s = i32::from_le_bytes(src[..4].try_into().unwrap());
    dst[..4].copy_from_slice(&d.max(s).to_le_bytes());
}

impl Default for ReductionOps {
    fn default() -> Self {
        let mut ops: HashMap<u32, fn(&mut [u8], &[u8], bool)> = HashMap::new();
        ops.insert(REDOP_SUM_I32, red_sum_i32);
        ops.insert(REDOP_MAX_I32, red_max_i32);
        Self { ops }
    }
}

impl ReductionOps {
    pub fn register(&mut self, id: u32, f: fn(&mut [u8], &[u8], bool)) {
        self.ops.insert(id, f);
    }

    pub fn get(&self, id: u32) -> Result<fn(&mut [u8], &[u8], bool)> {
        self.ops
            .get(&id)
            .copied()
            .ok_or_else(|| RuntimeError::InvalidHandle(format!("reduction op {id}")))
    }
}

/// One executable unit of a transfer request
pub enum TransferPlan<const N: usize> {
    Copy {
        src_inst: RegionInstance<N>,
        dst_inst: RegionInstance<N>,
        entries: Vec<OffsetsAndSize>,
    },
    Reduce {
        srcs: Vec<CopySrcDstField<N>>,
        dst: CopySrcDstField<N>,
        redop: u32,
        fold: bool,
    },
    Fill {
        dst: CopySrcDstField<N>,
        value: Vec<u8>,
    },
}

/// Pick the node that should execute a copy between two memories
///
/// ```text
/// src \ dst | RDMA-global       | local
/// ----------+-------------------+---------
/// RDMA      | local node (warn) | receiver
/// local     | sender            | sender
/// ```
pub fn select_dma_node(src_mem: MemoryId, dst_mem: MemoryId, local: NodeId) -> NodeId {
    let src_is_rdma = src_mem.kind.is_rdma();
    let dst_is_rdma = dst_mem.kind.is_rdma();
    if src_is_rdma {
        if dst_is_rdma {
            tracing::warn!(
                src = %src_mem,
                dst = %dst_mem,
                node = local.0,
                "global-to-global copy being serialized on local node"
            );
            local
        } else {
            // gathers run best at the receiver
            dst_mem.node
        }
    } else {
        // writing outward is best done by the sender, which may also be
        // the target
        src_mem.node
    }
}

impl<const N: usize> TransferPlan<N> {
    /// The node this plan executes on
    pub fn executing_node(&self, local: NodeId) -> NodeId {
        match self {
            TransferPlan::Copy {
                src_inst, dst_inst, ..
            } => select_dma_node(src_inst.memory, dst_inst.memory, local),
            // reductions always run where the sources live
            TransferPlan::Reduce { srcs, .. } => srcs[0].inst.memory.node,
            TransferPlan::Fill { dst, .. } => dst.inst.memory.node,
        }
    }

    /// Lower a copy or reduction request to plans
    pub fn plan_copy(
        srcs: &[CopySrcDstField<N>],
        dsts: &[CopySrcDstField<N>],
        redop: Option<(u32, bool)>,
    ) -> Result<Vec<TransferPlan<N>>> {
        if let Some((redop, fold)) = redop {
            // every source must live on one node
            let node = srcs
                .first()
                .ok_or_else(|| RuntimeError::invalid("reduction with no sources"))?
                .inst
                .memory
                .node;
            if srcs.iter().any(|s| s.inst.memory.node != node) {
                return Err(RuntimeError::invalid(
                    "reduction sources span multiple nodes",
                ));
            }
            if dsts.len() != 1 {
                return Err(RuntimeError::invalid(format!(
                    "reduction needs exactly one destination field, got {}",
                    dsts.len()
                )));
            }
            return Ok(vec![TransferPlan::Reduce {
                srcs: srcs.to_vec(),
                dst: dsts[0].clone(),
                redop,
                fold,
            }]);
        }

        // pair up source and destination byte runs
        type InstPair = (u64, u64);
        type MemPair = (MemoryId, MemoryId);
        struct Group<const N: usize> {
            src_inst: RegionInstance<N>,
            dst_inst: RegionInstance<N>,
            entries: Vec<OffsetsAndSize>,
        }
        let mut by_mem: HashMap<MemPair, HashMap<InstPair, Group<N>>> = HashMap::new();
        let mut plans = Vec::new();

        let mut src_it = srcs.iter();
        let mut dst_it = dsts.iter();
        let (mut cur_src, mut cur_dst) = (src_it.next(), dst_it.next());
        let (mut src_sub, mut dst_sub) = (0usize, 0usize);
        while let (Some(src), Some(dst)) = (cur_src, cur_dst) {
            let size = (src.size - src_sub).min(dst.size - dst_sub);
            let oas = OffsetsAndSize {
                src_field: src.field,
                src_suboffset: src_sub,
                dst_field: dst.field,
                dst_suboffset: dst_sub,
                size,
                serdez_id: src.serdez_id,
            };
            if oas.serdez_id != 0 {
                // serialized fields cannot be batched with plain byte copies
                plans.push(TransferPlan::Copy {
                    src_inst: src.inst.clone(),
                    dst_inst: dst.inst.clone(),
                    entries: vec![oas],
                });
            } else {
                let mem_pair = (src.inst.memory, dst.inst.memory);
                let inst_pair = (src.inst.id, dst.inst.id);
                by_mem
                    .entry(mem_pair)
                    .or_default()
                    .entry(inst_pair)
                    .or_insert_with(|| Group {
                        src_inst: src.inst.clone(),
                        dst_inst: dst.inst.clone(),
                        entries: Vec::new(),
                    })
                    .entries
                    .push(oas);
            }
            src_sub += size;
            debug_assert!(src_sub <= src.size);
            if src_sub == src.size {
                cur_src = src_it.next();
                src_sub = 0;
            }
            dst_sub += size;
            debug_assert!(dst_sub <= dst.size);
            if dst_sub == dst.size {
                cur_dst = dst_it.next();
                dst_sub = 0;
            }
        }
        if cur_src.is_some() || cur_dst.is_some() {
            return Err(RuntimeError::invalid(
                "source and destination field runs have different total sizes",
            ));
        }

        tracing::debug!(mem_pairs = by_mem.len(), "copy request planned");
        for (_, by_inst) in by_mem {
            for (_, group) in by_inst {
                plans.push(TransferPlan::Copy {
                    src_inst: group.src_inst,
                    dst_inst: group.dst_inst,
                    entries: group.entries,
                });
            }
        }
        Ok(plans)
    }

    /// Lower a fill request to one plan per destination field
    ///
    /// `fill_value` looks like a packed struct with a value per field in
    /// order. A field that consumes the whole value lets the next field
    /// reuse it.
    pub fn plan_fill(
        dsts: &[CopySrcDstField<N>],
        fill_value: &[u8],
    ) -> Result<Vec<TransferPlan<N>>> {
        let mut plans = Vec::new();
        let mut fill_ofs = 0usize;
        for dst in dsts {
            if fill_ofs + dst.size > fill_value.len() {
                return Err(RuntimeError::invalid(format!(
                    "insufficient fill data: need at least {} bytes, have {}",
                    fill_ofs + dst.size,
                    fill_value.len()
                )));
            }
            plans.push(TransferPlan::Fill {
                dst: dst.clone(),
                value: fill_value[fill_ofs..fill_ofs + dst.size].to_vec(),
            });
            if fill_ofs > 0 || dst.size != fill_value.len() {
                fill_ofs += dst.size;
            }
        }
        Ok(plans)
    }

    /// Execute this plan over `domain` against host-visible memory
    pub fn execute(
        &self,
        domain: &IndexSpace<N>,
        store: &MemoryStore,
        redops: &ReductionOps,
    ) -> Result<()> {
        match self {
            TransferPlan::Copy {
                src_inst,
                dst_inst,
                entries,
            } => {
                let src_slices = entries
                    .iter()
                    .map(|e| FieldSlice {
                        field: e.src_field,
                        suboffset: e.src_suboffset,
                        size: e.size,
                    })
                    .collect();
                let dst_slices = entries
                    .iter()
                    .map(|e| FieldSlice {
                        field: e.dst_field,
                        suboffset: e.dst_suboffset,
                        size: e.size,
                    })
                    .collect();
                let mut src = TransferIterator::new(domain, src_inst.clone(), src_slices, 0);
                let mut dst = TransferIterator::new(domain, dst_inst.clone(), dst_slices, 0);
                pump_copy(store, src_inst.memory, &mut src, dst_inst.memory, &mut dst)
            }
            TransferPlan::Reduce {
                srcs,
                dst,
                redop,
                fold,
            } => {
                let apply = redops.get(*redop)?;
                for src in srcs {
                    for p in domain.points() {
                        let s = store.read(
                            src.inst.memory,
                            src.inst.byte_address(p, src.field),
                            src.size,
                        )?;
                        let off = dst.inst.byte_address(p, dst.field);
                        let mut d = store.read(dst.inst.memory, off, dst.size)?;
                        apply(&mut d, &s, *fold);
                        store.write(dst.inst.memory, off, &d)?;
                    }
                }
                Ok(())
            }
            TransferPlan::Fill { dst, value } => {
                for p in domain.points() {
                    store.write(
                        dst.inst.memory,
                        dst.inst.byte_address(p, dst.field),
                        value,
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// Copy between two iterators, matching chunk sizes by shrinking budgets
fn pump_copy<const N: usize>(
    store: &MemoryStore,
    src_mem: MemoryId,
    src: &mut TransferIterator<N>,
    dst_mem: MemoryId,
    dst: &mut TransferIterator<N>,
) -> Result<()> {
    while !src.done() && !dst.done() {
        let mut budget = EXEC_CHUNK_BYTES;
        loop {
            let s = src
                .step(budget, true)
                .ok_or_else(|| RuntimeError::invalid("transfer budget below element size"))?;
            let d = dst
                .step(budget, true)
                .ok_or_else(|| RuntimeError::invalid("transfer budget below element size"))?;
            let n = s.total_bytes().min(d.total_bytes());
            if s.total_bytes() == n && d.total_bytes() == n {
                src.confirm_step();
                dst.confirm_step();
                copy_chunk(store, src_mem, &s, dst_mem, &d)?;
                break;
            }
            src.cancel_step();
            dst.cancel_step();
            budget = n;
        }
    }
    debug_assert!(src.done() && dst.done());
    Ok(())
}

fn copy_chunk(
    store: &MemoryStore,
    src_mem: MemoryId,
    src: &AddressInfo,
    dst_mem: MemoryId,
    dst: &AddressInfo,
) -> Result<()> {
    // flatten the source chunk into transfer order
    let mut bytes = Vec::with_capacity(src.total_bytes());
    for pl in 0..src.num_planes {
        for ln in 0..src.num_lines {
            let base = src.base_offset + pl * src.plane_stride + ln * src.line_stride;
            bytes.extend(store.read(src_mem, base, src.bytes_per_chunk)?);
        }
    }
    // scatter into the destination shape
    let mut ofs = 0;
    for pl in 0..dst.num_planes {
        for ln in 0..dst.num_lines {
            let base = dst.base_offset + pl * dst.plane_stride + ln * dst.line_stride;
            store.write(dst_mem, base, &bytes[ofs..ofs + dst.bytes_per_chunk])?;
            ofs += dst.bytes_per_chunk;
        }
    }
    Ok(())
}

/// Plan and execute a copy request, returning its completion event
///
/// The work runs when `wait_on` triggers; the returned event is the merge
/// of every per-plan completion.
#[allow(clippy::too_many_arguments)]
pub fn issue_copy<const N: usize>(
    srcs: Vec<CopySrcDstField<N>>,
    dsts: Vec<CopySrcDstField<N>>,
    redop: Option<(u32, bool)>,
    domain: IndexSpace<N>,
    store: Arc<MemoryStore>,
    redops: Arc<ReductionOps>,
    events: &Arc<EventTable>,
    wait_on: Event,
    local: NodeId,
) -> Result<Event> {
    let plans = TransferPlan::plan_copy(&srcs, &dsts, redop)?;
    Ok(execute_plans(plans, domain, store, redops, events, wait_on, local))
}

/// Plan and execute a fill request, returning its completion event
pub fn issue_fill<const N: usize>(
    dsts: Vec<CopySrcDstField<N>>,
    fill_value: &[u8],
    domain: IndexSpace<N>,
    store: Arc<MemoryStore>,
    events: &Arc<EventTable>,
    wait_on: Event,
    local: NodeId,
) -> Result<Event> {
    let plans = TransferPlan::plan_fill(&dsts, fill_value)?;
    Ok(execute_plans(
        plans,
        domain,
        store,
        Arc::new(ReductionOps::default()),
        events,
        wait_on,
        local,
    ))
}

/// Run each plan once `wait_on` triggers; merge the per-plan completions
pub fn execute_plans<const N: usize>(
    plans: Vec<TransferPlan<N>>,
    domain: IndexSpace<N>,
    store: Arc<MemoryStore>,
    redops: Arc<ReductionOps>,
    events: &Arc<EventTable>,
    wait_on: Event,
    local: NodeId,
) -> Event {
    let mut finish_events = Vec::with_capacity(plans.len());
    for plan in plans {
        let done = events.create();
        finish_events.push(done);
        let node = plan.executing_node(local);
        tracing::debug!(node = node.0, "transfer plan scheduled");
        let store = Arc::clone(&store);
        let redops = Arc::clone(&redops);
        let domain = domain.clone();
        let events2 = Arc::clone(events);
        events.add_waiter(wait_on, move |outcome| {
            let result = outcome.and_then(|()| plan.execute(&domain, &store, &redops));
            match result {
                Ok(()) => events2.trigger(done),
                Err(err) => events2.poison(done, err),
            }
        });
    }
    events.merge(&finish_events)
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;
    use skein_base::Rect;

    fn setup() -> (Arc<MemoryStore>, MemoryId, MemoryId) {
        let store = Arc::new(MemoryStore::new());
        let a = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 1 << 16);
        let b = store.create_memory(NodeId(1), MemoryKind::SystemLocal, 1 << 16);
        (store, a, b)
    }

    fn inst_1d(
        store: &MemoryStore,
        mem: MemoryId,
        len: i64,
        field_sizes: &[usize],
    ) -> RegionInstance<1> {
        RegionInstance::create(store, mem, &IndexSpace::dense(Rect::span(0, len - 1)), field_sizes)
            .unwrap()
    }

    #[test]
    fn test_plan_copy_groups_by_mem_pair() {
        let (store, mem_a, mem_b) = setup();
        let src1 = inst_1d(&store, mem_a, 8, &[4]);
        let src2 = inst_1d(&store, mem_b, 8, &[4]);
        let dst = inst_1d(&store, mem_a, 8, &[4, 4]);

        let srcs = vec![
            CopySrcDstField::new(src1, 0),
            CopySrcDstField::new(src2, 0),
        ];
        let dsts = vec![
            CopySrcDstField::new(dst.clone(), 0),
            CopySrcDstField::new(dst, 1),
        ];
        let plans = TransferPlan::plan_copy(&srcs, &dsts, None).unwrap();
        // two distinct (src_mem, dst_mem) pairs -> two copy plans
        assert_eq!(plans.len(), 2);
        for p in &plans {
            match p {
                TransferPlan::Copy { entries, .. } => assert_eq!(entries.len(), 1),
                _ => panic!("expected copy plan"),
            }
        }
    }

    #[test]
    fn test_plan_copy_concatenates_runs() {
        let (store, mem_a, _) = setup();
        // one 8-byte source field feeds two 4-byte destination fields
        let src = inst_1d(&store, mem_a, 8, &[8]);
        let dst = inst_1d(&store, mem_a, 8, &[4, 4]);
        let srcs = vec![CopySrcDstField::new(src, 0)];
        let dsts = vec![
            CopySrcDstField::new(dst.clone(), 0),
            CopySrcDstField::new(dst, 1),
        ];
        let plans = TransferPlan::plan_copy(&srcs, &dsts, None).unwrap();
        assert_eq!(plans.len(), 1);
        match &plans[0] {
            TransferPlan::Copy { entries, .. } => {
                assert_eq!(
                    entries[0],
                    OffsetsAndSize {
                        src_field: 0,
                        src_suboffset: 0,
                        dst_field: 0,
                        dst_suboffset: 0,
                        size: 4,
                        serdez_id: 0
                    }
                );
                assert_eq!(
                    entries[1],
                    OffsetsAndSize {
                        src_field: 0,
                        src_suboffset: 4,
                        dst_field: 1,
                        dst_suboffset: 0,
                        size: 4,
                        serdez_id: 0
                    }
                );
            }
            _ => panic!("expected copy plan"),
        }
    }

    #[test]
    fn test_serdez_field_gets_own_plan() {
        let (store, mem_a, _) = setup();
        let src = inst_1d(&store, mem_a, 8, &[4, 4]);
        let dst = inst_1d(&store, mem_a, 8, &[4, 4]);
        let srcs = vec![
            CopySrcDstField::new(src.clone(), 0).with_serdez(9),
            CopySrcDstField::new(src, 1),
        ];
        let dsts = vec![
            CopySrcDstField::new(dst.clone(), 0),
            CopySrcDstField::new(dst, 1),
        ];
        let plans = TransferPlan::plan_copy(&srcs, &dsts, None).unwrap();
        assert_eq!(plans.len(), 2);
        let serdez_plans = plans
            .iter()
            .filter(|p| match p {
                TransferPlan::Copy { entries, .. } => entries.iter().any(|e| e.serdez_id != 0),
                _ => false,
            })
            .count();
        assert_eq!(serdez_plans, 1);
    }

    #[test]
    fn test_mismatched_runs_rejected() {
        let (store, mem_a, _) = setup();
        let src = inst_1d(&store, mem_a, 8, &[8]);
        let dst = inst_1d(&store, mem_a, 8, &[4]);
        let plans = TransferPlan::plan_copy(
            &[CopySrcDstField::new(src, 0)],
            &[CopySrcDstField::new(dst, 0)],
            None,
        );
        assert!(plans.is_err());
    }

    #[test]
    fn test_reduction_validation() {
        let (store, mem_a, mem_b) = setup();
        let s1 = inst_1d(&store, mem_a, 4, &[4]);
        let s2 = inst_1d(&store, mem_b, 4, &[4]);
        let d = inst_1d(&store, mem_a, 4, &[4]);
        // sources on different nodes are rejected
        let err = TransferPlan::plan_copy(
            &[CopySrcDstField::new(s1.clone(), 0), CopySrcDstField::new(s2, 0)],
            &[CopySrcDstField::new(d.clone(), 0)],
            Some((REDOP_SUM_I32, false)),
        );
        assert!(err.is_err());
        // single-node single-destination reduction plans fine
        let ok = TransferPlan::plan_copy(
            &[CopySrcDstField::new(s1, 0)],
            &[CopySrcDstField::new(d, 0)],
            Some((REDOP_SUM_I32, false)),
        )
        .unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn test_fill_value_packing() {
        let (store, mem_a, _) = setup();
        let dst = inst_1d(&store, mem_a, 4, &[4, 4]);
        // 8-byte packed value split across two 4-byte fields
        let plans = TransferPlan::plan_fill(
            &[
                CopySrcDstField::new(dst.clone(), 0),
                CopySrcDstField::new(dst.clone(), 1),
            ],
            &[1, 2, 3, 4, 5, 6, 7, 8],
        )
        .unwrap();
        assert_eq!(plans.len(), 2);
        match (&plans[0], &plans[1]) {
            (TransferPlan::Fill { value: v0, .. }, TransferPlan::Fill { value: v1, .. }) => {
                assert_eq!(v0, &vec![1, 2, 3, 4]);
                assert_eq!(v1, &vec![5, 6, 7, 8]);
            }
            _ => panic!("expected fill plans"),
        }
        // a field consuming the whole value lets the next reuse it
        let reuse = TransferPlan::plan_fill(
            &[
                CopySrcDstField::new(dst.clone(), 0),
                CopySrcDstField::new(dst, 1),
            ],
            &[9, 9, 9, 9],
        )
        .unwrap();
        match (&reuse[0], &reuse[1]) {
            (TransferPlan::Fill { value: v0, .. }, TransferPlan::Fill { value: v1, .. }) => {
                assert_eq!(v0, v1);
            }
            _ => panic!("expected fill plans"),
        }
    }

    #[test]
    fn test_fill_insufficient_data() {
        let (store, mem_a, _) = setup();
        let dst = inst_1d(&store, mem_a, 4, &[4, 4]);
        assert!(TransferPlan::plan_fill(
            &[
                CopySrcDstField::new(dst.clone(), 0),
                CopySrcDstField::new(dst, 1)
            ],
            &[0, 0, 0, 0, 0]
        )
        .is_err());
    }

    #[test]
    fn test_node_selection_table() {
        let local = NodeId(5);
        let mk = |node, kind| MemoryId {
            node,
            kind,
            index: 0,
        };
        // local -> local: sender
        assert_eq!(
            select_dma_node(
                mk(NodeId(1), MemoryKind::SystemLocal),
                mk(NodeId(2), MemoryKind::SystemLocal),
                local
            ),
            NodeId(1)
        );
        // local -> rdma: sender
        assert_eq!(
            select_dma_node(
                mk(NodeId(1), MemoryKind::SystemLocal),
                mk(NodeId(2), MemoryKind::RdmaGlobal),
                local
            ),
            NodeId(1)
        );
        // rdma -> local: receiver
        assert_eq!(
            select_dma_node(
                mk(NodeId(1), MemoryKind::RdmaGlobal),
                mk(NodeId(2), MemoryKind::SystemLocal),
                local
            ),
            NodeId(2)
        );
        // rdma -> rdma: local node fallback
        assert_eq!(
            select_dma_node(
                mk(NodeId(1), MemoryKind::RdmaGlobal),
                mk(NodeId(2), MemoryKind::RdmaGlobal),
                local
            ),
            local
        );
    }

    #[test]
    fn test_copy_execution_moves_bytes() {
        let (store, mem_a, mem_b) = setup();
        let src = inst_1d(&store, mem_a, 16, &[4]);
        let dst = inst_1d(&store, mem_b, 16, &[4]);
        for i in 0..16i64 {
            store
                .write(
                    mem_a,
                    src.byte_address(skein_base::Point([i]), 0),
                    &(i as i32).to_le_bytes(),
                )
                .unwrap();
        }
        let events = EventTable::new();
        let domain = src.space.clone();
        let done = issue_copy(
            vec![CopySrcDstField::new(src, 0)],
            vec![CopySrcDstField::new(dst.clone(), 0)],
            None,
            domain,
            Arc::clone(&store),
            Arc::new(ReductionOps::default()),
            &events,
            Event::NONE,
            NodeId(0),
        )
        .unwrap();
        assert!(events.has_triggered(done));
        for i in 0..16i64 {
            let bytes = store
                .read(mem_b, dst.byte_address(skein_base::Point([i]), 0), 4)
                .unwrap();
            assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), i as i32);
        }
    }

    #[test]
    fn test_reduce_execution() {
        let (store, mem_a, _) = setup();
        let src = inst_1d(&store, mem_a, 8, &[4]);
        let dst = inst_1d(&store, mem_a, 8, &[4]);
        let events = EventTable::new();
        for i in 0..8i64 {
            store
                .write(mem_a, src.byte_address(skein_base::Point([i]), 0), &5i32.to_le_bytes())
                .unwrap();
            store
                .write(mem_a, dst.byte_address(skein_base::Point([i]), 0), &2i32.to_le_bytes())
                .unwrap();
        }
        let domain = src.space.clone();
        let done = issue_copy(
            vec![CopySrcDstField::new(src, 0)],
            vec![CopySrcDstField::new(dst.clone(), 0)],
            Some((REDOP_SUM_I32, false)),
            domain,
            Arc::clone(&store),
            Arc::new(ReductionOps::default()),
            &events,
            Event::NONE,
            NodeId(0),
        )
        .unwrap();
        assert!(events.has_triggered(done));
        let bytes = store
            .read(mem_a, dst.byte_address(skein_base::Point([3]), 0), 4)
            .unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 7);
    }

    #[test]
    fn test_copy_deferred_until_precondition() {
        let (store, mem_a, _) = setup();
        let src = inst_1d(&store, mem_a, 4, &[4]);
        let dst = inst_1d(&store, mem_a, 4, &[4]);
        store
            .write(mem_a, src.byte_address(skein_base::Point([0]), 0), &7i32.to_le_bytes())
            .unwrap();
        let events = EventTable::new();
        let gate = events.create();
        let domain = src.space.clone();
        let done = issue_copy(
            vec![CopySrcDstField::new(src, 0)],
            vec![CopySrcDstField::new(dst.clone(), 0)],
            None,
            domain,
            Arc::clone(&store),
            Arc::new(ReductionOps::default()),
            &events,
            gate,
            NodeId(0),
        )
        .unwrap();
        assert!(!events.has_triggered(done));
        events.trigger(gate);
        assert!(events.has_triggered(done));
        let bytes = store
            .read(mem_a, dst.byte_address(skein_base::Point([0]), 0), 4)
            .unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 7);
    }
}

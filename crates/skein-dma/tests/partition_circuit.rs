//! Circuit-style graph partitioning: nodes grouped by subcircuit, edges by
//! the subcircuit of their input node, then private/shared/ghost node sets
//! derived with images and set algebra.

use skein_base::{Event, EventTable, IndexSpace, Point, Rect};
use skein_dma::{
    AffineAccessor, FieldDataDescriptor, MemoryKind, MemoryStore, NodeId, PartitionEngine,
    RegionInstance,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const NUM_NODES: i64 = 100;
const NUM_EDGES: i64 = 10;
const NUM_PIECES: i64 = 2;
const RANDOM_SEED: u64 = 12345;
const PCT_WIRE_IN_PIECE: u64 = 50;

/// Deterministic counter-based generator so checks can regenerate any
/// element's data without holding it all in one place
fn prng(idx: i64, stream: u64, modulus: u64) -> i64 {
    let mut z = RANDOM_SEED
        .wrapping_add((idx as u64).wrapping_mul(0x9e3779b97f4a7c15))
        .wrapping_add(stream.wrapping_mul(0xbf58476d1ce4e5b9));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    ((z ^ (z >> 31)) % modulus) as i64
}

fn node_subckt(idx: i64) -> i64 {
    idx * NUM_PIECES / NUM_NODES
}

fn edge_data(idx: i64) -> (i64, i64) {
    let subckt = idx * NUM_PIECES / NUM_EDGES;
    let n_lo = subckt * NUM_NODES / NUM_PIECES;
    let n_hi = (subckt + 1) * NUM_NODES / NUM_PIECES;
    let in_node = n_lo + prng(idx, 1, (n_hi - n_lo) as u64);
    let pct = prng(idx, 2, 100) as u64;
    let out_node = if pct < PCT_WIRE_IN_PIECE {
        n_lo + prng(idx, 3, (n_hi - n_lo) as u64)
    } else {
        prng(idx, 3, NUM_NODES as u64)
    };
    (in_node, out_node)
}

struct Setup {
    engine: PartitionEngine,
    events: Arc<EventTable>,
    is_nodes: IndexSpace<1>,
    is_edges: IndexSpace<1>,
    subckt_fd: FieldDataDescriptor<1>,
    in_node_fd: FieldDataDescriptor<1>,
    out_node_fd: FieldDataDescriptor<1>,
}

fn setup() -> Setup {
    let events = EventTable::new();
    let store = Arc::new(MemoryStore::new());
    let engine = PartitionEngine::new(Arc::clone(&events), Arc::clone(&store));
    let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 1 << 20);

    let is_nodes = IndexSpace::dense(Rect::span(0, NUM_NODES - 1));
    let is_edges = IndexSpace::dense(Rect::span(0, NUM_EDGES - 1));

    let ri_nodes = RegionInstance::create(&store, mem, &is_nodes, &[4]).unwrap();
    let ri_edges = RegionInstance::create(&store, mem, &is_edges, &[8, 8]).unwrap();

    let subckt = AffineAccessor::<i32, 1>::new(Arc::clone(&store), ri_nodes.clone(), 0);
    for i in 0..NUM_NODES {
        subckt.write(Point([i]), node_subckt(i) as i32);
    }
    let in_node = AffineAccessor::<i64, 1>::new(Arc::clone(&store), ri_edges.clone(), 0);
    let out_node = AffineAccessor::<i64, 1>::new(Arc::clone(&store), ri_edges.clone(), 1);
    for e in 0..NUM_EDGES {
        let (inn, out) = edge_data(e);
        in_node.write(Point([e]), inn);
        out_node.write(Point([e]), out);
    }

    Setup {
        engine,
        events,
        is_nodes: is_nodes.clone(),
        is_edges: is_edges.clone(),
        subckt_fd: FieldDataDescriptor {
            space: is_nodes,
            inst: ri_nodes,
            field: 0,
        },
        in_node_fd: FieldDataDescriptor {
            space: is_edges.clone(),
            inst: ri_edges.clone(),
            field: 0,
        },
        out_node_fd: FieldDataDescriptor {
            space: is_edges,
            inst: ri_edges,
            field: 1,
        },
    }
}

fn points_of(s: &IndexSpace<1>) -> HashSet<i64> {
    s.points().map(|p| p[0]).collect()
}

#[test]
fn circuit_partitioning_private_shared_ghost() {
    let s = setup();
    let colors: Vec<i32> = (0..NUM_PIECES as i32).collect();

    // independent node partition by subcircuit id
    let (p_nodes, e1) =
        s.engine
            .by_field(&s.is_nodes, vec![s.subckt_fd.clone()], colors, Event::NONE);

    // edges follow the subcircuit of their input node
    let (p_edges, e2) = s.engine.by_preimage(
        &s.is_edges,
        vec![s.in_node_fd.clone()],
        p_nodes.clone(),
        e1,
    );

    // the image through the output node over-approximates the shared nodes
    let (p_extra_nodes, e3) =
        s.engine
            .by_image(&s.is_nodes, vec![s.out_node_fd.clone()], p_edges.clone(), e2);

    // subtracting each piece's own nodes leaves its ghosts
    let (p_ghost, e4) = s
        .engine
        .differences(&p_extra_nodes, &p_nodes, e3);

    // everybody's ghosts together are the shared nodes
    let (is_shared, e5) = s.engine.union_many(&p_ghost, e4);

    // private is what remains
    let (is_private, e6) = s.engine.difference(&s.is_nodes, &is_shared, e5);

    let (p_shr, e7) = s.engine.intersections(&p_nodes, &is_shared, e5);
    let (p_pvt, e8) = s.engine.intersections(&p_nodes, &is_private, e6);

    let done = s.events.merge(&[e7, e8]);
    s.events.wait(done).unwrap();

    // ── structural checks ──────────────────────────────────────────────

    // the field split is deterministic: two pieces of 50 nodes each
    assert_eq!(p_nodes.len(), 2);
    assert_eq!(p_nodes[0].volume(), 50);
    assert_eq!(p_nodes[1].volume(), 50);

    let private = points_of(&is_private);
    let shared = points_of(&is_shared);

    // private ∪ shared = all nodes, private ∩ shared = ∅
    assert!(private.is_disjoint(&shared));
    let mut all: Vec<i64> = private.union(&shared).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..NUM_NODES).collect::<Vec<_>>());

    // each piece's ghosts are shared nodes and never its own
    for p in 0..NUM_PIECES as usize {
        let ghost = points_of(&p_ghost[p]);
        let own = points_of(&p_nodes[p]);
        assert!(ghost.is_subset(&shared), "piece {p} ghost not ⊆ shared");
        assert!(ghost.is_disjoint(&own), "piece {p} ghost overlaps own nodes");
    }

    // ── element-wise checks against regenerated data ───────────────────

    let mut ghost_nodes: HashMap<i64, HashSet<i64>> = HashMap::new();
    for e in 0..NUM_EDGES {
        let (in_node, out_node) = edge_data(e);
        let in_subckt = node_subckt(in_node);
        let out_subckt = node_subckt(out_node);
        for p in 0..NUM_PIECES {
            let expected = p == in_subckt;
            let actual = p_edges[p as usize].contains(Point([e]));
            assert_eq!(expected, actual, "edge {e} in p_edges[{p}]");
        }
        if in_subckt != out_subckt {
            ghost_nodes.entry(out_node).or_default().insert(in_subckt);
        }
    }

    for n in 0..NUM_NODES {
        let subckt = node_subckt(n);
        let is_ghosted = ghost_nodes.contains_key(&n);
        assert_eq!(!is_ghosted, private.contains(&n), "node {n} private");
        assert_eq!(is_ghosted, shared.contains(&n), "node {n} shared");
        for p in 0..NUM_PIECES {
            let exp_pvt = subckt == p && !is_ghosted;
            let exp_shr = subckt == p && is_ghosted;
            let exp_ghost = ghost_nodes.get(&n).is_some_and(|s| s.contains(&p));
            assert_eq!(exp_pvt, p_pvt[p as usize].contains(Point([n])), "node {n} pvt[{p}]");
            assert_eq!(exp_shr, p_shr[p as usize].contains(Point([n])), "node {n} shr[{p}]");
            assert_eq!(
                exp_ghost,
                p_ghost[p as usize].contains(Point([n])),
                "node {n} ghost[{p}]"
            );
        }
    }
}

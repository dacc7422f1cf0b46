//! Dependent partitioning
//!
//! Operators that compute derived index spaces from field data: grouping by
//! field value, forward images, inverse preimages, weighted/equal splits,
//! and set algebra over subspaces. Every operator is deferred: it accepts a
//! precondition event, returns its outputs immediately as index spaces with
//! pending sparsity maps, and fills the maps in exactly once when it runs.
//! Observers chain off the returned event (or call `make_valid`) before
//! iterating an output.
//!
//! Empty inputs short-circuit: the outputs are empty and the returned event
//! is already triggered.

use crate::instance::{AffineAccessor, FieldDataDescriptor};
use crate::memory::MemoryStore;
use rayon::prelude::*;
use skein_base::sparsity::{coalesce_spans, SparsityEntry, SparsityMap};
use skein_base::{Event, EventTable, IndexSpace, Point, Rect, Result, RuntimeError};
use std::sync::Arc;

/// Engine computing deferred partitioning operators
pub struct PartitionEngine {
    events: Arc<EventTable>,
    store: Arc<MemoryStore>,
}

impl PartitionEngine {
    pub fn new(events: Arc<EventTable>, store: Arc<MemoryStore>) -> Self {
        Self { events, store }
    }

    pub fn events(&self) -> &Arc<EventTable> {
        &self.events
    }

    /// Allocate `count` output spaces with pending sparsity over `bounds`
    fn pending_outputs(
        &self,
        bounds: Rect<1>,
        count: usize,
    ) -> (Vec<IndexSpace<1>>, Vec<Arc<SparsityMap<1>>>) {
        let maps: Vec<_> = (0..count)
            .map(|_| SparsityMap::new_pending(&self.events))
            .collect();
        let spaces = maps
            .iter()
            .map(|m| IndexSpace {
                bounds,
                sparsity: Some(Arc::clone(m)),
            })
            .collect();
        (spaces, maps)
    }

    /// Run `compute` when `wait_on` triggers, publishing one entry list per
    /// output map; the returned event gates observation of all outputs
    fn defer<F>(&self, wait_on: Event, maps: Vec<Arc<SparsityMap<1>>>, compute: F) -> Event
    where
        F: FnOnce() -> Result<Vec<Vec<SparsityEntry<1>>>> + Send + 'static,
    {
        let done = self.events.create();
        let events = Arc::clone(&self.events);
        let done_ev = done;
        self.events.add_waiter(wait_on, move |outcome| {
            match outcome.and_then(|()| compute()) {
                Ok(entry_sets) => {
                    debug_assert_eq!(entry_sets.len(), maps.len());
                    for (map, entries) in maps.iter().zip(entry_sets) {
                        map.set_entries(entries, &events);
                    }
                    events.trigger(done_ev);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "partitioning operator failed");
                    events.poison(done_ev, err);
                }
            }
        });
        done
    }

    fn empty_outputs(count: usize) -> (Vec<IndexSpace<1>>, Event) {
        (vec![IndexSpace::empty(); count], Event::NONE)
    }

    /// Split `parent` into `count` pieces of near-equal point counts
    ///
    /// The pieces are exhaustive and pairwise disjoint; piece boundaries
    /// follow the point ordering of the parent.
    pub fn equal_subspaces(
        &self,
        parent: &IndexSpace<1>,
        count: usize,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if parent.bounds.is_empty() {
            return Self::empty_outputs(count);
        }
        let (spaces, maps) = self.pending_outputs(parent.bounds, count);
        let parent = parent.clone();
        let done = self.defer(wait_on, maps, move || {
            let points: Vec<i64> = parent.points().map(|p| p[0]).collect();
            let total = points.len();
            let mut out = Vec::with_capacity(count);
            for i in 0..count {
                let lo = total * i / count;
                let hi = total * (i + 1) / count;
                out.push(entries_from_sorted(&points[lo..hi]));
            }
            Ok(out)
        });
        (spaces, done)
    }

    /// Split `parent` into pieces of exactly the given point counts
    pub fn weighted_subspaces(
        &self,
        parent: &IndexSpace<1>,
        weights: Vec<usize>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if parent.bounds.is_empty() {
            return Self::empty_outputs(weights.len());
        }
        let (spaces, maps) = self.pending_outputs(parent.bounds, weights.len());
        let parent = parent.clone();
        let done = self.defer(wait_on, maps, move || {
            let points: Vec<i64> = parent.points().map(|p| p[0]).collect();
            let total: usize = weights.iter().sum();
            if total != points.len() {
                return Err(RuntimeError::partitioning(format!(
                    "weights sum to {total} but the space has {} points",
                    points.len()
                )));
            }
            let mut out = Vec::with_capacity(weights.len());
            let mut cursor = 0;
            for &w in &weights {
                out.push(entries_from_sorted(&points[cursor..cursor + w]));
                cursor += w;
            }
            Ok(out)
        });
        (spaces, done)
    }

    /// Group points of `parent` by the value of a scalar field
    ///
    /// Output `i` holds the points whose field value equals `colors[i]`.
    pub fn by_field<T>(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<FieldDataDescriptor<1>>,
        colors: Vec<T>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event)
    where
        T: bytemuck::Pod + PartialEq + Send + Sync + 'static,
    {
        if parent.bounds.is_empty() || field_data.is_empty() {
            return Self::empty_outputs(colors.len());
        }
        let (spaces, maps) = self.pending_outputs(parent.bounds, colors.len());
        let parent = parent.clone();
        let store = Arc::clone(&self.store);
        let done = self.defer(wait_on, maps, move || {
            let mut buckets: Vec<Vec<i64>> = vec![Vec::new(); colors.len()];
            for fd in &field_data {
                let acc = AffineAccessor::<T, 1>::new(Arc::clone(&store), fd.inst.clone(), fd.field);
                for p in fd.space.points() {
                    if !parent.contains(p) {
                        continue;
                    }
                    let v = acc.read(p);
                    if let Some(i) = colors.iter().position(|c| *c == v) {
                        buckets[i].push(p[0]);
                    }
                }
            }
            Ok(buckets
                .into_iter()
                .map(|mut b| {
                    b.sort_unstable();
                    entries_from_sorted(&b)
                })
                .collect())
        });
        (spaces, done)
    }

    /// Forward map: output `i` is the set of field values over `sources[i]`
    ///
    /// Values outside `parent` (e.g. out-of-range pointers) are dropped.
    pub fn by_image(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<FieldDataDescriptor<1>>,
        sources: Vec<IndexSpace<1>>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if parent.bounds.is_empty() || sources.is_empty() {
            return Self::empty_outputs(sources.len());
        }
        let (spaces, maps) = self.pending_outputs(parent.bounds, sources.len());
        let parent = parent.clone();
        let store = Arc::clone(&self.store);
        let done = self.defer(wait_on, maps, move || {
            let out: Vec<Vec<SparsityEntry<1>>> = sources
                .par_iter()
                .map(|source| {
                    let mut values = Vec::new();
                    for fd in &field_data {
                        let acc = AffineAccessor::<i64, 1>::new(
                            Arc::clone(&store),
                            fd.inst.clone(),
                            fd.field,
                        );
                        for p in fd.space.points() {
                            if !source.contains(p) {
                                continue;
                            }
                            let v = acc.read(p);
                            if parent.contains(Point([v])) {
                                values.push(v);
                            }
                        }
                    }
                    values.sort_unstable();
                    values.dedup();
                    entries_from_sorted(&values)
                })
                .collect();
            Ok(out)
        });
        (spaces, done)
    }

    /// Inverse map: output `i` is the set of points whose field value lands
    /// in `targets[i]`
    pub fn by_preimage(
        &self,
        parent: &IndexSpace<1>,
        field_data: Vec<FieldDataDescriptor<1>>,
        targets: Vec<IndexSpace<1>>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if parent.bounds.is_empty() || targets.is_empty() {
            return Self::empty_outputs(targets.len());
        }
        let (spaces, maps) = self.pending_outputs(parent.bounds, targets.len());
        let parent = parent.clone();
        let store = Arc::clone(&self.store);
        let done = self.defer(wait_on, maps, move || {
            let out: Vec<Vec<SparsityEntry<1>>> = targets
                .par_iter()
                .map(|target| {
                    let mut points = Vec::new();
                    for fd in &field_data {
                        let acc = AffineAccessor::<i64, 1>::new(
                            Arc::clone(&store),
                            fd.inst.clone(),
                            fd.field,
                        );
                        for p in fd.space.points() {
                            if !parent.contains(p) {
                                continue;
                            }
                            let v = acc.read(p);
                            if target.contains(Point([v])) {
                                points.push(p[0]);
                            }
                        }
                    }
                    points.sort_unstable();
                    points.dedup();
                    entries_from_sorted(&points)
                })
                .collect();
            Ok(out)
        });
        (spaces, done)
    }

    /// Union of all inputs into a single space
    pub fn union_many(
        &self,
        inputs: &[IndexSpace<1>],
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        let bounds = inputs
            .iter()
            .fold(Rect::empty(), |acc, s| acc.union_bbox(&s.bounds));
        if bounds.is_empty() {
            return (IndexSpace::empty(), Event::NONE);
        }
        let (mut spaces, maps) = self.pending_outputs(bounds, 1);
        let inputs = inputs.to_vec();
        let done = self.defer(wait_on, maps, move || {
            let mut points: Vec<i64> = inputs
                .iter()
                .flat_map(|s| s.points().map(|p| p[0]))
                .collect();
            points.sort_unstable();
            points.dedup();
            Ok(vec![entries_from_sorted(&points)])
        });
        (spaces.remove(0), done)
    }

    /// Union of two spaces
    pub fn union(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        self.union_many(&[lhs.clone(), rhs.clone()], wait_on)
    }

    /// Pairwise intersection of each `lhs[i]` with `rhs`
    pub fn intersections(
        &self,
        lhs: &[IndexSpace<1>],
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if lhs.is_empty() {
            return Self::empty_outputs(0);
        }
        let bounds = rhs.bounds;
        let (spaces, maps) = self.pending_outputs(bounds, lhs.len());
        let lhs = lhs.to_vec();
        let rhs = rhs.clone();
        let done = self.defer(wait_on, maps, move || {
            Ok(lhs
                .iter()
                .map(|l| {
                    let mut points: Vec<i64> = l
                        .points()
                        .filter(|p| rhs.contains(*p))
                        .map(|p| p[0])
                        .collect();
                    points.sort_unstable();
                    points.dedup();
                    entries_from_sorted(&points)
                })
                .collect())
        });
        (spaces, done)
    }

    /// Intersection of two spaces
    pub fn intersection(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        let (mut v, ev) = self.intersections(std::slice::from_ref(lhs), rhs, wait_on);
        (v.remove(0), ev)
    }

    /// Difference `lhs \ rhs`
    pub fn difference(
        &self,
        lhs: &IndexSpace<1>,
        rhs: &IndexSpace<1>,
        wait_on: Event,
    ) -> (IndexSpace<1>, Event) {
        let (mut v, ev) =
            self.differences(std::slice::from_ref(lhs), std::slice::from_ref(rhs), wait_on);
        (v.remove(0), ev)
    }

    /// Pairwise difference `lhs[i] \ rhs[i]`
    pub fn differences(
        &self,
        lhs: &[IndexSpace<1>],
        rhs: &[IndexSpace<1>],
        wait_on: Event,
    ) -> (Vec<IndexSpace<1>>, Event) {
        if lhs.is_empty() {
            return Self::empty_outputs(0);
        }
        if lhs.len() != rhs.len() {
            let ev = self.events.create();
            self.events.poison(
                ev,
                RuntimeError::partitioning(format!(
                    "pairwise difference arity mismatch: {} vs {}",
                    lhs.len(),
                    rhs.len()
                )),
            );
            return (vec![IndexSpace::empty(); lhs.len()], ev);
        }
        let bounds = lhs
            .iter()
            .fold(Rect::empty(), |acc, s| acc.union_bbox(&s.bounds));
        if bounds.is_empty() {
            return Self::empty_outputs(lhs.len());
        }
        let (spaces, maps) = self.pending_outputs(bounds, lhs.len());
        let lhs = lhs.to_vec();
        let rhs = rhs.to_vec();
        let done = self.defer(wait_on, maps, move || {
            Ok(lhs
                .iter()
                .zip(&rhs)
                .map(|(l, r)| {
                    let mut points: Vec<i64> = l
                        .points()
                        .filter(|p| !r.contains(*p))
                        .map(|p| p[0])
                        .collect();
                    points.sort_unstable();
                    points.dedup();
                    entries_from_sorted(&points)
                })
                .collect())
        });
        (spaces, done)
    }
}

/// Coalesce a sorted, deduplicated coordinate list into sparsity entries
fn entries_from_sorted(coords: &[i64]) -> Vec<SparsityEntry<1>> {
    coalesce_spans(coords)
        .into_iter()
        .map(SparsityEntry::dense)
        .collect()
}

// ================================================================================================
// Tests
// ================================================================================================

//! Sparsity maps
//!
//! A [`SparsityMap`] is the materialized description of a sparse index
//! space: a list of disjoint rectangles, each optionally refined by a dense
//! bitmap over its bounds. Maps are produced in a deferred fashion by the
//! partitioning engine; consumers observe an empty map until the validity
//! event triggers, and the payload is immutable from then on.

use crate::event::{Event, EventTable};
use crate::space::{Point, Rect};
use parking_lot::Mutex;
use std::sync::Arc;

/// One piece of a sparsity map: a rectangle, optionally masked
#[derive(Debug, Clone)]
pub struct SparsityEntry<const N: usize> {
    pub bounds: Rect<N>,
    /// When present, bit `i` covers the `i`-th point of `bounds` in
    /// dimension-0-fastest order; absent means the whole rectangle is set.
    pub bitmap: Option<Vec<u64>>,
}

impl<const N: usize> SparsityEntry<N> {
    /// A fully-set rectangle entry
    pub fn dense(bounds: Rect<N>) -> Self {
        SparsityEntry {
            bounds,
            bitmap: None,
        }
    }

    pub fn contains(&self, p: Point<N>) -> bool {
        if !self.bounds.contains(p) {
            return false;
        }
        match &self.bitmap {
            None => true,
            Some(bits) => {
                let idx = self.linear_index(p);
                (bits[idx / 64] >> (idx % 64)) & 1 != 0
            }
        }
    }

    fn linear_index(&self, p: Point<N>) -> usize {
        let mut idx = 0usize;
        let mut stride = 1usize;
        for d in 0..N {
            idx += (p[d] - self.bounds.lo[d]) as usize * stride;
            stride *= (self.bounds.hi[d] - self.bounds.lo[d] + 1) as usize;
        }
        idx
    }

    /// Number of set points
    pub fn volume(&self) -> usize {
        match &self.bitmap {
            None => self.bounds.volume(),
            Some(bits) => bits.iter().map(|w| w.count_ones() as usize).sum(),
        }
    }
}

enum MapState<const N: usize> {
    Pending { valid_event: Event },
    Valid { entries: Arc<Vec<SparsityEntry<N>>>, valid_event: Event },
}

/// Deferred, write-once description of a sparse point set
///
/// The map reaches the valid state exactly once, via [`SparsityMap::set_entries`],
/// which also triggers the validity event handed out by
/// [`SparsityMap::make_valid`]. All observations before validity see an
/// empty entry list.
pub struct SparsityMap<const N: usize> {
    state: Mutex<MapState<N>>,
}

impl<const N: usize> SparsityMap<N> {
    /// Create a map whose payload will be filled in later
    pub fn new_pending(events: &EventTable) -> Arc<Self> {
        Arc::new(SparsityMap {
            state: Mutex::new(MapState::Pending {
                valid_event: events.create(),
            }),
        })
    }

    /// Create an already-valid map from its entries
    pub fn new_valid(entries: Vec<SparsityEntry<N>>) -> Arc<Self> {
        Arc::new(SparsityMap {
            state: Mutex::new(MapState::Valid {
                entries: Arc::new(entries),
                valid_event: Event::NONE,
            }),
        })
    }

    /// The event gating observation of the payload
    pub fn make_valid(&self, _events: &EventTable) -> Event {
        match &*self.state.lock() {
            MapState::Pending { valid_event } => *valid_event,
            MapState::Valid { valid_event, .. } => *valid_event,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(&*self.state.lock(), MapState::Valid { .. })
    }

    /// Publish the payload and trigger the validity event
    ///
    /// May be called exactly once, by the engine that owns the computation.
    pub fn set_entries(&self, entries: Vec<SparsityEntry<N>>, events: &EventTable) {
        let valid_event = {
            let mut st = self.state.lock();
            match &*st {
                MapState::Valid { .. } => {
                    debug_assert!(false, "sparsity map filled twice");
                    return;
                }
                MapState::Pending { valid_event } => {
                    let ev = *valid_event;
                    *st = MapState::Valid {
                        entries: Arc::new(entries),
                        valid_event: ev,
                    };
                    ev
                }
            }
        };
        events.trigger(valid_event);
    }

    /// The entry list; empty until the map is valid
    pub fn entries(&self) -> Arc<Vec<SparsityEntry<N>>> {
        match &*self.state.lock() {
            MapState::Pending { .. } => Arc::new(Vec::new()),
            MapState::Valid { entries, .. } => Arc::clone(entries),
        }
    }

    /// Entry rectangles without their bitmaps (for coarse iteration)
    pub fn entry_rects(&self) -> Vec<Rect<N>> {
        self.entries().iter().map(|e| e.bounds).collect()
    }

    pub fn contains(&self, p: Point<N>) -> bool {
        self.entries().iter().any(|e| e.contains(p))
    }

    /// Total set points within `clip`
    pub fn total_volume_clipped(&self, clip: &Rect<N>) -> usize {
        self.entries()
            .iter()
            .map(|e| {
                if clip.contains_rect(&e.bounds) {
                    e.volume()
                } else {
                    // slow path for entries straddling the clip rectangle
                    e.bounds
                        .intersection(clip)
                        .iter()
                        .filter(|p| e.contains(*p))
                        .count()
                }
            })
            .sum()
    }
}

/// Coalesce a sorted, deduplicated 1-D coordinate list into maximal spans
pub fn coalesce_spans(coords: &[i64]) -> Vec<Rect<1>> {
    let mut out = Vec::new();
    let mut iter = coords.iter().copied();
    let Some(first) = iter.next() else {
        return out;
    };
    let (mut lo, mut hi) = (first, first);
    for c in iter {
        debug_assert!(c > hi);
        if c == hi + 1 {
            hi = c;
        } else {
            out.push(Rect::span(lo, hi));
            lo = c;
            hi = c;
        }
    }
    out.push(Rect::span(lo, hi));
    out
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_map_reads_empty() {
        let events = EventTable::new();
        let map = SparsityMap::<1>::new_pending(&events);
        assert!(!map.is_valid());
        assert!(map.entries().is_empty());
        assert!(!map.contains(Point([3])));
        let ev = map.make_valid(&events);
        assert!(!events.has_triggered(ev));
    }

    #[test]
    fn test_set_entries_triggers_validity() {
        let events = EventTable::new();
        let map = SparsityMap::new_pending(&events);
        let ev = map.make_valid(&events);
        map.set_entries(vec![SparsityEntry::dense(Rect::span(2, 5))], &events);
        assert!(events.has_triggered(ev));
        assert!(map.is_valid());
        assert!(map.contains(Point([2])));
        assert!(!map.contains(Point([6])));
        assert_eq!(map.total_volume_clipped(&Rect::span(0, 100)), 4);
    }

    #[test]
    fn test_payload_identical_after_validity() {
        let events = EventTable::new();
        let map = SparsityMap::new_pending(&events);
        map.set_entries(vec![SparsityEntry::dense(Rect::span(0, 9))], &events);
        let a = map.entry_rects();
        let b = map.entry_rects();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bitmap_entry() {
        // a 0..7 span with only even points set
        let mut bits = vec![0u64];
        for i in (0..8).step_by(2) {
            bits[0] |= 1 << i;
        }
        let entry = SparsityEntry {
            bounds: Rect::span(0, 7),
            bitmap: Some(bits),
        };
        assert!(entry.contains(Point([4])));
        assert!(!entry.contains(Point([5])));
        assert_eq!(entry.volume(), 4);
    }

    #[test]
    fn test_coalesce_spans() {
        assert_eq!(
            coalesce_spans(&[0, 1, 2, 5, 6, 9]),
            vec![Rect::span(0, 2), Rect::span(5, 6), Rect::span(9, 9)]
        );
        assert!(coalesce_spans(&[]).is_empty());
        assert_eq!(coalesce_spans(&[7]), vec![Rect::span(7, 7)]);
    }
}

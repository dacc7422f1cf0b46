//! N-dimensional integer index spaces
//!
//! Points and rectangles are parameterized by a const dimension count over
//! `i64` coordinates. An [`IndexSpace`] is a bounding rectangle plus an
//! optional [`SparsityMap`](crate::sparsity::SparsityMap) that restricts it
//! to a subset of points.
//!
//! Iteration order is dimension 0 fastest throughout; the transfer layer
//! relies on this when matching linearizations.

use crate::event::{Event, EventTable};
use crate::sparsity::SparsityMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Coordinate type for all index spaces
pub type Coord = i64;

/// A point in N-dimensional integer space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point<const N: usize>(pub [Coord; N]);

impl<const N: usize> Serialize for Point<N> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for Point<N> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let coords: Vec<Coord> = Vec::deserialize(deserializer)?;
        let arr: [Coord; N] = coords
            .try_into()
            .map_err(|v: Vec<Coord>| serde::de::Error::invalid_length(v.len(), &"N coords"))?;
        Ok(Point(arr))
    }
}

impl<const N: usize> Point<N> {
    pub const fn new(coords: [Coord; N]) -> Self {
        Point(coords)
    }

    /// The all-zeroes point
    pub const fn zeroes() -> Self {
        Point([0; N])
    }
}

impl From<Coord> for Point<1> {
    fn from(x: Coord) -> Self {
        Point([x])
    }
}

impl<const N: usize> Index<usize> for Point<N> {
    type Output = Coord;
    fn index(&self, d: usize) -> &Coord {
        &self.0[d]
    }
}

impl<const N: usize> IndexMut<usize> for Point<N> {
    fn index_mut(&mut self, d: usize) -> &mut Coord {
        &mut self.0[d]
    }
}

impl<const N: usize> fmt::Display for Point<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ">")
    }
}

/// An axis-aligned rectangle `[lo, hi]` (inclusive on both ends)
///
/// A rectangle with any `hi[d] < lo[d]` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect<const N: usize> {
    pub lo: Point<N>,
    pub hi: Point<N>,
}

impl<const N: usize> Rect<N> {
    pub const fn new(lo: Point<N>, hi: Point<N>) -> Self {
        Rect { lo, hi }
    }

    /// A canonical empty rectangle
    pub fn empty() -> Self {
        let mut r = Rect {
            lo: Point::zeroes(),
            hi: Point::zeroes(),
        };
        r.hi.0[0] = -1;
        r
    }

    pub fn is_empty(&self) -> bool {
        (0..N).any(|d| self.hi[d] < self.lo[d])
    }

    /// Number of points contained
    pub fn volume(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (0..N)
            .map(|d| (self.hi[d] - self.lo[d] + 1) as usize)
            .product()
    }

    pub fn contains(&self, p: Point<N>) -> bool {
        (0..N).all(|d| p[d] >= self.lo[d] && p[d] <= self.hi[d])
    }

    /// Whether `other` lies entirely inside this rectangle
    pub fn contains_rect(&self, other: &Rect<N>) -> bool {
        other.is_empty() || (0..N).all(|d| other.lo[d] >= self.lo[d] && other.hi[d] <= self.hi[d])
    }

    pub fn intersection(&self, other: &Rect<N>) -> Rect<N> {
        let mut out = *self;
        for d in 0..N {
            out.lo[d] = out.lo[d].max(other.lo[d]);
            out.hi[d] = out.hi[d].min(other.hi[d]);
        }
        out
    }

    pub fn overlaps(&self, other: &Rect<N>) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Smallest rectangle containing both inputs
    pub fn union_bbox(&self, other: &Rect<N>) -> Rect<N> {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut out = *self;
        for d in 0..N {
            out.lo[d] = out.lo[d].min(other.lo[d]);
            out.hi[d] = out.hi[d].max(other.hi[d]);
        }
        out
    }

    /// Iterate the contained points, dimension 0 fastest
    pub fn iter(&self) -> RectIter<N> {
        RectIter {
            rect: *self,
            next: if self.is_empty() { None } else { Some(self.lo) },
        }
    }
}

impl Rect<1> {
    /// Convenience constructor for 1-D spans
    pub fn span(lo: Coord, hi: Coord) -> Self {
        Rect {
            lo: Point([lo]),
            hi: Point([hi]),
        }
    }
}

impl<const N: usize> fmt::Display for Rect<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.lo, self.hi)
    }
}

/// Point iterator over a rectangle, dimension 0 fastest
pub struct RectIter<const N: usize> {
    rect: Rect<N>,
    next: Option<Point<N>>,
}

impl<const N: usize> Iterator for RectIter<N> {
    type Item = Point<N>;

    fn next(&mut self) -> Option<Point<N>> {
        let cur = self.next?;
        let mut nxt = cur;
        let mut carry = true;
        for d in 0..N {
            if nxt[d] < self.rect.hi[d] {
                nxt[d] += 1;
                carry = false;
                break;
            }
            nxt[d] = self.rect.lo[d];
        }
        self.next = if carry { None } else { Some(nxt) };
        Some(cur)
    }
}

/// A bounded N-dimensional integer set, possibly sparse
///
/// Dense spaces are just a rectangle. Sparse spaces additionally carry a
/// sparsity map whose contents become observable only after its validity
/// event triggers; callers that need the point set must go through
/// [`IndexSpace::make_valid`] first.
#[derive(Clone)]
pub struct IndexSpace<const N: usize> {
    pub bounds: Rect<N>,
    pub sparsity: Option<Arc<SparsityMap<N>>>,
}

impl<const N: usize> IndexSpace<N> {
    /// A dense space covering `bounds`
    pub fn dense(bounds: Rect<N>) -> Self {
        IndexSpace {
            bounds,
            sparsity: None,
        }
    }

    /// The empty space
    pub fn empty() -> Self {
        IndexSpace {
            bounds: Rect::empty(),
            sparsity: None,
        }
    }

    pub fn is_dense(&self) -> bool {
        self.sparsity.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty() || self.sparsity.as_ref().is_some_and(|s| s.is_valid() && s.total_volume_clipped(&self.bounds) == 0)
    }

    /// Event gating observation of the sparsity payload
    ///
    /// Dense spaces are always valid. Observers must wait on (or chain off)
    /// the returned event before iterating a sparse space.
    pub fn make_valid(&self, events: &EventTable) -> Event {
        match &self.sparsity {
            None => Event::NONE,
            Some(s) => s.make_valid(events),
        }
    }

    /// Number of points (requires a valid sparsity map)
    pub fn volume(&self) -> usize {
        match &self.sparsity {
            None => self.bounds.volume(),
            Some(s) => s.total_volume_clipped(&self.bounds),
        }
    }

    /// Point membership (requires a valid sparsity map)
    pub fn contains(&self, p: Point<N>) -> bool {
        if !self.bounds.contains(p) {
            return false;
        }
        match &self.sparsity {
            None => true,
            Some(s) => s.contains(p),
        }
    }

    /// The maximal rectangles making up this space, clipped to bounds
    ///
    /// Dense spaces yield their bounds; sparse spaces yield the sparsity
    /// entries (empty until the map is valid).
    pub fn rects(&self) -> Vec<Rect<N>> {
        match &self.sparsity {
            None => {
                if self.bounds.is_empty() {
                    Vec::new()
                } else {
                    vec![self.bounds]
                }
            }
            Some(s) => s
                .entry_rects()
                .into_iter()
                .map(|r| r.intersection(&self.bounds))
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Iterate all contained points, rect by rect, dimension 0 fastest
    pub fn points(&self) -> impl Iterator<Item = Point<N>> {
        self.rects().into_iter().flat_map(|r| r.iter())
    }
}

impl<const N: usize> fmt::Debug for IndexSpace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sparsity {
            None => write!(f, "IndexSpace({})", self.bounds),
            Some(s) => write!(
                f,
                "IndexSpace({}, sparse{})",
                self.bounds,
                if s.is_valid() { "" } else { ", pending" }
            ),
        }
    }
}

// ================================================================================================
// Tests
// ================================================================================================

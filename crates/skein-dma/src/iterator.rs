//! Transfer iteration
//!
//! A [`TransferIterator`] walks the `(domain, instance, fields)` product and
//! breaks it into [`AddressInfo`] chunks no larger than a caller-supplied
//! byte budget. Each chunk is contiguous (or line-strided) in the instance's
//! linearization:
//!
//! - Growth proceeds dimension by dimension in layout order; a dimension
//!   that is only partially consumed stops all higher dimensions.
//! - On sparse 1-D domains, neighboring spans are merged across gaps of at
//!   most `extra_elems` elements when the merged span fits the budget.
//! - Stepping can be tentative: `step(.., tentative) → confirm_step` /
//!   `cancel_step`, with cancellation restoring the position exactly.
//!
//! Iterators are finite and restartable via [`TransferIterator::reset`].

use crate::instance::RegionInstance;
use skein_base::{IndexSpace, Point, Rect};

/// One contiguous-or-strided piece of a transfer
///
/// Covers `bytes_per_chunk × num_lines × num_planes` bytes starting at
/// `base_offset`; lines are `line_stride` apart, planes `plane_stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    pub base_offset: usize,
    pub bytes_per_chunk: usize,
    pub num_lines: usize,
    pub line_stride: usize,
    pub num_planes: usize,
    pub plane_stride: usize,
}

impl AddressInfo {
    /// Total payload bytes described by this chunk
    pub fn total_bytes(&self) -> usize {
        self.bytes_per_chunk * self.num_lines * self.num_planes
    }

    /// Absolute byte offsets of every payload byte, in transfer order
    pub fn byte_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_planes).flat_map(move |pl| {
            (0..self.num_lines).flat_map(move |ln| {
                let base = self.base_offset + pl * self.plane_stride + ln * self.line_stride;
                base..base + self.bytes_per_chunk
            })
        })
    }
}

/// A byte slice of one instance field taking part in a transfer
///
/// `size == field size` is the common whole-field case; smaller slices copy
/// `size` bytes starting `suboffset` into each element and iterate as
/// strided lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlice {
    pub field: usize,
    pub suboffset: usize,
    pub size: usize,
}

impl FieldSlice {
    /// Whole-field slice
    pub fn whole(field: usize, size: usize) -> Self {
        FieldSlice {
            field,
            suboffset: 0,
            size,
        }
    }
}

struct Pending<const N: usize> {
    next_field: usize,
    next_rect: usize,
    next_point: Point<N>,
}

/// Lazy cursor over `(domain, instance, fields)`
pub struct TransferIterator<const N: usize> {
    inst: RegionInstance<N>,
    rects: Vec<Rect<N>>,
    fields: Vec<FieldSlice>,
    extra_elems: usize,
    field_idx: usize,
    rect_idx: usize,
    cur: Point<N>,
    tentative: Option<Pending<N>>,
}

impl<const N: usize> TransferIterator<N> {
    /// Build an iterator; the domain must be valid (sparsity observable)
    pub fn new(
        domain: &IndexSpace<N>,
        inst: RegionInstance<N>,
        fields: Vec<FieldSlice>,
        extra_elems: usize,
    ) -> Self {
        let rects = domain.rects();
        // an empty domain or field list is done from the start
        let fields = if rects.is_empty() { Vec::new() } else { fields };
        let cur = rects.first().map(|r| r.lo).unwrap_or(Point::zeroes());
        Self {
            inst,
            rects,
            fields,
            extra_elems,
            field_idx: 0,
            rect_idx: 0,
            cur,
            tentative: None,
        }
    }

    /// Whether every field has been fully iterated
    pub fn done(&self) -> bool {
        self.field_idx == self.fields.len()
    }

    /// Restart from the beginning
    pub fn reset(&mut self) {
        self.field_idx = 0;
        self.rect_idx = 0;
        if let Some(r) = self.rects.first() {
            self.cur = r.lo;
        }
        self.tentative = None;
    }

    /// Produce the next chunk, at most `max_bytes` of payload
    ///
    /// Returns `None` without advancing when the budget cannot hold a single
    /// element. With `tentative`, the position advances only on
    /// [`TransferIterator::confirm_step`]; [`TransferIterator::cancel_step`]
    /// restores the pre-step position exactly.
    pub fn step(&mut self, max_bytes: usize, tentative: bool) -> Option<AddressInfo> {
        assert!(!self.done());
        assert!(self.tentative.is_none(), "tentative step pending");

        let slice = self.fields[self.field_idx];
        let fl = &self.inst.layout.fields[slice.field];
        let elem = slice.size;
        let max_elems = max_bytes / elem;
        if max_elems == 0 {
            return None;
        }

        let rect = self.rects[self.rect_idx];
        let whole_field = slice.size == fl.size;
        let mut consumed_until = self.rect_idx;
        let mut target = Rect {
            lo: self.cur,
            hi: self.cur,
        };
        let info;

        if whole_field {
            // grow dimension by dimension while the linearization stays
            // contiguous and the budget holds
            let mut grow = true;
            let mut exp_stride = fl.size;
            let mut cur_bytes = fl.size;
            for d in 0..N {
                if grow {
                    if fl.strides[d] == exp_stride {
                        let mut len = (rect.hi[d] - self.cur[d] + 1) as usize;
                        exp_stride *= len;
                        let byte_limit = max_bytes / cur_bytes;
                        if byte_limit < len {
                            len = byte_limit;
                            grow = false;
                        }
                        target.hi[d] = self.cur[d] + len as i64 - 1;
                        cur_bytes *= len;
                    } else {
                        grow = false;
                        target.hi[d] = self.cur[d];
                    }
                } else {
                    target.hi[d] = self.cur[d];
                }
            }

            // merge 1-D spans across small gaps when padding allows
            if N == 1 && target.hi[0] == rect.hi[0] && self.extra_elems > 0 {
                let mut span_elems = (target.hi[0] - self.cur[0] + 1) as usize;
                while consumed_until + 1 < self.rects.len() {
                    let next = self.rects[consumed_until + 1];
                    let gap = (next.lo[0] - self.rects[consumed_until].hi[0] - 1) as usize;
                    let merged = (next.hi[0] - self.cur[0] + 1) as usize;
                    if gap <= self.extra_elems && merged <= max_elems {
                        consumed_until += 1;
                        target.hi[0] = next.hi[0];
                        span_elems = merged;
                    } else {
                        break;
                    }
                }
                cur_bytes = span_elems * elem;
            }

            info = AddressInfo {
                base_offset: self.inst.byte_address(self.cur, slice.field) + slice.suboffset,
                bytes_per_chunk: cur_bytes,
                num_lines: 1,
                line_stride: 0,
                num_planes: 1,
                plane_stride: 0,
            };
        } else {
            // partial-field slice: strided lines along dimension 0
            let avail = (rect.hi[0] - self.cur[0] + 1) as usize;
            let lines = avail.min(max_elems);
            target.hi[0] = self.cur[0] + lines as i64 - 1;
            info = AddressInfo {
                base_offset: self.inst.byte_address(self.cur, slice.field) + slice.suboffset,
                bytes_per_chunk: elem,
                num_lines: lines,
                line_stride: fl.strides[0],
                num_planes: 1,
                plane_stride: 0,
            };
        }

        // advance: carry through dimensions of the last consumed rect
        let last_rect = self.rects[consumed_until];
        let mut next_point = self.cur;
        let mut carry = true;
        for d in 0..N {
            if carry {
                if target.hi[d] == last_rect.hi[d] {
                    next_point[d] = last_rect.lo[d];
                } else {
                    next_point[d] = target.hi[d] + 1;
                    carry = false;
                }
            } else {
                next_point[d] = target.lo[d];
            }
        }

        let (next_field, next_rect, next_point) = if carry {
            let nr = consumed_until + 1;
            if nr < self.rects.len() {
                (self.field_idx, nr, self.rects[nr].lo)
            } else {
                (self.field_idx + 1, 0, self.rects[0].lo)
            }
        } else {
            (self.field_idx, self.rect_idx, next_point)
        };

        if tentative {
            self.tentative = Some(Pending {
                next_field,
                next_rect,
                next_point,
            });
        } else {
            self.field_idx = next_field;
            self.rect_idx = next_rect;
            self.cur = next_point;
        }

        Some(info)
    }

    /// Commit the pending tentative step
    pub fn confirm_step(&mut self) {
        let pending = self.tentative.take().expect("no tentative step");
        self.field_idx = pending.next_field;
        self.rect_idx = pending.next_rect;
        self.cur = pending.next_point;
    }

    /// Abandon the pending tentative step, restoring the prior position
    pub fn cancel_step(&mut self) {
        assert!(self.tentative.is_some(), "no tentative step");
        self.tentative = None;
    }
}

// ================================================================================================
// Tests
// ================================================================================================

//! Region instances and typed accessors
//!
//! An instance is a concrete allocation of a region in one memory, with a
//! declared field layout. Fields are stored structure-of-arrays: each field
//! occupies its own affine block over the instance bounds, dimension 0
//! fastest.

use crate::memory::{MemoryId, MemoryStore};
use skein_base::{IndexSpace, Point, Rect, Result};
use std::marker::PhantomData;
use std::sync::Arc;

/// Per-field placement within an instance
#[derive(Debug, Clone)]
pub struct FieldLayout<const N: usize> {
    /// Byte offset of this field's block from the instance base
    pub rel_offset: usize,
    /// Field size in bytes
    pub size: usize,
    /// Byte stride per dimension, dimension 0 fastest
    pub strides: [usize; N],
}

/// Affine layout of an instance over its bounds
#[derive(Debug, Clone)]
pub struct InstanceLayout<const N: usize> {
    pub bounds: Rect<N>,
    pub fields: Vec<FieldLayout<N>>,
    /// Total bytes of the instance block
    pub total_bytes: usize,
}

impl<const N: usize> InstanceLayout<N> {
    /// Structure-of-arrays layout: one contiguous block per field
    pub fn soa(bounds: Rect<N>, field_sizes: &[usize]) -> Self {
        let volume = bounds.volume();
        let mut fields = Vec::with_capacity(field_sizes.len());
        let mut rel_offset = 0;
        for &size in field_sizes {
            let mut strides = [0usize; N];
            let mut stride = size;
            for d in 0..N {
                strides[d] = stride;
                let extent = if bounds.is_empty() {
                    0
                } else {
                    (bounds.hi[d] - bounds.lo[d] + 1) as usize
                };
                stride *= extent.max(1);
            }
            fields.push(FieldLayout {
                rel_offset,
                size,
                strides,
            });
            rel_offset += size * volume;
        }
        InstanceLayout {
            bounds,
            fields,
            total_bytes: rel_offset,
        }
    }
}

/// A concrete allocation of a region, backed by one memory
#[derive(Clone)]
pub struct RegionInstance<const N: usize> {
    /// Process-unique instance id
    pub id: u64,
    pub memory: MemoryId,
    /// Base offset of the instance block within the memory
    pub base: usize,
    pub layout: InstanceLayout<N>,
    pub space: IndexSpace<N>,
}

impl<const N: usize> RegionInstance<N> {
    /// Allocate an instance of `space` in `memory` with the given fields
    pub fn create(
        store: &MemoryStore,
        memory: MemoryId,
        space: &IndexSpace<N>,
        field_sizes: &[usize],
    ) -> Result<Self> {
        let layout = InstanceLayout::soa(space.bounds, field_sizes);
        let base = store.alloc(memory, layout.total_bytes.max(1))?;
        Ok(RegionInstance {
            id: store.next_instance_id(),
            memory,
            base,
            layout,
            space: space.clone(),
        })
    }

    /// Absolute byte offset of `(point, field)` in the backing memory
    pub fn byte_address(&self, p: Point<N>, field: usize) -> usize {
        let f = &self.layout.fields[field];
        let mut off = self.base + f.rel_offset;
        for d in 0..N {
            off += (p[d] - self.layout.bounds.lo[d]) as usize * f.strides[d];
        }
        off
    }
}

/// Typed point-wise access to one field of an instance
///
/// Reads and writes go through the shared memory store; `T` must match the
/// declared field size.
pub struct AffineAccessor<T, const N: usize> {
    store: Arc<MemoryStore>,
    inst: RegionInstance<N>,
    field: usize,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod, const N: usize> AffineAccessor<T, N> {
    pub fn new(store: Arc<MemoryStore>, inst: RegionInstance<N>, field: usize) -> Self {
        debug_assert_eq!(inst.layout.fields[field].size, std::mem::size_of::<T>());
        Self {
            store,
            inst,
            field,
            _marker: PhantomData,
        }
    }

    pub fn read(&self, p: Point<N>) -> T {
        let off = self.inst.byte_address(p, self.field);
        let bytes = self
            .store
            .read(self.inst.memory, off, std::mem::size_of::<T>())
            .expect("accessor read in bounds");
        *bytemuck::from_bytes(&bytes)
    }

    pub fn write(&self, p: Point<N>, value: T) {
        let off = self.inst.byte_address(p, self.field);
        self.store
            .write(self.inst.memory, off, bytemuck::bytes_of(&value))
            .expect("accessor write in bounds");
    }
}

/// Field data a partitioning operator reads: a subspace plus the instance
/// and field holding each point's value
#[derive(Clone)]
pub struct FieldDataDescriptor<const N: usize> {
    pub space: IndexSpace<N>,
    pub inst: RegionInstance<N>,
    pub field: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, NodeId};

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_soa_layout_strides() {
        let bounds = Rect::new(Point([0, 0]), Point([9, 4])); // 10 x 5
        let layout = InstanceLayout::<2>::soa(bounds, &[4, 8]);
        assert_eq!(layout.fields[0].strides, [4, 40]);
        assert_eq!(layout.fields[1].strides, [8, 80]);
        assert_eq!(layout.fields[0].rel_offset, 0);
        assert_eq!(layout.fields[1].rel_offset, 4 * 50);
        assert_eq!(layout.total_bytes, 4 * 50 + 8 * 50);
    }

    #[test]
    fn test_accessor_round_trip() {
        let store = store();
        let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 1 << 16);
        let space = IndexSpace::dense(Rect::span(0, 99));
        let inst = RegionInstance::create(&store, mem, &space, &[4]).unwrap();
        let acc = AffineAccessor::<i32, 1>::new(Arc::clone(&store), inst, 0);
        for i in 0..100 {
            acc.write(Point([i]), (i * 3) as i32);
        }
        for i in 0..100 {
            assert_eq!(acc.read(Point([i])), (i * 3) as i32);
        }
    }

    #[test]
    fn test_byte_address_contiguity() {
        let store = store();
        let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 1 << 12);
        let space = IndexSpace::dense(Rect::new(Point([0, 0]), Point([3, 3])));
        let inst = RegionInstance::create(&store, mem, &space, &[2]).unwrap();
        // dimension 0 neighbors differ by the field size
        let a = inst.byte_address(Point([0, 0]), 0);
        let b = inst.byte_address(Point([1, 0]), 0);
        let c = inst.byte_address(Point([0, 1]), 0);
        assert_eq!(b - a, 2);
        assert_eq!(c - a, 8);
    }
}

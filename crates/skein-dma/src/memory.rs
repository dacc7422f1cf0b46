//! Memory model for transfers
//!
//! A [`MemoryId`] names one memory on one node; the [`MemoryStore`] backs
//! host-visible memories with byte arenas so plans can execute in-process.
//! Device memories hold no arena here; their transfers route through the
//! stream schedulers.

use parking_lot::RwLock;
use skein_base::{Result, RuntimeError};
use std::collections::HashMap;
use std::fmt;

/// Identifier of one node in a distributed deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u16);

/// What kind of memory an id names; decides transfer routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Globally addressable RDMA segment
    RdmaGlobal,
    /// Node-local system memory
    SystemLocal,
    /// Device-private framebuffer
    Framebuffer,
    /// Host-pinned, device-visible memory
    ZeroCopy,
}

impl MemoryKind {
    /// Whether transfers touching this memory follow the RDMA rules
    pub fn is_rdma(self) -> bool {
        matches!(self, MemoryKind::RdmaGlobal)
    }
}

/// Identifier of one memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId {
    pub node: NodeId,
    pub kind: MemoryKind,
    pub index: u16,
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem{}.{:?}.{}", self.node.0, self.kind, self.index)
    }
}

struct Arena {
    data: Vec<u8>,
    next_free: usize,
}

/// Byte arenas backing host-visible memories
///
/// Interior-mutable so accessors and plan execution can read and write
/// through a shared handle.
pub struct MemoryStore {
    arenas: RwLock<HashMap<MemoryId, RwLock<Arena>>>,
    next_index: RwLock<HashMap<(NodeId, MemoryKind), u16>>,
    next_instance: std::sync::atomic::AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            arenas: RwLock::new(HashMap::new()),
            next_index: RwLock::new(HashMap::new()),
            next_instance: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Dispense a process-unique region instance id
    pub fn next_instance_id(&self) -> u64 {
        self.next_instance
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Create a memory of `bytes` capacity on `node`
    pub fn create_memory(&self, node: NodeId, kind: MemoryKind, bytes: usize) -> MemoryId {
        let index = {
            let mut next = self.next_index.write();
            let slot = next.entry((node, kind)).or_insert(0);
            let idx = *slot;
            *slot += 1;
            idx
        };
        let id = MemoryId { node, kind, index };
        self.arenas.write().insert(
            id,
            RwLock::new(Arena {
                data: vec![0u8; bytes],
                next_free: 0,
            }),
        );
        tracing::debug!(memory = %id, bytes, "memory_created");
        id
    }

    /// Reserve `bytes` in `memory`, returning the base offset
    pub fn alloc(&self, memory: MemoryId, bytes: usize) -> Result<usize> {
        let arenas = self.arenas.read();
        let arena = arenas
            .get(&memory)
            .ok_or_else(|| RuntimeError::InvalidHandle(memory.to_string()))?;
        let mut arena = arena.write();
        if arena.next_free + bytes > arena.data.len() {
            return Err(RuntimeError::OutOfMemory {
                requested: bytes,
                available: arena.data.len() - arena.next_free,
            });
        }
        let off = arena.next_free;
        arena.next_free += bytes;
        Ok(off)
    }

    /// Read `len` bytes at `offset`
    pub fn read(&self, memory: MemoryId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let arenas = self.arenas.read();
        let arena = arenas
            .get(&memory)
            .ok_or_else(|| RuntimeError::InvalidHandle(memory.to_string()))?;
        let arena = arena.read();
        if offset + len > arena.data.len() {
            return Err(RuntimeError::invalid(format!(
                "read past end of {memory}: {offset}+{len}"
            )));
        }
        Ok(arena.data[offset..offset + len].to_vec())
    }

    /// Write bytes at `offset`
    pub fn write(&self, memory: MemoryId, offset: usize, data: &[u8]) -> Result<()> {
        let arenas = self.arenas.read();
        let arena = arenas
            .get(&memory)
            .ok_or_else(|| RuntimeError::InvalidHandle(memory.to_string()))?;
        let mut arena = arena.write();
        if offset + data.len() > arena.data.len() {
            return Err(RuntimeError::invalid(format!(
                "write past end of {memory}: {offset}+{}",
                data.len()
            )));
        }
        arena.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_rw() {
        let store = MemoryStore::new();
        let m = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 256);
        let base = store.alloc(m, 64).unwrap();
        store.write(m, base, &[1, 2, 3]).unwrap();
        assert_eq!(store.read(m, base, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let store = MemoryStore::new();
        let m = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 16);
        store.alloc(m, 16).unwrap();
        assert!(matches!(
            store.alloc(m, 1),
            Err(RuntimeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_distinct_indices_per_node() {
        let store = MemoryStore::new();
        let a = store.create_memory(NodeId(1), MemoryKind::SystemLocal, 8);
        let b = store.create_memory(NodeId(1), MemoryKind::SystemLocal, 8);
        assert_ne!(a, b);
    }
}

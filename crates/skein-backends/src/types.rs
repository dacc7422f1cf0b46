//! Types for device identification, streams and submitted work

use std::fmt;

/// Kernel function id reserved for the kill sentinel
///
/// A kernel submission with this id tells the scheduler's worker to
/// synchronize the device and exit.
pub const KILL_FUNC_ID: u64 = 0;

/// Identifier of one accelerator device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Role of a stream on its device
///
/// Each device runs a configurable number of task streams plus four
/// dedicated DMA streams, one per copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Task(usize),
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    Peer,
}

/// Identifier of one device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub device: DeviceId,
    pub kind: StreamKind,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StreamKind::Task(i) => write!(f, "{}:task{}", self.device, i),
            StreamKind::HostToDevice => write!(f, "{}:h2d", self.device),
            StreamKind::DeviceToHost => write!(f, "{}:d2h", self.device),
            StreamKind::DeviceToDevice => write!(f, "{}:d2d", self.device),
            StreamKind::Peer => write!(f, "{}:peer", self.device),
        }
    }
}

/// Direction of an asynchronous copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    Peer,
}

impl CopyKind {
    /// The dedicated DMA stream this copy kind routes to
    pub fn stream_kind(self) -> StreamKind {
        match self {
            CopyKind::HostToDevice => StreamKind::HostToDevice,
            CopyKind::DeviceToHost => StreamKind::DeviceToHost,
            CopyKind::DeviceToDevice => StreamKind::DeviceToDevice,
            CopyKind::Peer => StreamKind::Peer,
        }
    }
}

/// Marker posted to a stream; completes when the stream reaches it
///
/// Markers on one stream complete in posting order. Values are monotonic
/// per backend and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMarker(pub u64);

/// A completion observed by the backend
///
/// Produced on whatever thread the device notifies on; consumed by the
/// scheduler's worker. An error marks the bound work fence as failed.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub stream: StreamId,
    pub marker: DeviceMarker,
    pub error: Option<String>,
}

/// A kernel submission
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    pub func_id: u64,
    pub args: Vec<u8>,
}

impl KernelLaunch {
    pub fn new(func_id: u64, args: Vec<u8>) -> Self {
        Self { func_id, args }
    }

    pub fn is_kill(&self) -> bool {
        self.func_id == KILL_FUNC_ID
    }
}

/// An asynchronous copy between two device-visible addresses
#[derive(Debug, Clone)]
pub struct CopyDescriptor {
    pub src: u64,
    pub dst: u64,
    pub bytes: usize,
    pub kind: CopyKind,
}

/// A device-side fill of a repeating pattern
#[derive(Debug, Clone)]
pub struct FillDescriptor {
    pub dst: u64,
    pub pattern: Vec<u8>,
    pub bytes: usize,
}

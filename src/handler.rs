//! The backend handler ABI.
//!
//! A handler implements block I/O for one storage subtype. Handlers are
//! registered with the [registry](crate::registry) either by a built-in
//! module or by a dynamically loaded one; both go through a
//! [`HandlerRegistrar`]. Device state set up by `open` travels on the
//! [`Device`](crate::device::Device) as an opaque payload.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::Device;
use crate::error::Result;

/// Completion status of one backend command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// Command succeeded.
    Ok,
    /// Range not addressable by the device.
    Range,
    /// Medium read failure.
    ReadErr,
    /// Medium write failure.
    WriteErr,
    /// Transient resource exhaustion.
    NoResource,
}

impl CmdStatus {
    /// Whether this status reports success.
    pub fn is_ok(self) -> bool {
        self == CmdStatus::Ok
    }
}

/// What one command asks of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Read a byte range into the command's segments.
    Read,
    /// Write the command's segments at an offset.
    Write,
    /// Persist previously written data.
    Flush,
}

/// Owned scatter/gather segment list.
///
/// Bridge-initiated commands carry a single segment; handlers walk segments
/// in order and must fill or consume each one completely.
pub struct SgList {
    segs: SmallVec<[Vec<u8>; 1]>,
}

impl SgList {
    /// One zeroed segment of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        let mut segs = SmallVec::new();
        segs.push(vec![0u8; len]);
        SgList { segs }
    }

    /// Wrap an existing buffer as a single segment.
    pub fn from_vec(v: Vec<u8>) -> Self {
        let mut segs = SmallVec::new();
        segs.push(v);
        SgList { segs }
    }

    /// Build from explicit segments.
    pub fn from_segments(segs: Vec<Vec<u8>>) -> Self {
        SgList {
            segs: SmallVec::from_vec(segs),
        }
    }

    /// Total byte length across segments.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(Vec::len).sum()
    }

    /// The segments, in order.
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segs
    }

    /// Mutable segments, in order.
    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.segs
    }

    /// Collapse into one contiguous buffer. Free when there is one segment.
    pub fn into_contiguous(mut self) -> Vec<u8> {
        if self.segs.len() == 1 {
            return self.segs.swap_remove(0);
        }
        let mut out = Vec::with_capacity(self.total_len());
        for seg in self.segs {
            out.extend_from_slice(&seg);
        }
        out
    }
}

/// One in-flight I/O request, owned by the submitter until its completion
/// callback runs.
pub struct Command {
    /// Operation requested of the handler.
    pub kind: CmdKind,
    /// Byte offset on the device; unused for flush.
    pub offset: u64,
    /// Data segments; empty for flush.
    pub sg: SgList,
}

/// Registration surface handed to a module's `handler_init`.
pub trait HandlerRegistrar {
    /// Store the handler in an empty registry slot. Fails with `exists` if
    /// the subtype is already registered, `no-space` if the table is full.
    fn register(&self, handler: Arc<dyn Handler>) -> Result<()>;
}

/// Backend entry points for one storage subtype.
///
/// `nr_threads() == 0` means read/write/flush run and complete on the
/// submitter's thread. A positive value gives the device a worker pool of
/// that many consumers: completions then arrive asynchronously and are in
/// submission order only when the pool has a single consumer.
pub trait Handler: Send + Sync {
    /// Short unique identifier, the first cfgstring segment.
    fn subtype(&self) -> &str;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Worker-pool width; see the trait docs.
    fn nr_threads(&self) -> usize {
        0
    }

    /// Whether the handler implements `read`.
    fn can_read(&self) -> bool {
        true
    }

    /// Whether the handler implements `write`.
    fn can_write(&self) -> bool {
        true
    }

    /// Whether the handler implements `flush`. Without it the bridge
    /// completes flushes successfully on its own.
    fn has_flush(&self) -> bool {
        false
    }

    /// Validate the backend-specific part of a cfgstring before any device
    /// state exists. The `Err` carries a reason shown to the operator.
    fn check_config(&self, _cfg: &str) -> Result<(), String> {
        Ok(())
    }

    /// Bind device state. Geometry defaults are already on `dev`; the
    /// handler may overwrite them and stashes its state via
    /// [`Device::set_private`].
    fn open(&self, dev: &Device, reopen: bool) -> Result<()>;

    /// Tear down device state bound by `open`.
    fn close(&self, dev: &Device);

    /// Fill `sg` from the device starting at byte `offset`.
    fn read(&self, dev: &Device, sg: &mut SgList, offset: u64) -> CmdStatus;

    /// Write `sg` to the device starting at byte `offset`.
    fn write(&self, dev: &Device, sg: &SgList, offset: u64) -> CmdStatus;

    /// Persist written data. Only called when `has_flush` is true.
    fn flush(&self, _dev: &Device) -> CmdStatus {
        CmdStatus::Ok
    }
}

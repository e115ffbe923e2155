//! Frames and the pinned handle callers hold on to them.

use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::io::{check, DiskOp};
use crate::page::{self, PageId, PAGE_SIZE};
use crate::pager::Pager;

/// One slot of the page buffer. Frames are identified by their index
/// into the pool; the buffer is a fixed range of the pager's slab.
///
/// While `pins > 0` the frame's binding is stable: `page_id`, the
/// buffer range, and the descriptor may be read freely by every
/// pinner. Rebinding happens only on the free-to-bound transition,
/// under the pager's map lock.
pub(crate) struct Frame {
    pub(crate) buf: *mut u8,
    pub(crate) page_id: AtomicU64,
    pub(crate) pins: AtomicU32,
    pub(crate) op: Arc<DiskOp>,
}

// Frames are shared across client threads; the raw buffer pointer
// aliases slab memory whose exclusivity is enforced by the pin
// protocol, not the type system.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn new(buf: *mut u8) -> Self {
        Self {
            buf,
            page_id: AtomicU64::new(0),
            pins: AtomicU32::new(0),
            op: Arc::new(DiskOp::new()),
        }
    }
}

/// A pinned frame. The pin is released on drop; afterwards the frame
/// may be rebound to another page, so no data from the handle may be
/// retained past it.
pub struct FrameRef<'p> {
    pub(crate) pager: &'p Pager,
    pub(crate) index: usize,
}

impl FrameRef<'_> {
    fn frame(&self) -> &Frame {
        &self.pager.frames[self.index]
    }

    /// Index of the frame inside the pool.
    pub fn frame_index(&self) -> usize {
        self.index
    }

    pub fn page_id(&self) -> PageId {
        self.frame().page_id.load(Ordering::Acquire)
    }

    /// The frame's page buffer. Only valid content after
    /// [`Self::wait`] has observed a successful load.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the buffer is a live, disjoint slab range for as
        // long as the pin is held.
        unsafe { slice::from_raw_parts(self.frame().buf, PAGE_SIZE) }
    }

    /// Mutable access to the page buffer. Exactly one pinner may
    /// mutate; concurrent pinners of the same page must coordinate
    /// above the pager.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `data`; exclusivity among pinners is the
        // caller's contract.
        unsafe { slice::from_raw_parts_mut(self.frame().buf, PAGE_SIZE) }
    }

    /// The frame's operation descriptor, shared by every pinner.
    pub fn op(&self) -> &Arc<DiskOp> {
        &self.frame().op
    }

    /// Blocks until the frame's outstanding operation completes and
    /// maps its kernel result.
    pub fn wait(&self) -> Result<u32> {
        check(self.frame().op.wait())
    }

    /// Verifies the page checksum of the buffer contents. Callers
    /// check this after waiting on a load; a mismatching page must not
    /// be used.
    pub fn verify_checksum(&self) -> Result<()> {
        page::verify_checksum(self.data())
    }
}

impl Drop for FrameRef<'_> {
    fn drop(&mut self) {
        self.pager.release(self.index);
    }
}

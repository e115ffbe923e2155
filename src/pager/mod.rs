//! Fixed-capacity page buffer over the I/O manager.
//!
//! The pager owns one page-aligned slab carved into `frames` buffers,
//! a page-id → frame-index map behind a single mutex, and the free-
//! frame queue. Frames are pinned while in use; a pinned frame is
//! never rebound. There is no eviction: when every frame is pinned,
//! allocation fails with `ResourceExhausted` and the layer above
//! either releases pages or fails its operation.

mod frame;

pub use frame::FrameRef;
pub(crate) use frame::Frame;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BrumaError, Result};
use crate::io::{check, DiskOp, IoMgr, OpCode, Slab};
use crate::page::{page_offset, PageId, PAGE_SIZE};

/// Configuration for a pager instance.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Number of frames in the pool; must be a power of two.
    pub frames: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self { frames: 0x80 }
    }
}

struct PagerShared {
    map: HashMap<PageId, usize>,
    free: Receiver<usize>,
}

/// The page buffer. Multiple instances may coexist; each owns its own
/// coordinator thread and ring.
pub struct Pager {
    // drop order: the I/O manager joins its coordinator before the
    // file and slab go away
    iomgr: IoMgr,
    pub(crate) frames: Box<[Frame]>,
    shared: Mutex<PagerShared>,
    free_tx: SyncSender<usize>,
    next_page_id: AtomicU64,
    file: Arc<File>,
    slab: Slab,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("frames", &self.frames.len())
            .field("next_page_id", &self.next_page_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl Pager {
    /// Opens (creating if missing) `path` with direct-I/O semantics
    /// and builds the frame pool.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        if options.frames == 0 || !options.frames.is_power_of_two() {
            return Err(BrumaError::InvalidArgument(
                "frame count must be a power of two",
            ));
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .custom_flags(libc::O_DIRECT)
                .mode(0o640)
                .open(path)?,
        );
        let slab = Slab::new(options.frames * PAGE_SIZE)?;
        let mut frames = Vec::with_capacity(options.frames);
        let (free_tx, free_rx) = sync_channel(options.frames);
        for index in 0..options.frames {
            frames.push(Frame::new(slab.page_ptr(index)));
            free_tx.send(index).expect("free queue sized to the pool");
        }
        let iomgr = IoMgr::start(Arc::clone(&file))?;
        debug!(frames = options.frames, path = %path.display(), "pager.create");
        Ok(Self {
            iomgr,
            frames: frames.into_boxed_slice(),
            shared: Mutex::new(PagerShared {
                map: HashMap::with_capacity(options.frames),
                free: free_rx,
            }),
            free_tx,
            next_page_id: AtomicU64::new(1),
            file,
            slab,
        })
    }

    /// Returns a pinned frame for `page_id`, loading it from disk when
    /// not resident. The caller must wait on the frame before reading
    /// its data. Fails with `ResourceExhausted` when no frame is free;
    /// there is no eviction.
    pub fn get_page(&self, page_id: PageId) -> Result<FrameRef<'_>> {
        if page_id == 0 {
            return Err(BrumaError::InvalidArgument("page id 0 is the null page"));
        }
        let mut shared = self.shared.lock();
        if let Some(&index) = shared.map.get(&page_id) {
            let frame = &self.frames[index];
            debug_assert_eq!(frame.page_id.load(Ordering::Acquire), page_id);
            frame.pins.fetch_add(1, Ordering::AcqRel);
            drop(shared);
            return Ok(FrameRef { pager: self, index });
        }

        let Ok(index) = shared.free.try_recv() else {
            return Err(BrumaError::ResourceExhausted("no free frame"));
        };
        let frame = &self.frames[index];
        debug_assert_eq!(frame.pins.load(Ordering::Acquire), 0);
        frame.page_id.store(page_id, Ordering::Release);
        frame.pins.store(1, Ordering::Release);
        frame.op.prepare(
            OpCode::Read,
            frame.buf,
            PAGE_SIZE as u64,
            page_offset(page_id),
        );
        shared.map.insert(page_id, index);
        drop(shared);

        // A racer that lost to the insert above pins the same frame
        // and waits on the same descriptor; the latch is armed before
        // the map entry exists, so no waiter can see a stale result.
        if let Err(err) = self.iomgr.submit(&frame.op) {
            self.abort_load(page_id, index);
            return Err(err);
        }
        Ok(FrameRef { pager: self, index })
    }

    /// Unwinds a frame binding whose read never reached the
    /// coordinator. Racers that pinned in the meantime observe the
    /// failure result and release normally.
    fn abort_load(&self, page_id: PageId, index: usize) {
        let frame = &self.frames[index];
        frame.op.complete(-libc::EPIPE);
        let mut shared = self.shared.lock();
        if frame.pins.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.map.remove(&page_id);
            frame.page_id.store(0, Ordering::Release);
            drop(shared);
            self.free_tx
                .send(index)
                .expect("free queue sized to the pool");
        }
    }

    /// Assigns the next page id to a fresh pinned frame. No I/O is
    /// issued; the frame's descriptor reports immediate success.
    pub fn create_page(&self, zero: bool) -> Result<FrameRef<'_>> {
        let mut shared = self.shared.lock();
        let Ok(index) = shared.free.try_recv() else {
            return Err(BrumaError::ResourceExhausted("no free frame"));
        };
        let page_id = self.next_page_id.fetch_add(1, Ordering::Relaxed);
        let frame = &self.frames[index];
        debug_assert_eq!(frame.pins.load(Ordering::Acquire), 0);
        frame.page_id.store(page_id, Ordering::Release);
        frame.pins.store(1, Ordering::Release);
        frame.op.prepare(OpCode::Nop, std::ptr::null_mut(), 0, 0);
        frame.op.complete(0);
        shared.map.insert(page_id, index);
        drop(shared);

        let mut handle = FrameRef { pager: self, index };
        if zero {
            // we hold the only pin, nobody else mutates the buffer
            handle.data_mut().fill(0);
        }
        Ok(handle)
    }

    /// Submits a write of the frame's buffer to its page offset. The
    /// caller waits on the frame for the write itself; durability
    /// additionally needs [`Self::sync`].
    pub fn write_page(&self, frame: &FrameRef<'_>) -> Result<()> {
        let inner = &self.frames[frame.index];
        debug_assert!(inner.op.is_done(), "frame still has an operation in flight");
        let page_id = inner.page_id.load(Ordering::Acquire);
        inner.op.prepare(
            OpCode::Write,
            inner.buf,
            PAGE_SIZE as u64,
            page_offset(page_id),
        );
        self.iomgr.submit(&inner.op).inspect_err(|_| {
            // never reached the coordinator: settle the latch so a
            // later wait cannot hang
            inner.op.complete(-libc::EPIPE);
        })
    }

    /// Submits an fsync and waits for it.
    pub fn sync(&self) -> Result<()> {
        let op = Arc::new(DiskOp::new());
        op.prepare(OpCode::Sync, std::ptr::null_mut(), 0, 0);
        self.iomgr.submit(&op)?;
        check(op.wait())?;
        Ok(())
    }

    /// Preallocates file backing for pages `1..=page_count`.
    pub fn preallocate(&self, page_count: u64) -> Result<()> {
        if page_count == 0 {
            return Ok(());
        }
        let op = Arc::new(DiskOp::new());
        op.prepare(
            OpCode::Allocate,
            std::ptr::null_mut(),
            (page_count + 1) * PAGE_SIZE as u64,
            0,
        );
        self.iomgr.submit(&op)?;
        check(op.wait())?;
        Ok(())
    }

    /// Restores the page-id counter, e.g. from the meta page's page
    /// count after reopening an existing database.
    pub fn set_next_page_id(&self, next: PageId) {
        self.next_page_id.store(next.max(1), Ordering::Relaxed);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Drops a pin. On the last release the frame leaves the map and
    /// returns to the free queue; every free frame is off the map.
    pub(crate) fn release(&self, index: usize) {
        let mut shared = self.shared.lock();
        let frame = &self.frames[index];
        let previous = frame.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "release of an unpinned frame");
        if previous == 1 {
            let page_id = frame.page_id.load(Ordering::Acquire);
            let removed = shared.map.remove(&page_id);
            debug_assert_eq!(removed, Some(index), "resident frame missing from map");
            frame.page_id.store(0, Ordering::Release);
            drop(shared);
            self.free_tx
                .send(index)
                .expect("free queue sized to the pool");
        }
    }

    /// Shuts down the I/O manager. Also runs on drop.
    pub fn close(&mut self) {
        self.iomgr.close();
    }

    /// Bytes currently backing the file, for diagnostics.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Total bytes of the frame slab.
    pub fn pool_bytes(&self) -> usize {
        self.slab.len()
    }
}

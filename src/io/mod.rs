//! Asynchronous block-I/O manager.
//!
//! One coordinator thread owns an io_uring instance and is the only
//! thread that touches it. Clients describe a single-page disk
//! operation in a [`DiskOp`], push it onto a bounded submission
//! channel, and block on the descriptor until the coordinator reports
//! the kernel's result.
//!
//! The coordinator runs three phases per iteration: it *collects*
//! descriptors from the channel (blocking only when nothing is in
//! flight), *submits* prepared entries (waiting for a completion first
//! once the ring is deeper than [`RING_TARGET_DEPTH`]), and *reaps*
//! whatever completions are available, waking every waiter of each
//! finished descriptor.
//!
//! Ring `user_data` carries a small integer ticket rather than a
//! pointer; a parallel slot array maps tickets back to descriptors, so
//! descriptor lifetime is decoupled from the words travelling through
//! the kernel ring.

pub mod slab;
pub mod ticket;

pub use slab::Slab;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use io_uring::{opcode, types, IoUring};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{BrumaError, Result};
use crate::io::ticket::TicketQueue;
use crate::page::PAGE_SIZE;

/// Submission/completion ring capacity.
pub const RING_ENTRIES: usize = 0x80;

/// Depth at which the coordinator starts waiting for completions
/// before submitting more; the slack below [`RING_ENTRIES`] absorbs
/// one full collect batch.
pub const RING_TARGET_DEPTH: usize = 0x60;

/// Capacity of the bounded submission channel; `submit` blocks beyond
/// this.
pub const SUBMISSION_QUEUE_DEPTH: usize = 0x100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpCode {
    Nop,
    Write,
    Read,
    Sync,
    Allocate,
}

/// Raw buffer pointer carried inside a descriptor. The memory it names
/// is pinned by the owner of the descriptor for the whole flight.
#[derive(Clone, Copy)]
struct RawBuf(*mut u8);

// Sent to the coordinator thread; the pointee is guarded by frame pins.
unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

#[derive(Clone, Copy)]
struct OpSpec {
    opcode: OpCode,
    buf: RawBuf,
    len: u64,
    offset: u64,
}

/// A single-page disk operation descriptor.
///
/// The descriptor is owned by the submitter and must outlive the
/// operation until its completion has been observed; abandoning a wait
/// and rebinding the descriptor while the kernel still owes a result
/// is a use-after-free. The completion signal is a broadcast: any
/// number of threads may wait on the same outstanding descriptor and
/// every one of them observes the result.
pub struct DiskOp {
    spec: Mutex<OpSpec>,
    result: AtomicI32,
    done: Mutex<bool>,
    completed: Condvar,
}

impl DiskOp {
    /// A fresh descriptor is born completed with result 0, so waiting
    /// before the first submission does not block.
    pub fn new() -> Self {
        Self {
            spec: Mutex::new(OpSpec {
                opcode: OpCode::Nop,
                buf: RawBuf(std::ptr::null_mut()),
                len: 0,
                offset: 0,
            }),
            result: AtomicI32::new(0),
            done: Mutex::new(true),
            completed: Condvar::new(),
        }
    }

    /// Rebinds the descriptor for a new operation and arms the
    /// completion latch. Must not be called while a previous flight is
    /// still outstanding.
    ///
    /// Buffers and offsets must be page-aligned and (for reads and
    /// writes) page-sized; the manager never re-aligns.
    pub fn prepare(&self, opcode: OpCode, buf: *mut u8, len: u64, offset: u64) {
        debug_assert!(self.is_done(), "descriptor rebound while in flight");
        match opcode {
            OpCode::Read | OpCode::Write => {
                debug_assert!(!buf.is_null());
                debug_assert_eq!(buf as usize % PAGE_SIZE, 0, "buffer not page-aligned");
                debug_assert_eq!(len as usize, PAGE_SIZE, "read/write must be page-sized");
                debug_assert_eq!(offset % PAGE_SIZE as u64, 0, "offset not page-aligned");
            }
            OpCode::Allocate => {
                debug_assert_eq!(len % PAGE_SIZE as u64, 0);
                debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
            }
            OpCode::Nop | OpCode::Sync => {}
        }
        let mut spec = self.spec.lock();
        spec.opcode = opcode;
        spec.buf = RawBuf(buf);
        spec.len = len;
        spec.offset = offset;
        drop(spec);
        *self.done.lock() = false;
    }

    /// Stores the kernel result and wakes every waiter.
    pub(crate) fn complete(&self, res: i32) {
        self.result.store(res, Ordering::Release);
        let mut done = self.done.lock();
        *done = true;
        self.completed.notify_all();
    }

    /// Blocks until the coordinator signals completion and returns the
    /// kernel's raw result: negative is a negated errno, non-negative
    /// the bytes transferred (0 for sync/allocate success).
    pub fn wait(&self) -> i32 {
        let mut done = self.done.lock();
        while !*done {
            self.completed.wait(&mut done);
        }
        drop(done);
        self.result.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Result of the last completed flight; only meaningful after
    /// [`Self::wait`] returned.
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }
}

impl Default for DiskOp {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiskOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spec = self.spec.lock();
        write!(
            f,
            "DiskOp {{ {:?} buf: {:p} len: {:#x} off: {:#x} done: {} res: {} }}",
            spec.opcode,
            spec.buf.0,
            spec.len,
            spec.offset,
            self.is_done(),
            self.result.load(Ordering::Relaxed),
        )
    }
}

/// Turns a raw kernel result into `Ok(bytes)` or an [`BrumaError::IoFailure`].
pub fn check(res: i32) -> Result<u32> {
    if res < 0 {
        Err(BrumaError::IoFailure(-res))
    } else {
        Ok(res as u32)
    }
}

/// Handle to the coordinator thread. Dropping it (or calling
/// [`IoMgr::close`]) lets the coordinator drain its in-flight
/// operations and exit.
pub struct IoMgr {
    tx: Option<SyncSender<Arc<DiskOp>>>,
    worker: Option<JoinHandle<()>>,
}

impl IoMgr {
    /// Builds the ring and spawns the coordinator against `file`,
    /// which must already be open with direct-I/O semantics.
    pub fn start(file: Arc<File>) -> Result<Self> {
        let ring = IoUring::new(RING_ENTRIES as u32)?;
        let (tx, rx) = sync_channel(SUBMISSION_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("bruma-iomgr".into())
            .spawn(move || coordinator(ring, file, rx))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queues a prepared descriptor. Blocks once the submission
    /// channel holds [`SUBMISSION_QUEUE_DEPTH`] undelivered
    /// descriptors.
    pub fn submit(&self, op: &Arc<DiskOp>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(BrumaError::InvalidArgument("i/o manager already closed"))?;
        tx.send(Arc::clone(op)).map_err(|_| {
            BrumaError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "i/o coordinator is gone",
            ))
        })
    }

    /// Signals shutdown and joins the coordinator after it drains.
    pub fn close(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for IoMgr {
    fn drop(&mut self) {
        self.close();
    }
}

fn coordinator(mut ring: IoUring, file: Arc<File>, rx: Receiver<Arc<DiskOp>>) {
    let fd = types::Fd(file.as_raw_fd());
    let mut tickets: TicketQueue<Arc<DiskOp>> = TicketQueue::new(RING_ENTRIES);
    let mut queued = 0usize;
    let mut inflight = 0usize;
    let mut shutdown = false;

    loop {
        // Phase 1: collect. Block only when the ring is idle; then
        // greedily drain the channel while the ring has room.
        if !shutdown {
            if inflight == 0 && queued == 0 {
                match rx.recv() {
                    Ok(op) => {
                        prep_entry(&mut ring, &mut tickets, fd, op);
                        queued += 1;
                    }
                    Err(_) => shutdown = true,
                }
            }
            while inflight + queued < RING_ENTRIES {
                match rx.try_recv() {
                    Ok(op) => {
                        prep_entry(&mut ring, &mut tickets, fd, op);
                        queued += 1;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        shutdown = true;
                        break;
                    }
                }
            }
        }
        if shutdown && inflight == 0 && queued == 0 {
            debug!("iomgr.shutdown");
            return;
        }

        // Phase 2: submit. Past the target depth, trade latency for
        // batch width by waiting on at least one completion.
        if queued > 0 {
            let wait_one = inflight + queued > RING_TARGET_DEPTH;
            let submitted = submit_retrying(&mut ring, wait_one).min(queued);
            queued -= submitted;
            inflight += submitted;
        } else if inflight > 0 {
            // nothing to push: sleep until a completion arrives
            let _ = submit_retrying(&mut ring, true);
        }

        // Phase 3: reap everything currently available.
        let mut completion = ring.completion();
        for cqe in &mut completion {
            let ticket = cqe.user_data() as usize;
            let res = cqe.result();
            if res < 0 {
                debug!(ticket, res, "iomgr.completion_error");
            }
            let op = tickets.release(ticket);
            op.complete(res);
            inflight -= 1;
        }
    }
}

/// Acquires a ticket for `op`, builds the matching submission entry
/// with the ticket as `user_data`, and pushes it onto the ring.
fn prep_entry(ring: &mut IoUring, tickets: &mut TicketQueue<Arc<DiskOp>>, fd: types::Fd, op: Arc<DiskOp>) {
    let spec = *op.spec.lock();
    let ticket = tickets.acquire(op);
    let entry = match spec.opcode {
        OpCode::Nop => opcode::Nop::new().build(),
        OpCode::Read => opcode::Read::new(fd, spec.buf.0, spec.len as u32)
            .offset(spec.offset)
            .build(),
        OpCode::Write => opcode::Write::new(fd, spec.buf.0 as *const u8, spec.len as u32)
            .offset(spec.offset)
            .build(),
        OpCode::Sync => opcode::Fsync::new(fd).build(),
        OpCode::Allocate => opcode::Fallocate::new(fd, spec.len)
            .offset(spec.offset)
            .build(),
    }
    .user_data(ticket as u64);
    // The collect phase never outruns RING_ENTRIES, so there is room.
    unsafe {
        ring.submission()
            .push(&entry)
            .expect("submission queue unexpectedly full");
    }
}

/// Submits the prepared entries, optionally waiting for at least one
/// completion. EINTR and timeouts are retried; EBUSY defers to the
/// reap phase; anything else is logged and reported as zero submitted.
fn submit_retrying(ring: &mut IoUring, wait_one: bool) -> usize {
    loop {
        let outcome = if wait_one {
            ring.submit_and_wait(1)
        } else {
            ring.submit()
        };
        match outcome {
            Ok(n) => return n,
            Err(err) => match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ETIME) => continue,
                Some(libc::EBUSY) => return 0,
                _ => {
                    error!(err = %err, "iomgr.submit");
                    return 0;
                }
            },
        }
    }
}

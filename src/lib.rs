//! Storage core of an embedded key/value database.
//!
//! Three layers, bottom-up:
//!
//! - [`io`]: a single coordinator thread that owns an io_uring
//!   submission/completion ring, batches page-granularity disk
//!   operations against one direct-I/O file, and wakes waiting clients
//!   when their operations complete.
//! - [`pager`]: a fixed pool of page-sized frames carved from one
//!   aligned slab, a page-id map, and pin-counted frame handles. A
//!   pinned frame is never reused.
//! - [`page`]: the on-disk layout of a single page: a common 64-byte
//!   checksummed header, the slotted layout used by the B-tree to pack
//!   variable-length records, and the meta page holding the database
//!   roots.

pub mod error;
pub mod io;
pub mod page;
pub mod pager;

pub use crate::error::{BrumaError, Result};
pub use crate::page::{PageId, PAGE_HEADER_LEN, PAGE_SIZE};
pub use crate::pager::{FrameRef, Pager, PagerOptions};

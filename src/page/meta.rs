//! Meta page: the single page holding the database roots.
//!
//! Lives at page id 1. After the common header:
//!
//! ```text
//! 0x20  8  magic "BrumaKV~"
//! 0x28  8  root_page_id
//! 0x30  8  page_count
//! 0x38  8  free_list_head
//! ```
//!
//! Updates must be paired with a checksum recompute and a
//! write-through-fsync before the change is considered durable; the
//! pager provides both halves of that contract.

use crate::error::{BrumaError, Result};
use crate::page::{self, PageId, PageKind, FORMAT_VERSION, PAGE_SIZE};

/// Eight ASCII bytes at the head of the layout-specific region.
pub const MAGIC: &[u8; 8] = b"BrumaKV~";

/// Page id the meta page occupies.
pub const META_PAGE_ID: PageId = 1;

const MAGIC_OFF: usize = 0x20;
const ROOT_ID: usize = 0x28;
const PAGE_COUNT: usize = 0x30;
const FREE_LIST_HEAD: usize = 0x38;

pub struct MetaPage<'a> {
    raw: &'a mut [u8],
}

impl<'a> MetaPage<'a> {
    /// Initializes a fresh meta page. The supplied `root_id` is written
    /// as-is; a database without a tree yet passes 0.
    pub fn init(raw: &'a mut [u8], id: PageId, root_id: PageId, gen: u64) -> Result<Self> {
        if raw.len() != PAGE_SIZE {
            return Err(BrumaError::InvalidArgument("page buffer must be PAGE_SIZE"));
        }
        let mut p = Self { raw };
        page::set_page_id(p.raw, id);
        page::set_pagetype(p.raw, PageKind::Meta);
        page::set_version(p.raw, FORMAT_VERSION);
        page::set_generation(p.raw, gen);
        p.raw[MAGIC_OFF..MAGIC_OFF + MAGIC.len()].copy_from_slice(MAGIC);
        p.set_root_id(root_id);
        p.set_page_count(0);
        p.set_free_list_head(0);
        Ok(p)
    }

    /// Wraps a loaded meta page, rejecting buffers without the magic
    /// marker or the meta page kind.
    pub fn from_raw(raw: &'a mut [u8]) -> Result<Self> {
        if raw.len() != PAGE_SIZE {
            return Err(BrumaError::InvalidArgument("page buffer must be PAGE_SIZE"));
        }
        if &raw[MAGIC_OFF..MAGIC_OFF + MAGIC.len()] != MAGIC {
            return Err(BrumaError::Corruption("meta page magic mismatch"));
        }
        if PageKind::from_u8(page::pagetype(raw))? != PageKind::Meta {
            return Err(BrumaError::Corruption("meta page has wrong kind"));
        }
        Ok(Self { raw })
    }

    pub fn id(&self) -> PageId {
        page::page_id(self.raw)
    }

    pub fn root_id(&self) -> PageId {
        page::read_u64(self.raw, ROOT_ID)
    }

    pub fn set_root_id(&mut self, id: PageId) {
        page::write_u64(self.raw, ROOT_ID, id);
    }

    pub fn page_count(&self) -> u64 {
        page::read_u64(self.raw, PAGE_COUNT)
    }

    pub fn set_page_count(&mut self, count: u64) {
        page::write_u64(self.raw, PAGE_COUNT, count);
    }

    pub fn free_list_head(&self) -> PageId {
        page::read_u64(self.raw, FREE_LIST_HEAD)
    }

    pub fn set_free_list_head(&mut self, id: PageId) {
        page::write_u64(self.raw, FREE_LIST_HEAD, id);
    }

    pub fn write_checksum(&mut self) {
        page::write_checksum(self.raw);
    }

    pub fn verify_checksum(&self) -> Result<()> {
        page::verify_checksum(self.raw)
    }
}

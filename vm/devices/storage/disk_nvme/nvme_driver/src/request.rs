// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command identifier allocation.
//!
//! Each queue pair owns a pool of request slots. A slot's index is its CID,
//! and it carries an opaque user value plus, optionally, a page from the DMA
//! heap for building PRP lists.

use crate::Error;
use crate::NVME_PAGE_SIZE;
use parking_lot::Mutex;
use user_driver::heap::DmaBuffer;
use user_driver::heap::DmaHeap;

/// The number of requests, and therefore CIDs, per queue pair.
pub const REQUEST_POOL_LEN: usize = 1024;

/// A request slot.
#[derive(Debug, Clone)]
pub struct Request {
    cid: u16,
    /// Opaque to the driver; reset when the CID is allocated.
    pub user: u64,
}

impl Request {
    pub fn cid(&self) -> u16 {
        self.cid
    }
}

/// One page reserved for a request's PRP list.
#[derive(Debug, Copy, Clone)]
pub struct PrpListPage<'b> {
    buffer: &'b DmaBuffer<'b>,
    offset: usize,
}

impl<'b> PrpListPage<'b> {
    pub(crate) fn new(buffer: &'b DmaBuffer<'b>, offset: usize) -> Self {
        assert!(offset % NVME_PAGE_SIZE == 0 && offset + NVME_PAGE_SIZE <= buffer.len());
        Self { buffer, offset }
    }

    /// The device address of the list.
    pub fn phys(&self) -> u64 {
        self.buffer.phys_at(self.offset)
    }

    pub(crate) fn write_entry(&self, index: usize, value: u64) {
        let offset = index * size_of::<u64>();
        assert!(offset < NVME_PAGE_SIZE);
        self.buffer.write_obj(self.offset + offset, &value);
    }

    #[cfg(test)]
    pub(crate) fn read_entry(&self, index: usize) -> u64 {
        self.buffer.read_obj(self.offset + index * size_of::<u64>())
    }
}

struct PoolCore {
    reqs: Vec<Request>,
    /// Free CIDs; the top of the stack is the next to be handed out.
    free: Vec<u16>,
    in_flight: Vec<bool>,
}

/// A fixed pool of [`REQUEST_POOL_LEN`] request slots.
pub struct RequestPool<'a> {
    core: Mutex<PoolCore>,
    prp_lists: Option<DmaBuffer<'a>>,
}

impl std::fmt::Debug for RequestPool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPool")
            .field("free", &self.core.lock().free.len())
            .field("prp_lists", &self.prp_lists)
            .finish()
    }
}

impl Default for RequestPool<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RequestPool<'a> {
    /// Creates a pool without PRP list pages.
    pub fn new() -> Self {
        Self::with_pages(None)
    }

    /// Creates a pool where each of the first `count` CIDs owns one page of
    /// `heap` for its PRP list. The pages return to the heap when the pool
    /// is dropped.
    ///
    /// CIDs are handed out from the bottom of the free stack, so a caller
    /// that never holds more than `count` requests at once always gets a
    /// CID with a page.
    pub fn with_prp_lists(heap: &'a DmaHeap, count: usize) -> Result<Self, Error> {
        if !(1..=REQUEST_POOL_LEN).contains(&count) {
            return Err(Error::InvalidArgument("unsupported prp list count"));
        }
        let pages = heap.alloc(count * NVME_PAGE_SIZE)?;
        Ok(Self::with_pages(Some(pages)))
    }

    fn with_pages(prp_lists: Option<DmaBuffer<'a>>) -> Self {
        Self {
            core: Mutex::new(PoolCore {
                reqs: (0..REQUEST_POOL_LEN as u16)
                    .map(|cid| Request { cid, user: 0 })
                    .collect(),
                free: (0..REQUEST_POOL_LEN as u16).rev().collect(),
                in_flight: vec![false; REQUEST_POOL_LEN],
            }),
            prp_lists,
        }
    }

    fn check(cid: u16) -> Result<usize, Error> {
        let index = cid as usize;
        if index < REQUEST_POOL_LEN {
            Ok(index)
        } else {
            Err(Error::InvalidArgument("command identifier out of range"))
        }
    }

    /// Takes a free CID.
    pub fn alloc(&self) -> Result<u16, Error> {
        let mut core = self.core.lock();
        let cid = core
            .free
            .pop()
            .ok_or(Error::ResourceExhausted("command identifier"))?;
        core.in_flight[cid as usize] = true;
        core.reqs[cid as usize].user = 0;
        Ok(cid)
    }

    /// Returns `cid` to the pool. The caller must have consumed its
    /// completion.
    pub fn free(&self, cid: u16) -> Result<(), Error> {
        let index = Self::check(cid)?;
        let mut core = self.core.lock();
        if !core.in_flight[index] {
            return Err(Error::InvalidArgument("command identifier not in flight"));
        }
        core.in_flight[index] = false;
        core.free.push(cid);
        Ok(())
    }

    /// Runs `f` on the slot for `cid`.
    pub fn with_request<R>(&self, cid: u16, f: impl FnOnce(&mut Request) -> R) -> Result<R, Error> {
        let index = Self::check(cid)?;
        Ok(f(&mut self.core.lock().reqs[index]))
    }

    /// The PRP list page of `cid`, if the pool has them.
    pub fn prp_list(&self, cid: u16) -> Result<Option<PrpListPage<'_>>, Error> {
        let index = Self::check(cid)?;
        let Some(pages) = &self.prp_lists else {
            return Ok(None);
        };
        let offset = index * NVME_PAGE_SIZE;
        if offset >= pages.len() {
            return Err(Error::ResourceExhausted("prp list page"));
        }
        Ok(Some(PrpListPage::new(pages, offset)))
    }

    /// The number of CIDs available.
    pub fn available(&self) -> usize {
        self.core.lock().free.len()
    }
}

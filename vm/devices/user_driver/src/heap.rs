// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A first-fit allocator for device buffers, carved out of one pinned
//! hugepage region.
//!
//! Block headers live in-band, one page before each payload, and link to each
//! other by byte offset from the region base. The allocation metadata is
//! therefore part of the shared memory itself and stays meaningful to another
//! process that imports the region at a different virtual address.
//!
//! Physical addresses come from a lookup table with one entry per hugepage,
//! built once when the heap is created. A buffer is only physically
//! contiguous while it stays within one hugepage; see
//! [`DmaBuffer::is_phys_contiguous`].

use crate::config::HostMemConfig;
use crate::hugepage::HugepageRegion;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::HostMemError;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Marks a valid block header ("HMBK").
const BLOCK_MAGIC: u32 = 0x484d_424b;
/// Terminates the block list.
const NO_BLOCK: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct BlockHeader {
    magic: u32,
    free: u32,
    /// Payload bytes, excluding the header page.
    size: u64,
    /// Offset of the next block header, or [`NO_BLOCK`].
    next: u64,
}

/// A snapshot of one block of the heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the payload from the region base.
    pub offset: usize,
    /// Payload bytes.
    pub size: usize,
    pub free: bool,
}

/// Serializes mutation of the in-band block list.
#[derive(Debug)]
struct FreeList {
    live: usize,
}

/// A heap of DMA-capable memory.
pub struct DmaHeap {
    mem: MemoryBlock,
    lut: Vec<u64>,
    hugepage_size: usize,
    page_size: usize,
    free_list: Mutex<FreeList>,
}

impl std::fmt::Debug for DmaHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaHeap")
            .field("base", &self.mem.base())
            .field("len", &self.mem.len())
            .field("hugepage_size", &self.hugepage_size)
            .field("page_size", &self.page_size)
            .field("lut", &self.lut)
            .finish()
    }
}

impl DmaHeap {
    /// Allocates a new hugepage region of `size` bytes and builds a heap in
    /// it.
    pub fn new(size: usize, config: &HostMemConfig) -> Result<Self, HostMemError> {
        let region = HugepageRegion::allocate(size, config)?;
        Self::with_region(Arc::new(region), config)
    }

    /// Builds an empty heap in `region`, discarding its contents.
    pub fn with_region(
        region: Arc<dyn MappedDmaTarget>,
        config: &HostMemConfig,
    ) -> Result<Self, HostMemError> {
        let heap = Self::attach(region, config)?;
        heap.mem.write_obj(
            0,
            &BlockHeader {
                magic: BLOCK_MAGIC,
                free: 1,
                size: (heap.mem.len() - heap.page_size) as u64,
                next: NO_BLOCK,
            },
        );
        tracing::debug!(?heap, "initialized DMA heap");
        Ok(heap)
    }

    /// Maps a region shared by another process and attaches to the heap that
    /// process built in it.
    ///
    /// The block list is not synchronized across processes. The importer
    /// should only use it to resolve addresses of buffers it was told about,
    /// not allocate from it concurrently with the owner.
    pub fn import(path: impl AsRef<Path>, config: &HostMemConfig) -> Result<Self, HostMemError> {
        let region = HugepageRegion::import(path, config)?;
        Self::open_existing(Arc::new(region), config)
    }

    /// Attaches to a heap previously built in `region`.
    pub fn open_existing(
        region: Arc<dyn MappedDmaTarget>,
        config: &HostMemConfig,
    ) -> Result<Self, HostMemError> {
        let heap = Self::attach(region, config)?;
        if heap.header(0).magic != BLOCK_MAGIC {
            return Err(HostMemError::InvalidArgument(
                "region does not contain a DMA heap",
            ));
        }
        let live = heap.blocks().iter().filter(|b| !b.free).count();
        heap.free_list.lock().live = live;
        tracing::debug!(?heap, live, "attached to DMA heap");
        Ok(heap)
    }

    fn attach(
        region: Arc<dyn MappedDmaTarget>,
        config: &HostMemConfig,
    ) -> Result<Self, HostMemError> {
        config.validate()?;
        let page_size = config.page_size;
        let hugepage_size = region.hugepage_size();
        if size_of::<BlockHeader>() > page_size
            || hugepage_size < page_size
            || region.len() % hugepage_size != 0
            || region.len() <= page_size
        {
            return Err(HostMemError::InvalidArgument(
                "region is not a whole number of hugepages larger than a page",
            ));
        }

        let lut = (0..region.len() / hugepage_size)
            .map(|i| region.resolve_phys(i * hugepage_size))
            .collect::<Result<Vec<_>, _>>()?;
        if lut[0] != region.phys() {
            return Err(HostMemError::Inconsistent {
                phys: region.phys(),
                lut0: lut[0],
            });
        }

        Ok(Self {
            mem: MemoryBlock::new(region),
            lut,
            hugepage_size,
            page_size,
            free_list: Mutex::new(FreeList { live: 0 }),
        })
    }

    fn header(&self, offset: usize) -> BlockHeader {
        self.mem.read_obj(offset)
    }

    fn set_header(&self, offset: usize, header: &BlockHeader) {
        self.mem.write_obj(offset, header);
    }

    /// The backing region.
    pub fn region(&self) -> &Arc<dyn MappedDmaTarget> {
        self.mem.target()
    }

    /// The physical address of each hugepage of the region.
    pub fn lut(&self) -> &[u64] {
        &self.lut
    }

    /// The alignment and granularity of allocations.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn hugepage_size(&self) -> usize {
        self.hugepage_size
    }

    /// The largest allocation an empty heap can satisfy.
    pub fn capacity(&self) -> usize {
        self.mem.len() - self.page_size
    }

    /// The number of outstanding allocations.
    pub fn live_allocations(&self) -> usize {
        self.free_list.lock().live
    }

    /// Walks the block list.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let _guard = self.free_list.lock();
        self.blocks_locked()
    }

    fn blocks_locked(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        loop {
            let header = self.header(offset);
            blocks.push(BlockInfo {
                offset: offset + self.page_size,
                size: header.size as usize,
                free: header.free != 0,
            });
            if header.next == NO_BLOCK {
                break blocks;
            }
            offset = header.next as usize;
        }
    }

    /// Allocates `size` bytes aligned to the page size.
    pub fn alloc(&self, size: usize) -> Result<DmaBuffer<'_>, HostMemError> {
        self.alloc_aligned(size, self.page_size)
    }

    /// Allocates `size` bytes aligned to `alignment`, which is raised to the
    /// page size if smaller.
    ///
    /// The first free block large enough is used. The block is split when
    /// what remains after the allocation can hold another header and payload
    /// page; otherwise the whole block is handed out.
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<DmaBuffer<'_>, HostMemError> {
        if size == 0 {
            return Err(HostMemError::InvalidArgument("zero sized allocation"));
        }
        if !alignment.is_power_of_two() {
            return Err(HostMemError::InvalidArgument(
                "alignment must be a power of two",
            ));
        }
        let page = self.page_size;
        let alignment = alignment.max(page);
        let size = size
            .checked_next_multiple_of(page)
            .ok_or(HostMemError::OutOfMemory { size })?;

        let mut free_list = self.free_list.lock();
        let mut offset = 0;
        loop {
            let mut header = self.header(offset);
            if header.free != 0 {
                let payload = offset + page;
                let mut pad = payload.next_multiple_of(alignment) - payload;
                if pad == page {
                    // A one page front would be a header with no payload.
                    // Move to the next aligned position instead.
                    pad += alignment;
                }
                if header.size as usize >= pad + size {
                    let (offset, mut header) = if pad > 0 {
                        // Leave the unaligned front of the block free.
                        let aligned = offset + pad;
                        let rest = BlockHeader {
                            magic: BLOCK_MAGIC,
                            free: 1,
                            size: header.size - pad as u64,
                            next: header.next,
                        };
                        header.size = (pad - page) as u64;
                        header.next = aligned as u64;
                        self.set_header(offset, &header);
                        (aligned, rest)
                    } else {
                        (offset, header)
                    };

                    let remaining = header.size as usize - size;
                    if remaining > page {
                        let split = offset + page + size;
                        self.set_header(
                            split,
                            &BlockHeader {
                                magic: BLOCK_MAGIC,
                                free: 1,
                                size: (remaining - page) as u64,
                                next: header.next,
                            },
                        );
                        header.next = split as u64;
                        header.size = size as u64;
                    }
                    header.free = 0;
                    self.set_header(offset, &header);
                    free_list.live += 1;

                    let buffer = DmaBuffer {
                        heap: self,
                        offset: offset + page,
                        len: size,
                    };
                    tracing::trace!(
                        offset = buffer.offset,
                        len = buffer.len,
                        phys = buffer.phys(),
                        "dma alloc"
                    );
                    return Ok(buffer);
                }
            }
            if header.next == NO_BLOCK {
                break;
            }
            offset = header.next as usize;
        }
        Err(HostMemError::OutOfMemory { size })
    }

    /// Frees the allocation whose payload starts at `payload`, then merges
    /// every pair of adjacent free blocks in one pass over the list.
    fn free_offset(&self, payload: usize) -> Result<(), HostMemError> {
        let mut free_list = self.free_list.lock();
        let page = self.page_size;
        let target = payload
            .checked_sub(page)
            .ok_or(HostMemError::InvalidArgument("not a heap allocation"))?;

        let mut offset = 0;
        loop {
            let mut header = self.header(offset);
            if offset == target {
                if header.free != 0 {
                    return Err(HostMemError::InvalidArgument("double free"));
                }
                header.free = 1;
                self.set_header(offset, &header);
                break;
            }
            if header.next == NO_BLOCK {
                return Err(HostMemError::InvalidArgument("not a heap allocation"));
            }
            offset = header.next as usize;
        }
        free_list.live -= 1;

        let mut offset = 0;
        loop {
            let mut header = self.header(offset);
            if header.next == NO_BLOCK {
                break;
            }
            let next = self.header(header.next as usize);
            if header.free != 0 && next.free != 0 {
                header.size += page as u64 + next.size;
                header.next = next.next;
                self.set_header(offset, &header);
            } else {
                offset = header.next as usize;
            }
        }
        tracing::trace!(offset = payload, "dma free");
        Ok(())
    }

    /// Translates a pointer into the region to the physical address the
    /// device must use.
    pub fn virt_to_phys(&self, ptr: *const u8) -> Result<u64, HostMemError> {
        let offset = (ptr as usize)
            .checked_sub(self.mem.base() as usize)
            .filter(|&offset| offset < self.mem.len())
            .ok_or(HostMemError::InvalidArgument("pointer outside the heap"))?;
        Ok(self.offset_to_phys(offset))
    }

    fn offset_to_phys(&self, offset: usize) -> u64 {
        self.lut[offset / self.hugepage_size] + (offset % self.hugepage_size) as u64
    }
}

/// An allocation from a [`DmaHeap`], freed on drop.
pub struct DmaBuffer<'a> {
    heap: &'a DmaHeap,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for DmaBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("phys", &format_args!("{:#x}", self.phys()))
            .finish()
    }
}

impl DmaBuffer<'_> {
    /// The heap the buffer came from.
    pub fn heap(&self) -> &DmaHeap {
        self.heap
    }

    /// The length in bytes, rounded up to the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Offset of the buffer from the region base.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The virtual address of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.heap.mem.base().wrapping_add(self.offset)
    }

    /// The physical address of the start of the buffer.
    pub fn phys(&self) -> u64 {
        self.heap.offset_to_phys(self.offset)
    }

    /// The physical address of the byte at `offset` into the buffer.
    pub fn phys_at(&self, offset: usize) -> u64 {
        assert!(offset < self.len, "offset {offset:#x} past end of buffer");
        self.heap.offset_to_phys(self.offset + offset)
    }

    /// Whether the first `len` bytes of the buffer are guaranteed to be
    /// physically contiguous, that is, they lie within one hugepage.
    pub fn is_phys_contiguous(&self, len: usize) -> bool {
        let hugepage = self.heap.hugepage_size;
        len <= self.len
            && (len == 0 || self.offset / hugepage == (self.offset + len - 1) / hugepage)
    }

    fn check(&self, offset: usize, len: usize) -> usize {
        assert!(
            offset <= self.len && len <= self.len - offset,
            "access {offset:#x}+{len:#x} past end of buffer"
        );
        self.offset + offset
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        self.heap.mem.read_at(self.check(offset, data.len()), data)
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.heap.mem.write_at(self.check(offset, data.len()), data)
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        self.heap.mem.read_obj(self.check(offset, size_of::<T>()))
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.heap
            .mem
            .write_obj(self.check(offset, size_of::<T>()), data)
    }

    /// Zeroes the whole buffer.
    pub fn zero(&self) {
        self.heap.mem.fill_at(self.offset, self.len, 0)
    }
}

impl Drop for DmaBuffer<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.heap.free_offset(self.offset) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                offset = self.offset,
                "failed to free DMA buffer"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedDmaRegion;
    use test_with_tracing::test;

    const HUGE: usize = 2 << 20;
    const PAGE: usize = 4096;
    const PHYS: u64 = 0x1_0000_0000;

    fn config() -> HostMemConfig {
        HostMemConfig::new(HUGE, PAGE)
    }

    fn heap(hugepages: usize) -> DmaHeap {
        let region = EmulatedDmaRegion::new(hugepages * HUGE, HUGE, PHYS).unwrap();
        DmaHeap::with_region(Arc::new(region), &config()).unwrap()
    }

    fn assert_tiles(heap: &DmaHeap) {
        let mut expected = PAGE;
        for block in heap.blocks() {
            assert_eq!(block.offset, expected);
            expected += block.size + PAGE;
        }
        assert_eq!(expected, heap.region().len() + PAGE);
    }

    #[test]
    fn first_fit_reuses_freed_slot() {
        let heap = heap(2);
        let a = heap.alloc(4096).unwrap();
        let b = heap.alloc(4096).unwrap();
        let c = heap.alloc(4096).unwrap();
        let b_ptr = b.as_ptr();
        drop(b);
        let d = heap.alloc(4096).unwrap();
        assert_eq!(d.as_ptr(), b_ptr);
        assert!(a.as_ptr() < d.as_ptr() && d.as_ptr() < c.as_ptr());
        assert_tiles(&heap);
    }

    #[test]
    fn coalescing_restores_full_capacity() {
        let heap = heap(2);
        let bufs = (1..20)
            .map(|i| heap.alloc(i * 1000).unwrap())
            .collect::<Vec<_>>();
        assert_tiles(&heap);
        assert!(heap.alloc(heap.capacity()).is_err());

        // Free in an interleaved order so merges happen in both directions.
        let (even, odd): (Vec<_>, Vec<_>) =
            bufs.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
        drop(odd);
        assert_tiles(&heap);
        drop(even);

        assert_eq!(heap.live_allocations(), 0);
        assert_eq!(heap.blocks().len(), 1);
        let all = heap.alloc(heap.capacity()).unwrap();
        assert_eq!(all.len(), 2 * HUGE - PAGE);
    }

    #[test]
    fn allocations_are_page_aligned() {
        let heap = heap(1);
        let bufs = [1, 4095, 4096, 4097, 10000]
            .map(|n| heap.alloc(n).unwrap());
        for (buf, n) in bufs.iter().zip([1usize, 4095, 4096, 4097, 10000]) {
            assert_eq!(buf.as_ptr() as usize % PAGE, 0);
            assert_eq!(buf.phys() % PAGE as u64, 0);
            assert_eq!(buf.len(), n.next_multiple_of(PAGE));
        }
    }

    #[test]
    fn larger_alignment() {
        let heap = heap(2);
        let _a = heap.alloc(4096).unwrap();
        let b = heap.alloc_aligned(4096, 64 * 1024).unwrap();
        assert_eq!(b.offset() % (64 * 1024), 0);
        assert_tiles(&heap);
        drop(b);
        assert_eq!(heap.blocks().len(), 2);
    }

    #[test]
    fn one_page_padding_leaves_no_empty_block() {
        let heap = heap(2);
        // The next free payload starts one page short of an 8KiB boundary.
        let _a = heap.alloc(PAGE).unwrap();
        let b = heap.alloc_aligned(PAGE, 2 * PAGE).unwrap();
        assert_eq!(b.offset() % (2 * PAGE), 0);
        assert!(heap.blocks().iter().all(|block| block.size > 0));
        assert_tiles(&heap);
        drop(b);
        assert_eq!(heap.blocks().len(), 2);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let heap = heap(1);
        // Leave exactly one header page behind: too small for another block.
        let buf = heap.alloc(heap.capacity() - PAGE).unwrap();
        assert_eq!(heap.blocks().len(), 1);
        assert!(matches!(
            heap.alloc(1),
            Err(HostMemError::OutOfMemory { .. })
        ));
        drop(buf);
        heap.alloc(heap.capacity()).unwrap();
    }

    #[test]
    fn rejects_bad_requests() {
        let heap = heap(1);
        assert!(matches!(
            heap.alloc(0),
            Err(HostMemError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.alloc_aligned(4096, 3),
            Err(HostMemError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.alloc(HUGE),
            Err(HostMemError::OutOfMemory { .. })
        ));
        assert!(matches!(
            heap.free_offset(PAGE),
            Err(HostMemError::InvalidArgument("double free"))
        ));
        assert!(matches!(
            heap.free_offset(3 * PAGE),
            Err(HostMemError::InvalidArgument("not a heap allocation"))
        ));
    }

    #[test]
    fn lut_translation() {
        let region = EmulatedDmaRegion::new(3 * HUGE, HUGE, 0)
            .unwrap()
            .with_hugepage_phys(vec![0x4000_0000, 0x9000_0000, 0x2000_0000]);
        let heap = DmaHeap::with_region(Arc::new(region), &config()).unwrap();
        assert_eq!(heap.lut(), &[0x4000_0000, 0x9000_0000, 0x2000_0000]);

        let base = heap.region().base();
        assert_eq!(heap.virt_to_phys(base).unwrap(), heap.lut()[0]);
        for o in [0, 1, HUGE - 1, HUGE, HUGE + 0x123, 3 * HUGE - 1] {
            assert_eq!(
                heap.virt_to_phys(base.wrapping_add(o)).unwrap(),
                heap.lut()[o / HUGE] + (o % HUGE) as u64
            );
        }
        assert!(heap.virt_to_phys(base.wrapping_add(3 * HUGE)).is_err());
        assert!(heap.virt_to_phys(base.wrapping_sub(1)).is_err());
    }

    #[test]
    fn contiguity_stops_at_hugepage_boundary() {
        let heap = heap(2);
        let first = heap.alloc(HUGE - 3 * PAGE).unwrap();
        assert!(first.is_phys_contiguous(first.len()));
        let straddle = heap.alloc(4 * PAGE).unwrap();
        assert!(straddle.is_phys_contiguous(PAGE));
        assert!(!straddle.is_phys_contiguous(4 * PAGE));
    }

    #[test]
    fn buffer_access() {
        let heap = heap(1);
        let buf = heap.alloc(100).unwrap();
        buf.write_obj(8, &0xabcdu16);
        assert_eq!(buf.read_obj::<u16>(8), 0xabcd);
        buf.zero();
        assert_eq!(buf.read_obj::<u64>(8), 0);
        assert_eq!(buf.phys_at(10), buf.phys() + 10);
    }

    #[test]
    #[should_panic(expected = "past end of buffer")]
    fn buffer_bounds() {
        let heap = heap(1);
        let buf = heap.alloc(4096).unwrap();
        buf.write_obj(4092, &0u64);
    }

    /// Reports a base address that disagrees with its own page tables.
    struct Liar(EmulatedDmaRegion);

    // SAFETY: passes through to a valid region.
    unsafe impl MappedDmaTarget for Liar {
        fn base(&self) -> *const u8 {
            self.0.base()
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn hugepage_size(&self) -> usize {
            self.0.hugepage_size()
        }
        fn phys(&self) -> u64 {
            self.0.phys() + HUGE as u64
        }
        fn resolve_phys(&self, offset: usize) -> Result<u64, HostMemError> {
            self.0.resolve_phys(offset)
        }
    }

    #[test]
    fn lut_self_check() {
        let region = Liar(EmulatedDmaRegion::new(HUGE, HUGE, PHYS).unwrap());
        assert!(matches!(
            DmaHeap::with_region(Arc::new(region), &config()),
            Err(HostMemError::Inconsistent { .. })
        ));
    }

    #[test]
    fn reattach_sees_allocations() {
        let region: Arc<dyn MappedDmaTarget> =
            Arc::new(EmulatedDmaRegion::new(HUGE, HUGE, PHYS).unwrap());
        let heap = DmaHeap::with_region(region.clone(), &config()).unwrap();
        let buf = heap.alloc(3 * PAGE).unwrap();
        buf.write_at(0, b"shared");

        let other = DmaHeap::open_existing(region, &config()).unwrap();
        assert_eq!(other.live_allocations(), 1);
        assert_eq!(other.blocks(), heap.blocks());
        let mut data = [0; 6];
        other.mem.read_at(buf.offset(), &mut data);
        assert_eq!(&data, b"shared");
    }

    #[test]
    fn shared_between_threads() {
        let heap = heap(2);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 1..50 {
                        let buf = heap.alloc(i * 512).unwrap();
                        buf.write_obj(0, &(i as u64));
                        assert_eq!(buf.read_obj::<u64>(0), i as u64);
                    }
                });
            }
        });
        assert_eq!(heap.live_allocations(), 0);
        assert_eq!(heap.blocks().len(), 1);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing host memory with the device.

use crate::HostMemError;
use std::path::Path;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The 4KB page size used by NVMe devices.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// A pinned, mapped region that can be accessed by the host or the device.
///
/// # Safety
/// The implementor must ensure that the VA region from `base()..base() + len()`
/// remains mapped and pinned for the lifetime of the object.
pub unsafe trait MappedDmaTarget: Send + Sync {
    /// The virtual address of the mapped memory.
    fn base(&self) -> *const u8;

    /// The length of the region in bytes. A multiple of
    /// [`Self::hugepage_size`].
    fn len(&self) -> usize;

    /// The size of the pages backing the region. The region is physically
    /// contiguous within each of them.
    fn hugepage_size(&self) -> usize;

    /// The physical address of the region base, as resolved when the region
    /// was created.
    fn phys(&self) -> u64;

    /// Resolves the physical address of the byte at `offset`.
    fn resolve_phys(&self, offset: usize) -> Result<u64, HostMemError>;

    /// A path another process can open to import the region, if any.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Byte-level access to a whole [`MappedDmaTarget`].
///
/// All accesses go through atomic bytes, since the device may be writing the
/// same memory concurrently.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn MappedDmaTarget>,
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new(mem: Arc<dyn MappedDmaTarget>) -> Self {
        Self { mem }
    }

    /// The backing region.
    pub fn target(&self) -> &Arc<dyn MappedDmaTarget> {
        &self.mem
    }

    /// Get the base address of the region.
    pub fn base(&self) -> *const u8 {
        self.mem.base()
    }

    /// Gets the length of the region in bytes.
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Gets the region as an atomic slice.
    pub fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: the underlying memory is valid for the lifetime of `mem`,
        // and AtomicU8 has the same layout as u8.
        unsafe { std::slice::from_raw_parts(self.mem.base().cast(), self.mem.len()) }
    }

    /// Reads from the region into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (d, s) in data
            .iter_mut()
            .zip(&self.as_slice()[offset..][..len])
        {
            *d = s.load(Ordering::Relaxed);
        }
    }

    /// Writes into the region from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (d, s) in self.as_slice()[offset..][..data.len()].iter().zip(data) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    /// Sets `len` bytes at `offset` to `value`.
    pub fn fill_at(&self, offset: usize, len: usize, value: u8) {
        for b in &self.as_slice()[offset..][..len] {
            b.store(value, Ordering::Relaxed);
        }
    }

    /// Reads an object from the region at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes an object into the region at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedDmaRegion;
    use test_with_tracing::test;

    #[test]
    fn object_access() {
        let region = EmulatedDmaRegion::new(2 << 20, 2 << 20, 0x1_0000_0000).unwrap();
        let mem = MemoryBlock::new(Arc::new(region));
        mem.write_obj(8, &0x1122_3344_5566_7788u64);
        assert_eq!(mem.read_obj::<u64>(8), 0x1122_3344_5566_7788);
        let mut bytes = [0; 2];
        mem.read_at(8, &mut bytes);
        assert_eq!(bytes, [0x88, 0x77]);
        mem.fill_at(8, 4, 0xff);
        assert_eq!(mem.read_obj::<u64>(8), 0x1122_3344_ffff_ffff);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_access_panics() {
        let region = EmulatedDmaRegion::new(2 << 20, 2 << 20, 0).unwrap();
        let mem = MemoryBlock::new(Arc::new(region));
        mem.write_obj((2 << 20) - 4, &0u64);
    }
}

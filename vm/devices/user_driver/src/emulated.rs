// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated stand-ins for DMA memory and device registers.
//!
//! These let the heap, the queue logic and full controller bring-up run
//! without hugepages, privileges or hardware.

use crate::hugepage::Mapping;
use crate::memory::MappedDmaTarget;
use crate::DeviceRegisterIo;
use crate::HostMemError;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Anonymous memory posing as a hugepage region, with synthetic physical
/// addresses.
///
/// By default hugepage `i` sits at `base_phys + i * hugepage_size`, making
/// the region physically contiguous. [`Self::with_hugepage_phys`] scatters the
/// hugepages instead, like real hugepages usually are.
pub struct EmulatedDmaRegion {
    mapping: Mapping,
    hugepage_size: usize,
    hugepage_phys: Vec<u64>,
}

impl EmulatedDmaRegion {
    /// Creates a zeroed region of `len` bytes.
    pub fn new(len: usize, hugepage_size: usize, base_phys: u64) -> Result<Self, HostMemError> {
        if !hugepage_size.is_power_of_two() || len == 0 || len % hugepage_size != 0 {
            return Err(HostMemError::InvalidArgument(
                "size must be a non-zero multiple of the hugepage size",
            ));
        }
        let mapping = Mapping::anonymous(len).map_err(|source| HostMemError::Os {
            op: "map emulated DMA memory",
            source,
        })?;
        let hugepage_phys = (0..len / hugepage_size)
            .map(|i| base_phys + (i * hugepage_size) as u64)
            .collect();
        Ok(Self {
            mapping,
            hugepage_size,
            hugepage_phys,
        })
    }

    /// Assigns the physical address of each hugepage.
    pub fn with_hugepage_phys(mut self, hugepage_phys: Vec<u64>) -> Self {
        assert_eq!(hugepage_phys.len(), self.hugepage_phys.len());
        self.hugepage_phys = hugepage_phys;
        self
    }

    fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: the mapping is valid for the lifetime of self, and AtomicU8
        // has the same layout as u8.
        unsafe { std::slice::from_raw_parts(self.mapping.as_ptr().cast(), self.mapping.len()) }
    }

    /// Translates a device physical range to an offset in the region. The
    /// range must not cross a hugepage.
    pub fn translate(&self, phys: u64, len: usize) -> Option<usize> {
        let size = self.hugepage_size as u64;
        self.hugepage_phys
            .iter()
            .position(|&base| phys >= base && phys + len as u64 <= base + size)
            .map(|i| i * self.hugepage_size + (phys - self.hugepage_phys[i]) as usize)
    }

    /// Reads memory the way the device would, by physical address.
    pub fn read_phys(&self, phys: u64, data: &mut [u8]) -> Result<(), HostMemError> {
        let offset = self
            .translate(phys, data.len())
            .ok_or(HostMemError::InvalidArgument("physical range not in region"))?;
        for (d, s) in data.iter_mut().zip(&self.as_slice()[offset..]) {
            *d = s.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes memory the way the device would, by physical address.
    pub fn write_phys(&self, phys: u64, data: &[u8]) -> Result<(), HostMemError> {
        let offset = self
            .translate(phys, data.len())
            .ok_or(HostMemError::InvalidArgument("physical range not in region"))?;
        for (d, s) in self.as_slice()[offset..].iter().zip(data) {
            d.store(*s, Ordering::Relaxed);
        }
        Ok(())
    }
}

// SAFETY: The mapping is valid for the lifetime of the region and only
// unmapped on drop.
unsafe impl MappedDmaTarget for EmulatedDmaRegion {
    fn base(&self) -> *const u8 {
        self.mapping.as_ptr()
    }

    fn len(&self) -> usize {
        self.mapping.len()
    }

    fn hugepage_size(&self) -> usize {
        self.hugepage_size
    }

    fn phys(&self) -> u64 {
        self.hugepage_phys[0]
    }

    fn resolve_phys(&self, offset: usize) -> Result<u64, HostMemError> {
        if offset >= self.mapping.len() {
            return Err(HostMemError::InvalidArgument("offset outside region"));
        }
        Ok(self.hugepage_phys[offset / self.hugepage_size] + (offset % self.hugepage_size) as u64)
    }
}

/// A device model reachable through MMIO.
pub trait MmioIntercept: Send {
    /// Handles a register read at `offset`.
    fn mmio_read(&mut self, offset: usize, data: &mut [u8]);
    /// Handles a register write at `offset`.
    fn mmio_write(&mut self, offset: usize, data: &[u8]);
}

/// Register access to an emulated device model.
pub struct EmulatedDevice<T> {
    device: Arc<Mutex<T>>,
    len: usize,
}

impl<T> Clone for EmulatedDevice<T> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            len: self.len,
        }
    }
}

impl<T: MmioIntercept> EmulatedDevice<T> {
    /// Wraps `device`, exposing `len` bytes of register space.
    pub fn new(device: T, len: usize) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            len,
        }
    }

    /// Locks the device model for inspection.
    pub fn device(&self) -> MutexGuard<'_, T> {
        self.device.lock()
    }

    fn check(&self, offset: usize, size: usize) {
        assert!(
            offset % size == 0 && offset + size <= self.len,
            "bad register access at {offset:#x}"
        );
    }
}

impl<T: MmioIntercept> DeviceRegisterIo for EmulatedDevice<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        let mut n = [0; 4];
        self.device.lock().mmio_read(offset, &mut n);
        u32::from_ne_bytes(n)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        let mut n = [0; 8];
        self.device.lock().mmio_read(offset, &mut n);
        u64::from_ne_bytes(n)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.check(offset, 4);
        self.device.lock().mmio_write(offset, &data.to_ne_bytes());
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.check(offset, 8);
        self.device.lock().mmio_write(offset, &data.to_ne_bytes());
    }
}

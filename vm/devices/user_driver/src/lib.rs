// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure for user-mode device drivers: DMA-capable hugepage memory,
//! a heap that carves device buffers out of it, and access to device
//! registers.

// UNSAFETY: Mapping memory and device BARs, and volatile access to them.
#![expect(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod emulated;
pub mod heap;
pub mod hugepage;
pub mod memory;
pub mod sysfs;

/// Access to device register space.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;
    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// An error from the host memory subsystem.
#[derive(Debug, thiserror::Error)]
pub enum HostMemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of DMA memory allocating {size:#x} bytes")]
    OutOfMemory { size: usize },
    #[error("physical address of the region base {phys:#x} does not match LUT[0] {lut0:#x}")]
    Inconsistent { phys: u64, lut0: u64 },
    #[error("virtual address {virt:#x} is not present in RAM")]
    NotPresent { virt: usize },
    #[error("physical address of {virt:#x} is hidden, resolving it requires CAP_SYS_ADMIN")]
    PrivilegeRequired { virt: usize },
    #[error("unsupported hugepage size {0:#x}")]
    UnsupportedHugepageSize(usize),
    #[error("failed to {op}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HostMemError {
    /// Wraps the calling thread's last OS error.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

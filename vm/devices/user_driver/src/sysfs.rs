// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping PCI BARs through sysfs resource files.
//!
//! The device must be unbound from its kernel driver, and the process needs
//! permission to open `/sys/bus/pci/devices/<bdf>/resource<N>`.

use crate::hugepage::Mapping;
use crate::DeviceRegisterIo;
use crate::HostMemError;
use std::path::PathBuf;

/// A memory mapped BAR of a PCI function.
pub struct PciBar {
    mapping: Mapping,
    pci_id: String,
    index: u8,
}

impl std::fmt::Debug for PciBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciBar")
            .field("pci_id", &self.pci_id)
            .field("index", &self.index)
            .field("len", &self.mapping.len())
            .finish()
    }
}

/// Checks `pci_id` looks like `dddd:bb:dd.f`.
fn validate_pci_id(pci_id: &str) -> Result<(), HostMemError> {
    let valid = pci_id.len() == 12
        && pci_id.char_indices().all(|(i, c)| match i {
            4 | 7 => c == ':',
            10 => c == '.',
            _ => c.is_ascii_hexdigit(),
        });
    if valid {
        Ok(())
    } else {
        Err(HostMemError::InvalidArgument(
            "PCI address must have the form dddd:bb:dd.f",
        ))
    }
}

impl PciBar {
    /// Maps BAR `index` of the function at `pci_id`.
    pub fn open(pci_id: &str, index: u8) -> Result<Self, HostMemError> {
        validate_pci_id(pci_id)?;
        if index > 5 {
            return Err(HostMemError::InvalidArgument("BAR index must be 0..=5"));
        }
        let path = PathBuf::from(format!("/sys/bus/pci/devices/{pci_id}/resource{index}"));
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| HostMemError::Os {
                op: "open BAR resource",
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| HostMemError::Os {
                op: "stat BAR resource",
                source,
            })?
            .len() as usize;
        if len == 0 {
            return Err(HostMemError::InvalidArgument("BAR is not implemented"));
        }
        let mapping = Mapping::shared(file.file(), len).map_err(|source| HostMemError::Os {
            op: "map BAR",
            source,
        })?;
        let bar = Self {
            mapping,
            pci_id: pci_id.to_owned(),
            index,
        };
        tracing::debug!(?bar, "mapped BAR");
        Ok(bar)
    }

    /// The PCI address of the function.
    pub fn pci_id(&self) -> &str {
        &self.pci_id
    }

    fn reg_ptr<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset <= self.mapping.len() - size_of::<T>() && offset % align_of::<T>() == 0,
            "bad register access at {offset:#x}"
        );
        // SAFETY: the offset is validated to be in bounds.
        unsafe { self.mapping.as_ptr().add(offset).cast() }
    }
}

impl DeviceRegisterIo for PciBar {
    fn len(&self) -> usize {
        self.mapping.len()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe { std::ptr::read_volatile(self.reg_ptr::<u32>(offset)) }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe { std::ptr::read_volatile(self.reg_ptr::<u64>(offset)) }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe { std::ptr::write_volatile(self.reg_ptr::<u32>(offset), data) }
    }

    fn write_u64(&self, offset: usize, data: u64) {
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe { std::ptr::write_volatile(self.reg_ptr::<u64>(offset), data) }
    }
}

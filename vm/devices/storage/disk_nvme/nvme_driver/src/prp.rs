// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Physical region page (PRP) construction for DMA buffers.

use super::spec;
use crate::request::PrpListPage;
use crate::Error;
use crate::NVME_PAGE_SIZE;
use user_driver::heap::DmaBuffer;

/// Value for unused PRP entries, to catch/mitigate buffer size mismatches.
const INVALID_PAGE_ADDR: u64 = !(NVME_PAGE_SIZE as u64 - 1);

/// Entries in one PRP list page. Lists are never chained.
const PRP_LIST_ENTRIES: usize = NVME_PAGE_SIZE / size_of::<u64>();

/// The data pointer of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Prp {
    dptr: [u64; 2],
}

impl Prp {
    /// Describes the first `len` bytes of `buffer`.
    ///
    /// The bytes must lie within one hugepage, since only then are they
    /// physically contiguous. Transfers of more than two pages are described
    /// by writing a PRP list into `prp_list`.
    pub fn new(
        buffer: &DmaBuffer<'_>,
        len: usize,
        prp_list: Option<PrpListPage<'_>>,
    ) -> Result<Self, Error> {
        if len == 0 || len > buffer.len() {
            return Err(Error::InvalidArgument("transfer length does not fit buffer"));
        }
        if !buffer.is_phys_contiguous(len) {
            return Err(Error::InvalidArgument(
                "buffer crosses a hugepage boundary",
            ));
        }
        let prp1 = buffer.phys();
        let pages = len.div_ceil(NVME_PAGE_SIZE);
        let dptr = match pages {
            1 => [prp1, INVALID_PAGE_ADDR],
            2 => [prp1, prp1 + NVME_PAGE_SIZE as u64],
            _ => {
                if pages - 1 > PRP_LIST_ENTRIES {
                    return Err(Error::InvalidArgument(
                        "transfer is too large for one PRP list",
                    ));
                }
                let list = prp_list.ok_or(Error::InvalidArgument(
                    "transfer needs a PRP list page",
                ))?;
                for i in 1..pages {
                    list.write_entry(i - 1, prp1 + (i * NVME_PAGE_SIZE) as u64);
                }
                [prp1, list.phys()]
            }
        };
        Ok(Self { dptr })
    }

    pub fn dptr(&self) -> [u64; 2] {
        self.dptr
    }

    /// Sets the data pointer of `command`.
    pub fn apply(&self, command: &mut spec::Command) {
        command.dptr = self.dptr;
    }
}

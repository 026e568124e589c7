// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe namespace frontend.

use super::spec;
use super::spec::nvm;
use crate::controller::Controller;
use crate::queue_pair::QueuePair;
use crate::Error;
use crate::NVME_PAGE_SHIFT;
use user_driver::heap::DmaBuffer;
use user_driver::DeviceRegisterIo;
use zerocopy::FromZeros;

/// An error getting a namespace.
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("namespace not found")]
    NotFound,
    #[error("formatted lba size invalid")]
    FlbasInvalid,
    #[error("lba format invalid: {0:?}")]
    LbaFormatInvalid(nvm::Lbaf),
    #[error("nvme request failed")]
    Request(#[source] Error),
    #[error("maximum data transfer size too small: 2^{0} pages")]
    MdtsInvalid(u8),
}

/// An NVMe namespace.
#[derive(Debug)]
pub struct Namespace {
    nsid: u32,
    block_count: u64,
    block_shift: u32,
    max_transfer_block_count: u32,
    timeout_ms: u32,
}

impl Namespace {
    /// Identifies namespace `nsid` of `controller`.
    pub fn identify<T: DeviceRegisterIo>(
        controller: &mut Controller<'_, T>,
        nsid: u32,
    ) -> Result<Self, NamespaceError> {
        let identify = controller
            .identify_namespace(nsid)
            .map_err(NamespaceError::Request)?;
        Self::new_from_identify(controller.identify(), controller.timeout_ms(), nsid, &identify)
    }

    fn new_from_identify(
        controller_identify: &spec::IdentifyController,
        timeout_ms: u32,
        nsid: u32,
        identify: &nvm::IdentifyNamespace,
    ) -> Result<Self, NamespaceError> {
        if identify.nsze == 0 {
            return Err(NamespaceError::NotFound);
        }

        let lba_format_index = identify.flbas.low_index();
        if lba_format_index > identify.nlbaf {
            return Err(NamespaceError::FlbasInvalid);
        }

        let lbaf = identify.lbaf[lba_format_index as usize];
        let block_shift = lbaf.lbads();
        if !matches!(block_shift, 9..=16) {
            return Err(NamespaceError::LbaFormatInvalid(lbaf));
        }

        let max_transfer_block_count = {
            let mdts = if controller_identify.mdts != 0 {
                controller_identify.mdts
            } else {
                u8::MAX
            };
            let max_transfer_bits = mdts.saturating_add(NVME_PAGE_SHIFT);
            1 << max_transfer_bits
                .checked_sub(block_shift)
                .ok_or(NamespaceError::MdtsInvalid(mdts))?
                .min(16)
        };

        let namespace = Self {
            nsid,
            block_count: identify.nsze,
            block_shift: block_shift.into(),
            max_transfer_block_count,
            timeout_ms,
        };
        tracing::info!(
            nsid,
            block_count = namespace.block_count,
            block_size = namespace.block_size(),
            "namespace identified"
        );
        Ok(namespace)
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Gets the current block count.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Gets the block size in bytes.
    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    /// The largest transfer a single command may carry, in blocks.
    pub fn max_transfer_block_count(&self) -> u32 {
        self.max_transfer_block_count
    }

    /// Reads `block_count` blocks starting at `lba` into `buffer`.
    pub fn read<T: DeviceRegisterIo>(
        &self,
        qp: &mut QueuePair<'_, T>,
        lba: u64,
        block_count: u32,
        buffer: &DmaBuffer<'_>,
    ) -> Result<(), Error> {
        self.io(qp, nvm::NvmOpcode::READ, lba, block_count, buffer)
    }

    /// Writes `block_count` blocks from `buffer` starting at `lba`.
    pub fn write<T: DeviceRegisterIo>(
        &self,
        qp: &mut QueuePair<'_, T>,
        lba: u64,
        block_count: u32,
        buffer: &DmaBuffer<'_>,
    ) -> Result<(), Error> {
        self.io(qp, nvm::NvmOpcode::WRITE, lba, block_count, buffer)
    }

    fn io<T: DeviceRegisterIo>(
        &self,
        qp: &mut QueuePair<'_, T>,
        opcode: nvm::NvmOpcode,
        lba: u64,
        block_count: u32,
        buffer: &DmaBuffer<'_>,
    ) -> Result<(), Error> {
        if block_count == 0 || block_count > self.max_transfer_block_count {
            return Err(Error::InvalidArgument("unsupported transfer block count"));
        }
        if lba
            .checked_add(block_count.into())
            .is_none_or(|end| end > self.block_count)
        {
            return Err(Error::InvalidArgument("transfer past end of namespace"));
        }
        let len = (block_count as usize) << self.block_shift;
        let command = spec::Command {
            cdw0: spec::Cdw0::new().with_opcode(opcode.0),
            nsid: self.nsid,
            cdw10: nvm::Cdw10ReadWrite::new().with_sbla_low(lba as u32).into(),
            cdw11: nvm::Cdw11ReadWrite::new()
                .with_sbla_high((lba >> 32) as u32)
                .into(),
            cdw12: nvm::Cdw12ReadWrite::new()
                .with_nlb_z((block_count - 1) as u16)
                .into(),
            ..FromZeros::new_zeroed()
        };
        qp.submit_sync_with_data(command, buffer, len, self.timeout_ms)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    fn identify(nsze: u64, lbads: u8) -> nvm::IdentifyNamespace {
        let mut identify = nvm::IdentifyNamespace::new_zeroed();
        identify.nsze = nsze;
        identify.lbaf[0] = nvm::Lbaf::new().with_lbads(lbads);
        identify
    }

    fn controller(mdts: u8) -> spec::IdentifyController {
        let mut identify = spec::IdentifyController::new_zeroed();
        identify.mdts = mdts;
        identify
    }

    #[test]
    fn block_geometry() {
        let ns = Namespace::new_from_identify(&controller(5), 1000, 1, &identify(1 << 20, 9))
            .unwrap();
        assert_eq!(ns.block_size(), 512);
        assert_eq!(ns.block_count(), 1 << 20);
        // 2^5 pages of 4KiB is 256 blocks of 512 bytes.
        assert_eq!(ns.max_transfer_block_count(), 256);

        let ns = Namespace::new_from_identify(&controller(0), 1000, 1, &identify(8, 12)).unwrap();
        assert_eq!(ns.block_size(), 4096);
        assert_eq!(ns.max_transfer_block_count(), 1 << 16);
    }

    #[test]
    fn rejects_bad_identify_data() {
        assert!(matches!(
            Namespace::new_from_identify(&controller(0), 1000, 1, &identify(0, 9)),
            Err(NamespaceError::NotFound)
        ));
        assert!(matches!(
            Namespace::new_from_identify(&controller(0), 1000, 1, &identify(8, 7)),
            Err(NamespaceError::LbaFormatInvalid(_))
        ));
        let mut bad_flbas = identify(8, 9);
        bad_flbas.flbas = nvm::Flbas::new().with_low_index(2);
        assert!(matches!(
            Namespace::new_from_identify(&controller(0), 1000, 1, &bad_flbas),
            Err(NamespaceError::FlbasInvalid)
        ));
    }
}

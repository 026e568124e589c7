// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the NVM command set specification.

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identify Namespace data structure (CNS 0), trimmed to the size and format
/// fields.
#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Clone)]
pub struct IdentifyNamespace {
    /// Namespace size in logical blocks.
    pub nsze: u64,
    /// Namespace capacity in logical blocks.
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats. Zero based.
    pub nlbaf: u8,
    pub flbas: Flbas,
    pub rsvd1: [u8; 101],
    pub lbaf: [Lbaf; 16],
    pub rsvd2: [u8; 3904],
}

const _: () = assert!(size_of::<IdentifyNamespace>() == 4096);

impl IdentifyNamespace {
    /// The LBA format the namespace is currently formatted with.
    pub fn current_lbaf(&self) -> Lbaf {
        self.lbaf[self.flbas.low_index() as usize]
    }

    /// The size of one logical block in bytes.
    pub fn block_size(&self) -> u32 {
        1 << self.current_lbaf().lbads()
    }
}

/// LBA format
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Lbaf {
    /// Metadata size
    pub ms: u16,
    /// LBA data size (as power of two)
    pub lbads: u8,
    /// Relative performance
    #[bits(2)]
    pub rp: u8,
    #[bits(6)]
    _rsvd: u8,
}

/// Formatted LBA size
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Flbas {
    #[bits(4)]
    pub low_index: u8,
    pub inband_metadata: bool,
    /// High bits of the index. Only valid if NLBAF > 16.
    #[bits(2)]
    pub high_index: u8,
    #[bits(1)]
    _rsvd: u8,
}

#[open_enum]
#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub enum NvmOpcode {
    FLUSH = 0x00,
    WRITE = 0x01,
    READ = 0x02,
}

#[bitfield(u32)]
pub struct Cdw10ReadWrite {
    /// Starting LBA, low 32 bits.
    pub sbla_low: u32,
}

#[bitfield(u32)]
pub struct Cdw11ReadWrite {
    /// Starting LBA, high 32 bits.
    pub sbla_high: u32,
}

#[bitfield(u32)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks. Zero-based.
    pub nlb_z: u16,
    #[bits(4)]
    _rsvd: u8,
    /// Directive type (write only).
    #[bits(4)]
    pub dtype: u8,
    /// Storage tag check.
    pub stc: bool,
    _rsvd2: bool,
    /// Protection information
    #[bits(4)]
    pub prinfo: u8,
    /// Force unit access
    pub fua: bool,
    /// Limited retry
    pub lr: bool,
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the NVMe specifications:
//!
//! Base 2.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-Base-Specification-2.0c-2022.10.04-Ratified.pdf>
//! PCIe transport 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-PCIe-Transport-Specification-1.0c-2022.10.03-Ratified.pdf>
//!
//! Only the subset needed to bring up a controller, create queues and move
//! data is defined here. Layouts are bit-exact with the hardware.

#![no_std]

pub mod nvm;

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Offset of the first doorbell register in BAR0.
pub const DOORBELL_BASE: usize = 0x1000;

/// Size of a submission queue entry, as a power of two (64 bytes).
pub const SQE_SIZE_SHIFT: u8 = 6;

/// Size of a completion queue entry, as a power of two (16 bytes).
pub const CQE_SIZE_SHIFT: u8 = 4;

#[open_enum]
#[repr(u16)]
#[derive(Copy, Clone, Debug)]
pub enum Register {
    CAP = 0x0,
    VS = 0x8,
    INTMS = 0xc,
    INTMC = 0x10,
    CC = 0x14,
    RESERVED = 0x18,
    CSTS = 0x1c,
    NSSR = 0x20,
    AQA = 0x24,
    ASQ = 0x28,
    ACQ = 0x30,
}

/// Controller capabilities.
#[bitfield(u64)]
pub struct Cap {
    /// Maximum queue entries supported. Zero-based.
    pub mqes_z: u16,
    /// Contiguous queues required.
    pub cqr: bool,
    pub ams_weighted_round_robin_with_urgent: bool,
    pub ams_vendor_specific: bool,
    #[bits(5)]
    pub reserved: u8,
    /// Worst case time to wait for CSTS.RDY to change, in 500ms units.
    pub to: u8,
    /// Doorbell stride: doorbells are `4 << dstrd` bytes apart.
    #[bits(4)]
    pub dstrd: u8,
    pub nssrs: bool,
    pub css_nvm: bool,
    #[bits(5)]
    pub css_reserved: u8,
    pub multiple_io: bool,
    pub admin_only: bool,
    pub bps: bool,
    #[bits(2)]
    pub cps: u8,
    /// Minimum memory page size, as `2 ^ (12 + mpsmin)`.
    #[bits(4)]
    pub mpsmin: u8,
    #[bits(4)]
    pub mpsmax: u8,
    pub pmrs: bool,
    pub cmbs: bool,
    pub nsss: bool,
    pub crwms: bool,
    pub crims: bool,
    #[bits(3)]
    pub reserved2: u64,
}

impl Cap {
    /// The timeout for CSTS.RDY transitions, in milliseconds.
    pub fn timeout_ms(&self) -> u32 {
        self.to() as u32 * 500
    }

    /// The distance between two doorbell registers, in bytes.
    pub fn doorbell_stride(&self) -> usize {
        4 << self.dstrd()
    }

    /// The maximum number of entries in a single queue.
    pub fn max_queue_entries(&self) -> u32 {
        self.mqes_z() as u32 + 1
    }
}

/// Controller configuration.
#[bitfield(u32)]
pub struct Cc {
    pub en: bool,
    #[bits(3)]
    pub reserved: u8,
    #[bits(3)]
    pub css: u8,
    #[bits(4)]
    pub mps: u8,
    #[bits(3)]
    pub ams: u8,
    #[bits(2)]
    pub shn: u8,
    #[bits(4)]
    pub iosqes: u8,
    #[bits(4)]
    pub iocqes: u8,
    pub crime: bool,
    #[bits(7)]
    pub reserved2: u8,
}

/// Controller status.
#[bitfield(u32)]
pub struct Csts {
    pub rdy: bool,
    /// Controller fatal status.
    pub cfs: bool,
    #[bits(2)]
    pub shst: u8,
    pub nssro: bool,
    pub pp: bool,
    pub st: bool,
    #[bits(25)]
    pub reserved: u32,
}

/// Admin queue attributes.
#[bitfield(u32)]
pub struct Aqa {
    #[bits(12)]
    pub asqs_z: u16,
    #[bits(4)]
    pub reserved: u8,
    #[bits(12)]
    pub acqs_z: u16,
    #[bits(4)]
    pub reserved2: u8,
}

/// A submission queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    /// PRP entry 1 and PRP entry 2.
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == 1 << SQE_SIZE_SHIFT);

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    pub reserved: u8,
    /// PRP or SGL for data transfer. Zero means PRPs.
    #[bits(2)]
    pub psdt: u8,
    pub cid: u16,
}

#[open_enum]
#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub enum AdminOpcode {
    DELETE_IO_SUBMISSION_QUEUE = 0x00,
    CREATE_IO_SUBMISSION_QUEUE = 0x01,
    GET_LOG_PAGE = 0x02,
    DELETE_IO_COMPLETION_QUEUE = 0x04,
    CREATE_IO_COMPLETION_QUEUE = 0x05,
    IDENTIFY = 0x06,
    ABORT = 0x08,
    SET_FEATURES = 0x09,
    GET_FEATURES = 0x0a,
}

/// A completion queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == 1 << CQE_SIZE_SHIFT);

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionStatus {
    pub phase: bool,
    /// 8 bits of status code followed by 3 bits of the status code type.
    #[bits(11)]
    pub status: u16,
    #[bits(2)]
    pub crd: u8,
    pub more: bool,
    pub dnr: bool,
}

#[open_enum]
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default)]
pub enum StatusCodeType {
    GENERIC = 0,
    COMMAND_SPECIFIC = 1,
    MEDIA_ERROR = 2,
    PATH_RELATED = 3,
    VENDOR_SPECIFIC = 7,
}

/// A completion status: the status code in the low 8 bits and the status code
/// type in the next 3.
#[open_enum]
#[repr(u16)]
#[derive(Copy, Clone, Debug, Default)]
pub enum Status {
    SUCCESS = 0x00,
    INVALID_COMMAND_OPCODE = 0x01,
    INVALID_FIELD_IN_COMMAND = 0x02,
    COMMAND_ID_CONFLICT = 0x03,
    DATA_TRANSFER_ERROR = 0x04,
    INTERNAL_ERROR = 0x06,
    COMMAND_ABORT_REQUESTED = 0x07,
    COMMAND_ABORTED_DUE_TO_SQ_DELETION = 0x08,
    INVALID_NAMESPACE_OR_FORMAT = 0x0b,
    COMMAND_SEQUENCE_ERROR = 0x0c,
    PRP_OFFSET_INVALID = 0x13,

    LBA_OUT_OF_RANGE = 0x80,
    CAPACITY_EXCEEDED = 0x81,
    NAMESPACE_NOT_READY = 0x82,

    COMPLETION_QUEUE_INVALID = 0x100,
    INVALID_QUEUE_IDENTIFIER = 0x101,
    INVALID_QUEUE_SIZE = 0x102,
    INVALID_QUEUE_DELETION = 0x10c,

    MEDIA_WRITE_FAULT = 0x280,
    MEDIA_UNRECOVERED_READ_ERROR = 0x281,
}

impl Status {
    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8 & 0x7)
    }
}

impl From<CompletionStatus> for Status {
    fn from(value: CompletionStatus) -> Self {
        Status(value.status())
    }
}

// Identify
#[bitfield(u32)]
pub struct Cdw10Identify {
    pub cns: u8,
    pub reserved: u8,
    pub cntid: u16,
}

#[open_enum]
#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub enum Cns {
    NAMESPACE = 0x0,
    CONTROLLER = 0x1,
    ACTIVE_NAMESPACES = 0x2,
}

/// Identify Controller data structure (CNS 1), trimmed to the fields this
/// driver consumes. Reserved and unused ranges are kept as byte arrays so the
/// structure stays exactly one 4KB page.
#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    /// Serial number, space padded ASCII.
    pub sn: [u8; 20],
    /// Model number, space padded ASCII.
    pub mn: [u8; 40],
    /// Firmware revision, space padded ASCII.
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum data transfer size (in minimum page size units, as power of
    /// two).
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rsvd1: [u8; 428],
    pub sqes: QueueEntrySize,
    pub cqes: QueueEntrySize,
    pub maxcmd: u16,
    /// Number of namespaces.
    pub nn: u32,
    pub rsvd2: [u8; 3576],
}

const _: () = assert!(size_of::<IdentifyController>() == 4096);

impl IdentifyController {
    /// The serial number with trailing padding removed.
    pub fn serial_number(&self) -> &str {
        ascii_field(&self.sn)
    }

    /// The model number with trailing padding removed.
    pub fn model_number(&self) -> &str {
        ascii_field(&self.mn)
    }

    /// The firmware revision with trailing padding removed.
    pub fn firmware_revision(&self) -> &str {
        ascii_field(&self.fr)
    }
}

/// Decodes a space or NUL padded ASCII identify field. Non-UTF-8 contents
/// decode as an empty string.
fn ascii_field(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes)
        .map(|s| s.trim_end_matches([' ', '\0']))
        .unwrap_or("")
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueEntrySize {
    /// Required entry size, as a power of two.
    #[bits(4)]
    pub min: u8,
    /// Maximum entry size, as a power of two.
    #[bits(4)]
    pub max: u8,
}

#[bitfield(u32)]
pub struct Cdw10CreateIoQueue {
    pub qid: u16,
    pub qsize_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoCompletionQueue {
    /// Physically contiguous.
    pub pc: bool,
    /// Interrupts enabled.
    pub ien: bool,
    #[bits(14)]
    pub rsvd: u16,
    pub iv: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoSubmissionQueue {
    /// Physically contiguous.
    pub pc: bool,
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    pub rsvd: u16,
    pub cqid: u16,
}

#[bitfield(u32)]
pub struct Cdw10DeleteIoQueue {
    pub qid: u16,
    pub rsvd: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn status_splits_code_and_type() {
        let status = Status::INVALID_QUEUE_IDENTIFIER;
        assert_eq!(status.status_code(), 0x01);
        assert_eq!(status.status_code_type(), StatusCodeType::COMMAND_SPECIFIC);

        let raw = CompletionStatus::new()
            .with_phase(true)
            .with_status(Status::LBA_OUT_OF_RANGE.0);
        assert_eq!(u16::from(raw), 0x0101);
        assert_eq!(Status::from(raw), Status::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn cap_derived_values() {
        let cap = Cap::new().with_to(20).with_dstrd(2).with_mqes_z(1023);
        assert_eq!(cap.timeout_ms(), 10_000);
        assert_eq!(cap.doorbell_stride(), 16);
        assert_eq!(cap.max_queue_entries(), 1024);
        // DSTRD lives in bits 32..35.
        assert_eq!(u64::from(cap) >> 32 & 0xf, 2);
    }

    #[test]
    fn cc_enable_layout() {
        let cc = Cc::new()
            .with_iocqes(CQE_SIZE_SHIFT)
            .with_iosqes(SQE_SIZE_SHIFT)
            .with_en(true);
        assert_eq!(u32::from(cc), (4 << 20) | (6 << 16) | 1);
    }

    #[test]
    fn command_identifier_offsets() {
        let mut command = Command::new_zeroed();
        command.cdw0 = Cdw0::new().with_opcode(0x06).with_cid(0x1234);
        command.dptr = [0xaaaa_0000, 0xbbbb_0000];
        command.cdw10 = 1;
        let bytes = command.as_bytes();
        assert_eq!(bytes[0], 0x06);
        assert_eq!(&bytes[2..4], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[24..32], &0xaaaa_0000u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0xbbbb_0000u64.to_le_bytes());
        assert_eq!(&bytes[40..44], &1u32.to_le_bytes());
    }

    #[test]
    fn identify_strings() {
        let mut identify = IdentifyController::new_zeroed();
        identify.sn[..6].copy_from_slice(b"SN0001");
        identify.sn[6..].fill(b' ');
        identify.mn[..5].copy_from_slice(b"Model");
        let bytes = identify.as_bytes();
        assert_eq!(&bytes[4..10], b"SN0001");
        assert_eq!(&bytes[24..29], b"Model");
        assert_eq!(identify.serial_number(), "SN0001");
        assert_eq!(identify.model_number(), "Model");
        assert_eq!(identify.firmware_revision(), "");
    }
}

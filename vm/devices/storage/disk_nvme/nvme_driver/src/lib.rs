// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A polled, synchronous NVMe driver core for user-mode drivers.
//!
//! The controller's admin and I/O queue pairs live in a
//! [`user_driver::heap::DmaHeap`]; the controller registers are reached
//! through any [`user_driver::DeviceRegisterIo`], such as a sysfs-mapped
//! BAR or an emulated device.

#![forbid(unsafe_code)]

mod controller;
mod error;
mod namespace;
mod prp;
mod qid;
mod queue_pair;
mod queues;
mod registers;
mod request;

pub use self::controller::Controller;
pub use self::controller::ADMIN_QUEUE_DEPTH;
pub use self::error::Error;
pub use self::error::NvmeError;
pub use self::namespace::Namespace;
pub use self::namespace::NamespaceError;
pub use self::prp::Prp;
pub use self::qid::QidBitmap;
pub use self::qid::MAX_QID;
pub use self::queue_pair::admin_cmd;
pub use self::queue_pair::QueuePair;
pub use self::request::PrpListPage;
pub use self::request::Request;
pub use self::request::RequestPool;
pub use self::request::REQUEST_POOL_LEN;

use nvme_spec as spec;

const NVME_PAGE_SHIFT: u8 = 12;
const NVME_PAGE_SIZE: usize = 1 << NVME_PAGE_SHIFT;

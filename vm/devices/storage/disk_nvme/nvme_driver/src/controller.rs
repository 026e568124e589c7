// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller bring-up and I/O queue management.

use super::spec;
use crate::qid::QidBitmap;
use crate::queue_pair::admin_cmd;
use crate::queue_pair::QueuePair;
use crate::registers::Bar0;
use crate::registers::DeviceRegisters;
use crate::Error;
use crate::NVME_PAGE_SIZE;
use std::sync::Arc;
use user_driver::heap::DmaBuffer;
use user_driver::heap::DmaHeap;
use user_driver::DeviceRegisterIo;

/// Entries in each admin ring.
pub const ADMIN_QUEUE_DEPTH: u16 = 32;

/// An enabled NVMe controller with its admin queue pair.
///
/// Dropping the controller clears CC.EN, so that the device stops using
/// the queue memory before it returns to the heap.
pub struct Controller<'a, T: DeviceRegisterIo> {
    registers: Arc<DeviceRegisters<T>>,
    heap: &'a DmaHeap,
    admin: QueuePair<'a, T>,
    qids: QidBitmap,
    /// Scratch page for identify data.
    scratch: DmaBuffer<'a>,
    identify: Box<spec::IdentifyController>,
    /// Queue pairs the controller may still consider live, because deleting
    /// them failed. Their rings stay allocated until the controller is
    /// disabled.
    retired: Vec<QueuePair<'a, T>>,
}

impl<T: DeviceRegisterIo> std::fmt::Debug for Controller<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cap", &self.registers.cap)
            .field("admin", &self.admin)
            .field("qids", &self.qids)
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl<'a, T: DeviceRegisterIo> Controller<'a, T> {
    /// Resets and enables the controller behind `bar0`, placing the admin
    /// queues in `heap`, and identifies it.
    pub fn open(bar0: T, heap: &'a DmaHeap) -> Result<Self, Error> {
        let span = tracing::info_span!("nvme_open", timeout_ms = tracing::field::Empty);
        let _enter = span.enter();

        let registers = Arc::new(DeviceRegisters::new(Bar0(bar0)));
        if u64::from(registers.cap) == !0 {
            return Err(Error::DeviceGone);
        }
        span.record("timeout_ms", registers.timeout_ms());
        tracing::debug!(
            cap = ?registers.cap,
            cc = ?registers.bar0.cc(),
            csts = ?registers.bar0.csts(),
            "controller registers"
        );
        if registers.cap.mpsmin() != 0 {
            return Err(Error::InvalidArgument(
                "controller does not support 4KiB memory pages",
            ));
        }

        // The admin queues may only be programmed while the controller is
        // disabled.
        registers.disable()?;

        let depth = clamp_depth(&registers.cap, ADMIN_QUEUE_DEPTH);
        let admin = QueuePair::new(0, depth, heap, registers.clone())?;
        let scratch = heap.alloc(NVME_PAGE_SIZE)?;

        // From here on, dropping `this` disables the controller again.
        let mut this = Self {
            registers,
            heap,
            admin,
            qids: QidBitmap::new(),
            scratch,
            identify: Box::new(zerocopy::FromZeros::new_zeroed()),
            retired: Vec::new(),
        };
        this.enable()?;
        this.identify_controller()?;
        tracing::info!(
            serial = this.identify.serial_number(),
            model = this.identify.model_number(),
            firmware = this.identify.firmware_revision(),
            "controller ready"
        );
        Ok(this)
    }

    fn enable(&mut self) -> Result<(), Error> {
        let depth = self.admin.depth();
        let bar0 = &self.registers.bar0;
        bar0.set_aqa(
            spec::Aqa::new()
                .with_asqs_z(depth - 1)
                .with_acqs_z(depth - 1),
        );
        bar0.set_asq(self.admin.sq_addr());
        bar0.set_acq(self.admin.cq_addr());
        bar0.set_cc(
            spec::Cc::new()
                .with_iosqes(6)
                .with_iocqes(4)
                .with_mps(0)
                .with_css(0)
                .with_ams(0)
                .with_en(true),
        );
        self.registers.wait_ready(true)
    }

    fn identify_controller(&mut self) -> Result<(), Error> {
        let command = spec::Command {
            cdw10: spec::Cdw10Identify::new()
                .with_cns(spec::Cns::CONTROLLER.0)
                .into(),
            ..admin_cmd(spec::AdminOpcode::IDENTIFY)
        };
        let timeout_ms = self.timeout_ms();
        self.admin
            .submit_sync_with_data(command, &self.scratch, NVME_PAGE_SIZE, timeout_ms)?;
        *self.identify = self.scratch.read_obj(0);
        Ok(())
    }

    /// Reads the identify namespace data for `nsid`.
    pub fn identify_namespace(&mut self, nsid: u32) -> Result<spec::nvm::IdentifyNamespace, Error> {
        if nsid == 0 || nsid > self.identify.nn {
            return Err(Error::InvalidArgument("namespace identifier out of range"));
        }
        let command = spec::Command {
            nsid,
            cdw10: spec::Cdw10Identify::new()
                .with_cns(spec::Cns::NAMESPACE.0)
                .into(),
            ..admin_cmd(spec::AdminOpcode::IDENTIFY)
        };
        let timeout_ms = self.timeout_ms();
        self.admin
            .submit_sync_with_data(command, &self.scratch, NVME_PAGE_SIZE, timeout_ms)?;
        Ok(self.scratch.read_obj(0))
    }

    /// The identify controller data read at open.
    pub fn identify(&self) -> &spec::IdentifyController {
        &self.identify
    }

    pub fn cap(&self) -> spec::Cap {
        self.registers.cap
    }

    /// The controller's worst case response time, from CAP.TO.
    pub fn timeout_ms(&self) -> u32 {
        self.registers.timeout_ms()
    }

    pub fn heap(&self) -> &'a DmaHeap {
        self.heap
    }

    pub fn qids(&self) -> &QidBitmap {
        &self.qids
    }

    /// The admin queue pair, for issuing admin commands directly.
    pub fn admin(&mut self) -> &mut QueuePair<'a, T> {
        &mut self.admin
    }

    /// Allocates a queue identifier and a queue pair of `depth` entries and
    /// creates its completion, then submission, queue on the controller.
    ///
    /// `depth` is clamped to what the controller and a one page ring
    /// support.
    pub fn create_io_qpair(&mut self, depth: u16) -> Result<QueuePair<'a, T>, Error> {
        let clamped = clamp_depth(&self.registers.cap, depth);
        if clamped != depth {
            tracing::warn!(depth, clamped, "clamping io queue depth");
        }
        let qid = self.qids.find_free()?;
        self.qids.alloc(qid)?;
        let qp = match QueuePair::new(qid, clamped, self.heap, self.registers.clone()) {
            Ok(qp) => qp,
            Err(err) => {
                self.qids.free(qid)?;
                return Err(err);
            }
        };

        let timeout_ms = self.timeout_ms();
        let cdw10: u32 = spec::Cdw10CreateIoQueue::new()
            .with_qid(qid)
            .with_qsize_z(clamped - 1)
            .into();
        let r = self.admin.submit_sync(
            spec::Command {
                dptr: [qp.cq_addr(), 0],
                cdw10,
                cdw11: spec::Cdw11CreateIoCompletionQueue::new()
                    .with_pc(true)
                    .into(),
                ..admin_cmd(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE)
            },
            timeout_ms,
        );
        if let Err(err) = r {
            tracing::error!(
                qid,
                error = &err as &dyn std::error::Error,
                "failed to create completion queue"
            );
            self.qids.free(qid)?;
            return Err(err);
        }

        let r = self.admin.submit_sync(
            spec::Command {
                dptr: [qp.sq_addr(), 0],
                cdw10,
                cdw11: spec::Cdw11CreateIoSubmissionQueue::new()
                    .with_pc(true)
                    .with_cqid(qid)
                    .into(),
                ..admin_cmd(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE)
            },
            timeout_ms,
        );
        if let Err(err) = r {
            tracing::error!(
                qid,
                error = &err as &dyn std::error::Error,
                "failed to create submission queue"
            );
            match self.delete_queue(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE, qid) {
                Ok(()) => self.qids.free(qid)?,
                Err(delete_err) => {
                    tracing::error!(
                        qid,
                        error = &delete_err as &dyn std::error::Error,
                        "failed to delete completion queue"
                    );
                    self.retire(qp);
                }
            }
            return Err(err);
        }

        tracing::info!(qid, depth = clamped, "io queue pair created");
        Ok(qp)
    }

    /// Keeps `qp` and its identifier until the controller is disabled.
    fn retire(&mut self, qp: QueuePair<'a, T>) {
        tracing::warn!(qid = qp.qid(), "keeping queue pair until controller reset");
        self.retired.push(qp);
    }

    fn delete_queue(&mut self, opcode: spec::AdminOpcode, qid: u16) -> Result<(), Error> {
        let timeout_ms = self.timeout_ms();
        self.admin.submit_sync(
            spec::Command {
                cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into(),
                ..admin_cmd(opcode)
            },
            timeout_ms,
        )?;
        Ok(())
    }

    /// Deletes the submission, then completion, queue of `qp` on the
    /// controller and releases its identifier.
    ///
    /// On failure the controller keeps the queue pair and its identifier
    /// until it is disabled, since the device may still access the rings.
    pub fn delete_io_qpair(&mut self, qp: QueuePair<'a, T>) -> Result<(), Error> {
        let qid = qp.qid();
        if qid == 0 || !self.qids.is_allocated(qid)? {
            return Err(Error::InvalidArgument("not an io queue pair of this controller"));
        }
        let r = self
            .delete_queue(spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE, qid)
            .and_then(|()| self.delete_queue(spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE, qid));
        if let Err(err) = r {
            tracing::error!(
                qid,
                error = &err as &dyn std::error::Error,
                "failed to delete io queue pair"
            );
            self.retire(qp);
            return Err(err);
        }
        drop(qp);
        self.qids.free(qid)?;
        tracing::info!(qid, "io queue pair deleted");
        Ok(())
    }
}

impl<T: DeviceRegisterIo> Drop for Controller<'_, T> {
    fn drop(&mut self) {
        // Fields, including retired queue pairs, are freed after this
        // returns.
        let _span = tracing::info_span!("nvme_close").entered();
        if let Err(err) = self.registers.disable() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to disable controller"
            );
        }
    }
}

/// Limits `depth` to one page of submission entries and to CAP.MQES.
fn clamp_depth(cap: &spec::Cap, depth: u16) -> u16 {
    let mqes = cap.max_queue_entries().min(u16::MAX.into()) as u16;
    depth.min(QueuePair::<()>::MAX_DEPTH).min(mqes)
}

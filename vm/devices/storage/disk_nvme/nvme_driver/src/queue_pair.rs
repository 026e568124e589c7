// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of an admin or IO queue pair.

use super::spec;
use crate::error::NvmeError;
use crate::prp::Prp;
use crate::queues::CompletionQueue;
use crate::queues::QueueFull;
use crate::queues::SubmissionQueue;
use crate::registers::DeviceRegisters;
use crate::request::RequestPool;
use crate::Error;
use crate::NVME_PAGE_SIZE;
use std::sync::Arc;
use std::time::Duration;
use user_driver::backoff::poll_until;
use user_driver::heap::DmaBuffer;
use user_driver::heap::DmaHeap;
use user_driver::DeviceRegisterIo;
use zerocopy::FromZeros;

/// A submission and completion ring sharing one queue identifier, polled
/// synchronously.
///
/// Commands are tracked by CID from submission to completion. Completions
/// may arrive in any order.
pub struct QueuePair<'a, T> {
    qid: u16,
    depth: u16,
    sq: SubmissionQueue<'a>,
    cq: CompletionQueue<'a>,
    requests: RequestPool<'a>,
    registers: Arc<DeviceRegisters<T>>,
}

impl<T> std::fmt::Debug for QueuePair<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qid", &self.qid)
            .field("depth", &self.depth)
            .field("tail", &self.sq.tail())
            .field("head", &self.cq.head())
            .field("phase", &self.cq.phase())
            .finish()
    }
}

impl<T> QueuePair<'_, T> {
    /// Maximum queue size in entries, limited by one page per ring.
    pub const MAX_DEPTH: u16 = (NVME_PAGE_SIZE / size_of::<spec::Command>()) as u16;
}

impl<'a, T: DeviceRegisterIo> QueuePair<'a, T> {
    pub(crate) fn new(
        qid: u16,
        depth: u16,
        heap: &'a DmaHeap,
        registers: Arc<DeviceRegisters<T>>,
    ) -> Result<Self, Error> {
        if !(2..=Self::MAX_DEPTH).contains(&depth) {
            return Err(Error::InvalidArgument("unsupported queue depth"));
        }
        let sq_mem = heap.alloc(NVME_PAGE_SIZE)?;
        let cq_mem = heap.alloc(NVME_PAGE_SIZE)?;
        // Admin payloads are at most one page and never need a PRP list.
        // Synchronous I/O holds at most `depth` CIDs at once; a caller that
        // keeps more outstanding gets `ResourceExhausted` for list transfers.
        let requests = if qid == 0 {
            RequestPool::new()
        } else {
            RequestPool::with_prp_lists(heap, depth.into())?
        };
        let qp = Self {
            qid,
            depth,
            sq: SubmissionQueue::new(qid, depth, sq_mem),
            cq: CompletionQueue::new(qid, depth, cq_mem),
            requests,
            registers,
        };
        tracing::debug!(?qp, sq = qp.sq_addr(), cq = qp.cq_addr(), "queue pair allocated");
        Ok(qp)
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// The next submission ring slot.
    pub fn tail(&self) -> u16 {
        self.sq.tail()
    }

    /// The next completion ring slot.
    pub fn head(&self) -> u16 {
        self.cq.head()
    }

    /// The phase a new completion at `head` will carry.
    pub fn phase(&self) -> bool {
        self.cq.phase()
    }

    pub fn sq_addr(&self) -> u64 {
        self.sq.phys()
    }

    pub fn cq_addr(&self) -> u64 {
        self.cq.phys()
    }

    pub fn requests(&self) -> &RequestPool<'a> {
        &self.requests
    }

    fn submit(
        &mut self,
        mut command: spec::Command,
        data: Option<(&DmaBuffer<'_>, usize)>,
    ) -> Result<u16, Error> {
        let cid = self.requests.alloc()?;
        let r = (|| {
            if let Some((buffer, len)) = data {
                let list = if len > 2 * NVME_PAGE_SIZE {
                    self.requests.prp_list(cid)?
                } else {
                    None
                };
                Prp::new(buffer, len, list)?.apply(&mut command);
            }
            command.cdw0.set_cid(cid);
            self.sq.write(command).map_err(|QueueFull| {
                Error::ResourceExhausted("submission queue entry")
            })
        })();
        if let Err(err) = r {
            self.requests.free(cid)?;
            return Err(err);
        }
        Ok(cid)
    }

    /// Writes `command` into the submission ring under a fresh CID, which is
    /// returned. The device is not notified until [`Self::ring_doorbell`].
    pub fn enqueue(&mut self, command: spec::Command) -> Result<u16, Error> {
        self.submit(command, None)
    }

    /// Like [`Self::enqueue`], pointing the command at the first `len` bytes
    /// of `buffer`.
    pub fn enqueue_with_data(
        &mut self,
        command: spec::Command,
        buffer: &DmaBuffer<'_>,
        len: usize,
    ) -> Result<u16, Error> {
        self.submit(command, Some((buffer, len)))
    }

    /// Writes the submission tail doorbell, unless the device has already
    /// been told about every enqueued command. Returns whether a write
    /// happened.
    pub fn ring_doorbell(&mut self) -> bool {
        self.sq.commit(&self.registers)
    }

    /// Waits up to `timeout_ms` for the next completion and acknowledges it
    /// to the device. The completion's CID stays allocated.
    pub fn reap_completion(&mut self, timeout_ms: u32) -> Result<spec::Completion, Error> {
        let completion = poll_until(Duration::from_millis(timeout_ms.into()), || self.cq.read())
            .ok_or(Error::Timeout {
                what: "completion",
                timeout_ms,
            })?;
        if completion.sqid == self.sq.id() {
            self.sq.update_head(completion.sqhd);
        }
        self.cq.commit(&self.registers);
        tracing::trace!(
            qid = self.qid,
            cid = completion.cid,
            status = completion.status.status(),
            "completion"
        );
        Ok(completion)
    }

    fn wait(&mut self, cid: u16, timeout_ms: u32) -> Result<spec::Completion, Error> {
        self.ring_doorbell();
        let completion = loop {
            let completion = self.reap_completion(timeout_ms)?;
            self.requests.free(completion.cid)?;
            if completion.cid == cid {
                break completion;
            }
            tracing::warn!(
                qid = self.qid,
                cid = completion.cid,
                "dropping completion for another command"
            );
        };
        match completion.status.status() {
            0 => Ok(completion),
            status => Err(NvmeError::from(spec::Status(status)).into()),
        }
    }

    /// Submits `command` and waits for its completion, failing on a non-zero
    /// status.
    pub fn submit_sync(
        &mut self,
        command: spec::Command,
        timeout_ms: u32,
    ) -> Result<spec::Completion, Error> {
        let cid = self.enqueue(command)?;
        self.wait(cid, timeout_ms)
    }

    /// Like [`Self::submit_sync`], transferring the first `len` bytes of
    /// `buffer`.
    pub fn submit_sync_with_data(
        &mut self,
        command: spec::Command,
        buffer: &DmaBuffer<'_>,
        len: usize,
        timeout_ms: u32,
    ) -> Result<spec::Completion, Error> {
        let cid = self.enqueue_with_data(command, buffer, len)?;
        self.wait(cid, timeout_ms)
    }
}

/// A zeroed command with the given admin opcode.
pub fn admin_cmd(opcode: spec::AdminOpcode) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        ..FromZeros::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Bar0;
    use test_with_tracing::test;
    use user_driver::config::HostMemConfig;
    use user_driver::emulated::EmulatedDevice;
    use user_driver::emulated::EmulatedDmaRegion;
    use user_driver::emulated::MmioIntercept;
    use zerocopy::IntoBytes;

    const PHYS: u64 = 0x4_0000_0000;

    /// Completes every command on queue 1 as soon as its tail doorbell is
    /// written, with a fixed status.
    struct Responder {
        mem: Arc<EmulatedDmaRegion>,
        sq: u64,
        cq: u64,
        depth: u16,
        sq_head: u16,
        cq_tail: u16,
        phase: bool,
        status: u16,
        doorbells: Vec<(usize, u32)>,
    }

    impl MmioIntercept for Responder {
        fn mmio_read(&mut self, offset: usize, data: &mut [u8]) {
            // CAP: DSTRD=0, TO=1.
            let cap = u64::from(spec::Cap::new().with_to(1));
            let v = if offset == 0 { cap } else { 0 };
            data.copy_from_slice(&v.to_ne_bytes()[..data.len()]);
        }

        fn mmio_write(&mut self, offset: usize, data: &[u8]) {
            let value = u32::from_ne_bytes(data.try_into().unwrap());
            self.doorbells.push((offset, value));
            if offset != 0x1008 {
                return;
            }
            while self.sq_head != value as u16 {
                let mut command = spec::Command::new_zeroed();
                self.mem
                    .read_phys(self.sq + self.sq_head as u64 * 64, command.as_mut_bytes())
                    .unwrap();
                self.sq_head = (self.sq_head + 1) % self.depth;
                let completion = spec::Completion {
                    sqhd: self.sq_head,
                    sqid: 1,
                    cid: command.cdw0.cid(),
                    status: spec::CompletionStatus::new()
                        .with_phase(self.phase)
                        .with_status(self.status),
                    ..FromZeros::new_zeroed()
                };
                self.mem
                    .write_phys(self.cq + self.cq_tail as u64 * 16, completion.as_bytes())
                    .unwrap();
                self.cq_tail = (self.cq_tail + 1) % self.depth;
                if self.cq_tail == 0 {
                    self.phase = !self.phase;
                }
            }
        }
    }

    struct Fixture {
        mem: Arc<EmulatedDmaRegion>,
        heap: DmaHeap,
        dev: EmulatedDevice<Responder>,
    }

    impl Fixture {
        fn new() -> Self {
            let mem = Arc::new(EmulatedDmaRegion::new(8 << 20, 2 << 20, PHYS).unwrap());
            let heap =
                DmaHeap::with_region(mem.clone(), &HostMemConfig::new(2 << 20, 4096)).unwrap();
            let dev = EmulatedDevice::new(
                Responder {
                    mem: mem.clone(),
                    sq: 0,
                    cq: 0,
                    depth: 0,
                    sq_head: 0,
                    cq_tail: 0,
                    phase: true,
                    status: 0,
                    doorbells: Vec::new(),
                },
                0x2000,
            );
            Self { mem, heap, dev }
        }

        fn queue_pair(&self, depth: u16) -> QueuePair<'_, EmulatedDevice<Responder>> {
            let registers = Arc::new(DeviceRegisters::new(Bar0(self.dev.clone())));
            let qp = QueuePair::new(1, depth, &self.heap, registers).unwrap();
            let mut responder = self.dev.device();
            responder.sq = qp.sq_addr();
            responder.cq = qp.cq_addr();
            responder.depth = depth;
            qp
        }
    }

    fn nop() -> spec::Command {
        admin_cmd(spec::AdminOpcode::GET_FEATURES)
    }

    #[test]
    fn rings_start_zeroed_in_phase_one() {
        let fixture = Fixture::new();
        let qp = fixture.queue_pair(4);
        assert_eq!((qp.tail(), qp.head(), qp.phase()), (0, 0, true));
        let mut cqe = [0xffu8; 16];
        fixture.mem.read_phys(qp.cq_addr(), &mut cqe).unwrap();
        assert_eq!(cqe, [0; 16]);
    }

    #[test]
    fn doorbell_is_deduplicated() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        qp.enqueue(nop()).unwrap();
        assert!(qp.ring_doorbell());
        assert!(!qp.ring_doorbell());
        let sq_writes = fixture
            .dev
            .device()
            .doorbells
            .iter()
            .filter(|(offset, _)| *offset == 0x1008)
            .count();
        assert_eq!(sq_writes, 1);
    }

    #[test]
    fn rings_wrap_after_depth_commands() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        let mut cids = Vec::new();
        for i in 0..4 {
            assert_eq!(qp.tail(), i);
            let completion = qp.submit_sync(nop(), 1000).unwrap();
            cids.push(completion.cid);
            if i < 3 {
                assert!(qp.phase());
            }
        }
        assert_eq!(qp.tail(), 0);
        assert_eq!(qp.head(), 0);
        assert!(!qp.phase());
        // The CID is released after every synchronous command.
        assert_eq!(cids, [0, 0, 0, 0]);

        qp.submit_sync(nop(), 1000).unwrap();
        assert_eq!((qp.tail(), qp.head(), qp.phase()), (1, 1, false));
        // The CQ head doorbell follows every reap.
        assert_eq!(fixture.dev.device().doorbells.last(), Some(&(0x100c, 1)));
    }

    #[test]
    fn queued_commands_complete_by_cid() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(8);
        let cids = (0..3).map(|_| qp.enqueue(nop()).unwrap()).collect::<Vec<_>>();
        assert_eq!(cids, [0, 1, 2]);
        qp.ring_doorbell();
        for cid in cids {
            let completion = qp.reap_completion(1000).unwrap();
            assert_eq!(completion.cid, cid);
            qp.requests().free(completion.cid).unwrap();
        }
        assert!(qp.requests().free(0).is_err());
    }

    #[test]
    fn error_status_is_reported() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        fixture.dev.device().status = spec::Status::INVALID_FIELD_IN_COMMAND.0;
        match qp.submit_sync(nop(), 1000) {
            Err(Error::Io(err)) => {
                assert_eq!(err.status(), spec::Status::INVALID_FIELD_IN_COMMAND)
            }
            r => panic!("unexpected {r:?}"),
        }
        // The CID was still returned.
        assert_eq!(qp.requests().available(), crate::REQUEST_POOL_LEN);
    }

    #[test]
    fn reap_times_out() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        assert!(matches!(
            qp.reap_completion(10),
            Err(Error::Timeout {
                what: "completion",
                timeout_ms: 10
            })
        ));
    }

    #[test]
    fn full_submission_ring() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(2);
        qp.enqueue(nop()).unwrap();
        assert!(matches!(
            qp.enqueue(nop()),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(qp.requests().available(), crate::REQUEST_POOL_LEN - 1);
    }

    #[test]
    fn rejects_bad_depth() {
        let fixture = Fixture::new();
        let registers = Arc::new(DeviceRegisters::new(Bar0(fixture.dev.clone())));
        for depth in [0, 1, 65] {
            assert!(matches!(
                QueuePair::new(1, depth, &fixture.heap, registers.clone()),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn data_pointer_is_filled_in() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        let buf = fixture.heap.alloc(3 * 4096).unwrap();
        qp.enqueue_with_data(nop(), &buf, 3 * 4096).unwrap();
        let mut command = spec::Command::new_zeroed();
        fixture
            .mem
            .read_phys(qp.sq_addr(), command.as_mut_bytes())
            .unwrap();
        assert_eq!(command.dptr[0], buf.phys());
        let list = qp.requests().prp_list(0).unwrap().unwrap();
        assert_eq!(command.dptr[1], list.phys());
        assert_eq!(list.read_entry(1), buf.phys() + 2 * 4096);
    }

    #[test]
    fn prp_lists_cover_queue_depth() {
        let fixture = Fixture::new();
        let mut qp = fixture.queue_pair(4);
        let buf = fixture.heap.alloc(3 * 4096).unwrap();
        assert!(qp.requests().prp_list(3).unwrap().is_some());
        for _ in 0..4 {
            qp.requests().alloc().unwrap();
        }
        // CID 4 has no list page; two pages still fit in PRP1 and PRP2.
        assert!(matches!(
            qp.enqueue_with_data(nop(), &buf, 3 * 4096),
            Err(Error::ResourceExhausted("prp list page"))
        ));
        assert_eq!(qp.requests().available(), crate::REQUEST_POOL_LEN - 4);
        assert_eq!(qp.enqueue_with_data(nop(), &buf, 2 * 4096).unwrap(), 4);
    }
}

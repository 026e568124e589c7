// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of submission and completion queues.

use super::spec;
use crate::registers::DeviceRegisters;
use user_driver::heap::DmaBuffer;
use user_driver::DeviceRegisterIo;

pub(crate) struct SubmissionQueue<'a> {
    sqid: u16,
    head: u32,
    tail: u32,
    committed_tail: u32,
    len: u32,
    mem: DmaBuffer<'a>,
}

#[derive(Debug)]
pub(crate) struct QueueFull;

impl<'a> SubmissionQueue<'a> {
    pub fn new(sqid: u16, len: u16, mem: DmaBuffer<'a>) -> Self {
        assert!(mem.len() >= len as usize * size_of::<spec::Command>());
        mem.zero();
        Self {
            sqid,
            head: 0,
            tail: 0,
            // The device also starts at tail 0.
            committed_tail: 0,
            len: len.into(),
            mem,
        }
    }

    pub fn id(&self) -> u16 {
        self.sqid
    }

    pub fn tail(&self) -> u16 {
        self.tail as u16
    }

    /// The device physical address of the ring.
    pub fn phys(&self) -> u64 {
        self.mem.phys()
    }

    pub fn update_head(&mut self, head: u16) {
        let head = head as u32;
        if head < self.len {
            self.head = head;
        } else {
            tracing::warn!(sqid = self.sqid, head, "ignoring invalid sq head");
        }
    }

    pub fn write(&mut self, command: spec::Command) -> Result<(), QueueFull> {
        let next_tail = advance(self.tail, self.len);
        if next_tail == self.head {
            return Err(QueueFull);
        }
        self.mem
            .write_obj(self.tail as usize * size_of_val(&command), &command);
        self.tail = next_tail;
        Ok(())
    }

    /// Writes the tail doorbell if the tail moved since the last write.
    /// Returns whether the doorbell was written.
    pub fn commit<T: DeviceRegisterIo>(&mut self, registers: &DeviceRegisters<T>) -> bool {
        if self.tail != self.committed_tail {
            safe_intrinsics::store_fence();
            registers.doorbell(self.sqid, false, self.tail);
            tracing::trace!(sqid = self.sqid, tail = self.tail, "sq doorbell");
            self.committed_tail = self.tail;
            true
        } else {
            false
        }
    }
}

pub(crate) struct CompletionQueue<'a> {
    cqid: u16,
    head: u32,
    committed_head: u32,
    len: u32,
    phase: bool,
    mem: DmaBuffer<'a>,
}

impl<'a> CompletionQueue<'a> {
    pub fn new(cqid: u16, len: u16, mem: DmaBuffer<'a>) -> CompletionQueue<'a> {
        assert!(mem.len() >= len as usize * size_of::<spec::Completion>());
        // A zeroed entry has phase 0, which is never valid on the first pass.
        mem.zero();
        Self {
            cqid,
            head: 0,
            committed_head: 0,
            len: len.into(),
            phase: true,
            mem,
        }
    }

    pub fn head(&self) -> u16 {
        self.head as u16
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    pub fn phys(&self) -> u64 {
        self.mem.phys()
    }

    pub fn read(&mut self) -> Option<spec::Completion> {
        let completion = self
            .mem
            .read_obj::<spec::Completion>(self.head as usize * size_of::<spec::Completion>());
        if completion.status.phase() != self.phase {
            return None;
        }
        // The entry may have been observed before the rest of the device's
        // writes; re-read it after the fence.
        safe_intrinsics::load_fence();
        let completion = self
            .mem
            .read_obj::<spec::Completion>(self.head as usize * size_of::<spec::Completion>());
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
        }
        Some(completion)
    }

    pub fn commit<T: DeviceRegisterIo>(&mut self, registers: &DeviceRegisters<T>) -> bool {
        if self.head != self.committed_head {
            safe_intrinsics::store_fence();
            registers.doorbell(self.cqid, true, self.head);
            tracing::trace!(cqid = self.cqid, head = self.head, "cq doorbell");
            self.committed_head = self.head;
            true
        } else {
            false
        }
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}

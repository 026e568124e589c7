// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use super::spec;
use crate::Error;
use std::time::Duration;
use tracing::instrument;
use user_driver::backoff::poll_until;
use user_driver::DeviceRegisterIo;

/// The controller's register window, with the capabilities read once at
/// open.
pub(crate) struct DeviceRegisters<T> {
    pub bar0: Bar0<T>,
    pub cap: spec::Cap,
}

impl<T: DeviceRegisterIo> DeviceRegisters<T> {
    pub fn new(bar0: Bar0<T>) -> Self {
        let cap = bar0.cap();
        Self { bar0, cap }
    }

    /// How long CSTS.RDY may take to change.
    pub fn timeout_ms(&self) -> u32 {
        self.cap.timeout_ms()
    }

    pub fn doorbell_offset(&self, qid: u16, completion: bool) -> usize {
        let doorbell_stride_bits = self.cap.dstrd() + 2;
        spec::DOORBELL_BASE + ((qid as usize * 2 + completion as usize) << doorbell_stride_bits)
    }

    pub fn doorbell(&self, qid: u16, completion: bool, value: u32) {
        self.bar0
            .0
            .write_u32(self.doorbell_offset(qid, completion), value)
    }

    /// Polls CSTS until RDY equals `ready`.
    #[instrument(skip(self), level = "debug")]
    pub fn wait_ready(&self, ready: bool) -> Result<(), Error> {
        let timeout_ms = self.timeout_ms();
        poll_until(Duration::from_millis(timeout_ms.into()), || {
            let csts = self.bar0.csts();
            if u32::from(csts) == !0 {
                return Some(Err(Error::DeviceGone));
            }
            if ready && csts.cfs() {
                return Some(Err(Error::ControllerFatal));
            }
            (csts.rdy() == ready).then_some(Ok(()))
        })
        .unwrap_or(Err(Error::Timeout {
            what: if ready {
                "controller ready"
            } else {
                "controller not ready"
            },
            timeout_ms,
        }))
    }

    /// Clears CC.EN and waits for the controller to report not ready.
    pub fn disable(&self) -> Result<(), Error> {
        let cc = self.bar0.cc().with_en(false);
        self.bar0.set_cc(cc);
        self.wait_ready(false)
    }
}

pub(crate) struct Bar0<T>(pub T);

macro_rules! reg32 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u32(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u32(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

macro_rules! reg64 {
    ($get:ident, $set:ident, $reg:ident, $ty:ty) => {
        #[allow(dead_code)]
        pub fn $get(&self) -> $ty {
            <$ty>::from(self.0.read_u64(spec::Register::$reg.0 as usize))
        }
        #[allow(dead_code)]
        pub fn $set(&self, v: $ty) {
            self.0.write_u64(spec::Register::$reg.0 as usize, v.into())
        }
    };
}

impl<T: DeviceRegisterIo> Bar0<T> {
    reg64!(cap, set_cap, CAP, spec::Cap);
    reg64!(asq, set_asq, ASQ, u64);
    reg64!(acq, set_acq, ACQ, u64);
    reg32!(cc, set_cc, CC, spec::Cc);
    reg32!(csts, set_csts, CSTS, spec::Csts);
    reg32!(aqa, set_aqa, AQA, spec::Aqa);
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;
    use user_driver::emulated::EmulatedDevice;
    use user_driver::emulated::MmioIntercept;

    /// Bare registers: CAP is fixed, CSTS.RDY follows CC.EN after a
    /// configurable number of CSTS reads.
    struct Regs {
        cap: spec::Cap,
        cc: spec::Cc,
        csts: spec::Csts,
        delay: Option<u32>,
        pending: u32,
        writes: Vec<(usize, u32)>,
    }

    impl Regs {
        fn new(dstrd: u8, delay: Option<u32>) -> Self {
            Self {
                cap: spec::Cap::new().with_to(1).with_dstrd(dstrd).with_mqes_z(63),
                cc: spec::Cc::new(),
                csts: spec::Csts::new().with_rdy(true),
                delay,
                pending: 0,
                writes: Vec::new(),
            }
        }
    }

    impl MmioIntercept for Regs {
        fn mmio_read(&mut self, offset: usize, data: &mut [u8]) {
            let v = match spec::Register(offset as u16) {
                spec::Register::CAP => u64::from(self.cap),
                spec::Register::CC => u32::from(self.cc).into(),
                spec::Register::CSTS => {
                    if let Some(delay) = self.delay {
                        if self.csts.rdy() != self.cc.en() {
                            if self.pending >= delay {
                                self.csts.set_rdy(self.cc.en());
                                self.pending = 0;
                            } else {
                                self.pending += 1;
                            }
                        }
                    }
                    u32::from(self.csts).into()
                }
                _ => 0,
            };
            data.copy_from_slice(&v.to_ne_bytes()[..data.len()]);
        }

        fn mmio_write(&mut self, offset: usize, data: &[u8]) {
            let mut v = [0; 4];
            v.copy_from_slice(&data[..4]);
            let v = u32::from_ne_bytes(v);
            if offset == spec::Register::CC.0 as usize {
                self.cc = v.into();
            }
            self.writes.push((offset, v));
        }
    }

    fn registers(regs: Regs) -> (EmulatedDevice<Regs>, DeviceRegisters<EmulatedDevice<Regs>>) {
        let dev = EmulatedDevice::new(regs, 0x2000);
        let registers = DeviceRegisters::new(Bar0(dev.clone()));
        (dev, registers)
    }

    #[test]
    fn doorbell_layout() {
        for (dstrd, sq1, cq1) in [(0, 0x1008, 0x100c), (1, 0x1010, 0x1018), (2, 0x1020, 0x1030)] {
            let (_, registers) = registers(Regs::new(dstrd, None));
            assert_eq!(registers.doorbell_offset(0, false), 0x1000);
            assert_eq!(registers.doorbell_offset(0, true), 0x1000 + (4 << dstrd));
            assert_eq!(registers.doorbell_offset(1, false), sq1);
            assert_eq!(registers.doorbell_offset(1, true), cq1);
        }
    }

    #[test]
    fn doorbell_write() {
        let (dev, registers) = registers(Regs::new(0, None));
        registers.doorbell(1, true, 5);
        assert_eq!(dev.device().writes, [(0x100c, 5)]);
    }

    #[test]
    fn disable_waits_for_not_ready() {
        let (dev, registers) = registers(Regs::new(0, Some(1)));
        registers.bar0.set_cc(spec::Cc::new().with_en(true));
        registers.disable().unwrap();
        assert!(!dev.device().cc.en());
        assert!(!dev.device().csts.rdy());
    }

    #[test]
    fn never_not_ready_times_out() {
        let (_, registers) = registers(Regs::new(0, None));
        assert_eq!(registers.timeout_ms(), 500);
        assert!(matches!(
            registers.disable(),
            Err(Error::Timeout {
                timeout_ms: 500,
                ..
            })
        ));
    }

    #[test]
    fn fatal_status_fails_fast() {
        let mut regs = Regs::new(0, None);
        regs.csts = spec::Csts::new().with_cfs(true);
        let (_, registers) = registers(regs);
        assert!(matches!(
            registers.wait_ready(true),
            Err(Error::ControllerFatal)
        ));
    }

    #[test]
    fn all_ones_is_device_gone() {
        let mut regs = Regs::new(0, None);
        regs.csts = (!0u32).into();
        let (_, registers) = registers(regs);
        assert!(matches!(registers.wait_ready(false), Err(Error::DeviceGone)));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Safe wrappers around the CPU barrier instructions needed to talk to
//! devices through shared memory and MMIO.
//!
//! Rust's intrinsics for these are marked unsafe even though executing them
//! has no memory safety implications.

#![no_std]
// UNSAFETY: Calling cpu intrinsics and inline assembly.
#![expect(unsafe_code)]

/// Emit a store fence to flush the processor's store buffer.
///
/// Use this between writing device-visible memory (such as a submission queue
/// entry) and ringing the doorbell that tells the device to read it.
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: this instruction has no safety requirements.
        unsafe { core::arch::x86_64::_mm_sfence() }
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: this instruction has no safety requirements.
        unsafe { core::arch::asm!("dsb st", options(nostack)) };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("Unsupported architecture");
    }

    // Make the compiler aware.
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Release);
}

/// Emit a load fence so that no later load is satisfied before the loads that
/// precede it.
///
/// Use this after observing a valid completion entry and before trusting the
/// rest of its contents.
pub fn load_fence() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: this instruction has no safety requirements.
        unsafe { core::arch::x86_64::_mm_lfence() }
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: this instruction has no safety requirements.
        unsafe { core::arch::asm!("dsb ld", options(nostack)) };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("Unsupported architecture");
    }

    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Acquire);
}

#[cfg(test)]
mod tests {
    #[test]
    fn fences_do_not_fault() {
        super::store_fence();
        super::load_fence();
    }
}

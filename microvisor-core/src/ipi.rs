//! Cross-processor requests
//!
//! Each physical processor owns one mailbox slot. A sender posts a
//! request, kicks the target with an IPI, and spins until the target
//! acknowledges; the target polls its slot at the top of its run loop
//! (VMM code is never preempted, so there is nowhere else to look).
//! Stop is a broadcast and is synchronous by design: it only returns
//! once every online processor has wound down.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use microvisor_hal::{Intrinsics, IpiDest};

use crate::config::{IPI_VECTOR, MAX_PPS};

/// A decoded mailbox request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpRequest {
    None,
    /// Wind down and return to the driver.
    Stop,
    /// Deactivate the named VPS so another processor can adopt it.
    DeactivateVps { vpsid: u16 },
}

const REQ_NONE: u64 = 0;
const REQ_STOP: u64 = 1;
const REQ_DEACTIVATE: u64 = 2;

fn encode(req: PpRequest) -> u64 {
    match req {
        PpRequest::None => REQ_NONE,
        PpRequest::Stop => REQ_STOP,
        PpRequest::DeactivateVps { vpsid } => REQ_DEACTIVATE | (u64::from(vpsid) << 16),
    }
}

fn decode(raw: u64) -> PpRequest {
    match raw & 0xFFFF {
        REQ_STOP => PpRequest::Stop,
        REQ_DEACTIVATE => PpRequest::DeactivateVps { vpsid: (raw >> 16) as u16 },
        _ => PpRequest::None,
    }
}

/// One slot per processor plus an acknowledge counter for broadcasts.
pub struct IpiMailbox {
    slots: [AtomicU64; MAX_PPS],
    acks: AtomicUsize,
}

impl IpiMailbox {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(REQ_NONE);
        Self { slots: [ZERO; MAX_PPS], acks: AtomicUsize::new(0) }
    }

    /// Posts a request to one processor and kicks it.
    pub fn post<I: Intrinsics>(&self, intrinsic: &I, pp: u16, req: PpRequest) {
        self.slots[usize::from(pp) % MAX_PPS].store(encode(req), Ordering::Release);
        intrinsic.send_ipi(IpiDest::Pp(u32::from(pp)), IPI_VECTOR);
    }

    /// Takes (and clears) the pending request for `pp`.
    pub fn take(&self, pp: u16) -> PpRequest {
        decode(self.slots[usize::from(pp) % MAX_PPS].swap(REQ_NONE, Ordering::AcqRel))
    }

    /// Acknowledges a broadcast on behalf of `_pp`.
    pub fn ack(&self, _pp: u16) {
        self.acks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }

    /// Broadcasts stop to every other processor and spins until all
    /// `online - 1` of them acknowledge. There is no timeout; stop is
    /// synchronous.
    pub fn broadcast_stop<I: Intrinsics>(&self, intrinsic: &I, self_pp: u16, online: usize) {
        self.acks.store(0, Ordering::Release);
        for pp in 0..online {
            if pp as u16 != self_pp {
                self.slots[pp].store(encode(PpRequest::Stop), Ordering::Release);
            }
        }
        intrinsic.send_ipi(IpiDest::AllButSelf, IPI_VECTOR);

        while self.acks.load(Ordering::Acquire) < online.saturating_sub(1) {
            core::hint::spin_loop();
        }
    }
}

impl Default for IpiMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microvisor_hal::{CpuidResult, VmxFail};

    struct NullIntrinsics;

    impl Intrinsics for NullIntrinsics {
        fn cpuid(&self, _: u32, _: u32) -> CpuidResult {
            CpuidResult::default()
        }
        fn rdmsr(&self, _: u32) -> u64 {
            0
        }
        fn wrmsr(&mut self, _: u32, _: u64) {}
        fn invlpg(&self, _: u64) {}
        fn read_cr4(&self) -> u64 {
            0
        }
        fn write_cr4(&mut self, _: u64) {}
        fn vmxon(&mut self, _: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmxoff(&mut self) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmclear(&mut self, _: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmptrld(&mut self, _: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmread(&self, _: u32) -> Result<u64, VmxFail> {
            Ok(0)
        }
        fn vmwrite(&mut self, _: u32, _: u64) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmlaunch(&mut self) -> Result<(), VmxFail> {
            Ok(())
        }
        fn vmresume(&mut self) -> Result<(), VmxFail> {
            Ok(())
        }
        fn invept(&self, _: u64, _: u64) {}
        fn invvpid(&self, _: u64, _: u16) {}
        unsafe fn vmrun(
            &mut self,
            _: *mut microvisor_hal::arch::x86_64::vmcb::Vmcb,
            _: u64,
            _: *mut microvisor_hal::arch::x86_64::vmcb::Vmcb,
            _: u64,
        ) -> u64 {
            0
        }
        fn send_ipi(&self, _: IpiDest, _: u8) {}
    }

    #[test]
    fn requests_round_trip_through_a_slot() {
        let mailbox = IpiMailbox::new();
        let intrinsic = NullIntrinsics;

        assert_eq!(mailbox.take(3), PpRequest::None);

        mailbox.post(&intrinsic, 3, PpRequest::DeactivateVps { vpsid: 0x17 });
        assert_eq!(mailbox.take(3), PpRequest::DeactivateVps { vpsid: 0x17 });
        // Taking consumes.
        assert_eq!(mailbox.take(3), PpRequest::None);
    }

    #[test]
    fn stop_broadcast_completes_once_all_ack() {
        let mailbox = IpiMailbox::new();
        let intrinsic = NullIntrinsics;

        // Single processor online: nothing to wait for.
        mailbox.broadcast_stop(&intrinsic, 0, 1);

        // Two online: a peer thread polls its slot, winds down, and
        // acknowledges; only then does the broadcast return.
        std::thread::scope(|s| {
            s.spawn(|| {
                while mailbox.take(1) != PpRequest::Stop {
                    core::hint::spin_loop();
                }
                mailbox.ack(1);
            });
            mailbox.broadcast_stop(&intrinsic, 0, 2);
        });
        assert_eq!(mailbox.acks(), 1);
    }
}

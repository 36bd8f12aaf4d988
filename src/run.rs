//! The per-processor run loop
//!
//! One VMM execution context per physical processor, no scheduler, no
//! preemption: the loop enters the guest, services whatever the exit
//! asks for, and goes straight back in. Hypercall exits route to the
//! dispatcher; everything else goes to the extension's registered
//! vmexit handler. The only ways out are a stop (from this processor's
//! own dispatcher or another's broadcast) and an unrecoverable entry
//! failure.

use microvisor_core::ipi::{IpiMailbox, PpRequest};
use microvisor_core::syscall::abi::status;
use microvisor_core::vps::{VendorVps, VpsError};
use microvisor_core::{Kernel, Tls};
use microvisor_hal::Intrinsics;

/// Why the loop returned to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// A stop was requested; host state has been restored.
    Stopped,
    /// The hardware refused an entry; the VPS dump is in the debug
    /// ring.
    EntryFailed,
}

/// An extension vmexit handler: `(vpsid, exit_reason) -> action`, zero
/// to continue, nonzero to stop the VMM.
type VmexitHandler = extern "C" fn(u16, u64) -> u64;

/// Runs guests on this processor until a stop arrives.
///
/// `online` is the number of processors participating in a stop
/// broadcast.
pub fn pp_main<V: VendorVps, I: Intrinsics>(
    kernel: &Kernel<V>,
    mailbox: &IpiMailbox,
    intrinsic: &mut I,
    tls: &mut Tls,
    online: usize,
) -> RunExit {
    loop {
        match mailbox.take(tls.ppid) {
            PpRequest::Stop => {
                wind_down(kernel, intrinsic, tls);
                mailbox.ack(tls.ppid);
                return RunExit::Stopped;
            }
            PpRequest::DeactivateVps { vpsid } => {
                kernel.with_vps(|pool| {
                    if let Some(vps) = pool.get_mut(vpsid) {
                        let _ = vps.deactivate(intrinsic);
                    }
                });
            }
            PpRequest::None => {}
        }

        let reason = match kernel.run_vps(intrinsic, tls, tls.active_vpsid) {
            Ok(reason) => reason,
            Err(e) => {
                // An entry refusal or a broken VPS is not survivable;
                // give the extension's fail handler the last word.
                let handlers = kernel.handlers();
                if handlers.fail != 0 {
                    let fail: extern "C" fn(u16, u64) -> u64 =
                        unsafe { core::mem::transmute(handlers.fail as *const ()) };
                    fail(tls.active_vpsid, fail_code(e));
                }
                return RunExit::EntryFailed;
            }
        };

        if reason == V::HYPERCALL_EXIT {
            let st = kernel.dispatch(intrinsic, tls);
            if status::failed(st) {
                microvisor_core::log!("hypercall failed on pp {}: {:#x}", tls.ppid, st);
            }
            kernel.with_vps(|pool| {
                if let Some(vps) = pool.get_mut(tls.active_vpsid) {
                    let _ = vps.advance_ip(intrinsic);
                }
            });

            if kernel.is_stopping() {
                // This processor took the stop hypercall; wind the
                // others down before returning to the driver.
                mailbox.broadcast_stop(intrinsic, tls.ppid, online);
                wind_down(kernel, intrinsic, tls);
                return RunExit::Stopped;
            }
            continue;
        }

        let handlers = kernel.handlers();
        if handlers.vmexit != 0 {
            let handler: VmexitHandler =
                unsafe { core::mem::transmute(handlers.vmexit as *const ()) };
            if handler(tls.active_vpsid, reason) != 0 {
                mailbox.broadcast_stop(intrinsic, tls.ppid, online);
                wind_down(kernel, intrinsic, tls);
                return RunExit::Stopped;
            }
        } else {
            // No extension handler: all the root VM's exits are
            // reflected straight back.
            microvisor_core::log!(
                "unhandled exit {:#x} on pp {} vps {:#06x}",
                reason,
                tls.ppid,
                tls.active_vpsid
            );
        }
    }
}

/// A compact failure code handed to the extension's fail handler.
fn fail_code(e: VpsError) -> u64 {
    match e {
        VpsError::EntryFailed => 1,
        VpsError::EntryCheck(_) => 2,
        VpsError::InvalidState => 3,
        _ => 4,
    }
}

/// Deactivates this processor's VPS so host state can be restored at
/// the driver's call site.
fn wind_down<V: VendorVps, I: Intrinsics>(kernel: &Kernel<V>, intrinsic: &mut I, tls: &mut Tls) {
    kernel.with_vps(|pool| {
        if let Some(vps) = pool.get_mut(tls.active_vpsid) {
            let _ = vps.deactivate(intrinsic);
        }
    });
}

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Late-launch type-1 microkernel hypervisor
//!
//! The hypervisor gains control from a running host OS: an OS-specific
//! loader driver hands every physical processor one contiguous,
//! physically backed buffer and calls the entry point. Bring-up
//! virtualizes the processor, promotes the running host to the root
//! guest, loads the extension images embedded in the buffer, and drops
//! into the per-processor run loop. From then on all policy lives in
//! the extensions, reached through the hypercall ABI.

pub mod launch;
pub mod run;

#[cfg(target_arch = "x86_64")]
pub mod bringup;

pub use launch::DriverBuffer;
pub use microvisor_core::{ArchVps, Kernel, StateSave, Tls};
pub use run::{pp_main, RunExit};

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Core hypervisor functionality
//!
//! Everything between the hardware seam and the extension ABI: the page
//! pool, the per-processor TLS block, the VPS state machine for both
//! vendors, the VM/VP/VPS pools, the syscall dispatcher, the extension
//! loader, and the cross-processor mailbox.

pub mod config;
pub mod ext;
pub mod ipi;
pub mod log;
pub mod page_pool;
pub mod pool;
pub mod state_save;
pub mod syscall;
pub mod tls;
pub mod vm;
pub mod vp;
pub mod vps;

pub use page_pool::PagePool;
pub use state_save::{SegmentState, StateSave, TableState};
pub use syscall::Kernel;
pub use tls::Tls;
pub use vps::{Reg, VendorVps, VpsError};

/// The reserved invalid id for VMs, VPs, and VPSes.
pub const INVALID_ID: u16 = 0xFFFF;

/// Vendor selected at build time.
#[cfg(all(feature = "amd", not(feature = "intel")))]
pub type ArchVps = vps::amd::AmdVps;
#[cfg(any(feature = "intel", not(feature = "amd")))]
pub type ArchVps = vps::intel::IntelVps;

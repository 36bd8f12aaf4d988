//! x86-64: VMX and SVM control blocks plus the hardware intrinsics.

pub mod vmcb;
pub mod vmcs;

#[cfg(target_arch = "x86_64")]
pub mod hw;
#[cfg(target_arch = "x86_64")]
pub mod state;

#[cfg(target_arch = "x86_64")]
pub use hw::HwIntrinsics;

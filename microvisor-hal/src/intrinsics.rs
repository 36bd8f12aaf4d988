//! The privileged-instruction seam
//!
//! [`Intrinsics`] is the only way the rest of the hypervisor reaches a
//! raw CPU instruction. The hardware implementation lives in
//! [`crate::arch::x86_64::HwIntrinsics`]; tests drive the core against
//! in-memory doubles that record MSR and VMCS traffic.

use crate::PhysicalAddress;

/// CPUID output registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// IPI destination shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiDest {
    /// Every processor including the sender.
    All,
    /// Every processor except the sender.
    AllButSelf,
    /// One physical processor by APIC id.
    Pp(u32),
}

/// Failure modes of the VMX instruction set.
///
/// `Invalid` is VMfailInvalid (no current VMCS); `Valid` carries the
/// VM-instruction error number the hardware left in the current VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFail {
    Invalid,
    Valid(u32),
}

/// Raw CPU instruction surface.
///
/// Every method maps to one instruction (or one tight instruction
/// sequence) and performs no policy of its own.
pub trait Intrinsics {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&mut self, msr: u32, val: u64);

    fn invlpg(&self, addr: u64);

    fn read_cr4(&self) -> u64;
    fn write_cr4(&mut self, val: u64);

    /// Enters VMX root operation with the VMXON region at `phys`.
    fn vmxon(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail>;

    /// Leaves VMX root operation.
    fn vmxoff(&mut self) -> Result<(), VmxFail>;

    /// Clears the VMCS at `phys` and drops it from the active state of
    /// the current processor.
    fn vmclear(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail>;

    /// Makes the VMCS at `phys` current and active on this processor.
    fn vmptrld(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail>;

    fn vmread(&self, field: u32) -> Result<u64, VmxFail>;
    fn vmwrite(&mut self, field: u32, val: u64) -> Result<(), VmxFail>;

    /// Enters the guest through the current VMCS for the first time.
    /// Returns when the next VM-exit comes back; `Err` means the entry
    /// itself was refused.
    fn vmlaunch(&mut self) -> Result<(), VmxFail>;

    /// Re-enters the guest through a launched VMCS.
    fn vmresume(&mut self) -> Result<(), VmxFail>;

    fn invept(&self, kind: u64, eptp: u64);
    fn invvpid(&self, kind: u64, vpid: u16);

    /// Runs the guest VMCB, using the host VMCB page for the hidden
    /// host state. Both blocks are passed as mapped pointer plus
    /// physical address, the way the hardware and the exit stub each
    /// need them. Returns the exit code from the guest VMCB, or
    /// [`crate::INVALID_EXIT_REASON`] if the hardware refused the
    /// entry.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid mappings of the pages named by the
    /// physical addresses.
    unsafe fn vmrun(
        &mut self,
        guest_vmcb: *mut crate::arch::x86_64::vmcb::Vmcb,
        guest_vmcb_phys: PhysicalAddress,
        host_vmcb: *mut crate::arch::x86_64::vmcb::Vmcb,
        host_vmcb_phys: PhysicalAddress,
    ) -> u64;

    fn send_ipi(&self, dest: IpiDest, vector: u8);
}

//! Hardware implementation of the intrinsics seam
//!
//! Thin wrappers: one instruction each, flag captures converted to
//! `Result`. The VM-entry wrappers return only after the next VM-exit
//! has restored host state through the host RIP/RSP fields (Intel) or
//! the host state-save area (AMD); the exit stub that saves guest GPRs
//! into the TLS block runs before these functions return.

use core::arch::asm;

use crate::arch::x86_64::vmcb::Vmcb;
use crate::intrinsics::{CpuidResult, Intrinsics, IpiDest, VmxFail};
use crate::{msr, PhysicalAddress};

/// The real CPU.
#[derive(Default)]
pub struct HwIntrinsics;

impl HwIntrinsics {
    pub const fn new() -> Self {
        Self
    }

    fn vmx_result(cf: u8, zf: u8) -> Result<(), VmxFail> {
        if cf != 0 {
            return Err(VmxFail::Invalid);
        }
        if zf != 0 {
            // The error number sits in the current VMCS.
            let err = unsafe { vmread_raw(crate::arch::x86_64::vmcs::VM_INSTRUCTION_ERROR) }
                .map(|v| v as u32)
                .unwrap_or(0);
            return Err(VmxFail::Valid(err));
        }
        Ok(())
    }
}

unsafe fn vmread_raw(field: u32) -> Result<u64, VmxFail> {
    let value: u64;
    let cf: u8;
    let zf: u8;
    unsafe {
        asm!(
            "vmread {val}, {field}",
            "setc {cf}",
            "setz {zf}",
            field = in(reg) u64::from(field),
            val = out(reg) value,
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    if cf != 0 {
        return Err(VmxFail::Invalid);
    }
    if zf != 0 {
        return Err(VmxFail::Valid(0));
    }
    Ok(value)
}

impl Intrinsics for HwIntrinsics {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult { eax: r.eax, ebx: r.ebx, ecx: r.ecx, edx: r.edx }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn wrmsr(&mut self, msr: u32, val: u64) {
        unsafe { x86::msr::wrmsr(msr, val) }
    }

    fn invlpg(&self, addr: u64) {
        unsafe {
            asm!("invlpg [{}]", in(reg) addr, options(nostack));
        }
    }

    fn read_cr4(&self) -> u64 {
        crate::arch::x86_64::state::read_cr4()
    }

    fn write_cr4(&mut self, val: u64) {
        unsafe {
            asm!("mov cr4, {}", in(reg) val, options(nostack));
        }
    }

    fn vmxon(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmxon [{addr}]",
                "setc {cf}",
                "setz {zf}",
                addr = in(reg) core::ptr::addr_of!(phys),
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmxoff(&mut self) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmxoff",
                "setc {cf}",
                "setz {zf}",
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmclear(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmclear [{addr}]",
                "setc {cf}",
                "setz {zf}",
                addr = in(reg) core::ptr::addr_of!(phys),
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmptrld(&mut self, phys: PhysicalAddress) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmptrld [{addr}]",
                "setc {cf}",
                "setz {zf}",
                addr = in(reg) core::ptr::addr_of!(phys),
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmread(&self, field: u32) -> Result<u64, VmxFail> {
        unsafe { vmread_raw(field) }
    }

    fn vmwrite(&mut self, field: u32, val: u64) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmwrite {field}, {val}",
                "setc {cf}",
                "setz {zf}",
                field = in(reg) u64::from(field),
                val = in(reg) val,
                cf = out(reg_byte) cf,
                zf = out(reg_byte) zf,
                options(nostack),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmlaunch(&mut self) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmlaunch",
                "setc al",
                "setz cl",
                out("al") cf,
                out("cl") zf,
                clobber_abi("C"),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn vmresume(&mut self) -> Result<(), VmxFail> {
        let (cf, zf): (u8, u8);
        unsafe {
            asm!(
                "vmresume",
                "setc al",
                "setz cl",
                out("al") cf,
                out("cl") zf,
                clobber_abi("C"),
            );
        }
        Self::vmx_result(cf, zf)
    }

    fn invept(&self, kind: u64, eptp: u64) {
        let descriptor: [u64; 2] = [eptp, 0];
        unsafe {
            asm!(
                "invept {kind}, [{desc}]",
                kind = in(reg) kind,
                desc = in(reg) descriptor.as_ptr(),
                options(nostack),
            );
        }
    }

    fn invvpid(&self, kind: u64, vpid: u16) {
        let descriptor: [u64; 2] = [u64::from(vpid), 0];
        unsafe {
            asm!(
                "invvpid {kind}, [{desc}]",
                kind = in(reg) kind,
                desc = in(reg) descriptor.as_ptr(),
                options(nostack),
            );
        }
    }

    unsafe fn vmrun(
        &mut self,
        guest_vmcb: *mut Vmcb,
        guest_vmcb_phys: PhysicalAddress,
        _host_vmcb: *mut Vmcb,
        host_vmcb_phys: PhysicalAddress,
    ) -> u64 {
        unsafe {
            x86::msr::wrmsr(msr::VM_HSAVE_PA, host_vmcb_phys);
            asm!(
                "vmload rax",
                "vmrun rax",
                "vmsave rax",
                in("rax") guest_vmcb_phys,
                clobber_abi("C"),
            );
            core::ptr::addr_of!((*guest_vmcb).exitcode).read_volatile()
        }
    }

    fn send_ipi(&self, dest: IpiDest, vector: u8) {
        // x2APIC ICR: destination shorthand in bits 19:18, physical
        // destination in the high dword.
        let icr = match dest {
            IpiDest::All => (0b10u64 << 18) | u64::from(vector),
            IpiDest::AllButSelf => (0b11u64 << 18) | u64::from(vector),
            IpiDest::Pp(apic_id) => (u64::from(apic_id) << 32) | u64::from(vector),
        };
        unsafe { x86::msr::wrmsr(msr::IA32_X2APIC_ICR, icr) }
    }
}

//! The Intel flavor of the VPS
//!
//! One VMCS frame plus a handful of shadow fields for state the VMCS
//! does not hold (CR2, DR6, the STAR family, IA32_KERNEL_GS_BASE) —
//! those travel through the entry/exit stub instead. Activation is the
//! VMPTRLD that binds the VMCS to a processor, deactivation the VMCLEAR
//! that releases it, and the first entry after activation must be a
//! VMLAUNCH, VMRESUME afterwards.
//!
//! Numeric field access uses the SDM encodings; the width sub-field of
//! the encoding must match the access width or the operation is
//! rejected.

use core::ptr::NonNull;

use microvisor_hal::arch::x86_64::vmcs::{self, field_width, FieldWidth, VmcsRegion};
use microvisor_hal::{msr, Intrinsics};

use crate::page_pool::PagePool;
use crate::state_save::StateSave;
use crate::tls::Tls;
use crate::INVALID_ID;

use super::{checks, Reg, VendorVps, VpsError};

const EXIT_REASON_VMCALL: u64 = vmcs::exit_reason::VMCALL;

pub struct IntelVps {
    initialized: bool,
    id: u16,
    next_free: u16,
    allocated: bool,
    assigned_vp: u16,
    active_pp: Option<u16>,
    launched: bool,

    vmcs: *mut VmcsRegion,
    vmcs_phys: u64,

    // State the VMCS has no field for.
    cr2: u64,
    dr6: u64,
    star: u64,
    lstar: u64,
    cstar: u64,
    fmask: u64,
    kernel_gs_base: u64,
}

// The VMCS frame is owned exclusively by this VPS.
unsafe impl Send for IntelVps {}
unsafe impl Sync for IntelVps {}

impl Default for IntelVps {
    fn default() -> Self {
        Self {
            initialized: false,
            id: INVALID_ID,
            next_free: INVALID_ID,
            allocated: false,
            assigned_vp: INVALID_ID,
            active_pp: None,
            launched: false,
            vmcs: core::ptr::null_mut(),
            vmcs_phys: 0,
            cr2: 0,
            dr6: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            fmask: 0,
            kernel_gs_base: 0,
        }
    }
}

impl IntelVps {
    fn ensure_allocated(&self) -> Result<(), VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        Ok(())
    }

    fn field_u32(field: u64) -> Result<u32, VpsError> {
        u32::try_from(field).map_err(|_| VpsError::InvalidArgument)
    }
}

impl VendorVps for IntelVps {
    const HYPERCALL_EXIT: u64 = EXIT_REASON_VMCALL;

    fn enable_virtualization<I: Intrinsics>(
        intrinsic: &mut I,
        page_pool: &PagePool,
    ) -> Result<(), VpsError> {
        // CPUID.1 ECX[5] reports VMX.
        if intrinsic.cpuid(1, 0).ecx & (1 << 5) == 0 {
            return Err(VpsError::Unsupported);
        }

        // The feature-control MSR must permit VMXON; program and lock
        // it ourselves if the firmware left it unlocked.
        let fc = intrinsic.rdmsr(msr::IA32_FEATURE_CONTROL);
        if fc & msr::FEATURE_CONTROL_LOCK == 0 {
            intrinsic.wrmsr(
                msr::IA32_FEATURE_CONTROL,
                fc | msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMXON_OUTSIDE_SMX,
            );
        } else if fc & msr::FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(VpsError::Unsupported);
        }

        intrinsic.write_cr4(intrinsic.read_cr4() | msr::CR4_VMXE);

        // The VMXON region: one revision-stamped frame per processor,
        // held for the lifetime of the hypervisor.
        let frame: NonNull<VmcsRegion> = page_pool.allocate().ok_or(VpsError::OutOfMemory)?;
        let phys = page_pool
            .virt_to_phys(frame.as_ptr() as u64)
            .ok_or(VpsError::OutOfMemory)?;
        let revision = (intrinsic.rdmsr(msr::IA32_VMX_BASIC) & 0x7FFF_FFFF) as u32;
        unsafe { (*frame.as_ptr()).revision_id = revision };

        intrinsic.vmxon(phys)?;
        Ok(())
    }

    fn setup_host<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        host: &StateSave,
        exit_rip: u64,
        exit_rsp: u64,
    ) -> Result<(), VpsError> {
        self.ensure_allocated()?;

        // Host selectors must carry RPL 0 and TI 0.
        let sel = |s: u16| u64::from(s & !0x7);

        intrinsic.vmwrite(vmcs::HOST_ES_SELECTOR, sel(host.es.selector))?;
        intrinsic.vmwrite(vmcs::HOST_CS_SELECTOR, sel(host.cs.selector))?;
        intrinsic.vmwrite(vmcs::HOST_SS_SELECTOR, sel(host.ss.selector))?;
        intrinsic.vmwrite(vmcs::HOST_DS_SELECTOR, sel(host.ds.selector))?;
        intrinsic.vmwrite(vmcs::HOST_FS_SELECTOR, sel(host.fs.selector))?;
        intrinsic.vmwrite(vmcs::HOST_GS_SELECTOR, sel(host.gs.selector))?;
        intrinsic.vmwrite(vmcs::HOST_TR_SELECTOR, sel(host.tr.selector))?;

        intrinsic.vmwrite(vmcs::HOST_CR0, host.cr0)?;
        intrinsic.vmwrite(vmcs::HOST_CR3, host.cr3)?;
        intrinsic.vmwrite(vmcs::HOST_CR4, host.cr4)?;

        intrinsic.vmwrite(vmcs::HOST_FS_BASE, host.fs.base)?;
        intrinsic.vmwrite(vmcs::HOST_GS_BASE, host.gs.base)?;
        intrinsic.vmwrite(vmcs::HOST_TR_BASE, host.tr.base)?;
        intrinsic.vmwrite(vmcs::HOST_GDTR_BASE, host.gdtr.base)?;
        intrinsic.vmwrite(vmcs::HOST_IDTR_BASE, host.idtr.base)?;

        intrinsic.vmwrite(vmcs::HOST_IA32_SYSENTER_CS, host.sysenter_cs)?;
        intrinsic.vmwrite(vmcs::HOST_IA32_SYSENTER_ESP, host.sysenter_esp)?;
        intrinsic.vmwrite(vmcs::HOST_IA32_SYSENTER_EIP, host.sysenter_eip)?;
        intrinsic.vmwrite(vmcs::HOST_IA32_EFER, host.efer)?;
        intrinsic.vmwrite(vmcs::HOST_IA32_PAT, host.pat)?;

        intrinsic.vmwrite(vmcs::HOST_RIP, exit_rip)?;
        intrinsic.vmwrite(vmcs::HOST_RSP, exit_rsp)?;
        Ok(())
    }

    fn initialize(&mut self, id: u16) -> Result<(), VpsError> {
        if self.initialized || id == INVALID_ID {
            return Err(VpsError::InvalidArgument);
        }
        self.id = id;
        self.initialized = true;
        Ok(())
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn next_free(&self) -> u16 {
        self.next_free
    }

    fn set_next_free(&mut self, id: u16) {
        self.next_free = id;
    }

    fn is_allocated(&self) -> bool {
        self.allocated
    }

    fn assigned_vp(&self) -> u16 {
        self.assigned_vp
    }

    fn assign_vp(&mut self, vpid: u16) {
        self.assigned_vp = vpid;
    }

    fn active_pp(&self) -> Option<u16> {
        self.active_pp
    }

    fn allocate<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        page_pool: &PagePool,
    ) -> Result<(), VpsError> {
        if !self.initialized || self.allocated {
            return Err(VpsError::InvalidArgument);
        }

        let frame: NonNull<VmcsRegion> = match page_pool.allocate() {
            Some(p) => p,
            None => return Err(VpsError::OutOfMemory),
        };
        let phys = match page_pool.virt_to_phys(frame.as_ptr() as u64) {
            Some(p) => p,
            None => {
                unsafe { page_pool.deallocate(frame.cast(), crate::page_pool::FrameSize::Small) };
                return Err(VpsError::OutOfMemory);
            }
        };

        // Bits 30:0 of IA32_VMX_BASIC are the revision identifier the
        // hardware expects at offset zero of every VMCS region.
        let revision = (intrinsic.rdmsr(msr::IA32_VMX_BASIC) & 0x7FFF_FFFF) as u32;
        unsafe { (*frame.as_ptr()).revision_id = revision };

        self.vmcs = frame.as_ptr();
        self.vmcs_phys = phys;
        self.launched = false;
        self.allocated = true;
        Ok(())
    }

    fn deallocate(&mut self, page_pool: &PagePool) {
        if let Some(p) = NonNull::new(self.vmcs) {
            unsafe { page_pool.deallocate(p.cast(), crate::page_pool::FrameSize::Small) };
        }
        self.vmcs = core::ptr::null_mut();
        self.vmcs_phys = 0;
        self.active_pp = None;
        self.launched = false;
        self.allocated = false;
        self.cr2 = 0;
        self.dr6 = 0;
        self.star = 0;
        self.lstar = 0;
        self.cstar = 0;
        self.fmask = 0;
        self.kernel_gs_base = 0;
    }

    fn activate<I: Intrinsics>(&mut self, intrinsic: &mut I, ppid: u16) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        if self.active_pp.is_some() {
            return Err(VpsError::InvalidState);
        }
        intrinsic.vmptrld(self.vmcs_phys)?;
        self.active_pp = Some(ppid);
        Ok(())
    }

    fn deactivate<I: Intrinsics>(&mut self, intrinsic: &mut I) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        intrinsic.vmclear(self.vmcs_phys)?;
        self.active_pp = None;
        self.launched = false;
        Ok(())
    }

    fn state_save_to_vps<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        tls: &mut Tls,
        state: &StateSave,
    ) -> Result<(), VpsError> {
        use crate::tls::*;
        self.ensure_allocated()?;

        intrinsic.vmwrite(vmcs::GUEST_RSP, state.rsp)?;
        intrinsic.vmwrite(vmcs::GUEST_RIP, state.rip)?;
        intrinsic.vmwrite(vmcs::GUEST_RFLAGS, state.rflags)?;

        intrinsic.vmwrite(vmcs::GUEST_ES_SELECTOR, u64::from(state.es.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_ES_BASE, state.es.base)?;
        intrinsic.vmwrite(vmcs::GUEST_ES_LIMIT, u64::from(state.es.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_ES_AR_BYTES, u64::from(state.es.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_CS_SELECTOR, u64::from(state.cs.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_CS_BASE, state.cs.base)?;
        intrinsic.vmwrite(vmcs::GUEST_CS_LIMIT, u64::from(state.cs.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_CS_AR_BYTES, u64::from(state.cs.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_SS_SELECTOR, u64::from(state.ss.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_SS_BASE, state.ss.base)?;
        intrinsic.vmwrite(vmcs::GUEST_SS_LIMIT, u64::from(state.ss.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_SS_AR_BYTES, u64::from(state.ss.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_DS_SELECTOR, u64::from(state.ds.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_DS_BASE, state.ds.base)?;
        intrinsic.vmwrite(vmcs::GUEST_DS_LIMIT, u64::from(state.ds.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_DS_AR_BYTES, u64::from(state.ds.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_FS_SELECTOR, u64::from(state.fs.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_FS_BASE, state.fs.base)?;
        intrinsic.vmwrite(vmcs::GUEST_FS_LIMIT, u64::from(state.fs.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_FS_AR_BYTES, u64::from(state.fs.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_GS_SELECTOR, u64::from(state.gs.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_GS_BASE, state.gs.base)?;
        intrinsic.vmwrite(vmcs::GUEST_GS_LIMIT, u64::from(state.gs.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_GS_AR_BYTES, u64::from(state.gs.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_LDTR_SELECTOR, u64::from(state.ldtr.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_LDTR_BASE, state.ldtr.base)?;
        intrinsic.vmwrite(vmcs::GUEST_LDTR_LIMIT, u64::from(state.ldtr.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_LDTR_AR_BYTES, u64::from(state.ldtr.attrib))?;
        intrinsic.vmwrite(vmcs::GUEST_TR_SELECTOR, u64::from(state.tr.selector))?;
        intrinsic.vmwrite(vmcs::GUEST_TR_BASE, state.tr.base)?;
        intrinsic.vmwrite(vmcs::GUEST_TR_LIMIT, u64::from(state.tr.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_TR_AR_BYTES, u64::from(state.tr.attrib))?;

        intrinsic.vmwrite(vmcs::GUEST_GDTR_BASE, state.gdtr.base)?;
        intrinsic.vmwrite(vmcs::GUEST_GDTR_LIMIT, u64::from(state.gdtr.limit))?;
        intrinsic.vmwrite(vmcs::GUEST_IDTR_BASE, state.idtr.base)?;
        intrinsic.vmwrite(vmcs::GUEST_IDTR_LIMIT, u64::from(state.idtr.limit))?;

        intrinsic.vmwrite(vmcs::GUEST_CR0, state.cr0)?;
        intrinsic.vmwrite(vmcs::GUEST_CR3, state.cr3)?;
        intrinsic.vmwrite(vmcs::GUEST_CR4, state.cr4)?;
        intrinsic.vmwrite(vmcs::GUEST_DR7, state.dr7)?;
        self.cr2 = state.cr2;
        self.dr6 = state.dr6;

        intrinsic.vmwrite(vmcs::GUEST_IA32_EFER, state.efer)?;
        intrinsic.vmwrite(vmcs::GUEST_IA32_PAT, state.pat)?;
        intrinsic.vmwrite(vmcs::GUEST_IA32_DEBUGCTL, state.dbgctl)?;
        intrinsic.vmwrite(vmcs::GUEST_IA32_SYSENTER_CS, state.sysenter_cs)?;
        intrinsic.vmwrite(vmcs::GUEST_IA32_SYSENTER_ESP, state.sysenter_esp)?;
        intrinsic.vmwrite(vmcs::GUEST_IA32_SYSENTER_EIP, state.sysenter_eip)?;
        self.star = state.star;
        self.lstar = state.lstar;
        self.cstar = state.cstar;
        self.fmask = state.fmask;
        self.kernel_gs_base = state.kernel_gs_base;

        tls.set_reg(TLS_OFFSET_RAX, state.rax);
        tls.set_reg(TLS_OFFSET_RBX, state.rbx);
        tls.set_reg(TLS_OFFSET_RCX, state.rcx);
        tls.set_reg(TLS_OFFSET_RDX, state.rdx);
        tls.set_reg(TLS_OFFSET_RBP, state.rbp);
        tls.set_reg(TLS_OFFSET_RSI, state.rsi);
        tls.set_reg(TLS_OFFSET_RDI, state.rdi);
        tls.set_reg(TLS_OFFSET_R8, state.r8);
        tls.set_reg(TLS_OFFSET_R9, state.r9);
        tls.set_reg(TLS_OFFSET_R10, state.r10);
        tls.set_reg(TLS_OFFSET_R11, state.r11);
        tls.set_reg(TLS_OFFSET_R12, state.r12);
        tls.set_reg(TLS_OFFSET_R13, state.r13);
        tls.set_reg(TLS_OFFSET_R14, state.r14);
        tls.set_reg(TLS_OFFSET_R15, state.r15);

        Ok(())
    }

    fn vps_to_state_save<I: Intrinsics>(
        &self,
        intrinsic: &I,
        tls: &Tls,
        state: &mut StateSave,
    ) -> Result<(), VpsError> {
        use crate::tls::*;
        self.ensure_allocated()?;

        state.rax = tls.reg(TLS_OFFSET_RAX).unwrap_or(0);
        state.rbx = tls.reg(TLS_OFFSET_RBX).unwrap_or(0);
        state.rcx = tls.reg(TLS_OFFSET_RCX).unwrap_or(0);
        state.rdx = tls.reg(TLS_OFFSET_RDX).unwrap_or(0);
        state.rbp = tls.reg(TLS_OFFSET_RBP).unwrap_or(0);
        state.rsi = tls.reg(TLS_OFFSET_RSI).unwrap_or(0);
        state.rdi = tls.reg(TLS_OFFSET_RDI).unwrap_or(0);
        state.r8 = tls.reg(TLS_OFFSET_R8).unwrap_or(0);
        state.r9 = tls.reg(TLS_OFFSET_R9).unwrap_or(0);
        state.r10 = tls.reg(TLS_OFFSET_R10).unwrap_or(0);
        state.r11 = tls.reg(TLS_OFFSET_R11).unwrap_or(0);
        state.r12 = tls.reg(TLS_OFFSET_R12).unwrap_or(0);
        state.r13 = tls.reg(TLS_OFFSET_R13).unwrap_or(0);
        state.r14 = tls.reg(TLS_OFFSET_R14).unwrap_or(0);
        state.r15 = tls.reg(TLS_OFFSET_R15).unwrap_or(0);

        state.rsp = intrinsic.vmread(vmcs::GUEST_RSP)?;
        state.rip = intrinsic.vmread(vmcs::GUEST_RIP)?;
        state.rflags = intrinsic.vmread(vmcs::GUEST_RFLAGS)?;

        for (seg, sel, base, limit, ar) in [
            (&mut state.es, vmcs::GUEST_ES_SELECTOR, vmcs::GUEST_ES_BASE, vmcs::GUEST_ES_LIMIT, vmcs::GUEST_ES_AR_BYTES),
            (&mut state.cs, vmcs::GUEST_CS_SELECTOR, vmcs::GUEST_CS_BASE, vmcs::GUEST_CS_LIMIT, vmcs::GUEST_CS_AR_BYTES),
            (&mut state.ss, vmcs::GUEST_SS_SELECTOR, vmcs::GUEST_SS_BASE, vmcs::GUEST_SS_LIMIT, vmcs::GUEST_SS_AR_BYTES),
            (&mut state.ds, vmcs::GUEST_DS_SELECTOR, vmcs::GUEST_DS_BASE, vmcs::GUEST_DS_LIMIT, vmcs::GUEST_DS_AR_BYTES),
            (&mut state.fs, vmcs::GUEST_FS_SELECTOR, vmcs::GUEST_FS_BASE, vmcs::GUEST_FS_LIMIT, vmcs::GUEST_FS_AR_BYTES),
            (&mut state.gs, vmcs::GUEST_GS_SELECTOR, vmcs::GUEST_GS_BASE, vmcs::GUEST_GS_LIMIT, vmcs::GUEST_GS_AR_BYTES),
            (&mut state.ldtr, vmcs::GUEST_LDTR_SELECTOR, vmcs::GUEST_LDTR_BASE, vmcs::GUEST_LDTR_LIMIT, vmcs::GUEST_LDTR_AR_BYTES),
            (&mut state.tr, vmcs::GUEST_TR_SELECTOR, vmcs::GUEST_TR_BASE, vmcs::GUEST_TR_LIMIT, vmcs::GUEST_TR_AR_BYTES),
        ] {
            seg.selector = intrinsic.vmread(sel)? as u16;
            seg.base = intrinsic.vmread(base)?;
            seg.limit = intrinsic.vmread(limit)? as u32;
            seg.attrib = intrinsic.vmread(ar)? as u16;
        }

        state.gdtr.base = intrinsic.vmread(vmcs::GUEST_GDTR_BASE)?;
        state.gdtr.limit = intrinsic.vmread(vmcs::GUEST_GDTR_LIMIT)? as u16;
        state.idtr.base = intrinsic.vmread(vmcs::GUEST_IDTR_BASE)?;
        state.idtr.limit = intrinsic.vmread(vmcs::GUEST_IDTR_LIMIT)? as u16;

        state.cr0 = intrinsic.vmread(vmcs::GUEST_CR0)?;
        state.cr2 = self.cr2;
        state.cr3 = intrinsic.vmread(vmcs::GUEST_CR3)?;
        state.cr4 = intrinsic.vmread(vmcs::GUEST_CR4)?;
        state.dr6 = self.dr6;
        state.dr7 = intrinsic.vmread(vmcs::GUEST_DR7)?;

        state.efer = intrinsic.vmread(vmcs::GUEST_IA32_EFER)?;
        state.pat = intrinsic.vmread(vmcs::GUEST_IA32_PAT)?;
        state.dbgctl = intrinsic.vmread(vmcs::GUEST_IA32_DEBUGCTL)?;
        state.sysenter_cs = intrinsic.vmread(vmcs::GUEST_IA32_SYSENTER_CS)?;
        state.sysenter_esp = intrinsic.vmread(vmcs::GUEST_IA32_SYSENTER_ESP)?;
        state.sysenter_eip = intrinsic.vmread(vmcs::GUEST_IA32_SYSENTER_EIP)?;
        state.star = self.star;
        state.lstar = self.lstar;
        state.cstar = self.cstar;
        state.fmask = self.fmask;
        state.kernel_gs_base = self.kernel_gs_base;

        Ok(())
    }

    fn read_reg<I: Intrinsics>(
        &self,
        intrinsic: &I,
        tls: &Tls,
        reg: Reg,
    ) -> Result<u64, VpsError> {
        self.ensure_allocated()?;

        if let Some(offset) = reg.tls_offset() {
            return tls.reg(offset).ok_or(VpsError::InvalidArgument);
        }

        let field = match reg {
            Reg::Rsp => vmcs::GUEST_RSP,
            Reg::Rip => vmcs::GUEST_RIP,
            Reg::Rflags => vmcs::GUEST_RFLAGS,
            Reg::GdtrBase => vmcs::GUEST_GDTR_BASE,
            Reg::GdtrLimit => vmcs::GUEST_GDTR_LIMIT,
            Reg::IdtrBase => vmcs::GUEST_IDTR_BASE,
            Reg::IdtrLimit => vmcs::GUEST_IDTR_LIMIT,
            Reg::Es => vmcs::GUEST_ES_SELECTOR,
            Reg::EsBase => vmcs::GUEST_ES_BASE,
            Reg::EsLimit => vmcs::GUEST_ES_LIMIT,
            Reg::EsAttrib => vmcs::GUEST_ES_AR_BYTES,
            Reg::Cs => vmcs::GUEST_CS_SELECTOR,
            Reg::CsBase => vmcs::GUEST_CS_BASE,
            Reg::CsLimit => vmcs::GUEST_CS_LIMIT,
            Reg::CsAttrib => vmcs::GUEST_CS_AR_BYTES,
            Reg::Ss => vmcs::GUEST_SS_SELECTOR,
            Reg::SsBase => vmcs::GUEST_SS_BASE,
            Reg::SsLimit => vmcs::GUEST_SS_LIMIT,
            Reg::SsAttrib => vmcs::GUEST_SS_AR_BYTES,
            Reg::Ds => vmcs::GUEST_DS_SELECTOR,
            Reg::DsBase => vmcs::GUEST_DS_BASE,
            Reg::DsLimit => vmcs::GUEST_DS_LIMIT,
            Reg::DsAttrib => vmcs::GUEST_DS_AR_BYTES,
            Reg::Fs => vmcs::GUEST_FS_SELECTOR,
            Reg::FsBase => vmcs::GUEST_FS_BASE,
            Reg::FsLimit => vmcs::GUEST_FS_LIMIT,
            Reg::FsAttrib => vmcs::GUEST_FS_AR_BYTES,
            Reg::Gs => vmcs::GUEST_GS_SELECTOR,
            Reg::GsBase => vmcs::GUEST_GS_BASE,
            Reg::GsLimit => vmcs::GUEST_GS_LIMIT,
            Reg::GsAttrib => vmcs::GUEST_GS_AR_BYTES,
            Reg::Ldtr => vmcs::GUEST_LDTR_SELECTOR,
            Reg::LdtrBase => vmcs::GUEST_LDTR_BASE,
            Reg::LdtrLimit => vmcs::GUEST_LDTR_LIMIT,
            Reg::LdtrAttrib => vmcs::GUEST_LDTR_AR_BYTES,
            Reg::Tr => vmcs::GUEST_TR_SELECTOR,
            Reg::TrBase => vmcs::GUEST_TR_BASE,
            Reg::TrLimit => vmcs::GUEST_TR_LIMIT,
            Reg::TrAttrib => vmcs::GUEST_TR_AR_BYTES,
            Reg::Cr0 => vmcs::GUEST_CR0,
            Reg::Cr3 => vmcs::GUEST_CR3,
            Reg::Cr4 => vmcs::GUEST_CR4,
            Reg::Dr7 => vmcs::GUEST_DR7,
            Reg::Efer => vmcs::GUEST_IA32_EFER,
            Reg::Pat => vmcs::GUEST_IA32_PAT,
            Reg::Dbgctl => vmcs::GUEST_IA32_DEBUGCTL,
            Reg::SysenterCs => vmcs::GUEST_IA32_SYSENTER_CS,
            Reg::SysenterEsp => vmcs::GUEST_IA32_SYSENTER_ESP,
            Reg::SysenterEip => vmcs::GUEST_IA32_SYSENTER_EIP,
            Reg::Cr2 => return Ok(self.cr2),
            Reg::Dr6 => return Ok(self.dr6),
            Reg::Star => return Ok(self.star),
            Reg::Lstar => return Ok(self.lstar),
            Reg::Cstar => return Ok(self.cstar),
            Reg::Fmask => return Ok(self.fmask),
            Reg::KernelGsBase => return Ok(self.kernel_gs_base),
            _ => return Err(VpsError::InvalidArgument),
        };

        Ok(intrinsic.vmread(field)?)
    }

    fn write_reg<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        tls: &mut Tls,
        reg: Reg,
        val: u64,
    ) -> Result<(), VpsError> {
        self.ensure_allocated()?;

        if let Some(offset) = reg.tls_offset() {
            return tls.set_reg(offset, val).ok_or(VpsError::InvalidArgument);
        }

        let field = match reg {
            Reg::Rsp => vmcs::GUEST_RSP,
            Reg::Rip => vmcs::GUEST_RIP,
            Reg::Rflags => vmcs::GUEST_RFLAGS,
            Reg::GdtrBase => vmcs::GUEST_GDTR_BASE,
            Reg::GdtrLimit => vmcs::GUEST_GDTR_LIMIT,
            Reg::IdtrBase => vmcs::GUEST_IDTR_BASE,
            Reg::IdtrLimit => vmcs::GUEST_IDTR_LIMIT,
            Reg::Es => vmcs::GUEST_ES_SELECTOR,
            Reg::EsBase => vmcs::GUEST_ES_BASE,
            Reg::EsLimit => vmcs::GUEST_ES_LIMIT,
            Reg::EsAttrib => vmcs::GUEST_ES_AR_BYTES,
            Reg::Cs => vmcs::GUEST_CS_SELECTOR,
            Reg::CsBase => vmcs::GUEST_CS_BASE,
            Reg::CsLimit => vmcs::GUEST_CS_LIMIT,
            Reg::CsAttrib => vmcs::GUEST_CS_AR_BYTES,
            Reg::Ss => vmcs::GUEST_SS_SELECTOR,
            Reg::SsBase => vmcs::GUEST_SS_BASE,
            Reg::SsLimit => vmcs::GUEST_SS_LIMIT,
            Reg::SsAttrib => vmcs::GUEST_SS_AR_BYTES,
            Reg::Ds => vmcs::GUEST_DS_SELECTOR,
            Reg::DsBase => vmcs::GUEST_DS_BASE,
            Reg::DsLimit => vmcs::GUEST_DS_LIMIT,
            Reg::DsAttrib => vmcs::GUEST_DS_AR_BYTES,
            Reg::Fs => vmcs::GUEST_FS_SELECTOR,
            Reg::FsBase => vmcs::GUEST_FS_BASE,
            Reg::FsLimit => vmcs::GUEST_FS_LIMIT,
            Reg::FsAttrib => vmcs::GUEST_FS_AR_BYTES,
            Reg::Gs => vmcs::GUEST_GS_SELECTOR,
            Reg::GsBase => vmcs::GUEST_GS_BASE,
            Reg::GsLimit => vmcs::GUEST_GS_LIMIT,
            Reg::GsAttrib => vmcs::GUEST_GS_AR_BYTES,
            Reg::Ldtr => vmcs::GUEST_LDTR_SELECTOR,
            Reg::LdtrBase => vmcs::GUEST_LDTR_BASE,
            Reg::LdtrLimit => vmcs::GUEST_LDTR_LIMIT,
            Reg::LdtrAttrib => vmcs::GUEST_LDTR_AR_BYTES,
            Reg::Tr => vmcs::GUEST_TR_SELECTOR,
            Reg::TrBase => vmcs::GUEST_TR_BASE,
            Reg::TrLimit => vmcs::GUEST_TR_LIMIT,
            Reg::TrAttrib => vmcs::GUEST_TR_AR_BYTES,
            Reg::Cr0 => vmcs::GUEST_CR0,
            Reg::Cr3 => vmcs::GUEST_CR3,
            Reg::Cr4 => vmcs::GUEST_CR4,
            Reg::Dr7 => vmcs::GUEST_DR7,
            Reg::Efer => vmcs::GUEST_IA32_EFER,
            Reg::Pat => vmcs::GUEST_IA32_PAT,
            Reg::Dbgctl => vmcs::GUEST_IA32_DEBUGCTL,
            Reg::SysenterCs => vmcs::GUEST_IA32_SYSENTER_CS,
            Reg::SysenterEsp => vmcs::GUEST_IA32_SYSENTER_ESP,
            Reg::SysenterEip => vmcs::GUEST_IA32_SYSENTER_EIP,
            Reg::Cr2 => {
                self.cr2 = val;
                return Ok(());
            }
            Reg::Dr6 => {
                self.dr6 = val;
                return Ok(());
            }
            Reg::Star => {
                self.star = val;
                return Ok(());
            }
            Reg::Lstar => {
                self.lstar = val;
                return Ok(());
            }
            Reg::Cstar => {
                self.cstar = val;
                return Ok(());
            }
            Reg::Fmask => {
                self.fmask = val;
                return Ok(());
            }
            Reg::KernelGsBase => {
                self.kernel_gs_base = val;
                return Ok(());
            }
            _ => return Err(VpsError::InvalidArgument),
        };

        Ok(intrinsic.vmwrite(field, val)?)
    }

    fn read16<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u16, VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if field_width(field) != FieldWidth::Word {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmread(field)? as u16)
    }

    fn read32<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u32, VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if field_width(field) != FieldWidth::Double {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmread(field)? as u32)
    }

    fn read64<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u64, VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if !matches!(field_width(field), FieldWidth::Quad | FieldWidth::Natural) {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmread(field)?)
    }

    fn write16<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        field: u64,
        val: u16,
    ) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if field_width(field) != FieldWidth::Word {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmwrite(field, u64::from(val))?)
    }

    fn write32<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        field: u64,
        val: u32,
    ) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if field_width(field) != FieldWidth::Double {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmwrite(field, u64::from(val))?)
    }

    fn write64<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        field: u64,
        val: u64,
    ) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        let field = Self::field_u32(field)?;
        if !matches!(field_width(field), FieldWidth::Quad | FieldWidth::Natural) {
            return Err(VpsError::InvalidArgument);
        }
        Ok(intrinsic.vmwrite(field, val)?)
    }

    fn run<I: Intrinsics>(&mut self, intrinsic: &mut I, tls: &mut Tls) -> Result<u64, VpsError> {
        self.ensure_allocated()?;
        match self.active_pp {
            Some(pp) if pp == tls.ppid => {}
            _ => return Err(VpsError::InvalidState),
        }

        checks::check_entry_controls(intrinsic).map_err(VpsError::EntryCheck)?;

        let entry = if self.launched {
            intrinsic.vmresume()
        } else {
            intrinsic.vmlaunch()
        };

        if entry.is_err() {
            self.dump(intrinsic, tls);
            return Err(VpsError::EntryFailed);
        }
        self.launched = true;

        Ok(intrinsic.vmread(vmcs::EXIT_REASON)? & 0xFFFF)
    }

    fn advance_ip<I: Intrinsics>(&mut self, intrinsic: &mut I) -> Result<(), VpsError> {
        self.ensure_allocated()?;
        let rip = intrinsic.vmread(vmcs::GUEST_RIP)?;
        let len = intrinsic.vmread(vmcs::VM_EXIT_INSTRUCTION_LEN)?;
        intrinsic.vmwrite(vmcs::GUEST_RIP, rip.wrapping_add(len))?;
        Ok(())
    }

    fn dump<I: Intrinsics>(&self, intrinsic: &I, _tls: &Tls) {
        if !self.allocated {
            crate::log!("vps {:#06x}: unallocated", self.id);
            return;
        }
        let rd = |f| intrinsic.vmread(f).unwrap_or(0);
        crate::log!(
            "vps {:#06x}: rip={:#018x} rsp={:#018x} cr0={:#018x} cr3={:#018x} \
             reason={:#x} qual={:#x} instr_err={:#x}",
            self.id,
            rd(vmcs::GUEST_RIP),
            rd(vmcs::GUEST_RSP),
            rd(vmcs::GUEST_CR0),
            rd(vmcs::GUEST_CR3),
            rd(vmcs::EXIT_REASON),
            rd(vmcs::EXIT_QUALIFICATION),
            rd(vmcs::VM_INSTRUCTION_ERROR),
        );
    }
}

//! The AMD flavor of the VPS
//!
//! Two frames per VPS: the guest VMCB the hardware consumes on VMRUN
//! and a host VMCB whose page doubles as the host state-save area.
//! There is no launch/resume distinction and no activation instruction;
//! affinity is simply the processor that last ran the block, enforced
//! here in software.
//!
//! The VMCB stores segment attributes in the compressed 12-bit form, so
//! the state-transfer operations compress on the way in and decompress
//! on the way out. Raw field access (`read_reg` of an attribute token,
//! the numeric index operations) works on the stored form untouched.

use core::ptr::NonNull;

use microvisor_hal::arch::x86_64::vmcb::{exitcode, Vmcb};
use microvisor_hal::{Intrinsics, INVALID_EXIT_REASON, PAGE_SIZE};

use crate::page_pool::PagePool;
use crate::state_save::StateSave;
use crate::tls::Tls;
use crate::INVALID_ID;

use super::{
    check_attrib, checks, compress_attrib, decompress_attrib, Reg, VendorVps, VpsError,
};

/// Default ASID for a freshly allocated block; the root guest and every
/// extension-created guest get a real one via the field writes.
const DEFAULT_ASID: u32 = 1;

const INSTR2_INTERCEPT_VMRUN: u32 = 1 << 0;
const INSTR2_INTERCEPT_VMMCALL: u32 = 1 << 1;

pub struct AmdVps {
    initialized: bool,
    id: u16,
    next_free: u16,
    allocated: bool,
    assigned_vp: u16,
    active_pp: Option<u16>,

    guest_vmcb: *mut Vmcb,
    guest_vmcb_phys: u64,
    host_vmcb: *mut Vmcb,
    host_vmcb_phys: u64,
}

// The VMCB frames are owned exclusively by this VPS and only touched
// through it; the pool hands them out once.
unsafe impl Send for AmdVps {}
unsafe impl Sync for AmdVps {}

impl Default for AmdVps {
    fn default() -> Self {
        Self {
            initialized: false,
            id: INVALID_ID,
            next_free: INVALID_ID,
            allocated: false,
            assigned_vp: INVALID_ID,
            active_pp: None,
            guest_vmcb: core::ptr::null_mut(),
            guest_vmcb_phys: 0,
            host_vmcb: core::ptr::null_mut(),
            host_vmcb_phys: 0,
        }
    }
}

impl AmdVps {
    fn guest(&self) -> Result<&Vmcb, VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        Ok(unsafe { &*self.guest_vmcb })
    }

    fn guest_mut(&mut self) -> Result<&mut Vmcb, VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        Ok(unsafe { &mut *self.guest_vmcb })
    }

    /// Reads the guest VMCB as an array of `T`, index `field / size`.
    fn read_indexed<T: Copy>(&self, field: u64) -> Result<T, VpsError> {
        let vmcb = self.guest()?;
        let size = core::mem::size_of::<T>() as u64;
        let idx = field / size;
        if idx >= PAGE_SIZE as u64 / size {
            return Err(VpsError::InvalidIndex);
        }
        let base = vmcb as *const Vmcb as *const T;
        Ok(unsafe { *base.add(idx as usize) })
    }

    fn write_indexed<T: Copy>(&mut self, field: u64, val: T) -> Result<(), VpsError> {
        let vmcb = self.guest_mut()?;
        let size = core::mem::size_of::<T>() as u64;
        let idx = field / size;
        if idx >= PAGE_SIZE as u64 / size {
            return Err(VpsError::InvalidIndex);
        }
        let base = vmcb as *mut Vmcb as *mut T;
        unsafe { *base.add(idx as usize) = val };
        Ok(())
    }

    fn fits(val: u64, bits: u32) -> Result<u64, VpsError> {
        if bits < 64 && val >= 1u64 << bits {
            return Err(VpsError::InvalidArgument);
        }
        Ok(val)
    }

    fn ensure_allocated_flag(&self) -> Result<(), VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        Ok(())
    }
}

impl VendorVps for AmdVps {
    const HYPERCALL_EXIT: u64 = exitcode::VMEXIT_VMMCALL;

    fn enable_virtualization<I: Intrinsics>(
        intrinsic: &mut I,
        _page_pool: &PagePool,
    ) -> Result<(), VpsError> {
        // CPUID Fn8000_0001 ECX[2] reports SVM.
        if intrinsic.cpuid(0x8000_0001, 0).ecx & (1 << 2) == 0 {
            return Err(VpsError::Unsupported);
        }
        // VM_CR.SVMDIS: firmware locked SVM off.
        if intrinsic.rdmsr(microvisor_hal::msr::VM_CR) & (1 << 4) != 0 {
            return Err(VpsError::Unsupported);
        }

        let efer = intrinsic.rdmsr(microvisor_hal::msr::IA32_EFER);
        intrinsic.wrmsr(microvisor_hal::msr::IA32_EFER, efer | microvisor_hal::msr::EFER_SVME);
        Ok(())
    }

    fn setup_host<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        _host: &StateSave,
        _exit_rip: u64,
        _exit_rsp: u64,
    ) -> Result<(), VpsError> {
        // VMRUN saves the host into the VM_HSAVE_PA area and the host
        // VMCB page; nothing to program ahead of time.
        self.ensure_allocated_flag()
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
        _intrinsic: &mut I,
        page_pool: &PagePool,
    ) -> Result<(), VpsError> {
        if !self.initialized || self.allocated {
            return Err(VpsError::InvalidArgument);
        }

        let guest: NonNull<Vmcb> = match page_pool.allocate() {
            Some(p) => p,
            None => return Err(VpsError::OutOfMemory),
        };
        let guest_phys = match page_pool.virt_to_phys(guest.as_ptr() as u64) {
            Some(p) => p,
            None => {
                unsafe { page_pool.deallocate(guest.cast(), crate::page_pool::FrameSize::Small) };
                return Err(VpsError::OutOfMemory);
            }
        };

        let host: NonNull<Vmcb> = match page_pool.allocate() {
            Some(p) => p,
            None => {
                unsafe { page_pool.deallocate(guest.cast(), crate::page_pool::FrameSize::Small) };
                return Err(VpsError::OutOfMemory);
            }
        };
        let host_phys = match page_pool.virt_to_phys(host.as_ptr() as u64) {
            Some(p) => p,
            None => {
                unsafe {
                    page_pool.deallocate(host.cast(), crate::page_pool::FrameSize::Small);
                    page_pool.deallocate(guest.cast(), crate::page_pool::FrameSize::Small);
                }
                return Err(VpsError::OutOfMemory);
            }
        };

        self.guest_vmcb = guest.as_ptr();
        self.guest_vmcb_phys = guest_phys;
        self.host_vmcb = host.as_ptr();
        self.host_vmcb_phys = host_phys;

        // Minimum viable control area; everything else is adopted from
        // the state transfer or explicit field writes.
        let vmcb = unsafe { &mut *self.guest_vmcb };
        vmcb.guest_asid = DEFAULT_ASID;
        vmcb.intercept_instr2 |= INSTR2_INTERCEPT_VMRUN | INSTR2_INTERCEPT_VMMCALL;

        self.allocated = true;
        Ok(())
    }

    fn deallocate(&mut self, page_pool: &PagePool) {
        if let Some(p) = NonNull::new(self.host_vmcb) {
            unsafe { page_pool.deallocate(p.cast(), crate::page_pool::FrameSize::Small) };
        }
        self.host_vmcb = core::ptr::null_mut();
        self.host_vmcb_phys = 0;

        if let Some(p) = NonNull::new(self.guest_vmcb) {
            unsafe { page_pool.deallocate(p.cast(), crate::page_pool::FrameSize::Small) };
        }
        self.guest_vmcb = core::ptr::null_mut();
        self.guest_vmcb_phys = 0;

        self.active_pp = None;
        self.allocated = false;
    }

    fn activate<I: Intrinsics>(&mut self, _intrinsic: &mut I, ppid: u16) -> Result<(), VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        if self.active_pp.is_some() {
            return Err(VpsError::InvalidState);
        }
        self.active_pp = Some(ppid);
        Ok(())
    }

    fn deactivate<I: Intrinsics>(&mut self, _intrinsic: &mut I) -> Result<(), VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        self.active_pp = None;
        Ok(())
    }

    fn state_save_to_vps<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        tls: &mut Tls,
        state: &StateSave,
    ) -> Result<(), VpsError> {
        use crate::tls::*;

        // Validate every attribute before touching anything so a bad
        // word cannot leave the block half-written.
        let es_attrib = check_attrib(u64::from(state.es.attrib))?;
        let cs_attrib = check_attrib(u64::from(state.cs.attrib))?;
        let ss_attrib = check_attrib(u64::from(state.ss.attrib))?;
        let ds_attrib = check_attrib(u64::from(state.ds.attrib))?;
        let fs_attrib = check_attrib(u64::from(state.fs.attrib))?;
        let gs_attrib = check_attrib(u64::from(state.gs.attrib))?;
        let ldtr_attrib = check_attrib(u64::from(state.ldtr.attrib))?;
        let tr_attrib = check_attrib(u64::from(state.tr.attrib))?;

        let vmcb = self.guest_mut()?;

        vmcb.rsp = state.rsp;
        vmcb.rip = state.rip;
        vmcb.rflags = state.rflags;

        vmcb.es.selector = state.es.selector;
        vmcb.es.attrib = compress_attrib(es_attrib);
        vmcb.es.limit = state.es.limit;
        vmcb.es.base = state.es.base;
        vmcb.cs.selector = state.cs.selector;
        vmcb.cs.attrib = compress_attrib(cs_attrib);
        vmcb.cs.limit = state.cs.limit;
        vmcb.cs.base = state.cs.base;
        vmcb.ss.selector = state.ss.selector;
        vmcb.ss.attrib = compress_attrib(ss_attrib);
        vmcb.ss.limit = state.ss.limit;
        vmcb.ss.base = state.ss.base;
        vmcb.ds.selector = state.ds.selector;
        vmcb.ds.attrib = compress_attrib(ds_attrib);
        vmcb.ds.limit = state.ds.limit;
        vmcb.ds.base = state.ds.base;
        vmcb.fs.selector = state.fs.selector;
        vmcb.fs.attrib = compress_attrib(fs_attrib);
        vmcb.fs.limit = state.fs.limit;
        vmcb.fs.base = state.fs.base;
        vmcb.gs.selector = state.gs.selector;
        vmcb.gs.attrib = compress_attrib(gs_attrib);
        vmcb.gs.limit = state.gs.limit;
        vmcb.gs.base = state.gs.base;
        vmcb.ldtr.selector = state.ldtr.selector;
        vmcb.ldtr.attrib = compress_attrib(ldtr_attrib);
        vmcb.ldtr.limit = state.ldtr.limit;
        vmcb.ldtr.base = state.ldtr.base;
        vmcb.tr.selector = state.tr.selector;
        vmcb.tr.attrib = compress_attrib(tr_attrib);
        vmcb.tr.limit = state.tr.limit;
        vmcb.tr.base = state.tr.base;

        vmcb.gdtr.base = state.gdtr.base;
        vmcb.gdtr.limit = u32::from(state.gdtr.limit);
        vmcb.idtr.base = state.idtr.base;
        vmcb.idtr.limit = u32::from(state.idtr.limit);

        vmcb.cr0 = state.cr0;
        vmcb.cr2 = state.cr2;
        vmcb.cr3 = state.cr3;
        vmcb.cr4 = state.cr4;
        vmcb.dr6 = state.dr6;
        vmcb.dr7 = state.dr7;

        vmcb.efer = state.efer;
        vmcb.star = state.star;
        vmcb.lstar = state.lstar;
        vmcb.cstar = state.cstar;
        vmcb.sfmask = state.fmask;
        vmcb.kernel_gs_base = state.kernel_gs_base;
        vmcb.sysenter_cs = state.sysenter_cs;
        vmcb.sysenter_esp = state.sysenter_esp;
        vmcb.sysenter_eip = state.sysenter_eip;
        vmcb.g_pat = state.pat;
        vmcb.dbgctl = state.dbgctl;

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
        _intrinsic: &I,
        tls: &Tls,
        state: &mut StateSave,
    ) -> Result<(), VpsError> {
        use crate::tls::*;

        let vmcb = self.guest()?;

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

        state.rsp = vmcb.rsp;
        state.rip = vmcb.rip;
        state.rflags = vmcb.rflags;

        state.es = seg_from_vmcb(&vmcb.es);
        state.cs = seg_from_vmcb(&vmcb.cs);
        state.ss = seg_from_vmcb(&vmcb.ss);
        state.ds = seg_from_vmcb(&vmcb.ds);
        state.fs = seg_from_vmcb(&vmcb.fs);
        state.gs = seg_from_vmcb(&vmcb.gs);
        state.ldtr = seg_from_vmcb(&vmcb.ldtr);
        state.tr = seg_from_vmcb(&vmcb.tr);

        state.gdtr.base = vmcb.gdtr.base;
        state.gdtr.limit = vmcb.gdtr.limit as u16;
        state.idtr.base = vmcb.idtr.base;
        state.idtr.limit = vmcb.idtr.limit as u16;

        state.cr0 = vmcb.cr0;
        state.cr2 = vmcb.cr2;
        state.cr3 = vmcb.cr3;
        state.cr4 = vmcb.cr4;
        state.dr6 = vmcb.dr6;
        state.dr7 = vmcb.dr7;

        state.efer = vmcb.efer;
        state.star = vmcb.star;
        state.lstar = vmcb.lstar;
        state.cstar = vmcb.cstar;
        state.fmask = vmcb.sfmask;
        state.kernel_gs_base = vmcb.kernel_gs_base;
        state.sysenter_cs = vmcb.sysenter_cs;
        state.sysenter_esp = vmcb.sysenter_esp;
        state.sysenter_eip = vmcb.sysenter_eip;
        state.pat = vmcb.g_pat;
        state.dbgctl = vmcb.dbgctl;

        Ok(())
    }

    fn read_reg<I: Intrinsics>(
        &self,
        _intrinsic: &I,
        tls: &Tls,
        reg: Reg,
    ) -> Result<u64, VpsError> {
        if let Some(offset) = reg.tls_offset() {
            if !self.allocated {
                return Err(VpsError::InvalidArgument);
            }
            return tls.reg(offset).ok_or(VpsError::InvalidArgument);
        }

        let vmcb = self.guest()?;
        Ok(match reg {
            Reg::Rsp => vmcb.rsp,
            Reg::Rip => vmcb.rip,
            Reg::Rflags => vmcb.rflags,
            Reg::GdtrBase => vmcb.gdtr.base,
            Reg::GdtrLimit => u64::from(vmcb.gdtr.limit),
            Reg::IdtrBase => vmcb.idtr.base,
            Reg::IdtrLimit => u64::from(vmcb.idtr.limit),
            Reg::Es => u64::from(vmcb.es.selector),
            Reg::EsBase => vmcb.es.base,
            Reg::EsLimit => u64::from(vmcb.es.limit),
            Reg::EsAttrib => u64::from(vmcb.es.attrib),
            Reg::Cs => u64::from(vmcb.cs.selector),
            Reg::CsBase => vmcb.cs.base,
            Reg::CsLimit => u64::from(vmcb.cs.limit),
            Reg::CsAttrib => u64::from(vmcb.cs.attrib),
            Reg::Ss => u64::from(vmcb.ss.selector),
            Reg::SsBase => vmcb.ss.base,
            Reg::SsLimit => u64::from(vmcb.ss.limit),
            Reg::SsAttrib => u64::from(vmcb.ss.attrib),
            Reg::Ds => u64::from(vmcb.ds.selector),
            Reg::DsBase => vmcb.ds.base,
            Reg::DsLimit => u64::from(vmcb.ds.limit),
            Reg::DsAttrib => u64::from(vmcb.ds.attrib),
            Reg::Fs => u64::from(vmcb.fs.selector),
            Reg::FsBase => vmcb.fs.base,
            Reg::FsLimit => u64::from(vmcb.fs.limit),
            Reg::FsAttrib => u64::from(vmcb.fs.attrib),
            Reg::Gs => u64::from(vmcb.gs.selector),
            Reg::GsBase => vmcb.gs.base,
            Reg::GsLimit => u64::from(vmcb.gs.limit),
            Reg::GsAttrib => u64::from(vmcb.gs.attrib),
            Reg::Ldtr => u64::from(vmcb.ldtr.selector),
            Reg::LdtrBase => vmcb.ldtr.base,
            Reg::LdtrLimit => u64::from(vmcb.ldtr.limit),
            Reg::LdtrAttrib => u64::from(vmcb.ldtr.attrib),
            Reg::Tr => u64::from(vmcb.tr.selector),
            Reg::TrBase => vmcb.tr.base,
            Reg::TrLimit => u64::from(vmcb.tr.limit),
            Reg::TrAttrib => u64::from(vmcb.tr.attrib),
            Reg::Cr0 => vmcb.cr0,
            Reg::Cr2 => vmcb.cr2,
            Reg::Cr3 => vmcb.cr3,
            Reg::Cr4 => vmcb.cr4,
            Reg::Dr6 => vmcb.dr6,
            Reg::Dr7 => vmcb.dr7,
            Reg::Efer => vmcb.efer,
            Reg::Star => vmcb.star,
            Reg::Lstar => vmcb.lstar,
            Reg::Cstar => vmcb.cstar,
            Reg::Fmask => vmcb.sfmask,
            Reg::KernelGsBase => vmcb.kernel_gs_base,
            Reg::SysenterCs => vmcb.sysenter_cs,
            Reg::SysenterEsp => vmcb.sysenter_esp,
            Reg::SysenterEip => vmcb.sysenter_eip,
            Reg::Pat => vmcb.g_pat,
            Reg::Dbgctl => vmcb.dbgctl,
            // GPR tokens were handled through the TLS above.
            _ => return Err(VpsError::InvalidArgument),
        })
    }

    fn write_reg<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        tls: &mut Tls,
        reg: Reg,
        val: u64,
    ) -> Result<(), VpsError> {
        if let Some(offset) = reg.tls_offset() {
            if !self.allocated {
                return Err(VpsError::InvalidArgument);
            }
            return tls.set_reg(offset, val).ok_or(VpsError::InvalidArgument);
        }

        let vmcb = self.guest_mut()?;
        match reg {
            Reg::Rsp => vmcb.rsp = val,
            Reg::Rip => vmcb.rip = val,
            Reg::Rflags => vmcb.rflags = val,
            Reg::GdtrBase => vmcb.gdtr.base = val,
            Reg::GdtrLimit => vmcb.gdtr.limit = Self::fits(val, 32)? as u32,
            Reg::IdtrBase => vmcb.idtr.base = val,
            Reg::IdtrLimit => vmcb.idtr.limit = Self::fits(val, 32)? as u32,
            Reg::Es => vmcb.es.selector = Self::fits(val, 16)? as u16,
            Reg::EsBase => vmcb.es.base = val,
            Reg::EsLimit => vmcb.es.limit = Self::fits(val, 32)? as u32,
            Reg::EsAttrib => vmcb.es.attrib = Self::fits(val, 16)? as u16,
            Reg::Cs => vmcb.cs.selector = Self::fits(val, 16)? as u16,
            Reg::CsBase => vmcb.cs.base = val,
            Reg::CsLimit => vmcb.cs.limit = Self::fits(val, 32)? as u32,
            Reg::CsAttrib => vmcb.cs.attrib = Self::fits(val, 16)? as u16,
            Reg::Ss => vmcb.ss.selector = Self::fits(val, 16)? as u16,
            Reg::SsBase => vmcb.ss.base = val,
            Reg::SsLimit => vmcb.ss.limit = Self::fits(val, 32)? as u32,
            Reg::SsAttrib => vmcb.ss.attrib = Self::fits(val, 16)? as u16,
            Reg::Ds => vmcb.ds.selector = Self::fits(val, 16)? as u16,
            Reg::DsBase => vmcb.ds.base = val,
            Reg::DsLimit => vmcb.ds.limit = Self::fits(val, 32)? as u32,
            Reg::DsAttrib => vmcb.ds.attrib = Self::fits(val, 16)? as u16,
            Reg::Fs => vmcb.fs.selector = Self::fits(val, 16)? as u16,
            Reg::FsBase => vmcb.fs.base = val,
            Reg::FsLimit => vmcb.fs.limit = Self::fits(val, 32)? as u32,
            Reg::FsAttrib => vmcb.fs.attrib = Self::fits(val, 16)? as u16,
            Reg::Gs => vmcb.gs.selector = Self::fits(val, 16)? as u16,
            Reg::GsBase => vmcb.gs.base = val,
            Reg::GsLimit => vmcb.gs.limit = Self::fits(val, 32)? as u32,
            Reg::GsAttrib => vmcb.gs.attrib = Self::fits(val, 16)? as u16,
            Reg::Ldtr => vmcb.ldtr.selector = Self::fits(val, 16)? as u16,
            Reg::LdtrBase => vmcb.ldtr.base = val,
            Reg::LdtrLimit => vmcb.ldtr.limit = Self::fits(val, 32)? as u32,
            Reg::LdtrAttrib => vmcb.ldtr.attrib = Self::fits(val, 16)? as u16,
            Reg::Tr => vmcb.tr.selector = Self::fits(val, 16)? as u16,
            Reg::TrBase => vmcb.tr.base = val,
            Reg::TrLimit => vmcb.tr.limit = Self::fits(val, 32)? as u32,
            Reg::TrAttrib => vmcb.tr.attrib = Self::fits(val, 16)? as u16,
            Reg::Cr0 => vmcb.cr0 = val,
            Reg::Cr2 => vmcb.cr2 = val,
            Reg::Cr3 => vmcb.cr3 = val,
            Reg::Cr4 => vmcb.cr4 = val,
            Reg::Dr6 => vmcb.dr6 = val,
            Reg::Dr7 => vmcb.dr7 = val,
            Reg::Efer => vmcb.efer = val,
            Reg::Star => vmcb.star = val,
            Reg::Lstar => vmcb.lstar = val,
            Reg::Cstar => vmcb.cstar = val,
            Reg::Fmask => vmcb.sfmask = val,
            Reg::KernelGsBase => vmcb.kernel_gs_base = val,
            Reg::SysenterCs => vmcb.sysenter_cs = val,
            Reg::SysenterEsp => vmcb.sysenter_esp = val,
            Reg::SysenterEip => vmcb.sysenter_eip = val,
            Reg::Pat => vmcb.g_pat = val,
            Reg::Dbgctl => vmcb.dbgctl = val,
            _ => return Err(VpsError::InvalidArgument),
        }
        Ok(())
    }

    fn read16<I: Intrinsics>(&self, _intrinsic: &I, field: u64) -> Result<u16, VpsError> {
        self.read_indexed::<u16>(field)
    }

    fn read32<I: Intrinsics>(&self, _intrinsic: &I, field: u64) -> Result<u32, VpsError> {
        self.read_indexed::<u32>(field)
    }

    fn read64<I: Intrinsics>(&self, _intrinsic: &I, field: u64) -> Result<u64, VpsError> {
        self.read_indexed::<u64>(field)
    }

    fn write16<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        field: u64,
        val: u16,
    ) -> Result<(), VpsError> {
        self.write_indexed(field, val)
    }

    fn write32<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        field: u64,
        val: u32,
    ) -> Result<(), VpsError> {
        self.write_indexed(field, val)
    }

    fn write64<I: Intrinsics>(
        &mut self,
        _intrinsic: &mut I,
        field: u64,
        val: u64,
    ) -> Result<(), VpsError> {
        self.write_indexed(field, val)
    }

    fn run<I: Intrinsics>(&mut self, intrinsic: &mut I, tls: &mut Tls) -> Result<u64, VpsError> {
        if !self.allocated {
            return Err(VpsError::InvalidArgument);
        }
        match self.active_pp {
            Some(pp) if pp == tls.ppid => {}
            Some(_) => return Err(VpsError::InvalidState),
            None => self.active_pp = Some(tls.ppid),
        }

        checks::check_vmcb(self.guest()?).map_err(VpsError::EntryCheck)?;

        let exit = unsafe {
            intrinsic.vmrun(
                self.guest_vmcb,
                self.guest_vmcb_phys,
                self.host_vmcb,
                self.host_vmcb_phys,
            )
        };

        if exit == INVALID_EXIT_REASON {
            self.dump(intrinsic, tls);
            return Err(VpsError::EntryFailed);
        }

        Ok(exit)
    }

    fn advance_ip<I: Intrinsics>(&mut self, _intrinsic: &mut I) -> Result<(), VpsError> {
        let vmcb = self.guest_mut()?;
        vmcb.rip = vmcb.nrip;
        Ok(())
    }

    fn dump<I: Intrinsics>(&self, _intrinsic: &I, _tls: &Tls) {
        let Ok(vmcb) = self.guest() else {
            crate::log!("vps {:#06x}: unallocated", self.id);
            return;
        };
        crate::log!(
            "vps {:#06x}: rip={:#018x} rsp={:#018x} cr0={:#018x} cr3={:#018x} efer={:#018x} \
             exitcode={:#x} exitinfo1={:#x} exitinfo2={:#x}",
            self.id,
            vmcb.rip,
            vmcb.rsp,
            vmcb.cr0,
            vmcb.cr3,
            vmcb.efer,
            vmcb.exitcode,
            vmcb.exitinfo1,
            vmcb.exitinfo2,
        );
    }
}

fn seg_from_vmcb(seg: &microvisor_hal::arch::x86_64::vmcb::VmcbSeg) -> crate::SegmentState {
    crate::SegmentState {
        selector: seg.selector,
        attrib: decompress_attrib(seg.attrib),
        limit: seg.limit,
        base: seg.base,
    }
}

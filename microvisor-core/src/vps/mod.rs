//! The per-virtual-processor state machine
//!
//! A VPS owns the hardware control block for one virtual CPU: a VMCS on
//! Intel, a guest/host VMCB pair on AMD. It is the only thing in the
//! hypervisor that issues a VM entry, and it moves through exactly
//! three states: unallocated, allocated-inactive, and active on one
//! physical processor. Activity pins the VPS to the processor that
//! loaded it; migration is an explicit deactivate on the owner followed
//! by an activate on the target.

pub mod amd;
pub mod checks;
pub mod intel;
pub mod pool;

use microvisor_hal::{Intrinsics, VmxFail};

use crate::page_pool::PagePool;
use crate::state_save::StateSave;
use crate::tls::Tls;

pub use checks::CheckError;

/// Errors of the VPS operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpsError {
    /// The processor lacks (or firmware-disabled) the virtualization
    /// extension.
    Unsupported,
    /// A precondition failed: un-allocated VPS, bad token, bad value.
    InvalidArgument,
    /// A numeric field index is out of range for the control block.
    InvalidIndex,
    /// The page pool could not supply a control-block frame.
    OutOfMemory,
    /// The VPS is in the wrong lifecycle state for the operation.
    InvalidState,
    /// A pre-entry consistency check failed.
    EntryCheck(CheckError),
    /// The hardware refused the entry.
    EntryFailed,
    /// A VMX instruction faulted outside of entry.
    Vmx(VmxFail),
}

impl From<VmxFail> for VpsError {
    fn from(f: VmxFail) -> Self {
        VpsError::Vmx(f)
    }
}

/// Logical register tokens of the syscall ABI.
///
/// The numeric values are the wire encoding extensions pass to the
/// field read/write hypercalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Reg {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rsp,
    Rip,
    Rflags,
    GdtrBase,
    GdtrLimit,
    IdtrBase,
    IdtrLimit,
    Es,
    EsBase,
    EsLimit,
    EsAttrib,
    Cs,
    CsBase,
    CsLimit,
    CsAttrib,
    Ss,
    SsBase,
    SsLimit,
    SsAttrib,
    Ds,
    DsBase,
    DsLimit,
    DsAttrib,
    Fs,
    FsBase,
    FsLimit,
    FsAttrib,
    Gs,
    GsBase,
    GsLimit,
    GsAttrib,
    Ldtr,
    LdtrBase,
    LdtrLimit,
    LdtrAttrib,
    Tr,
    TrBase,
    TrLimit,
    TrAttrib,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Dr6,
    Dr7,
    Efer,
    Star,
    Lstar,
    Cstar,
    Fmask,
    KernelGsBase,
    SysenterCs,
    SysenterEsp,
    SysenterEip,
    Pat,
    Dbgctl,
}

impl Reg {
    /// Every token, in wire order. Tests and the dump path iterate it.
    pub const ALL: [Reg; 71] = [
        Reg::Rax,
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
        Reg::Rsp,
        Reg::Rip,
        Reg::Rflags,
        Reg::GdtrBase,
        Reg::GdtrLimit,
        Reg::IdtrBase,
        Reg::IdtrLimit,
        Reg::Es,
        Reg::EsBase,
        Reg::EsLimit,
        Reg::EsAttrib,
        Reg::Cs,
        Reg::CsBase,
        Reg::CsLimit,
        Reg::CsAttrib,
        Reg::Ss,
        Reg::SsBase,
        Reg::SsLimit,
        Reg::SsAttrib,
        Reg::Ds,
        Reg::DsBase,
        Reg::DsLimit,
        Reg::DsAttrib,
        Reg::Fs,
        Reg::FsBase,
        Reg::FsLimit,
        Reg::FsAttrib,
        Reg::Gs,
        Reg::GsBase,
        Reg::GsLimit,
        Reg::GsAttrib,
        Reg::Ldtr,
        Reg::LdtrBase,
        Reg::LdtrLimit,
        Reg::LdtrAttrib,
        Reg::Tr,
        Reg::TrBase,
        Reg::TrLimit,
        Reg::TrAttrib,
        Reg::Cr0,
        Reg::Cr2,
        Reg::Cr3,
        Reg::Cr4,
        Reg::Dr6,
        Reg::Dr7,
        Reg::Efer,
        Reg::Star,
        Reg::Lstar,
        Reg::Cstar,
        Reg::Fmask,
        Reg::KernelGsBase,
        Reg::SysenterCs,
        Reg::SysenterEsp,
        Reg::SysenterEip,
        Reg::Pat,
        Reg::Dbgctl,
    ];

    /// Decodes a wire value. Unknown values are a caller error.
    pub fn from_u64(v: u64) -> Option<Reg> {
        Self::ALL.get(v as usize).copied()
    }

    /// The TLS shadow-slot offset for plain GPR tokens.
    pub(crate) fn tls_offset(self) -> Option<usize> {
        use crate::tls::*;
        Some(match self {
            Reg::Rax => TLS_OFFSET_RAX,
            Reg::Rbx => TLS_OFFSET_RBX,
            Reg::Rcx => TLS_OFFSET_RCX,
            Reg::Rdx => TLS_OFFSET_RDX,
            Reg::Rbp => TLS_OFFSET_RBP,
            Reg::Rsi => TLS_OFFSET_RSI,
            Reg::Rdi => TLS_OFFSET_RDI,
            Reg::R8 => TLS_OFFSET_R8,
            Reg::R9 => TLS_OFFSET_R9,
            Reg::R10 => TLS_OFFSET_R10,
            Reg::R11 => TLS_OFFSET_R11,
            Reg::R12 => TLS_OFFSET_R12,
            Reg::R13 => TLS_OFFSET_R13,
            Reg::R14 => TLS_OFFSET_R14,
            Reg::R15 => TLS_OFFSET_R15,
            _ => return None,
        })
    }
}

/// Converts a 16-bit segment attribute of the form `0xF0FF` to the
/// VMCB's 12-bit form `0x0FFF`. The middle nibble must already be
/// zero; [`check_attrib`] rejects inputs that would lose bits.
pub(crate) fn compress_attrib(attrib: u16) -> u16 {
    (attrib & 0x00FF) | ((attrib & 0xF000) >> 4)
}

/// Inverse of [`compress_attrib`] on the 12-bit domain.
pub(crate) fn decompress_attrib(attrib: u16) -> u16 {
    (attrib & 0x00FF) | ((attrib & 0x0F00) << 4)
}

/// Rejects attribute words whose bits 11:8 are set: the VMCB cannot
/// represent them and dropping them silently corrupts the segment.
pub(crate) fn check_attrib(attrib: u64) -> Result<u16, VpsError> {
    if attrib > u64::from(u16::MAX) {
        return Err(VpsError::InvalidArgument);
    }
    let attrib = attrib as u16;
    if attrib & 0x0F00 != 0 {
        return Err(VpsError::InvalidArgument);
    }
    Ok(attrib)
}

/// The vendor-specific half of a VPS. Pools and the dispatcher only
/// ever see this surface.
pub trait VendorVps: Default {
    /// The exit reason the dispatcher treats as a hypercall.
    const HYPERCALL_EXIT: u64;

    /// Makes hardware virtualization available on the calling
    /// processor: VMXON on Intel (CR4.VMXE, feature-control gate,
    /// VMXON region from the pool), EFER.SVME on AMD. Must run once
    /// per processor before any VPS is activated there.
    fn enable_virtualization<I: Intrinsics>(
        intrinsic: &mut I,
        page_pool: &PagePool,
    ) -> Result<(), VpsError>;

    /// Programs the host half of the control block for this processor:
    /// where the next VM-exit lands (`exit_rip`/`exit_rsp`) and the
    /// host register state to restore. The AMD hardware keeps host
    /// state in the host VMCB on its own, so only Intel has work here.
    fn setup_host<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        host: &StateSave,
        exit_rip: u64,
        exit_rsp: u64,
    ) -> Result<(), VpsError>;

    fn initialize(&mut self, id: u16) -> Result<(), VpsError>;
    fn id(&self) -> u16;

    /// Intrusive free-list link, by id.
    fn next_free(&self) -> u16;
    fn set_next_free(&mut self, id: u16);

    fn is_allocated(&self) -> bool;
    fn assigned_vp(&self) -> u16;
    fn assign_vp(&mut self, vpid: u16);
    fn active_pp(&self) -> Option<u16>;

    /// Obtains the control-block frames and stamps the revision
    /// identifier. Rolls everything back on any failure.
    fn allocate<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        page_pool: &PagePool,
    ) -> Result<(), VpsError>;

    /// Returns the control-block frames and goes back to unallocated.
    fn deallocate(&mut self, page_pool: &PagePool);

    /// Binds the VPS to `ppid`. On Intel this is the VMPTRLD.
    fn activate<I: Intrinsics>(&mut self, intrinsic: &mut I, ppid: u16) -> Result<(), VpsError>;

    /// Unbinds the VPS from its processor. On Intel this is the
    /// VMCLEAR.
    fn deactivate<I: Intrinsics>(&mut self, intrinsic: &mut I) -> Result<(), VpsError>;

    fn state_save_to_vps<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        tls: &mut Tls,
        state: &StateSave,
    ) -> Result<(), VpsError>;

    fn vps_to_state_save<I: Intrinsics>(
        &self,
        intrinsic: &I,
        tls: &Tls,
        state: &mut StateSave,
    ) -> Result<(), VpsError>;

    fn read_reg<I: Intrinsics>(
        &self,
        intrinsic: &I,
        tls: &Tls,
        reg: Reg,
    ) -> Result<u64, VpsError>;

    fn write_reg<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        tls: &mut Tls,
        reg: Reg,
        val: u64,
    ) -> Result<(), VpsError>;

    fn read16<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u16, VpsError>;
    fn read32<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u32, VpsError>;
    fn read64<I: Intrinsics>(&self, intrinsic: &I, field: u64) -> Result<u64, VpsError>;
    fn write16<I: Intrinsics>(&mut self, intrinsic: &mut I, field: u64, val: u16)
        -> Result<(), VpsError>;
    fn write32<I: Intrinsics>(&mut self, intrinsic: &mut I, field: u64, val: u32)
        -> Result<(), VpsError>;
    fn write64<I: Intrinsics>(&mut self, intrinsic: &mut I, field: u64, val: u64)
        -> Result<(), VpsError>;

    /// Enters the guest and returns the next exit reason. Runs the
    /// pre-entry consistency checks first; a hardware entry refusal is
    /// [`VpsError::EntryFailed`] and never reaches an exit handler.
    fn run<I: Intrinsics>(&mut self, intrinsic: &mut I, tls: &mut Tls) -> Result<u64, VpsError>;

    /// Moves RIP past the instruction that caused the current exit.
    fn advance_ip<I: Intrinsics>(&mut self, intrinsic: &mut I) -> Result<(), VpsError>;

    /// Writes a human-readable snapshot into the debug ring.
    fn dump<I: Intrinsics>(&self, intrinsic: &I, tls: &Tls);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrib_compression_is_identity_on_the_12bit_domain() {
        for a in 0u16..=0x0FFF {
            assert_eq!(compress_attrib(decompress_attrib(a)), a);
        }
        // Expanded-form words with a clear middle nibble survive the
        // round trip unchanged.
        for a in [0xA09Bu16, 0xC093, 0x0082, 0x8000] {
            assert_eq!(decompress_attrib(compress_attrib(a)), a);
        }
        // The canonical 64-bit code segment attribute.
        assert_eq!(compress_attrib(0xA09B), 0x0A9B);
        assert_eq!(decompress_attrib(0x0A9B), 0xA09B);
    }

    #[test]
    fn attrib_middle_nibble_is_rejected() {
        assert!(check_attrib(0xA09B).is_ok());
        assert_eq!(check_attrib(0xA19B).unwrap_err(), VpsError::InvalidArgument);
        assert_eq!(check_attrib(0x1_0000).unwrap_err(), VpsError::InvalidArgument);
    }

    #[test]
    fn reg_wire_encoding_round_trips() {
        for (i, reg) in Reg::ALL.iter().enumerate() {
            assert_eq!(Reg::from_u64(i as u64), Some(*reg));
            assert_eq!(*reg as u64, i as u64);
        }
        assert_eq!(Reg::from_u64(Reg::ALL.len() as u64), None);
    }
}

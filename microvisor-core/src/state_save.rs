//! The vendor-neutral register state
//!
//! The translation target of the VPS state-transfer operations: one
//! struct holding everything the late-launch path captures from the
//! host and everything an extension can ask a VPS to adopt. Each field
//! maps to exactly one storage location in the vendor control block (or
//! its shadow), so a store/load cycle through a VPS reproduces the
//! struct bit for bit.
//!
//! The FS and GS segment bases double as the IA32_FS_BASE and
//! IA32_GS_BASE MSR values; the architecture keeps a single copy and so
//! does this struct.

/// One segment register in expanded (16-bit attribute) form.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

/// One descriptor-table register.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableState {
    pub base: u64,
    pub limit: u16,
}

/// The full register state of one virtual processor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSave {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ldtr: SegmentState,
    pub tr: SegmentState,

    pub gdtr: TableState,
    pub idtr: TableState,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub dbgctl: u64,
}

//! Host state capture for late launch
//!
//! When the hypervisor takes over a running OS, the first guest state
//! is the host's own: whatever the processor holds at the moment the
//! driver calls in. These readers collect that snapshot so the core can
//! seed the root VPS from it.

use core::arch::asm;

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::{sgdt, sidt};

/// One captured descriptor table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableSnapshot {
    pub base: u64,
    pub limit: u16,
}

/// Selector snapshot of the six segment registers plus LDTR and TR.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorSnapshot {
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr: u16,
    pub tr: u16,
}

pub fn read_selectors() -> SelectorSnapshot {
    let (ldtr, tr): (u16, u16);
    unsafe {
        asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack));
        asm!("str {0:x}", out(reg) tr, options(nomem, nostack));
    }
    SelectorSnapshot {
        es: ES::get_reg().0,
        cs: CS::get_reg().0,
        ss: SS::get_reg().0,
        ds: DS::get_reg().0,
        fs: FS::get_reg().0,
        gs: GS::get_reg().0,
        ldtr,
        tr,
    }
}

pub fn read_gdtr() -> TableSnapshot {
    let p = sgdt();
    TableSnapshot { base: p.base.as_u64(), limit: p.limit }
}

pub fn read_idtr() -> TableSnapshot {
    let p = sidt();
    TableSnapshot { base: p.base.as_u64(), limit: p.limit }
}

pub fn read_cr0() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr0", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_cr2() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr2", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_cr3() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr3", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_cr4() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr4", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_dr6() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, dr6", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_dr7() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, dr7", out(reg) v, options(nomem, nostack)) };
    v
}

pub fn read_rflags() -> u64 {
    let v: u64;
    unsafe { asm!("pushfq", "pop {}", out(reg) v, options(nomem)) };
    v
}

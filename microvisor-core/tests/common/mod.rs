//! Shared test doubles: an in-memory CPU and a pool-backed region.

#![allow(dead_code)]

extern crate std;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use microvisor_core::page_pool::PagePool;
use microvisor_hal::arch::x86_64::vmcb::Vmcb;
use microvisor_hal::arch::x86_64::vmcs;
use microvisor_hal::{msr, CpuidResult, Intrinsics, IpiDest, VmxFail};

/// Capability-MSR defaults that make an all-zero VMCS pass the entry
/// checks: nothing required, everything allowed.
fn default_msrs() -> HashMap<u32, u64> {
    let mut m = HashMap::new();
    m.insert(msr::IA32_VMX_BASIC, 0x0001_2345 | (1 << 55));
    for cap in [
        msr::IA32_VMX_TRUE_PINBASED_CTLS,
        msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        msr::IA32_VMX_TRUE_EXIT_CTLS,
        msr::IA32_VMX_TRUE_ENTRY_CTLS,
        msr::IA32_VMX_PROCBASED_CTLS2,
    ] {
        m.insert(cap, 0xFFFF_FFFF_0000_0000);
    }
    // EPT supports UC and WB paging-structure memory, 4-level walks.
    m.insert(msr::IA32_VMX_EPT_VPID_CAP, (1 << 8) | (1 << 14) | (1 << 6));
    m
}

/// An in-memory CPU: MSR file, VMCS store, scripted entries.
pub struct MockIntrinsics {
    pub msrs: RefCell<HashMap<u32, u64>>,
    pub vmcs: RefCell<HashMap<u32, u64>>,
    pub current_vmcs: Cell<u64>,
    pub launches: Cell<u32>,
    pub resumes: Cell<u32>,
    /// Next entry is refused with VMfailValid(7).
    pub refuse_entry: Cell<bool>,
    /// Exit reason an accepted entry reports.
    pub next_exit_reason: Cell<u64>,
    /// Exit code the mock VMRUN leaves in the guest VMCB.
    pub next_vmrun_exit: Cell<u64>,
    pub ipis: RefCell<Vec<(IpiDest, u8)>>,
    pub cr4: Cell<u64>,
    pub vmxon_region: Cell<u64>,
}

impl Default for MockIntrinsics {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIntrinsics {
    pub fn new() -> Self {
        Self {
            msrs: RefCell::new(default_msrs()),
            vmcs: RefCell::new(HashMap::new()),
            current_vmcs: Cell::new(0),
            launches: Cell::new(0),
            resumes: Cell::new(0),
            refuse_entry: Cell::new(false),
            next_exit_reason: Cell::new(0),
            next_vmrun_exit: Cell::new(0),
            ipis: RefCell::new(Vec::new()),
            cr4: Cell::new(0),
            vmxon_region: Cell::new(0),
        }
    }

    pub fn set_msr(&self, msr: u32, val: u64) {
        self.msrs.borrow_mut().insert(msr, val);
    }

    pub fn vmcs_field(&self, field: u32) -> u64 {
        self.vmcs.borrow().get(&field).copied().unwrap_or(0)
    }
}

impl Intrinsics for MockIntrinsics {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        match leaf {
            // VMX supported.
            1 => CpuidResult { ecx: 1 << 5, ..CpuidResult::default() },
            // SVM supported.
            0x8000_0001 => CpuidResult { ecx: 1 << 2, ..CpuidResult::default() },
            // 48 physical address bits.
            0x8000_0008 => CpuidResult { eax: 48, ..CpuidResult::default() },
            _ => CpuidResult::default(),
        }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, val: u64) {
        self.msrs.borrow_mut().insert(msr, val);
    }

    fn invlpg(&self, _addr: u64) {}

    fn read_cr4(&self) -> u64 {
        self.cr4.get()
    }

    fn write_cr4(&mut self, val: u64) {
        self.cr4.set(val);
    }

    fn vmxon(&mut self, phys: u64) -> Result<(), VmxFail> {
        self.vmxon_region.set(phys);
        Ok(())
    }

    fn vmxoff(&mut self) -> Result<(), VmxFail> {
        self.vmxon_region.set(0);
        Ok(())
    }

    fn vmclear(&mut self, phys: u64) -> Result<(), VmxFail> {
        if self.current_vmcs.get() == phys {
            self.current_vmcs.set(0);
        }
        Ok(())
    }

    fn vmptrld(&mut self, phys: u64) -> Result<(), VmxFail> {
        if phys == 0 {
            return Err(VmxFail::Invalid);
        }
        self.current_vmcs.set(phys);
        Ok(())
    }

    fn vmread(&self, field: u32) -> Result<u64, VmxFail> {
        Ok(self.vmcs_field(field))
    }

    fn vmwrite(&mut self, field: u32, val: u64) -> Result<(), VmxFail> {
        self.vmcs.borrow_mut().insert(field, val);
        Ok(())
    }

    fn vmlaunch(&mut self) -> Result<(), VmxFail> {
        if self.refuse_entry.get() {
            return Err(VmxFail::Valid(7));
        }
        self.launches.set(self.launches.get() + 1);
        self.vmcs.borrow_mut().insert(vmcs::EXIT_REASON, self.next_exit_reason.get());
        Ok(())
    }

    fn vmresume(&mut self) -> Result<(), VmxFail> {
        if self.refuse_entry.get() {
            return Err(VmxFail::Valid(7));
        }
        self.resumes.set(self.resumes.get() + 1);
        self.vmcs.borrow_mut().insert(vmcs::EXIT_REASON, self.next_exit_reason.get());
        Ok(())
    }

    fn invept(&self, _kind: u64, _eptp: u64) {}
    fn invvpid(&self, _kind: u64, _vpid: u16) {}

    unsafe fn vmrun(
        &mut self,
        guest_vmcb: *mut Vmcb,
        _guest_vmcb_phys: u64,
        _host_vmcb: *mut Vmcb,
        _host_vmcb_phys: u64,
    ) -> u64 {
        let exit = self.next_vmrun_exit.get();
        unsafe { (*guest_vmcb).exitcode = exit };
        exit
    }

    fn send_ipi(&self, dest: IpiDest, vector: u8) {
        self.ipis.borrow_mut().push((dest, vector));
    }
}

/// An aligned heap region serving as the driver buffer in tests.
pub struct TestRegion {
    ptr: *mut u8,
    layout: std::alloc::Layout,
    pub size: usize,
}

impl TestRegion {
    pub fn new(pages: usize) -> Self {
        let size = pages * 4096;
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout, size }
    }

    pub fn base(&self) -> u64 {
        self.ptr as u64
    }

    /// A pool over this region with a fixed fake physical base.
    pub fn pool(&self) -> PagePool {
        let pool = PagePool::empty();
        unsafe { pool.init(self.base(), 0x1000_0000, self.size as u64).unwrap() };
        pool
    }
}

impl Drop for TestRegion {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

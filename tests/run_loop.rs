//! Run-loop integration: hypercall routing, extension handlers, stop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use microvisor::run::{pp_main, RunExit};
use microvisor::{Kernel, Tls};
use microvisor_core::ipi::{IpiMailbox, PpRequest};
use microvisor_core::syscall::abi;
use microvisor_core::tls::{TLS_OFFSET_RAX, TLS_OFFSET_RDI};
use microvisor_core::vps::amd::AmdVps;
use microvisor_core::vps::VendorVps;
use microvisor_hal::arch::x86_64::vmcb::Vmcb;
use microvisor_hal::{CpuidResult, Intrinsics, IpiDest, VmxFail};

/// Scripted CPU: each VMRUN pops the next exit code.
struct ScriptedCpu {
    exits: RefCell<VecDeque<u64>>,
    ipis: Cell<usize>,
}

impl ScriptedCpu {
    fn new(exits: &[u64]) -> Self {
        Self { exits: RefCell::new(exits.iter().copied().collect()), ipis: Cell::new(0) }
    }
}

impl Intrinsics for ScriptedCpu {
    fn cpuid(&self, _: u32, _: u32) -> CpuidResult {
        CpuidResult { eax: 48, ..CpuidResult::default() }
    }
    fn rdmsr(&self, _: u32) -> u64 {
        0
    }
    fn wrmsr(&mut self, _: u32, _: u64) {}
    fn invlpg(&self, _: u64) {}
    fn read_cr4(&self) -> u64 {
        0
    }
    fn write_cr4(&mut self, _: u64) {}
    fn vmxon(&mut self, _: u64) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmxoff(&mut self) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmclear(&mut self, _: u64) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmptrld(&mut self, _: u64) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmread(&self, _: u32) -> Result<u64, VmxFail> {
        Ok(0)
    }
    fn vmwrite(&mut self, _: u32, _: u64) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmlaunch(&mut self) -> Result<(), VmxFail> {
        Ok(())
    }
    fn vmresume(&mut self) -> Result<(), VmxFail> {
        Ok(())
    }
    fn invept(&self, _: u64, _: u64) {}
    fn invvpid(&self, _: u64, _: u16) {}
    unsafe fn vmrun(&mut self, guest: *mut Vmcb, _: u64, _: *mut Vmcb, _: u64) -> u64 {
        let exit = self.exits.borrow_mut().pop_front().expect("unscripted vmrun");
        unsafe { (*guest).exitcode = exit };
        exit
    }
    fn send_ipi(&self, _: IpiDest, _: u8) {
        self.ipis.set(self.ipis.get() + 1);
    }
}

struct Region {
    ptr: *mut u8,
    layout: std::alloc::Layout,
    size: usize,
}

impl Region {
    fn new(pages: usize) -> Self {
        let size = pages * 4096;
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout, size }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

fn setup(region: &Region, cpu: &mut ScriptedCpu) -> (Kernel<AmdVps>, Tls, u64) {
    let kernel: Kernel<AmdVps> = Kernel::new();
    unsafe {
        kernel.page_pool.init(region.ptr as u64, 0x1000_0000, region.size as u64).unwrap();
    }
    kernel.init_root(cpu).unwrap();

    let mut tls = Tls::new(0);
    tls.active_vmid = 0;
    tls.active_vpid = 0;
    tls.active_vpsid = 0;

    tls.set_reg(TLS_OFFSET_RAX, abi::HANDLE_OP_OPEN);
    tls.set_reg(TLS_OFFSET_RDI, 1);
    assert_eq!(kernel.dispatch(cpu, &mut tls), abi::status::SUCCESS);
    let handle = tls.reg(TLS_OFFSET_RDI).unwrap();

    (kernel, tls, handle)
}

#[test]
fn stop_hypercall_ends_the_loop() {
    let region = Region::new(128);
    let mut cpu = ScriptedCpu::new(&[0x81]); // one VMMCALL exit
    let mailbox = IpiMailbox::new();
    let (kernel, mut tls, handle) = setup(&region, &mut cpu);

    // The guest's pending hypercall: stop the VMM.
    tls.set_reg(TLS_OFFSET_RAX, abi::CONTROL_OP_STOP);
    tls.set_reg(TLS_OFFSET_RDI, handle);

    assert_eq!(pp_main(&kernel, &mailbox, &mut cpu, &mut tls, 1), RunExit::Stopped);
    assert!(kernel.is_stopping());

    // Wind-down released the processor binding.
    kernel.with_vps(|pool| {
        assert_eq!(pool.get(0).unwrap().active_pp(), None);
    });
}

static HANDLED: AtomicU64 = AtomicU64::new(0);

extern "C" fn stop_on_first_exit(vpsid: u16, reason: u64) -> u64 {
    HANDLED.store((u64::from(vpsid) << 32) | reason, Ordering::SeqCst);
    1
}

#[test]
fn non_hypercall_exits_route_to_the_extension_handler() {
    let region = Region::new(128);
    let mut cpu = ScriptedCpu::new(&[0x72]); // one CPUID exit
    let mailbox = IpiMailbox::new();
    let (kernel, mut tls, handle) = setup(&region, &mut cpu);

    tls.set_reg(TLS_OFFSET_RAX, abi::CALLBACK_OP_REGISTER_VMEXIT);
    tls.set_reg(TLS_OFFSET_RDI, handle);
    tls.set_reg(microvisor_core::tls::TLS_OFFSET_RSI, stop_on_first_exit as usize as u64);
    assert_eq!(kernel.dispatch(&mut cpu, &mut tls), abi::status::SUCCESS);

    assert_eq!(pp_main(&kernel, &mailbox, &mut cpu, &mut tls, 1), RunExit::Stopped);
    assert_eq!(HANDLED.load(Ordering::SeqCst), 0x72);
}

#[test]
fn mailbox_stop_request_is_honored_before_entering_the_guest() {
    let region = Region::new(128);
    let mut cpu = ScriptedCpu::new(&[]); // the guest must never run
    let mailbox = IpiMailbox::new();
    let (kernel, mut tls, _handle) = setup(&region, &mut cpu);

    mailbox.post(&cpu, 0, PpRequest::Stop);
    assert_eq!(pp_main(&kernel, &mailbox, &mut cpu, &mut tls, 2), RunExit::Stopped);
    assert_eq!(mailbox.acks(), 1);
}

#[test]
fn entry_refusal_surfaces_as_a_failure() {
    let region = Region::new(128);
    let mut cpu = ScriptedCpu::new(&[u64::MAX]);
    let mailbox = IpiMailbox::new();
    let (kernel, mut tls, _handle) = setup(&region, &mut cpu);

    assert_eq!(pp_main(&kernel, &mailbox, &mut cpu, &mut tls, 1), RunExit::EntryFailed);
}

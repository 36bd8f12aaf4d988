//! Late-launch bring-up
//!
//! Runs on each physical processor when the loader driver calls in:
//! the first processor adopts the driver buffer (page pool, root
//! triplet, extension images), every processor captures its own host
//! state into the root VPS for its slot, runs the extension bootstraps,
//! and enters the run loop. Returning from here resumes the host OS at
//! the driver's call site.
//!
//! The driver buffer is assumed identity-mapped: the virtual address
//! the driver passes is also where the physically contiguous region
//! sits in the hypervisor's view.

use spin::{Mutex, Once};

use microvisor_core::ext::Extension;
use microvisor_core::ipi::IpiMailbox;
use microvisor_core::{ArchVps, Kernel, SegmentState, StateSave, Tls, VendorVps};
use microvisor_elf::ElfLoader;
use microvisor_hal::arch::x86_64::state;
use microvisor_hal::{msr, Intrinsics};

use crate::launch::DriverBuffer;
use crate::run::{pp_main, RunExit};

/// Virtual base the first position-independent extension sees; each
/// further image is spaced well apart.
const EXT_VIRT_BASE: u64 = 0xFFFF_8800_0000_0000;
const EXT_VIRT_STRIDE: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupError {
    BadBuffer,
    PoolInit,
    RootInit,
    ExtensionLoad,
}

static KERNEL: Once<Kernel<ArchVps>> = Once::new();
static MAILBOX: IpiMailbox = IpiMailbox::new();
static LOADER: Mutex<ElfLoader> = Mutex::new(ElfLoader::new());
static EXTENSIONS: Mutex<heapless::Vec<Extension, 8>> = Mutex::new(heapless::Vec::new());

/// Reads one segment descriptor's attribute word out of the GDT, in
/// the expanded 16-bit form (access byte low, flags nibble high).
unsafe fn descriptor_attrib(gdtr_base: u64, selector: u16) -> u16 {
    let index = u64::from(selector >> 3);
    if index == 0 {
        // The null selector is "unusable" in both vendors' encodings.
        return 0x0000;
    }
    let desc = unsafe { ((gdtr_base + index * 8) as *const u64).read() };
    let access = ((desc >> 40) & 0xFF) as u16;
    let flags = ((desc >> 52) & 0x0F) as u16;
    access | (flags << 12)
}

/// Snapshots the executing processor: the state the host OS resumes
/// from once it becomes the root guest. `resume_rip`/`resume_rsp` are
/// the driver's call site, captured by the entry stub.
pub unsafe fn capture_host_state<I: Intrinsics>(
    intrinsic: &I,
    resume_rip: u64,
    resume_rsp: u64,
) -> StateSave {
    let selectors = state::read_selectors();
    let gdtr = state::read_gdtr();
    let idtr = state::read_idtr();

    let seg = |selector: u16| SegmentState {
        selector,
        attrib: unsafe { descriptor_attrib(gdtr.base, selector) },
        limit: 0xFFFF_FFFF,
        base: 0,
    };

    let mut s = StateSave {
        rip: resume_rip,
        rsp: resume_rsp,
        rflags: state::read_rflags(),
        es: seg(selectors.es),
        cs: seg(selectors.cs),
        ss: seg(selectors.ss),
        ds: seg(selectors.ds),
        fs: seg(selectors.fs),
        gs: seg(selectors.gs),
        ldtr: seg(selectors.ldtr),
        tr: seg(selectors.tr),
        gdtr: microvisor_core::TableState { base: gdtr.base, limit: gdtr.limit },
        idtr: microvisor_core::TableState { base: idtr.base, limit: idtr.limit },
        cr0: state::read_cr0(),
        cr2: state::read_cr2(),
        cr3: state::read_cr3(),
        cr4: state::read_cr4(),
        dr6: state::read_dr6(),
        dr7: state::read_dr7(),
        efer: intrinsic.rdmsr(msr::IA32_EFER),
        star: intrinsic.rdmsr(msr::IA32_STAR),
        lstar: intrinsic.rdmsr(msr::IA32_LSTAR),
        cstar: intrinsic.rdmsr(msr::IA32_CSTAR),
        fmask: intrinsic.rdmsr(msr::IA32_FMASK),
        kernel_gs_base: intrinsic.rdmsr(msr::IA32_KERNEL_GS_BASE),
        sysenter_cs: intrinsic.rdmsr(msr::IA32_SYSENTER_CS),
        sysenter_esp: intrinsic.rdmsr(msr::IA32_SYSENTER_ESP),
        sysenter_eip: intrinsic.rdmsr(msr::IA32_SYSENTER_EIP),
        pat: intrinsic.rdmsr(msr::IA32_PAT),
        dbgctl: intrinsic.rdmsr(msr::IA32_DEBUGCTL),
        ..StateSave::default()
    };
    s.fs.base = intrinsic.rdmsr(msr::IA32_FS_BASE);
    s.gs.base = intrinsic.rdmsr(msr::IA32_GS_BASE);
    s
}

/// The hypervisor entry, called by the driver on every target
/// processor.
///
/// # Safety
///
/// `buffer` must point at a driver buffer per the §-protocol in
/// [`crate::launch`], identity-mapped and physically contiguous, and
/// this function must be called exactly once per processor with dense
/// `ppid`s starting at zero (processor 0 first).
pub unsafe fn vmm_main<I: Intrinsics>(
    intrinsic: &mut I,
    buffer: &'static [u8],
    ppid: u16,
    online: usize,
    resume_rip: u64,
    resume_rsp: u64,
    exit_rip: u64,
    exit_rsp: u64,
) -> Result<RunExit, BringupError> {
    let parsed = DriverBuffer::parse(buffer).map_err(|_| BringupError::BadBuffer)?;

    if ppid == 0 {
        let kernel = Kernel::new();
        let (pool_off, pool_len) = parsed.pool_region();
        let base = buffer.as_ptr() as u64 + pool_off as u64;
        unsafe {
            kernel
                .page_pool
                .init(base, base, pool_len as u64)
                .map_err(|_| BringupError::PoolInit)?;
        }
        kernel.init_root(intrinsic).map_err(|_| BringupError::RootInit)?;

        let mut loader = LOADER.lock();
        for (i, image) in parsed.extensions().enumerate() {
            let ext = unsafe {
                Extension::load(
                    &mut loader,
                    &kernel.page_pool,
                    image,
                    EXT_VIRT_BASE + i as u64 * EXT_VIRT_STRIDE,
                )
            }
            .map_err(|_| BringupError::ExtensionLoad)?;
            EXTENSIONS.lock().push(ext).map_err(|_| BringupError::ExtensionLoad)?;
        }

        KERNEL.call_once(|| kernel);
    }

    let kernel = loop {
        if let Some(kernel) = KERNEL.get() {
            break kernel;
        }
        core::hint::spin_loop();
    };

    // Hardware virtualization comes up per processor, before any VPS
    // can be activated here.
    ArchVps::enable_virtualization(intrinsic, &kernel.page_pool)
        .map_err(|_| BringupError::RootInit)?;

    // The root VP owns one VPS per processor: processor 0 uses the one
    // made by init_root, everyone else creates their own slot.
    let vpsid = if ppid == 0 {
        0
    } else {
        kernel
            .with_vps(|pool| pool.create(intrinsic, &kernel.page_pool, 0))
            .map_err(|_| BringupError::RootInit)?
    };

    let mut tls = Tls::new(ppid);
    tls.active_vmid = 0;
    tls.active_vpid = 0;
    tls.active_vpsid = vpsid;

    // Promote the running host: its state becomes the root guest's.
    let host_state = unsafe { capture_host_state(intrinsic, resume_rip, resume_rsp) };
    kernel.with_vps(|pool| -> Result<(), BringupError> {
        let vps = pool.get_mut(vpsid).ok_or(BringupError::RootInit)?;
        vps.activate(intrinsic, ppid).map_err(|_| BringupError::RootInit)?;
        vps.setup_host(intrinsic, &host_state, exit_rip, exit_rsp)
            .map_err(|_| BringupError::RootInit)?;
        vps.state_save_to_vps(intrinsic, &mut tls, &host_state)
            .map_err(|_| BringupError::RootInit)?;
        Ok(())
    })?;

    // Bootstrap every extension on this processor before the first
    // entry; interrupts are still off and the TLS is ours.
    for ext in EXTENSIONS.lock().iter() {
        unsafe { ext.invoke_bootstrap(&tls) };
    }

    Ok(pp_main(kernel, &MAILBOX, intrinsic, &mut tls, online))
}

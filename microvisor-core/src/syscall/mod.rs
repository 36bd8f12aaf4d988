//! The hypercall dispatcher
//!
//! Extensions reach the hypervisor through one gate; everything they
//! can do is an opcode routed here. The dispatcher owns the object
//! pools (coarse lock each) and validates on every call: the handle
//! must be open, referenced ids must resolve, and the object must be in
//! a state that permits the operation. TLS-resident state needs no
//! locking because the calling thread is the exiting guest of this
//! processor.

pub mod abi;

use spin::Mutex;

use microvisor_hal::Intrinsics;

use crate::config::{ABI_VERSION, MAX_VPS, MAX_VPSS};
use crate::page_pool::{FrameSize, PagePool};
use crate::pool::PoolError;
use crate::state_save::StateSave;
use crate::tls::Tls;
use crate::vm::VmPool;
use crate::vp::VpPool;
use crate::vps::pool::VpsPool;
use crate::vps::{Reg, VendorVps, VpsError};

use abi::status;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Handlers an extension registers via `bf_callback_op`.
#[derive(Default, Clone, Copy)]
pub struct ExtHandlers {
    pub bootstrap: u64,
    pub vmexit: u64,
    pub fail: u64,
}

/// The syscall-facing core: pools, the page pool, and extension
/// bookkeeping.
pub struct Kernel<V: VendorVps> {
    pub page_pool: PagePool,
    vms: Mutex<VmPool>,
    vps: Mutex<VpPool>,
    vpss: Mutex<VpsPool<V>>,
    handlers: Mutex<ExtHandlers>,

    open_handle: AtomicU64,
    bootstraps_done: AtomicUsize,
    stopping: AtomicBool,
}

/// Handle values: zero means closed; anything else was minted by
/// `handle_op_open`.
const NO_HANDLE: u64 = 0;
const HANDLE_VALUE: u64 = 0x4242_0001;

impl<V: VendorVps> Kernel<V> {
    pub fn new() -> Self {
        Self {
            page_pool: PagePool::empty(),
            vms: Mutex::new(VmPool::new()),
            vps: Mutex::new(VpPool::new()),
            vpss: Mutex::new(VpsPool::new()),
            handlers: Mutex::new(ExtHandlers::default()),
            open_handle: AtomicU64::new(NO_HANDLE),
            bootstraps_done: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    /// Creates the root VM/VP/VPS triplet (ids 0/0/0) representing the
    /// host OS. The page pool must be initialized first.
    pub fn init_root<I: Intrinsics>(&self, intrinsic: &mut I) -> Result<(), VpsError> {
        let vmid = self.vms.lock().create().map_err(|_| VpsError::OutOfMemory)?;

        let vpid = {
            let mut vps = self.vps.lock();
            let vpid = vps.create().map_err(|_| VpsError::OutOfMemory)?;
            vps.get_mut(vpid).ok_or(VpsError::InvalidArgument)?.assign_vm(vmid);
            vpid
        };

        self.vpss.lock().create(intrinsic, &self.page_pool, vpid)?;
        Ok(())
    }

    pub fn handlers(&self) -> ExtHandlers {
        *self.handlers.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn bootstraps_done(&self) -> usize {
        self.bootstraps_done.load(Ordering::Acquire)
    }

    /// Runs one VPS by id on behalf of the current processor.
    pub fn run_vps<I: Intrinsics>(
        &self,
        intrinsic: &mut I,
        tls: &mut Tls,
        vpsid: u16,
    ) -> Result<u64, VpsError> {
        let mut vpss = self.vpss.lock();
        let vps = vpss.get_mut(vpsid).ok_or(VpsError::InvalidArgument)?;
        vps.run(intrinsic, tls)
    }

    /// Full access to the VPS pool for bring-up and the run loop.
    pub fn with_vps<R>(&self, f: impl FnOnce(&mut VpsPool<V>) -> R) -> R {
        f(&mut self.vpss.lock())
    }

    fn check_handle(&self, handle: u64) -> bool {
        handle != NO_HANDLE && self.open_handle.load(Ordering::Acquire) == handle
    }

    /// Dispatches the hypercall described by the TLS syscall frame and
    /// leaves the status word in the frame's RAX slot.
    pub fn dispatch<I: Intrinsics>(&self, intrinsic: &mut I, tls: &mut Tls) -> u64 {
        let mut args = [0u64; 6];
        for (slot, offset) in args.iter_mut().zip(abi::ARG_REGS) {
            *slot = tls.reg(offset).unwrap_or(0);
        }
        let opcode = args[0];
        let group = opcode >> 60;

        // Every call validates the handle in the first argument
        // register. The handle group is the one exemption: opening the
        // handle cannot be gated on itself, and close names the handle
        // it is closing.
        let gated = group != abi::GROUP_HANDLE;
        let result = if gated && !self.check_handle(args[1]) {
            status::INVALID_HANDLE
        } else {
            match group {
                abi::GROUP_CALLBACK => self.dispatch_callback(opcode, &args),
                abi::GROUP_DEBUG => self.dispatch_debug(intrinsic, tls, opcode, &args),
                abi::GROUP_HANDLE => self.dispatch_handle(tls, opcode, &args),
                abi::GROUP_CONTROL => self.dispatch_control(opcode),
                abi::GROUP_VM => self.dispatch_vm(tls, opcode, &args),
                abi::GROUP_VP => self.dispatch_vp(tls, opcode, &args),
                abi::GROUP_VPS => self.dispatch_vps(intrinsic, tls, opcode, &args),
                abi::GROUP_INTRINSIC => self.dispatch_intrinsic(intrinsic, tls, opcode, &args),
                abi::GROUP_MEM => self.dispatch_mem(tls, opcode, &args),
                _ => status::INVALID_OPCODE,
            }
        };

        tls.set_reg(crate::tls::TLS_OFFSET_RAX, result);
        result
    }

    fn dispatch_callback(&self, opcode: u64, args: &[u64; 6]) -> u64 {
        let mut handlers = self.handlers.lock();
        match opcode {
            abi::CALLBACK_OP_REGISTER_BOOTSTRAP => handlers.bootstrap = args[2],
            abi::CALLBACK_OP_REGISTER_VMEXIT => handlers.vmexit = args[2],
            abi::CALLBACK_OP_REGISTER_FAIL => handlers.fail = args[2],
            _ => return status::INVALID_OPCODE,
        }
        status::SUCCESS
    }

    fn dispatch_debug<I: Intrinsics>(
        &self,
        intrinsic: &I,
        tls: &Tls,
        opcode: u64,
        args: &[u64; 6],
    ) -> u64 {
        match opcode {
            abi::DEBUG_OP_WRITE_CHAR => {
                crate::log::write_char(args[2] as u8);
                status::SUCCESS
            }
            abi::DEBUG_OP_WRITE_STR => {
                // Pointer and length from the extension's address
                // space; length is clamped to one page so a bad call
                // cannot flood the ring.
                if args[2] == 0 || args[3] == 0 || args[3] > 4096 {
                    return status::INVALID_ARGUMENT;
                }
                let bytes = unsafe {
                    core::slice::from_raw_parts(args[2] as *const u8, args[3] as usize)
                };
                for &b in bytes {
                    crate::log::write_char(b);
                }
                status::SUCCESS
            }
            abi::DEBUG_OP_DUMP_VPS => {
                let vpss = self.vpss.lock();
                match vpss.get(args[2] as u16) {
                    Some(vps) => {
                        vps.dump(intrinsic, tls);
                        status::SUCCESS
                    }
                    None => status::INVALID_ID,
                }
            }
            abi::DEBUG_OP_BREAKPOINT => {
                crate::log!("debug breakpoint on pp {}", tls.ppid);
                status::SUCCESS
            }
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_handle(&self, tls: &mut Tls, opcode: u64, args: &[u64; 6]) -> u64 {
        match opcode {
            abi::HANDLE_OP_OPEN => {
                if args[1] != ABI_VERSION {
                    return status::INVALID_ARGUMENT;
                }
                if self
                    .open_handle
                    .compare_exchange(
                        NO_HANDLE,
                        HANDLE_VALUE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    return status::INVALID_STATE;
                }
                tls.set_reg(crate::tls::TLS_OFFSET_RDI, HANDLE_VALUE);
                status::SUCCESS
            }
            abi::HANDLE_OP_CLOSE => {
                if self
                    .open_handle
                    .compare_exchange(args[1], NO_HANDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return status::INVALID_HANDLE;
                }
                status::SUCCESS
            }
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_control(&self, opcode: u64) -> u64 {
        match opcode {
            abi::CONTROL_OP_WAIT => {
                self.bootstraps_done.fetch_add(1, Ordering::AcqRel);
                status::SUCCESS
            }
            abi::CONTROL_OP_STOP => {
                self.stopping.store(true, Ordering::Release);
                status::SUCCESS
            }
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_vm(&self, tls: &mut Tls, opcode: u64, args: &[u64; 6]) -> u64 {
        match opcode {
            abi::VM_OP_CREATE => match self.vms.lock().create() {
                Ok(vmid) => {
                    tls.set_reg(crate::tls::TLS_OFFSET_RDI, u64::from(vmid));
                    status::SUCCESS
                }
                Err(e) => pool_status(e),
            },
            abi::VM_OP_DESTROY => self.destroy_vm(args[2] as u16),
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_vp(&self, tls: &mut Tls, opcode: u64, args: &[u64; 6]) -> u64 {
        match opcode {
            abi::VP_OP_CREATE => {
                let vmid = args[2] as u16;
                if self.vms.lock().get(vmid).is_none() {
                    return status::INVALID_ID;
                }
                let mut vps = self.vps.lock();
                match vps.create() {
                    Ok(vpid) => {
                        if let Some(vp) = vps.get_mut(vpid) {
                            vp.assign_vm(vmid);
                        }
                        tls.set_reg(crate::tls::TLS_OFFSET_RDI, u64::from(vpid));
                        status::SUCCESS
                    }
                    Err(e) => pool_status(e),
                }
            }
            abi::VP_OP_DESTROY => self.destroy_vp(args[2] as u16),
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_vps<I: Intrinsics>(
        &self,
        intrinsic: &mut I,
        tls: &mut Tls,
        opcode: u64,
        args: &[u64; 6],
    ) -> u64 {
        match opcode {
            abi::VPS_OP_CREATE => {
                let vpid = args[2] as u16;
                if self.vps.lock().get(vpid).is_none() {
                    return status::INVALID_ID;
                }
                match self.vpss.lock().create(intrinsic, &self.page_pool, vpid) {
                    Ok(vpsid) => {
                        tls.set_reg(crate::tls::TLS_OFFSET_RDI, u64::from(vpsid));
                        status::SUCCESS
                    }
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_DESTROY => {
                match self.vpss.lock().destroy(args[2] as u16, &self.page_pool) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => pool_status(e),
                }
            }
            _ => {
                let vpsid = args[2] as u16;
                let mut vpss = self.vpss.lock();
                let Some(vps) = vpss.get_mut(vpsid) else {
                    return status::INVALID_ID;
                };
                self.vps_field_op(intrinsic, tls, vps, opcode, args)
            }
        }
    }

    fn vps_field_op<I: Intrinsics>(
        &self,
        intrinsic: &mut I,
        tls: &mut Tls,
        vps: &mut V,
        opcode: u64,
        args: &[u64; 6],
    ) -> u64 {
        match opcode {
            abi::VPS_OP_READ_REG => {
                let Some(reg) = Reg::from_u64(args[3]) else {
                    return status::INVALID_ARGUMENT;
                };
                match vps.read_reg(intrinsic, tls, reg) {
                    Ok(val) => {
                        tls.set_reg(crate::tls::TLS_OFFSET_RDI, val);
                        status::SUCCESS
                    }
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_WRITE_REG => {
                let Some(reg) = Reg::from_u64(args[3]) else {
                    return status::INVALID_ARGUMENT;
                };
                match vps.write_reg(intrinsic, tls, reg, args[4]) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_READ16 => match vps.read16(intrinsic, args[3]) {
                Ok(val) => {
                    tls.set_reg(crate::tls::TLS_OFFSET_RDI, u64::from(val));
                    status::SUCCESS
                }
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_READ32 => match vps.read32(intrinsic, args[3]) {
                Ok(val) => {
                    tls.set_reg(crate::tls::TLS_OFFSET_RDI, u64::from(val));
                    status::SUCCESS
                }
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_READ64 => match vps.read64(intrinsic, args[3]) {
                Ok(val) => {
                    tls.set_reg(crate::tls::TLS_OFFSET_RDI, val);
                    status::SUCCESS
                }
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_WRITE16 => {
                let Ok(val) = u16::try_from(args[4]) else {
                    return status::INVALID_ARGUMENT;
                };
                match vps.write16(intrinsic, args[3], val) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_WRITE32 => {
                let Ok(val) = u32::try_from(args[4]) else {
                    return status::INVALID_ARGUMENT;
                };
                match vps.write32(intrinsic, args[3], val) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_WRITE64 => match vps.write64(intrinsic, args[3], args[4]) {
                Ok(()) => status::SUCCESS,
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_STATE_SAVE_TO_VPS => {
                if args[3] == 0 {
                    return status::INVALID_ARGUMENT;
                }
                let state = unsafe { core::ptr::read(args[3] as *const StateSave) };
                match vps.state_save_to_vps(intrinsic, tls, &state) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_VPS_TO_STATE_SAVE => {
                if args[3] == 0 {
                    return status::INVALID_ARGUMENT;
                }
                let mut state = StateSave::default();
                match vps.vps_to_state_save(intrinsic, tls, &mut state) {
                    Ok(()) => {
                        unsafe { core::ptr::write(args[3] as *mut StateSave, state) };
                        status::SUCCESS
                    }
                    Err(e) => vps_status(e),
                }
            }
            abi::VPS_OP_RUN => match vps.run(intrinsic, tls) {
                Ok(reason) => {
                    tls.set_reg(crate::tls::TLS_OFFSET_RDI, reason);
                    status::SUCCESS
                }
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_ADVANCE_IP => match vps.advance_ip(intrinsic) {
                Ok(()) => status::SUCCESS,
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_ACTIVATE => match vps.activate(intrinsic, tls.ppid) {
                Ok(()) => status::SUCCESS,
                Err(e) => vps_status(e),
            },
            abi::VPS_OP_DEACTIVATE => match vps.deactivate(intrinsic) {
                Ok(()) => status::SUCCESS,
                Err(e) => vps_status(e),
            },
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_intrinsic<I: Intrinsics>(
        &self,
        intrinsic: &mut I,
        tls: &mut Tls,
        opcode: u64,
        args: &[u64; 6],
    ) -> u64 {
        match opcode {
            abi::INTRINSIC_OP_RDMSR => {
                let Ok(msr) = u32::try_from(args[2]) else {
                    return status::INVALID_ARGUMENT;
                };
                tls.set_reg(crate::tls::TLS_OFFSET_RDI, intrinsic.rdmsr(msr));
                status::SUCCESS
            }
            abi::INTRINSIC_OP_WRMSR => {
                let Ok(msr) = u32::try_from(args[2]) else {
                    return status::INVALID_ARGUMENT;
                };
                intrinsic.wrmsr(msr, args[3]);
                status::SUCCESS
            }
            abi::INTRINSIC_OP_INVLPG => {
                intrinsic.invlpg(args[2]);
                status::SUCCESS
            }
            abi::INTRINSIC_OP_INVEPT => {
                intrinsic.invept(args[2], args[3]);
                status::SUCCESS
            }
            abi::INTRINSIC_OP_INVVPID => {
                let Ok(vpid) = u16::try_from(args[3]) else {
                    return status::INVALID_ARGUMENT;
                };
                intrinsic.invvpid(args[2], vpid);
                status::SUCCESS
            }
            _ => status::INVALID_OPCODE,
        }
    }

    fn dispatch_mem(&self, tls: &mut Tls, opcode: u64, args: &[u64; 6]) -> u64 {
        match opcode {
            abi::MEM_OP_ALLOC_PAGE => {
                let Some(page) = self.page_pool.allocate_page() else {
                    return status::OUT_OF_MEMORY;
                };
                let virt = page.as_ptr() as u64;
                let phys = self.page_pool.virt_to_phys(virt).unwrap_or(0);
                tls.set_reg(crate::tls::TLS_OFFSET_RDI, virt);
                tls.set_reg(crate::tls::TLS_OFFSET_RSI, phys);
                status::SUCCESS
            }
            abi::MEM_OP_FREE_PAGE => self.free_frame(args[2], FrameSize::Small),
            abi::MEM_OP_ALLOC_HUGE => {
                let size = match args[2] {
                    s if s <= FrameSize::Large.bytes() as u64 => FrameSize::Large,
                    s if s <= FrameSize::Huge.bytes() as u64 => FrameSize::Huge,
                    _ => return status::INVALID_ARGUMENT,
                };
                let Some(page) = self.page_pool.allocate_page_of_size(size) else {
                    return status::OUT_OF_MEMORY;
                };
                let virt = page.as_ptr() as u64;
                let phys = self.page_pool.virt_to_phys(virt).unwrap_or(0);
                tls.set_reg(crate::tls::TLS_OFFSET_RDI, virt);
                tls.set_reg(crate::tls::TLS_OFFSET_RSI, phys);
                status::SUCCESS
            }
            abi::MEM_OP_FREE_HUGE => {
                let size = if args[3] <= FrameSize::Large.bytes() as u64 {
                    FrameSize::Large
                } else {
                    FrameSize::Huge
                };
                self.free_frame(args[2], size)
            }
            abi::MEM_OP_ALLOC_HEAP => {
                let Some((virt, _)) =
                    self.page_pool.allocate_contiguous(args[2] as usize, crate::config::PAGE_4K)
                else {
                    return status::OUT_OF_MEMORY;
                };
                tls.set_reg(crate::tls::TLS_OFFSET_RDI, virt.as_ptr() as u64);
                status::SUCCESS
            }
            abi::MEM_OP_FREE_HEAP => {
                let (virt, len) = (args[2], args[3]);
                if len == 0 || virt % crate::config::PAGE_4K as u64 != 0 {
                    return status::INVALID_ARGUMENT;
                }
                let Some(end) = virt.checked_add(len - 1) else {
                    return status::INVALID_ARGUMENT;
                };
                if self.page_pool.virt_to_phys(virt).is_none()
                    || self.page_pool.virt_to_phys(end).is_none()
                {
                    return status::INVALID_ARGUMENT;
                }
                let Some(ptr) = core::ptr::NonNull::new(virt as *mut u8) else {
                    return status::INVALID_ARGUMENT;
                };
                unsafe { self.page_pool.free_contiguous(ptr, len as usize) };
                status::SUCCESS
            }
            abi::MEM_OP_MAP_GUEST_PHYS => {
                // The backing region is direct-mapped; mapping is a
                // translation.
                match self.page_pool.phys_to_virt(args[2]) {
                    Some(virt) => {
                        tls.set_reg(crate::tls::TLS_OFFSET_RDI, virt);
                        status::SUCCESS
                    }
                    None => status::INVALID_ARGUMENT,
                }
            }
            abi::MEM_OP_UNMAP_GUEST_PHYS => match self.page_pool.phys_to_virt(args[2]) {
                Some(_) => status::SUCCESS,
                None => status::INVALID_ARGUMENT,
            },
            _ => status::INVALID_OPCODE,
        }
    }

    fn free_frame(&self, virt: u64, size: FrameSize) -> u64 {
        if self.page_pool.virt_to_phys(virt).is_none() || virt % size.bytes() as u64 != 0 {
            return status::INVALID_ARGUMENT;
        }
        let Some(ptr) = core::ptr::NonNull::new(virt as *mut u8) else {
            return status::INVALID_ARGUMENT;
        };
        unsafe { self.page_pool.deallocate(ptr, size) };
        status::SUCCESS
    }

    /// Destroys a VM and cascades through its VPs and their VPSes.
    fn destroy_vm(&self, vmid: u16) -> u64 {
        let mut vp_ids: heapless::Vec<u16, MAX_VPS> = heapless::Vec::new();
        {
            let vps = self.vps.lock();
            for id in vps.ids_where(|vp| vp.assigned_vm() == vmid) {
                let _ = vp_ids.push(id);
            }
        }

        for vpid in &vp_ids {
            let st = self.destroy_vp(*vpid);
            if status::failed(st) {
                return st;
            }
        }

        match self.vms.lock().destroy(vmid) {
            Ok(()) => status::SUCCESS,
            Err(e) => pool_status(e),
        }
    }

    /// Destroys a VP and every VPS assigned to it.
    fn destroy_vp(&self, vpid: u16) -> u64 {
        let mut vps_ids: heapless::Vec<u16, MAX_VPSS> = heapless::Vec::new();
        {
            let vpss = self.vpss.lock();
            for id in vpss.ids_assigned_to(vpid) {
                let _ = vps_ids.push(id);
            }
        }

        {
            let mut vpss = self.vpss.lock();
            for vpsid in &vps_ids {
                if let Err(e) = vpss.destroy(*vpsid, &self.page_pool) {
                    return pool_status(e);
                }
            }
        }

        match self.vps.lock().destroy(vpid) {
            Ok(()) => status::SUCCESS,
            Err(e) => pool_status(e),
        }
    }
}

impl<V: VendorVps> Default for Kernel<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn vps_status(e: VpsError) -> u64 {
    match e {
        VpsError::Unsupported => status::INVALID_STATE,
        VpsError::InvalidArgument => status::INVALID_ARGUMENT,
        VpsError::InvalidIndex => status::INVALID_INDEX,
        VpsError::OutOfMemory => status::OUT_OF_MEMORY,
        VpsError::InvalidState => status::INVALID_STATE,
        VpsError::EntryCheck(_) => status::ENTRY_CHECK_FAILED,
        VpsError::EntryFailed => status::ENTRY_FAILED,
        VpsError::Vmx(_) => status::UNKNOWN,
    }
}

fn pool_status(e: PoolError) -> u64 {
    match e {
        PoolError::Exhausted => status::OUT_OF_MEMORY,
        PoolError::InvalidId => status::INVALID_ID,
        PoolError::Root => status::INVALID_ARGUMENT,
        PoolError::Active => status::INVALID_STATE,
    }
}

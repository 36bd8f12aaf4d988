//! VPS state-machine tests for both vendors.

mod common;

use common::{MockIntrinsics, TestRegion};

use microvisor_hal::Intrinsics;

use microvisor_core::vps::amd::AmdVps;
use microvisor_core::vps::checks::{self, CheckError};
use microvisor_core::vps::intel::IntelVps;
use microvisor_core::vps::{Reg, VendorVps, VpsError};
use microvisor_core::{SegmentState, StateSave, TableState, Tls};
use microvisor_hal::arch::x86_64::vmcs;
use microvisor_hal::msr;

fn allocated<V: VendorVps>(intrinsic: &mut MockIntrinsics, region: &TestRegion) -> (V, microvisor_core::PagePool) {
    let pool = region.pool();
    let mut vps = V::default();
    vps.initialize(1).unwrap();
    vps.allocate(intrinsic, &pool).unwrap();
    (vps, pool)
}

/// A register state where every field carries a distinct value.
fn sample_state() -> StateSave {
    let seg = |n: u64| SegmentState {
        selector: 0x08 + n as u16,
        attrib: 0xA093,
        limit: 0xFFFF_F000 + n as u32,
        base: 0x1000 * n,
    };
    StateSave {
        rax: 0x0101,
        rbx: 0x0202,
        rcx: 0x0303,
        rdx: 0x0404,
        rbp: 0x0505,
        rsi: 0x0606,
        rdi: 0x0707,
        r8: 0x0808,
        r9: 0x0909,
        r10: 0x0A0A,
        r11: 0x0B0B,
        r12: 0x0C0C,
        r13: 0x0D0D,
        r14: 0x0E0E,
        r15: 0x0F0F,
        rsp: 0x7FFF_F000,
        rip: 0xFFFF_8000_0010_0000,
        rflags: 0x202,
        es: seg(1),
        cs: SegmentState { selector: 0x10, attrib: 0xA09B, limit: 0xFFFF_FFFF, base: 0 },
        ss: seg(3),
        ds: seg(4),
        fs: seg(5),
        gs: seg(6),
        ldtr: SegmentState { selector: 0, attrib: 0x0082, limit: 0xFFFF, base: 0x9000 },
        tr: SegmentState { selector: 0x40, attrib: 0x008B, limit: 0x67, base: 0xA000 },
        gdtr: TableState { base: 0xFFFF_8000_0000_1000, limit: 0x7F },
        idtr: TableState { base: 0xFFFF_8000_0000_2000, limit: 0xFFF },
        cr0: 0x8005_0033,
        cr2: 0xBAD_ADD0,
        cr3: 0x1_0000,
        cr4: 0x20_06E0,
        dr6: 0xFFFF_0FF0,
        dr7: 0x400,
        efer: 0xD01,
        star: 0x23_0010_0000_0000,
        lstar: 0xFFFF_8000_0020_0000,
        cstar: 0xFFFF_8000_0030_0000,
        fmask: 0x4_7700,
        kernel_gs_base: 0xFFFF_8800_0000_0000,
        sysenter_cs: 0x10,
        sysenter_esp: 0xFFFF_8000_0040_0000,
        sysenter_eip: 0xFFFF_8000_0050_0000,
        pat: 0x7_0406_0007_0406,
        dbgctl: 0x1,
    }
}

/// The native width of each register token's storage.
fn token_mask(reg: Reg) -> u64 {
    use Reg::*;
    match reg {
        Es | Cs | Ss | Ds | Fs | Gs | Ldtr | Tr => 0xFFFF,
        EsAttrib | CsAttrib | SsAttrib | DsAttrib | FsAttrib | GsAttrib | LdtrAttrib
        | TrAttrib => 0xFFFF,
        EsLimit | CsLimit | SsLimit | DsLimit | FsLimit | GsLimit | LdtrLimit | TrLimit
        | GdtrLimit | IdtrLimit => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

#[test]
fn unallocated_vps_refuses_every_mutation() {
    let mut intrinsic = MockIntrinsics::new();
    let mut tls = Tls::new(0);

    let mut amd = AmdVps::default();
    amd.initialize(1).unwrap();
    assert_eq!(
        amd.write_reg(&mut intrinsic, &mut tls, Reg::Rip, 1).unwrap_err(),
        VpsError::InvalidArgument
    );
    assert_eq!(amd.read_reg(&intrinsic, &tls, Reg::Rax).unwrap_err(), VpsError::InvalidArgument);
    assert_eq!(amd.write64(&mut intrinsic, 0x578, 1).unwrap_err(), VpsError::InvalidArgument);
    assert_eq!(amd.run(&mut intrinsic, &mut tls).unwrap_err(), VpsError::InvalidArgument);
    assert_eq!(amd.advance_ip(&mut intrinsic).unwrap_err(), VpsError::InvalidArgument);

    let mut intel = IntelVps::default();
    intel.initialize(1).unwrap();
    assert_eq!(
        intel.write_reg(&mut intrinsic, &mut tls, Reg::Rip, 1).unwrap_err(),
        VpsError::InvalidArgument
    );
    assert_eq!(
        intel.state_save_to_vps(&mut intrinsic, &mut tls, &StateSave::default()).unwrap_err(),
        VpsError::InvalidArgument
    );
}

#[test]
fn amd_state_save_round_trips() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    let state = sample_state();
    vps.state_save_to_vps(&mut intrinsic, &mut tls, &state).unwrap();

    let mut read_back = StateSave::default();
    vps.vps_to_state_save(&intrinsic, &tls, &mut read_back).unwrap();
    assert_eq!(state, read_back);
}

#[test]
fn intel_state_save_round_trips() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    let state = sample_state();
    vps.state_save_to_vps(&mut intrinsic, &mut tls, &state).unwrap();

    let mut read_back = StateSave::default();
    vps.vps_to_state_save(&intrinsic, &tls, &mut read_back).unwrap();
    assert_eq!(state, read_back);
}

#[test]
fn amd_rejects_attributes_with_middle_nibble_bits() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    let mut state = sample_state();
    state.ds.attrib = 0xA193; // bits 11:8 are not representable
    assert_eq!(
        vps.state_save_to_vps(&mut intrinsic, &mut tls, &state).unwrap_err(),
        VpsError::InvalidArgument
    );
}

#[test]
fn register_tokens_round_trip_on_both_vendors() {
    let region = TestRegion::new(64);
    let region_b = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let mut tls = Tls::new(0);

    let (mut amd, _pool_a) = allocated::<AmdVps>(&mut intrinsic, &region);
    for (n, reg) in Reg::ALL.iter().enumerate() {
        let val = (0x1111_1111_1111_1111u64.wrapping_mul(n as u64 + 1)) & token_mask(*reg);
        amd.write_reg(&mut intrinsic, &mut tls, *reg, val).unwrap();
        assert_eq!(amd.read_reg(&intrinsic, &tls, *reg).unwrap(), val, "amd {:?}", reg);
    }

    let (mut intel, _pool_b) = allocated::<IntelVps>(&mut intrinsic, &region_b);
    for (n, reg) in Reg::ALL.iter().enumerate() {
        let val = (0x2222_2222_2222_2222u64.wrapping_mul(n as u64 + 1)) & token_mask(*reg);
        intel.write_reg(&mut intrinsic, &mut tls, *reg, val).unwrap();
        assert_eq!(intel.read_reg(&intrinsic, &tls, *reg).unwrap(), val, "intel {:?}", reg);
    }
}

#[test]
fn amd_cs_attribute_token_round_trips_raw() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    vps.write_reg(&mut intrinsic, &mut tls, Reg::CsAttrib, 0x0A9B).unwrap();
    assert_eq!(vps.read_reg(&intrinsic, &tls, Reg::CsAttrib).unwrap(), 0x0A9B);
}

#[test]
fn amd_numeric_index_round_trips_and_bounds_check() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let tls = Tls::new(0);

    // 0x578 is the VMCB's RIP slot; the raw index view and the token
    // view see the same storage.
    vps.write64(&mut intrinsic, 0x578, 0xFFFF_8000_1234_5678).unwrap();
    assert_eq!(vps.read64(&intrinsic, 0x578).unwrap(), 0xFFFF_8000_1234_5678);
    assert_eq!(vps.read_reg(&intrinsic, &tls, Reg::Rip).unwrap(), 0xFFFF_8000_1234_5678);

    vps.write16(&mut intrinsic, 0x412, 0x0A9B).unwrap();
    assert_eq!(vps.read16(&intrinsic, 0x412).unwrap(), 0x0A9B);
    assert_eq!(vps.read_reg(&intrinsic, &tls, Reg::CsAttrib).unwrap(), 0x0A9B);

    assert_eq!(vps.read64(&intrinsic, 0x1000).unwrap_err(), VpsError::InvalidIndex);
    assert_eq!(vps.write32(&mut intrinsic, 0x1000, 0).unwrap_err(), VpsError::InvalidIndex);
}

#[test]
fn amd_run_reports_exit_and_enforces_affinity() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);

    let mut tls0 = Tls::new(0);
    let mut tls1 = Tls::new(1);

    intrinsic.next_vmrun_exit.set(0x72); // CPUID
    assert_eq!(vps.run(&mut intrinsic, &mut tls0).unwrap(), 0x72);
    assert_eq!(vps.active_pp(), Some(0));

    // Active on PP 0: PP 1 must not run it without a migration.
    assert_eq!(vps.run(&mut intrinsic, &mut tls1).unwrap_err(), VpsError::InvalidState);

    vps.deactivate(&mut intrinsic).unwrap();
    vps.activate(&mut intrinsic, 1).unwrap();
    assert_eq!(vps.run(&mut intrinsic, &mut tls1).unwrap(), 0x72);
}

#[test]
fn amd_entry_refusal_is_a_distinguished_error() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    intrinsic.next_vmrun_exit.set(u64::MAX);
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap_err(), VpsError::EntryFailed);
}

#[test]
fn amd_advance_ip_adopts_nrip() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);

    // 0xC8 is the VMCB's NRIP slot.
    vps.write64(&mut intrinsic, 0xC8, 0x4002).unwrap();
    vps.advance_ip(&mut intrinsic).unwrap();
    assert_eq!(vps.read64(&intrinsic, 0x578).unwrap(), 0x4002);
}

#[test]
fn intel_launch_then_resume() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    // Not activated yet: no current VMCS to enter through.
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap_err(), VpsError::InvalidState);

    vps.activate(&mut intrinsic, 0).unwrap();
    assert_ne!(intrinsic.current_vmcs.get(), 0);

    intrinsic.next_exit_reason.set(18);
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap(), 18);
    assert_eq!((intrinsic.launches.get(), intrinsic.resumes.get()), (1, 0));

    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap(), 18);
    assert_eq!((intrinsic.launches.get(), intrinsic.resumes.get()), (1, 1));

    // Deactivation clears launch state: the next entry launches again.
    vps.deactivate(&mut intrinsic).unwrap();
    vps.activate(&mut intrinsic, 0).unwrap();
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap(), 18);
    assert_eq!((intrinsic.launches.get(), intrinsic.resumes.get()), (2, 1));
}

#[test]
fn intel_refused_entry_never_reaches_handlers() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    vps.activate(&mut intrinsic, 0).unwrap();
    intrinsic.refuse_entry.set(true);
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap_err(), VpsError::EntryFailed);

    // The refusal did not mark the VMCS launched.
    intrinsic.refuse_entry.set(false);
    vps.run(&mut intrinsic, &mut tls).unwrap();
    assert_eq!((intrinsic.launches.get(), intrinsic.resumes.get()), (1, 0));
}

#[test]
fn intel_advance_ip_skips_the_exiting_instruction() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);

    intrinsic.vmcs.borrow_mut().insert(vmcs::GUEST_RIP, 0x1000);
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_INSTRUCTION_LEN, 3);
    vps.advance_ip(&mut intrinsic).unwrap();
    assert_eq!(intrinsic.vmcs_field(vmcs::GUEST_RIP), 0x1003);
}

#[test]
fn intel_numeric_access_enforces_encoded_width() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);

    // A 64-bit field round-trips through the 64-bit accessors.
    vps.write64(&mut intrinsic, u64::from(vmcs::EPT_POINTER), 0xAA55).unwrap();
    assert_eq!(vps.read64(&intrinsic, u64::from(vmcs::EPT_POINTER)).unwrap(), 0xAA55);

    // Natural-width fields count as 64-bit.
    vps.write64(&mut intrinsic, u64::from(vmcs::GUEST_RIP), 0x77).unwrap();

    // Mismatched widths are rejected.
    assert_eq!(
        vps.read32(&intrinsic, u64::from(vmcs::GUEST_RIP)).unwrap_err(),
        VpsError::InvalidArgument
    );
    assert_eq!(
        vps.write16(&mut intrinsic, u64::from(vmcs::EXIT_REASON), 0).unwrap_err(),
        VpsError::InvalidArgument
    );
    assert_eq!(
        vps.write64(&mut intrinsic, u64::from(vmcs::GUEST_CS_SELECTOR), 0).unwrap_err(),
        VpsError::InvalidArgument
    );
    vps.write16(&mut intrinsic, u64::from(vmcs::GUEST_CS_SELECTOR), 0x10).unwrap();
    assert_eq!(vps.read16(&intrinsic, u64::from(vmcs::GUEST_CS_SELECTOR)).unwrap(), 0x10);
}

#[test]
fn entry_checks_reject_invalid_ept_memory_type() {
    // EPTP memory type 2 (write-through) with capabilities reporting
    // only UC and WB: the check fires before any entry is attempted.
    let mut intrinsic = MockIntrinsics::new();
    intrinsic
        .vmcs
        .borrow_mut()
        .insert(vmcs::CPU_BASED_VM_EXEC_CONTROL, 1 << 31);
    intrinsic.vmcs.borrow_mut().insert(vmcs::SECONDARY_VM_EXEC_CONTROL, 1 << 1);
    intrinsic.vmcs.borrow_mut().insert(vmcs::EPT_POINTER, (3 << 3) | 2);

    assert_eq!(checks::check_entry_controls(&intrinsic).unwrap_err(), CheckError::EptMemoryType);

    // And through the run path of an activated VPS.
    let region = TestRegion::new(64);
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);
    vps.activate(&mut intrinsic, 0).unwrap();
    assert_eq!(
        vps.run(&mut intrinsic, &mut tls).unwrap_err(),
        VpsError::EntryCheck(CheckError::EptMemoryType)
    );
    assert_eq!(intrinsic.launches.get(), 0);
}

#[test]
fn entry_checks_cover_the_sdm_rules() {
    // Reserved bit: allowed-1 mask forbids everything, one bit set.
    let intrinsic = MockIntrinsics::new();
    intrinsic.set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, 0);
    intrinsic.vmcs.borrow_mut().insert(vmcs::PIN_BASED_VM_EXEC_CONTROL, 1 << 1);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::PinBasedReservedBits
    );

    // Secondary controls without the activate bit.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::SECONDARY_VM_EXEC_CONTROL, 1 << 1);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::SecondaryWithoutActivate
    );

    // TPR-shadow dependents without the TPR shadow.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::CPU_BASED_VM_EXEC_CONTROL, 1 << 31);
    intrinsic.vmcs.borrow_mut().insert(vmcs::SECONDARY_VM_EXEC_CONTROL, 1 << 9);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::TprShadowConsistency
    );

    // Posted interrupts without external-interrupt exiting.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::PIN_BASED_VM_EXEC_CONTROL, 1 << 7);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::PostedIntWithoutExternalExit
    );

    // Posted interrupts with a misaligned descriptor.
    let intrinsic = MockIntrinsics::new();
    intrinsic
        .vmcs
        .borrow_mut()
        .insert(vmcs::PIN_BASED_VM_EXEC_CONTROL, (1 << 7) | (1 << 0));
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_CONTROLS, 1 << 15);
    intrinsic.vmcs.borrow_mut().insert(vmcs::POSTED_INTR_DESC_ADDR, 0x1008);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::PostedIntDescMisaligned
    );

    // VPID enabled with vpid zero.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::CPU_BASED_VM_EXEC_CONTROL, 1 << 31);
    intrinsic.vmcs.borrow_mut().insert(vmcs::SECONDARY_VM_EXEC_CONTROL, 1 << 5);
    assert_eq!(checks::check_entry_controls(&intrinsic).unwrap_err(), CheckError::VpidZero);

    // Event injection: reserved type.
    let intrinsic = MockIntrinsics::new();
    intrinsic
        .vmcs
        .borrow_mut()
        .insert(vmcs::VM_ENTRY_INTR_INFO_FIELD, (1 << 31) | (1 << 8) | 32);
    assert_eq!(checks::check_entry_controls(&intrinsic).unwrap_err(), CheckError::EventInjBadType);

    // Event injection: error code on a vector that has none.
    let intrinsic = MockIntrinsics::new();
    intrinsic
        .vmcs
        .borrow_mut()
        .insert(vmcs::VM_ENTRY_INTR_INFO_FIELD, (1 << 31) | (1 << 11) | (3 << 8) | 3);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::EventInjErrorCodeDelivery
    );

    // MSR store area: not 16-byte aligned.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_MSR_STORE_COUNT, 1);
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_MSR_STORE_ADDR, 0x1008);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::MsrStoreMisaligned
    );

    // MSR load area: past the physical-address width.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_MSR_LOAD_COUNT, 2);
    intrinsic.vmcs.borrow_mut().insert(vmcs::VM_EXIT_MSR_LOAD_ADDR, 1u64 << 52);
    assert_eq!(
        checks::check_entry_controls(&intrinsic).unwrap_err(),
        CheckError::MsrLoadOutOfRange
    );

    // More than four CR3 targets.
    let intrinsic = MockIntrinsics::new();
    intrinsic.vmcs.borrow_mut().insert(vmcs::CR3_TARGET_COUNT, 5);
    assert_eq!(checks::check_entry_controls(&intrinsic).unwrap_err(), CheckError::Cr3TargetCount);

    // All-defaults VMCS passes.
    let intrinsic = MockIntrinsics::new();
    checks::check_entry_controls(&intrinsic).unwrap();
}

#[test]
fn amd_vmcb_checks_cover_the_apm_rules() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    // ASID zero refuses the entry. 0x58 is the VMCB's guest ASID.
    vps.write32(&mut intrinsic, 0x58, 0).unwrap();
    assert_eq!(
        vps.run(&mut intrinsic, &mut tls).unwrap_err(),
        VpsError::EntryCheck(CheckError::AsidZero)
    );
    vps.write32(&mut intrinsic, 0x58, 1).unwrap();

    // CR0.NW without CR0.CD is not canonical.
    let mut tls2 = Tls::new(0);
    vps.write_reg(&mut intrinsic, &mut tls2, Reg::Cr0, 1 << 29).unwrap();
    assert_eq!(
        vps.run(&mut intrinsic, &mut tls).unwrap_err(),
        VpsError::EntryCheck(CheckError::Cr0CacheConflict)
    );
    vps.write_reg(&mut intrinsic, &mut tls2, Reg::Cr0, 0).unwrap();

    intrinsic.next_vmrun_exit.set(0x81);
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap(), 0x81);
}

#[test]
fn virtualization_enable_per_vendor() {
    let region = TestRegion::new(16);
    let mut intrinsic = MockIntrinsics::new();
    let pool = region.pool();

    // Intel: CR4.VMXE set and a revision-stamped VMXON region handed to
    // the hardware.
    IntelVps::enable_virtualization(&mut intrinsic, &pool).unwrap();
    assert_ne!(intrinsic.cr4.get() & (1 << 13), 0);
    let vmxon_phys = intrinsic.vmxon_region.get();
    assert_ne!(vmxon_phys, 0);
    let vmxon_virt = pool.phys_to_virt(vmxon_phys).unwrap();
    let revision = unsafe { (vmxon_virt as *const u32).read() };
    assert_eq!(u64::from(revision), intrinsic.rdmsr(msr::IA32_VMX_BASIC) & 0x7FFF_FFFF);

    // A locked feature-control MSR without the VMXON bit blocks entry
    // into VMX operation.
    let locked = MockIntrinsics::new();
    locked.set_msr(msr::IA32_FEATURE_CONTROL, msr::FEATURE_CONTROL_LOCK);
    let mut locked = locked;
    assert_eq!(
        IntelVps::enable_virtualization(&mut locked, &pool).unwrap_err(),
        VpsError::Unsupported
    );

    // AMD: EFER.SVME comes on.
    let mut amd_cpu = MockIntrinsics::new();
    AmdVps::enable_virtualization(&mut amd_cpu, &pool).unwrap();
    assert_ne!(amd_cpu.rdmsr(msr::IA32_EFER) & (1 << 12), 0);

    // Firmware-disabled SVM is reported, not ignored.
    let vmcr_locked = MockIntrinsics::new();
    vmcr_locked.set_msr(msr::VM_CR, 1 << 4);
    let mut vmcr_locked = vmcr_locked;
    assert_eq!(
        AmdVps::enable_virtualization(&mut vmcr_locked, &pool).unwrap_err(),
        VpsError::Unsupported
    );
}

#[test]
fn intel_host_fields_are_programmed_for_the_exit_path() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, _pool) = allocated::<IntelVps>(&mut intrinsic, &region);

    let mut host = sample_state();
    host.cs.selector = 0x13; // RPL bits must be stripped
    vps.setup_host(&mut intrinsic, &host, 0xFFFF_8000_0000_2000, 0xFFFF_8000_0000_3000)
        .unwrap();

    assert_eq!(intrinsic.vmcs_field(vmcs::HOST_CS_SELECTOR), 0x10);
    assert_eq!(intrinsic.vmcs_field(vmcs::HOST_CR3), host.cr3);
    assert_eq!(intrinsic.vmcs_field(vmcs::HOST_RIP), 0xFFFF_8000_0000_2000);
    assert_eq!(intrinsic.vmcs_field(vmcs::HOST_RSP), 0xFFFF_8000_0000_3000);
    assert_eq!(intrinsic.vmcs_field(vmcs::HOST_GDTR_BASE), host.gdtr.base);
}

#[test]
fn deallocate_returns_to_unallocated() {
    let region = TestRegion::new(64);
    let mut intrinsic = MockIntrinsics::new();
    let (mut vps, pool) = allocated::<AmdVps>(&mut intrinsic, &region);
    let mut tls = Tls::new(0);

    assert!(vps.is_allocated());
    vps.deallocate(&pool);
    assert!(!vps.is_allocated());
    assert_eq!(vps.run(&mut intrinsic, &mut tls).unwrap_err(), VpsError::InvalidArgument);
}

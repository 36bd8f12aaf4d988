//! Pre-entry consistency checks
//!
//! The hardware's own entry checks end in an opaque failure, so every
//! rule the control fields can break is checked here first and failure
//! names the rule. The Intel list follows the SDM's controls-on-entry
//! chapter; the AMD list follows the APM's VMRUN canonicalization
//! rules. Nothing here mutates state.

use microvisor_hal::arch::x86_64::vmcb::Vmcb;
use microvisor_hal::arch::x86_64::vmcs;
use microvisor_hal::{msr, Intrinsics};

/// One failed consistency rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    PinBasedReservedBits,
    ProcBasedReservedBits,
    SecondaryReservedBits,
    ExitReservedBits,
    EntryReservedBits,
    SecondaryWithoutActivate,
    TprShadowConsistency,
    PostedIntWithoutExternalExit,
    PostedIntWithoutAckOnExit,
    PostedIntBadVector,
    PostedIntDescMisaligned,
    EptWalkLength,
    EptMemoryType,
    VpidZero,
    EventInjReservedBits,
    EventInjBadType,
    EventInjBadVector,
    EventInjErrorCodeDelivery,
    MsrStoreMisaligned,
    MsrStoreOutOfRange,
    MsrLoadMisaligned,
    MsrLoadOutOfRange,
    EntryMsrLoadMisaligned,
    EntryMsrLoadOutOfRange,
    Cr3TargetCount,

    AsidZero,
    VmrunNotIntercepted,
    Cr0CacheConflict,
}

// Pin-based controls.
const PIN_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
const PIN_PROCESS_POSTED_INTERRUPTS: u64 = 1 << 7;

// Primary processor-based controls.
const PROC_USE_TPR_SHADOW: u64 = 1 << 21;
const PROC_ACTIVATE_SECONDARY: u64 = 1 << 31;

// Secondary processor-based controls.
const PROC2_ENABLE_EPT: u64 = 1 << 1;
const PROC2_VIRTUALIZE_X2APIC: u64 = 1 << 4;
const PROC2_ENABLE_VPID: u64 = 1 << 5;
const PROC2_APIC_REGISTER_VIRT: u64 = 1 << 8;
const PROC2_VIRTUAL_INT_DELIVERY: u64 = 1 << 9;

// Exit controls.
const EXIT_ACK_INTERRUPT_ON_EXIT: u64 = 1 << 15;

// IA32_VMX_BASIC bit 55: the TRUE capability MSRs exist.
const BASIC_TRUE_CTLS: u64 = 1 << 55;

// IA32_VMX_EPT_VPID_CAP: supported EPT paging-structure memory types.
const EPT_CAP_MEMTYPE_UC: u64 = 1 << 8;
const EPT_CAP_MEMTYPE_WB: u64 = 1 << 14;

const EPT_MEMTYPE_UC: u64 = 0;
const EPT_MEMTYPE_WB: u64 = 6;

// Event-injection interruption-information layout.
const INTR_INFO_VALID: u64 = 1 << 31;
const INTR_INFO_DELIVER_EC: u64 = 1 << 11;
const INTR_INFO_RESERVED: u64 = 0x7FFF_F000;
const INTR_TYPE_RESERVED: u64 = 1;
const INTR_TYPE_HW_EXCEPTION: u64 = 3;

/// Vectors that architecturally push an error code.
fn vector_has_error_code(vector: u64) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
}

/// Reads a control field, treating an unreadable field as all-zero so
/// the checks run identically whether or not the hardware implements
/// the field.
fn ctl<I: Intrinsics>(i: &I, field: u32) -> u64 {
    i.vmread(field).unwrap_or(0)
}

/// Verifies one control word against its allowed-0/allowed-1 MSR.
fn check_allowed<I: Intrinsics>(i: &I, value: u64, cap_msr: u32) -> bool {
    let cap = i.rdmsr(cap_msr);
    let allowed0 = cap & 0xFFFF_FFFF;
    let allowed1 = cap >> 32;
    // Every must-be-one bit set, no may-not-be-one bit set.
    (value & allowed0) == allowed0 && (value & !allowed1) == 0
}

/// Runs the full Intel entry-controls check list against the current
/// VMCS. Returns the first violated rule.
pub fn check_entry_controls<I: Intrinsics>(i: &I) -> Result<(), CheckError> {
    let basic = i.rdmsr(msr::IA32_VMX_BASIC);
    let true_ctls = basic & BASIC_TRUE_CTLS != 0;

    let (pin_cap, proc_cap, exit_cap, entry_cap) = if true_ctls {
        (
            msr::IA32_VMX_TRUE_PINBASED_CTLS,
            msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            msr::IA32_VMX_TRUE_EXIT_CTLS,
            msr::IA32_VMX_TRUE_ENTRY_CTLS,
        )
    } else {
        (
            msr::IA32_VMX_PINBASED_CTLS,
            msr::IA32_VMX_PROCBASED_CTLS,
            msr::IA32_VMX_EXIT_CTLS,
            msr::IA32_VMX_ENTRY_CTLS,
        )
    };

    let pin = ctl(i, vmcs::PIN_BASED_VM_EXEC_CONTROL);
    let proc = ctl(i, vmcs::CPU_BASED_VM_EXEC_CONTROL);
    let proc2 = ctl(i, vmcs::SECONDARY_VM_EXEC_CONTROL);
    let exit = ctl(i, vmcs::VM_EXIT_CONTROLS);
    let entry = ctl(i, vmcs::VM_ENTRY_CONTROLS);

    if !check_allowed(i, pin, pin_cap) {
        return Err(CheckError::PinBasedReservedBits);
    }
    if !check_allowed(i, proc, proc_cap) {
        return Err(CheckError::ProcBasedReservedBits);
    }
    if !check_allowed(i, exit, exit_cap) {
        return Err(CheckError::ExitReservedBits);
    }
    if !check_allowed(i, entry, entry_cap) {
        return Err(CheckError::EntryReservedBits);
    }

    let secondary_active = proc & PROC_ACTIVATE_SECONDARY != 0;
    if secondary_active {
        if !check_allowed(i, proc2, msr::IA32_VMX_PROCBASED_CTLS2) {
            return Err(CheckError::SecondaryReservedBits);
        }
    } else if proc2 != 0 {
        return Err(CheckError::SecondaryWithoutActivate);
    }

    if proc & PROC_USE_TPR_SHADOW == 0 {
        let tpr_dependents =
            PROC2_VIRTUAL_INT_DELIVERY | PROC2_VIRTUALIZE_X2APIC | PROC2_APIC_REGISTER_VIRT;
        if proc2 & tpr_dependents != 0 {
            return Err(CheckError::TprShadowConsistency);
        }
    }

    if pin & PIN_PROCESS_POSTED_INTERRUPTS != 0 {
        if pin & PIN_EXTERNAL_INTERRUPT_EXITING == 0 {
            return Err(CheckError::PostedIntWithoutExternalExit);
        }
        if exit & EXIT_ACK_INTERRUPT_ON_EXIT == 0 {
            return Err(CheckError::PostedIntWithoutAckOnExit);
        }
        if ctl(i, vmcs::POSTED_INTR_NOTIFICATION_VECTOR) >= 256 {
            return Err(CheckError::PostedIntBadVector);
        }
        if ctl(i, vmcs::POSTED_INTR_DESC_ADDR) & 0xFFF != 0 {
            return Err(CheckError::PostedIntDescMisaligned);
        }
    }

    if secondary_active && proc2 & PROC2_ENABLE_EPT != 0 {
        let eptp = ctl(i, vmcs::EPT_POINTER);
        let walk_minus_one = (eptp >> 3) & 0b111;
        if walk_minus_one > 3 {
            return Err(CheckError::EptWalkLength);
        }
        let cap = i.rdmsr(msr::IA32_VMX_EPT_VPID_CAP);
        let supported = match eptp & 0b111 {
            EPT_MEMTYPE_UC => cap & EPT_CAP_MEMTYPE_UC != 0,
            EPT_MEMTYPE_WB => cap & EPT_CAP_MEMTYPE_WB != 0,
            _ => false,
        };
        if !supported {
            return Err(CheckError::EptMemoryType);
        }
    }

    if secondary_active
        && proc2 & PROC2_ENABLE_VPID != 0
        && ctl(i, vmcs::VIRTUAL_PROCESSOR_ID) == 0
    {
        return Err(CheckError::VpidZero);
    }

    let info = ctl(i, vmcs::VM_ENTRY_INTR_INFO_FIELD);
    if info & INTR_INFO_VALID != 0 {
        let vector = info & 0xFF;
        let kind = (info >> 8) & 0b111;
        if info & INTR_INFO_RESERVED != 0 {
            return Err(CheckError::EventInjReservedBits);
        }
        if kind == INTR_TYPE_RESERVED {
            return Err(CheckError::EventInjBadType);
        }
        if kind == INTR_TYPE_HW_EXCEPTION && vector > 31 {
            return Err(CheckError::EventInjBadVector);
        }
        if info & INTR_INFO_DELIVER_EC != 0
            && !(kind == INTR_TYPE_HW_EXCEPTION && vector_has_error_code(vector))
        {
            return Err(CheckError::EventInjErrorCodeDelivery);
        }
    }

    let phys_bits = i.cpuid(0x8000_0008, 0).eax & 0xFF;
    let phys_mask = msr::physical_address_mask(phys_bits);
    let check_area = |count_field: u32,
                          addr_field: u32,
                          misaligned: CheckError,
                          out_of_range: CheckError|
     -> Result<(), CheckError> {
        let count = ctl(i, count_field);
        if count == 0 {
            return Ok(());
        }
        let addr = ctl(i, addr_field);
        if addr & 0xF != 0 {
            return Err(misaligned);
        }
        if addr.checked_add(count * 16 - 1).map_or(true, |end| end > phys_mask) {
            return Err(out_of_range);
        }
        Ok(())
    };
    check_area(
        vmcs::VM_EXIT_MSR_STORE_COUNT,
        vmcs::VM_EXIT_MSR_STORE_ADDR,
        CheckError::MsrStoreMisaligned,
        CheckError::MsrStoreOutOfRange,
    )?;
    check_area(
        vmcs::VM_EXIT_MSR_LOAD_COUNT,
        vmcs::VM_EXIT_MSR_LOAD_ADDR,
        CheckError::MsrLoadMisaligned,
        CheckError::MsrLoadOutOfRange,
    )?;
    check_area(
        vmcs::VM_ENTRY_MSR_LOAD_COUNT,
        vmcs::VM_ENTRY_MSR_LOAD_ADDR,
        CheckError::EntryMsrLoadMisaligned,
        CheckError::EntryMsrLoadOutOfRange,
    )?;

    if ctl(i, vmcs::CR3_TARGET_COUNT) > 4 {
        return Err(CheckError::Cr3TargetCount);
    }

    Ok(())
}

// AMD canonicalization rules.
const CR0_NW: u64 = 1 << 29;
const CR0_CD: u64 = 1 << 30;
const INSTR2_INTERCEPT_VMRUN: u32 = 1 << 0;

/// Runs the APM VMRUN canonicalization rules against a guest VMCB.
pub fn check_vmcb(vmcb: &Vmcb) -> Result<(), CheckError> {
    if vmcb.guest_asid == 0 {
        return Err(CheckError::AsidZero);
    }
    if vmcb.intercept_instr2 & INSTR2_INTERCEPT_VMRUN == 0 {
        return Err(CheckError::VmrunNotIntercepted);
    }
    if vmcb.cr0 & CR0_CD == 0 && vmcb.cr0 & CR0_NW != 0 {
        return Err(CheckError::Cr0CacheConflict);
    }
    Ok(())
}

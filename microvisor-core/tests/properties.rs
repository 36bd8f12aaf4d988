//! Property tests over the allocator and the VPS field surface.

mod common;

use std::collections::HashSet;

use common::{MockIntrinsics, TestRegion};
use proptest::prelude::*;

use microvisor_core::page_pool::FrameSize;
use microvisor_core::vps::amd::AmdVps;
use microvisor_core::vps::VendorVps;

proptest! {
    /// Any interleaving of allocations and frees yields distinct,
    /// zeroed, in-region frames.
    #[test]
    fn page_pool_never_hands_out_a_live_frame(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
        let region = TestRegion::new(32);
        let pool = region.pool();

        let mut live: Vec<*mut u8> = Vec::new();
        let mut seen = HashSet::new();

        for alloc in ops {
            if alloc {
                if let Some(frame) = pool.allocate_page() {
                    let addr = frame.as_ptr() as u64;
                    prop_assert!(addr >= region.base());
                    prop_assert!(addr + 4096 <= region.base() + region.size as u64);
                    prop_assert!(seen.insert(addr), "frame {addr:#x} handed out twice");

                    let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), 4096) };
                    prop_assert!(bytes.iter().all(|&b| b == 0));
                    unsafe { core::ptr::write_bytes(frame.as_ptr(), 0x5A, 4096) };
                    live.push(frame.as_ptr());
                }
            } else if let Some(ptr) = live.pop() {
                seen.remove(&(ptr as u64));
                unsafe { pool.deallocate(core::ptr::NonNull::new(ptr).unwrap(), FrameSize::Small) };
            }
        }
    }

    /// Invariant: for any 8-aligned index inside the control block,
    /// a 64-bit write reads back exactly.
    #[test]
    fn amd_indexed_u64_round_trips(index in (0u64..512).prop_map(|i| i * 8), val in any::<u64>()) {
        let region = TestRegion::new(16);
        let mut intrinsic = MockIntrinsics::new();
        let pool = region.pool();

        let mut vps = AmdVps::default();
        vps.initialize(1).unwrap();
        vps.allocate(&mut intrinsic, &pool).unwrap();

        vps.write64(&mut intrinsic, index, val).unwrap();
        prop_assert_eq!(vps.read64(&intrinsic, index).unwrap(), val);
    }

    /// Affine translation is its own inverse over the whole region.
    #[test]
    fn translation_round_trips(offset in 0u64..(31 * 4096)) {
        let region = TestRegion::new(32);
        let pool = region.pool();

        let virt = region.base() + offset;
        let phys = pool.virt_to_phys(virt).unwrap();
        prop_assert_eq!(pool.phys_to_virt(phys).unwrap(), virt);
    }
}

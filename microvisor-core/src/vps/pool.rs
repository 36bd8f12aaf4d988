//! The VPS pool
//!
//! Unlike the VM and VP pools, creating a VPS acquires hardware
//! resources (the control-block frames), so the pool drives the VPS
//! lifecycle itself: create is pop-plus-allocate with rollback, destroy
//! refuses active or root entries and returns the frames.

use microvisor_hal::Intrinsics;

use crate::config::MAX_VPSS;
use crate::page_pool::PagePool;
use crate::pool::PoolError;
use crate::INVALID_ID;

use super::{VendorVps, VpsError};

pub struct VpsPool<V: VendorVps> {
    entries: [V; MAX_VPSS],
    free_head: u16,
}

impl<V: VendorVps> VpsPool<V> {
    pub fn new() -> Self {
        let mut entries: [V; MAX_VPSS] = core::array::from_fn(|_| V::default());
        for (i, entry) in entries.iter_mut().enumerate() {
            let _ = entry.initialize(i as u16);
            let next = if i + 1 < MAX_VPSS { (i + 1) as u16 } else { INVALID_ID };
            entry.set_next_free(next);
        }
        Self { entries, free_head: 0 }
    }

    /// Creates a VPS bound to `vpid`: pops a free slot and allocates
    /// its control block. The slot goes back on the free list if the
    /// allocation fails.
    pub fn create<I: Intrinsics>(
        &mut self,
        intrinsic: &mut I,
        page_pool: &PagePool,
        vpid: u16,
    ) -> Result<u16, VpsError> {
        let id = self.free_head;
        if id == INVALID_ID {
            return Err(VpsError::OutOfMemory);
        }

        let next = self.entries[id as usize].next_free();

        if let Err(e) = self.entries[id as usize].allocate(intrinsic, page_pool) {
            return Err(e);
        }

        self.free_head = next;
        let entry = &mut self.entries[id as usize];
        entry.set_next_free(INVALID_ID);
        entry.assign_vp(vpid);
        Ok(id)
    }

    /// Destroys a VPS. The root VPS and any VPS still active on a
    /// processor are refused; deactivate on the owning processor first.
    pub fn destroy(&mut self, id: u16, page_pool: &PagePool) -> Result<(), PoolError> {
        if id == 0 {
            return Err(PoolError::Root);
        }
        let entry = match self.entries.get_mut(usize::from(id)) {
            Some(e) if e.is_allocated() => e,
            _ => return Err(PoolError::InvalidId),
        };
        if let Some(pp) = entry.active_pp() {
            crate::log!("vps {:#06x} destroy refused: active on pp {}", id, pp);
            return Err(PoolError::Active);
        }

        entry.deallocate(page_pool);
        entry.assign_vp(INVALID_ID);
        entry.set_next_free(self.free_head);
        self.free_head = id;
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&V> {
        self.entries.get(usize::from(id)).filter(|e| e.is_allocated())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut V> {
        self.entries.get_mut(usize::from(id)).filter(|e| e.is_allocated())
    }

    /// Ids of allocated VPSes assigned to `vpid`, oldest first.
    pub fn ids_assigned_to(&self, vpid: u16) -> impl Iterator<Item = u16> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.is_allocated() && e.assigned_vp() == vpid)
            .map(|(i, _)| i as u16)
    }
}

impl<V: VendorVps> Default for VpsPool<V> {
    fn default() -> Self {
        Self::new()
    }
}

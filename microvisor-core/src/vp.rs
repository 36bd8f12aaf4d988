//! Virtual processors
//!
//! A VP belongs to one VM and aggregates the VPSes created for it, one
//! per physical processor it has run on. VP 0 is the root VP.

use crate::config::MAX_VPS;
use crate::pool::{Pool, PoolEntry};
use crate::INVALID_ID;

pub struct Vp {
    id: u16,
    next_free: u16,
    allocated: bool,
    assigned_vm: u16,
}

impl Default for Vp {
    fn default() -> Self {
        Self { id: INVALID_ID, next_free: INVALID_ID, allocated: false, assigned_vm: INVALID_ID }
    }
}

impl Vp {
    pub fn assigned_vm(&self) -> u16 {
        self.assigned_vm
    }

    pub fn assign_vm(&mut self, vmid: u16) {
        self.assigned_vm = vmid;
    }
}

impl PoolEntry for Vp {
    fn initialize(&mut self, id: u16) -> Result<(), ()> {
        if id == INVALID_ID {
            return Err(());
        }
        self.id = id;
        Ok(())
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn next_free(&self) -> u16 {
        self.next_free
    }

    fn set_next_free(&mut self, id: u16) {
        self.next_free = id;
    }

    fn is_allocated(&self) -> bool {
        self.allocated
    }

    fn set_allocated(&mut self, allocated: bool) {
        self.allocated = allocated;
        if !allocated {
            self.assigned_vm = INVALID_ID;
        }
    }
}

pub type VpPool = Pool<Vp, MAX_VPS>;

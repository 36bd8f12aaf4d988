//! Virtual machines
//!
//! A VM is an id plus the VPs assigned to it; the guest memory map
//! belongs to the extension that created the VM and is expressed
//! through the memory hypercalls. VM 0 is the root VM, the booted host
//! OS itself, and exists for as long as the hypervisor does.

use crate::config::MAX_VMS;
use crate::pool::{Pool, PoolEntry};
use crate::INVALID_ID;

#[derive(Default)]
pub struct Vm {
    id: u16,
    next_free: u16,
    allocated: bool,
}

impl PoolEntry for Vm {
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
    }
}

pub type VmPool = Pool<Vm, MAX_VMS>;

//! Compile-time sizing of the hypervisor.

/// Maximum number of physical processors the TLS and mailbox arrays
/// are sized for.
pub const MAX_PPS: usize = 128;

/// Capacity of the VM pool, root VM included.
pub const MAX_VMS: usize = 16;

/// Capacity of the VP pool, root VPs included.
pub const MAX_VPS: usize = 256;

/// Capacity of the VPS pool.
pub const MAX_VPSS: usize = 256;

/// Frame sizes served by the page pool.
pub const PAGE_4K: usize = 4096;
pub const PAGE_2M: usize = 2 * 1024 * 1024;
pub const PAGE_1G: usize = 1024 * 1024 * 1024;

/// Vector used for cross-processor requests.
pub const IPI_VECTOR: u8 = 0xFD;

/// Version the handle syscall accepts.
pub const ABI_VERSION: u64 = 1;

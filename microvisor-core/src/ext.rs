//! Extension loading
//!
//! An extension is an ELF image dropped into the hypervisor's address
//! space: one contiguous allocation sized for the whole image, segments
//! copied and BSS-zeroed per the load plan, the image linked into the
//! shared namespace, and the well-known entry points resolved. Each
//! processor then runs the extension's bootstrap once, on the
//! hypervisor stack, interrupts disabled, with the per-PP TLS reachable
//! through the reserved segment base.

use microvisor_elf::{ElfError, ElfFile, ElfLoader};

use crate::page_pool::PagePool;
use crate::tls::Tls;

/// Symbols every extension image exports. Two of the five slots are
/// reserved for future revisions of the ABI and resolve to zero today.
const SYM_BOOTSTRAP: &str = "bootstrap";
const SYM_VMEXIT: &str = "vmexit";
const SYM_FAIL: &str = "fail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtError {
    Elf(ElfError),
    /// The contiguous region for the image could not be carved.
    OutOfMemory,
    /// The image exports no bootstrap entry.
    NoBootstrap,
}

impl From<ElfError> for ExtError {
    fn from(e: ElfError) -> Self {
        ExtError::Elf(e)
    }
}

/// A loaded, linked extension.
pub struct Extension {
    pub file: ElfFile,
    pub entry: u64,
    pub bootstrap: u64,
    pub vmexit: u64,
    pub fail: u64,
    pub reserved: [u64; 2],
}

impl Extension {
    /// Loads `bytes` as an extension image into `loader`'s namespace.
    ///
    /// The image lands at a pool-carved region; `exec_virt` is the
    /// virtual base position-independent images will see at run time.
    /// Relocation covers the whole loader and is idempotent for images
    /// relocated earlier.
    ///
    /// # Safety
    ///
    /// The pool region must be mapped at its virtual addresses (the
    /// loader links and later runs the image through them).
    pub unsafe fn load(
        loader: &mut ElfLoader,
        page_pool: &PagePool,
        bytes: &[u8],
        exec_virt: u64,
    ) -> Result<Extension, ExtError> {
        let mut file = ElfFile::parse(bytes)?;

        let total = file.total_memsz() as usize;
        let align = file.max_align().max(crate::config::PAGE_4K as u64) as usize;
        let (region, _phys) =
            page_pool.allocate_contiguous(total, align).ok_or(ExtError::OutOfMemory)?;
        let exec_addr = region.as_ptr();

        for i in 0..file.num_load_instrs() {
            let instr = *file.load_instr(i)?;
            let src = bytes
                .get(instr.file_offset as usize..(instr.file_offset + instr.filesz) as usize)
                .ok_or(ElfError::InvalidFile)?;
            unsafe {
                let dst = exec_addr.add(instr.mem_offset as usize);
                core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
                // The pool zeroes its frames, but the region may be
                // reused across loads; zero the BSS tail explicitly.
                core::ptr::write_bytes(
                    dst.add(instr.filesz as usize),
                    0,
                    (instr.memsz - instr.filesz) as usize,
                );
            }
        }

        unsafe {
            loader.add(&mut file, exec_addr, exec_virt)?;
            loader.relocate()?;
        }

        let bootstrap = unsafe { loader.resolve_symbol(SYM_BOOTSTRAP) };
        let bootstrap = match bootstrap {
            Ok(addr) => addr,
            Err(ElfError::NoSuchSymbol) => return Err(ExtError::NoBootstrap),
            Err(e) => return Err(e.into()),
        };
        let vmexit = unsafe { loader.resolve_symbol(SYM_VMEXIT).unwrap_or(0) };
        let fail = unsafe { loader.resolve_symbol(SYM_FAIL).unwrap_or(0) };

        Ok(Extension {
            entry: file.entry(),
            file,
            bootstrap,
            vmexit,
            fail,
            reserved: [0; 2],
        })
    }

    /// Invokes the extension's bootstrap for the processor owning
    /// `tls`. The caller provides the controlled context: hypervisor
    /// stack, interrupts disabled, segment base at the TLS.
    ///
    /// # Safety
    ///
    /// `self.bootstrap` must point at code linked for this address
    /// space with the `extern "C" fn(u16) -> u64` signature.
    pub unsafe fn invoke_bootstrap(&self, tls: &Tls) -> u64 {
        let entry: extern "C" fn(u16) -> u64 =
            unsafe { core::mem::transmute(self.bootstrap as *const ()) };
        entry(tls.ppid)
    }
}


//! Runtime linker over a set of loaded ELF images
//!
//! An [`ElfLoader`] owns the descriptors of every image participating in
//! one symbol namespace. Modules are stored by value in a bounded table
//! and referred to by index, so nothing here is self-referential; the
//! loaded segments live wherever the consumer copied them and are only
//! touched through raw pointers during linking.
//!
//! Global symbol resolution scans modules in insertion order. A strong
//! definition ends the scan; a weak definition is remembered and kept
//! only if no later module defines the symbol strongly. Symbols with a
//! zero value are undefined and never match.

use heapless::Vec;

use crate::file::ElfFile;
use crate::types::*;
use crate::{ElfError, MAX_NUM_MODULES};

/// Groups loaded images into one symbol namespace and links them.
#[derive(Default)]
pub struct ElfLoader {
    files: Vec<ElfFile, MAX_NUM_MODULES>,
    relocated: bool,
}

impl ElfLoader {
    pub const fn new() -> Self {
        Self { files: Vec::new(), relocated: false }
    }

    /// Number of images added so far.
    pub fn num_modules(&self) -> usize {
        self.files.len()
    }

    /// Returns the descriptor of module `index`.
    pub fn module(&self, index: usize) -> Result<&ElfFile, ElfError> {
        self.files.get(index).ok_or(ElfError::InvalidIndex)
    }

    /// True once [`relocate`](Self::relocate) has completed.
    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// Adds a loaded image to the namespace.
    ///
    /// `exec_addr` is the host-virtual base the segments were copied to;
    /// `exec_virt` is the virtual base the image will see at run time,
    /// honored only for position-independent images (fixed-address images
    /// keep their linked addresses). The call rebases the descriptor's
    /// dynamic-table addresses, reads the SysV hash header, and derives
    /// the symbol count from the distance between the symbol and string
    /// tables — a layout heuristic that holds for every mainstream
    /// linker but is not guaranteed by the ELF spec.
    ///
    /// An image can be added exactly once; the descriptor's `added` flag
    /// makes a second attempt fail even through a clone.
    ///
    /// # Safety
    ///
    /// The image's PT_LOAD segments must already be copied to
    /// `exec_addr` per its load instructions, and that memory must stay
    /// mapped for the lifetime of the loader.
    pub unsafe fn add(
        &mut self,
        ef: &mut ElfFile,
        exec_addr: *mut u8,
        exec_virt: u64,
    ) -> Result<(), ElfError> {
        if exec_addr.is_null() {
            return Err(ElfError::InvalidArgument);
        }
        if self.files.is_full() {
            return Err(ElfError::LoaderFull);
        }
        if ef.added {
            return Err(ElfError::InvalidArgument);
        }
        ef.added = true;

        ef.exec_addr = exec_addr as u64;
        if ef.start_addr == 0 {
            ef.exec_virt = exec_virt;
        }

        // Dynamic-table entries hold image virtual addresses; the host
        // address of table T is exec_addr + (T_vaddr - start_addr).
        let base = ef.exec_addr.wrapping_sub(ef.start_addr);
        let rebase = |addr: &mut u64| {
            if *addr != 0 {
                *addr = addr.wrapping_add(base);
            }
        };
        rebase(&mut ef.hash);
        rebase(&mut ef.strtab);
        rebase(&mut ef.symtab);
        rebase(&mut ef.rela_dyn);
        rebase(&mut ef.rela_plt);

        if ef.hash != 0 {
            ef.nbucket = unsafe { read_mem_u32(ef.hash) };
            ef.nchain = unsafe { read_mem_u32(ef.hash + 4) };
            ef.bucket = ef.hash + 8;
            ef.chain = ef.bucket + 4 * u64::from(ef.nbucket);
        }

        if ef.symtab != 0 && ef.strtab > ef.symtab {
            ef.symnum = (ef.strtab - ef.symtab) / SYM_SIZE as u64;
        }

        // Capacity was checked above.
        let _ = self.files.push(ef.clone());
        Ok(())
    }

    /// Applies every RELA.DYN and RELA.PLT relocation in every module.
    ///
    /// Idempotent: once the namespace has been relocated, further calls
    /// return success without touching memory.
    ///
    /// # Safety
    ///
    /// Every added image's segments must still be mapped at their
    /// `exec_addr`, writable where relocations land.
    pub unsafe fn relocate(&mut self) -> Result<(), ElfError> {
        if self.relocated {
            return Ok(());
        }

        for i in 0..self.files.len() {
            unsafe { self.relocate_module(i)? };
        }

        self.relocated = true;
        Ok(())
    }

    /// Resolves `name` across every module, returning its run-time
    /// address.
    ///
    /// # Safety
    ///
    /// Every added image's symbol and string tables must still be mapped.
    pub unsafe fn resolve_symbol(&self, name: &str) -> Result<u64, ElfError> {
        let (module, sym) = unsafe { self.lookup_global(name.as_bytes(), None)? };
        Ok(self.files[module].exec_virt.wrapping_add(sym.st_value))
    }

    unsafe fn relocate_module(&mut self, index: usize) -> Result<(), ElfError> {
        let (rela_dyn, relanum_dyn, rela_plt, relanum_plt) = {
            let ef = &self.files[index];
            (ef.rela_dyn, ef.relanum_dyn, ef.rela_plt, ef.relanum_plt)
        };

        for i in 0..relanum_dyn {
            let rela = unsafe { read_rela(rela_dyn + i * RELA_SIZE as u64) };
            unsafe { self.relocate_one(index, &rela)? };
        }

        for i in 0..relanum_plt {
            let rela = unsafe { read_rela(rela_plt + i * RELA_SIZE as u64) };
            unsafe { self.relocate_one(index, &rela)? };
        }

        Ok(())
    }

    unsafe fn relocate_one(&self, index: usize, rela: &Rela64) -> Result<(), ElfError> {
        let ef = &self.files[index];
        let target =
            ef.exec_addr.wrapping_add(rela.r_offset).wrapping_sub(ef.start_addr) as *mut u64;

        if rela.kind() == R_X86_64_RELATIVE {
            unsafe { target.write_unaligned(ef.exec_virt.wrapping_add(rela.r_addend as u64)) };
            return Ok(());
        }

        let local = unsafe { read_sym(ef.symtab + u64::from(rela.sym()) * SYM_SIZE as u64) };

        // A weak local definition never satisfies its own relocation; a
        // zero value is undefined. Both fall back to the global scan,
        // which skips this module.
        let (module, sym) = if local.bind() == STB_WEAK || local.st_value == 0 {
            let name = unsafe { cstr_at(ef.strtab + u64::from(local.st_name)) };
            unsafe { self.lookup_global(name, Some(index))? }
        } else {
            (index, local)
        };

        let mut value = self.files[module].exec_virt.wrapping_add(sym.st_value);

        match rela.kind() {
            R_X86_64_64 => value = value.wrapping_add(rela.r_addend as u64),
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {}
            _ => return Err(ElfError::UnsupportedRelocation),
        }

        unsafe { target.write_unaligned(value) };
        Ok(())
    }

    /// Scans modules in insertion order for `name`, skipping `ignore`.
    /// Strong matches end the scan; the last weak match wins otherwise.
    unsafe fn lookup_global(
        &self,
        name: &[u8],
        ignore: Option<usize>,
    ) -> Result<(usize, Sym64), ElfError> {
        let mut weak: Option<(usize, Sym64)> = None;

        for (i, ef) in self.files.iter().enumerate() {
            if Some(i) == ignore {
                continue;
            }

            let Some(sym) = (unsafe { lookup_in_module(ef, name) }) else {
                continue;
            };

            if sym.st_value == 0 {
                continue;
            }

            if sym.bind() == STB_WEAK {
                weak = Some((i, sym));
                continue;
            }

            return Ok((i, sym));
        }

        weak.ok_or(ElfError::NoSuchSymbol)
    }
}

/// Looks `name` up in one module: SysV hash chain if the image carries a
/// hash table, linear scan of the symbol table otherwise.
unsafe fn lookup_in_module(ef: &ElfFile, name: &[u8]) -> Option<Sym64> {
    if ef.symtab == 0 {
        return None;
    }

    if ef.hash != 0 && ef.nbucket != 0 {
        let h = sysv_hash(name);
        let mut i = unsafe { read_mem_u32(ef.bucket + 4 * (h % ef.nbucket) as u64) };

        while i > STN_UNDEF && i < ef.nchain {
            let sym = unsafe { read_sym(ef.symtab + u64::from(i) * SYM_SIZE as u64) };
            let str_bytes = unsafe { cstr_at(ef.strtab + u64::from(sym.st_name)) };
            if str_bytes == name {
                return Some(sym);
            }
            i = unsafe { read_mem_u32(ef.chain + 4 * u64::from(i)) };
        }

        return None;
    }

    for i in 0..ef.symnum {
        let sym = unsafe { read_sym(ef.symtab + i * SYM_SIZE as u64) };
        let str_bytes = unsafe { cstr_at(ef.strtab + u64::from(sym.st_name)) };
        if str_bytes == name {
            return Some(sym);
        }
    }

    None
}

/// The SysV ELF hash, 32-bit variant.
pub(crate) fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in name {
        h = (h << 4).wrapping_add(u32::from(c));
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= 0x0FFF_FFFF;
    }
    h
}

#[inline]
unsafe fn read_mem_u32(addr: u64) -> u32 {
    unsafe { (addr as *const u32).read_unaligned() }
}

unsafe fn read_sym(addr: u64) -> Sym64 {
    let p = addr as *const u8;
    unsafe {
        Sym64 {
            st_name: (p as *const u32).read_unaligned(),
            st_info: p.add(4).read(),
            st_value: (p.add(8) as *const u64).read_unaligned(),
        }
    }
}

unsafe fn read_rela(addr: u64) -> Rela64 {
    let p = addr as *const u64;
    unsafe {
        Rela64 {
            r_offset: p.read_unaligned(),
            r_info: p.add(1).read_unaligned(),
            r_addend: (p.add(2) as *const i64).read_unaligned(),
        }
    }
}

/// Reads a NUL-terminated string from loaded memory.
pub(crate) unsafe fn cstr_at(addr: u64) -> &'static [u8] {
    let base = addr as *const u8;
    let mut len = 0usize;
    unsafe {
        while base.add(len).read() != 0 {
            len += 1;
        }
        core::slice::from_raw_parts(base, len)
    }
}

//! Parsed ELF64 image descriptor
//!
//! [`ElfFile::parse`] validates an in-memory ELF image and extracts
//! everything the rest of the system needs as plain data: the load plan,
//! the dynamic-table virtual addresses, the C-runtime section view, and
//! the DT_NEEDED list. The file bytes themselves are only needed again
//! when the consumer copies segments into place, so the descriptor holds
//! no borrow and can sit in a fixed-capacity loader table by value.
//!
//! Until [`crate::ElfLoader::add`] rebases it, every table address in the
//! descriptor is an image-relative virtual address taken straight from
//! the dynamic section.

use bitflags::bitflags;
use heapless::Vec;

use crate::types::*;
use crate::{ElfError, MAX_NEEDED, MAX_SEGMENTS};

bitflags! {
    /// Segment permissions, matching ELF `p_flags` bit assignments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentPerm: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl Default for SegmentPerm {
    fn default() -> Self {
        Self::empty()
    }
}

/// One segment-placement instruction derived from a PT_LOAD entry.
///
/// The consumer copies `filesz` bytes from `file_offset` in the image to
/// `mem_offset` in the destination region, zero-fills the remaining
/// `memsz - filesz` bytes (BSS), and maps the result with `perm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadInstr {
    pub perm: SegmentPerm,
    pub mem_offset: u64,
    pub file_offset: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub virt_addr: u64,
}

/// C-runtime bootstrap view of a loaded image, rebased to run-time
/// virtual addresses. Pairs are `(address, size)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionInfo {
    pub init: Option<u64>,
    pub fini: Option<u64>,
    pub init_array: Option<(u64, u64)>,
    pub fini_array: Option<(u64, u64)>,
    pub eh_frame: Option<(u64, u64)>,
}

/// A parsed ELF64 image.
///
/// Created by [`ElfFile::parse`]; rebased in place by
/// [`crate::ElfLoader::add`] once the image's segments have been copied
/// to their destination region.
#[derive(Debug, Clone, Default)]
pub struct ElfFile {
    pub(crate) filesz: u64,

    /// Host-virtual base the image was loaded at; zero until added.
    pub(crate) exec_addr: u64,
    /// Run-time virtual base; stays zero for fixed-address images.
    pub(crate) exec_virt: u64,

    pub(crate) entry: u64,

    pub(crate) load_instrs: Vec<LoadInstr, MAX_SEGMENTS>,

    pub(crate) start_addr: u64,
    pub(crate) total_memsz: u64,
    pub(crate) max_align: u64,

    /// String-table offsets of the DT_NEEDED entries.
    pub(crate) needed: Vec<u64, MAX_NEEDED>,

    /// Dynamic-table addresses. Image-relative until added, host
    /// addresses afterwards.
    pub(crate) hash: u64,
    pub(crate) strtab: u64,
    pub(crate) symtab: u64,
    pub(crate) rela_dyn: u64,
    pub(crate) rela_plt: u64,
    pub(crate) relanum_dyn: u64,
    pub(crate) relanum_plt: u64,

    /// SysV hash header, derived during add.
    pub(crate) nbucket: u32,
    pub(crate) nchain: u32,
    pub(crate) bucket: u64,
    pub(crate) chain: u64,
    pub(crate) symnum: u64,

    pub(crate) init: u64,
    pub(crate) fini: u64,
    pub(crate) init_array: u64,
    pub(crate) init_arraysz: u64,
    pub(crate) fini_array: u64,
    pub(crate) fini_arraysz: u64,
    pub(crate) eh_frame: u64,
    pub(crate) eh_framesz: u64,

    pub(crate) flags_1: u64,
    pub(crate) stack_flags: u64,

    pub(crate) relro_vaddr: u64,
    pub(crate) relro_memsz: u64,

    pub(crate) added: bool,
}

impl ElfFile {
    /// Parses and validates an ELF64 image.
    ///
    /// Validation failures name their cause: a bad magic is
    /// [`ElfError::InvalidSignature`], an unsupported class, endianness,
    /// OS-ABI, type, machine, version, or flags word is
    /// [`ElfError::UnsupportedFile`], a buffer smaller than the header is
    /// [`ElfError::InvalidArgument`], and structural damage past the
    /// header is [`ElfError::InvalidFile`]. On any error no descriptor
    /// is produced.
    pub fn parse(file: &[u8]) -> Result<Self, ElfError> {
        if file.len() < EHDR_SIZE {
            return Err(ElfError::InvalidArgument);
        }

        let ehdr = Ehdr64::parse(file)?;

        Self::check_signature(&ehdr)?;
        Self::check_support(&ehdr)?;

        let mut ef = ElfFile { filesz: file.len() as u64, ..Default::default() };

        let (dynoff, dynnum) = ef.process_segments(file, &ehdr)?;
        ef.process_dynamic_section(file, dynoff, dynnum)?;

        ef.entry = ehdr.e_entry;
        ef.sweep_sections(file, &ehdr)?;

        Ok(ef)
    }

    fn check_signature(ehdr: &Ehdr64) -> Result<(), ElfError> {
        if ehdr.e_ident[EI_MAG0..EI_MAG0 + 4] != ELFMAG {
            return Err(ElfError::InvalidSignature);
        }
        Ok(())
    }

    fn check_support(ehdr: &Ehdr64) -> Result<(), ElfError> {
        if ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_ident[EI_VERSION] != EV_CURRENT {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_ident[EI_OSABI] != ELFOSABI_SYSV {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_ident[EI_ABIVERSION] != 0 {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_type != ET_DYN && ehdr.e_type != ET_EXEC {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_machine != EM_X86_64 {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_version != u32::from(EV_CURRENT) {
            return Err(ElfError::UnsupportedFile);
        }
        if ehdr.e_flags != 0 {
            return Err(ElfError::UnsupportedFile);
        }
        Ok(())
    }

    /// Walks the program headers, retaining at most [`MAX_SEGMENTS`]
    /// PT_LOAD entries (extras are ignored) and noting PT_DYNAMIC,
    /// PT_GNU_STACK, and PT_GNU_RELRO. Returns the dynamic section's
    /// file offset and entry count.
    fn process_segments(&mut self, file: &[u8], ehdr: &Ehdr64) -> Result<(u64, u64), ElfError> {
        let mut dynoff = 0u64;
        let mut dynnum = 0u64;
        let mut kept: Vec<Phdr64, MAX_SEGMENTS> = Vec::new();

        for i in 0..usize::from(ehdr.e_phnum) {
            let off = ehdr
                .e_phoff
                .checked_add((i * PHDR_SIZE) as u64)
                .ok_or(ElfError::InvalidFile)? as usize;
            let phdr = Phdr64::parse(file, off)?;

            match phdr.p_type {
                PT_LOAD => {
                    if kept.push(phdr).is_ok() {
                        self.total_memsz = phdr.p_vaddr.wrapping_add(phdr.p_memsz);
                        self.max_align = self.max_align.max(phdr.p_align);
                    }
                }
                PT_DYNAMIC => {
                    dynoff = phdr.p_offset;
                    dynnum = phdr.p_filesz / DYN_SIZE as u64;
                }
                PT_GNU_STACK => {
                    self.stack_flags = u64::from(phdr.p_flags);
                }
                PT_GNU_RELRO => {
                    self.relro_vaddr = phdr.p_vaddr;
                    self.relro_memsz = phdr.p_memsz;
                }
                _ => {}
            }
        }

        if let Some(first) = kept.first() {
            self.start_addr = first.p_vaddr;
            self.total_memsz = self.total_memsz.wrapping_sub(self.start_addr);
        }

        for phdr in &kept {
            let instr = LoadInstr {
                perm: SegmentPerm::from_bits_truncate(phdr.p_flags),
                mem_offset: phdr.p_vaddr.wrapping_sub(self.start_addr),
                file_offset: phdr.p_offset,
                memsz: phdr.p_memsz,
                filesz: phdr.p_filesz,
                virt_addr: phdr.p_vaddr,
            };
            // Capacity matches `kept`.
            let _ = self.load_instrs.push(instr);
        }

        Ok((dynoff, dynnum))
    }

    /// Walks the dynamic section, recording the tags the linker consumes.
    /// Table addresses stay image-relative until the image is added.
    fn process_dynamic_section(
        &mut self,
        file: &[u8],
        dynoff: u64,
        dynnum: u64,
    ) -> Result<(), ElfError> {
        if dynnum == 0 || dynoff == 0 {
            return Ok(());
        }

        for i in 0..dynnum {
            let off = dynoff
                .checked_add(i * DYN_SIZE as u64)
                .ok_or(ElfError::InvalidFile)? as usize;
            let dyn_entry = Dyn64::parse(file, off)?;

            match dyn_entry.d_tag {
                DT_NULL => return Ok(()),
                DT_NEEDED => {
                    // Bounded; extras are dropped like extra segments.
                    let _ = self.needed.push(dyn_entry.d_val);
                }
                DT_PLTRELSZ => self.relanum_plt = dyn_entry.d_val / RELA_SIZE as u64,
                DT_HASH => self.hash = dyn_entry.d_val,
                DT_STRTAB => self.strtab = dyn_entry.d_val,
                DT_SYMTAB => self.symtab = dyn_entry.d_val,
                DT_RELA => self.rela_dyn = dyn_entry.d_val,
                DT_RELASZ => self.relanum_dyn = dyn_entry.d_val / RELA_SIZE as u64,
                DT_INIT => self.init = dyn_entry.d_val,
                DT_FINI => self.fini = dyn_entry.d_val,
                DT_JMPREL => self.rela_plt = dyn_entry.d_val,
                DT_INIT_ARRAY => self.init_array = dyn_entry.d_val,
                DT_FINI_ARRAY => self.fini_array = dyn_entry.d_val,
                DT_INIT_ARRAYSZ => self.init_arraysz = dyn_entry.d_val,
                DT_FINI_ARRAYSZ => self.fini_arraysz = dyn_entry.d_val,
                DT_FLAGS_1 => self.flags_1 = dyn_entry.d_val,
                _ => {}
            }
        }

        Ok(())
    }

    /// Locates `.eh_frame`, `.ctors`, and `.dtors` by section name.
    ///
    /// Linkers disagree on whether these appear in the dynamic section:
    /// binutils ld emits init_array/fini_array and tags .eh_frame as
    /// SHT_X86_64_UNWIND, while gold and lld keep .ctors/.dtors out of
    /// .dynamic entirely. The file bytes are gone after parse, so the
    /// sweep happens here. A present .ctors/.dtors pair is treated as
    /// init_array/fini_array.
    fn sweep_sections(&mut self, file: &[u8], ehdr: &Ehdr64) -> Result<(), ElfError> {
        if ehdr.e_shnum == 0 {
            return Ok(());
        }

        let shstr = Shdr64::parse(
            file,
            ehdr.e_shoff
                .checked_add((usize::from(ehdr.e_shstrndx) * SHDR_SIZE) as u64)
                .ok_or(ElfError::InvalidFile)? as usize,
        )?;

        for i in 0..usize::from(ehdr.e_shnum) {
            let off = ehdr
                .e_shoff
                .checked_add((i * SHDR_SIZE) as u64)
                .ok_or(ElfError::InvalidFile)? as usize;
            let shdr = Shdr64::parse(file, off)?;

            let name_off = shstr
                .sh_offset
                .checked_add(u64::from(shdr.sh_name))
                .ok_or(ElfError::InvalidFile)? as usize;
            let name = read_cstr(file, name_off)?;

            match name {
                b".eh_frame" => {
                    self.eh_frame = shdr.sh_addr;
                    self.eh_framesz = shdr.sh_size;
                }
                b".ctors" => {
                    self.init_array = shdr.sh_addr;
                    self.init_arraysz = shdr.sh_size;
                }
                b".dtors" => {
                    self.fini_array = shdr.sh_addr;
                    self.fini_arraysz = shdr.sh_size;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Number of load instructions derived from the image.
    pub fn num_load_instrs(&self) -> usize {
        self.load_instrs.len()
    }

    /// Returns the load instruction at `index`.
    pub fn load_instr(&self, index: usize) -> Result<&LoadInstr, ElfError> {
        self.load_instrs.get(index).ok_or(ElfError::InvalidIndex)
    }

    /// Total bytes of memory the loaded image occupies.
    pub fn total_memsz(&self) -> u64 {
        self.total_memsz
    }

    /// True if the image is position independent (no fixed base).
    pub fn is_pic(&self) -> bool {
        self.start_addr == 0
    }

    /// First PT_LOAD virtual address; zero for PIC images.
    pub fn start_addr(&self) -> u64 {
        self.start_addr
    }

    /// Largest alignment any retained PT_LOAD segment requires.
    pub fn max_align(&self) -> u64 {
        self.max_align
    }

    /// Size of the file the descriptor was parsed from.
    pub fn file_size(&self) -> u64 {
        self.filesz
    }

    /// Raw DT_FLAGS_1 word (DF_1_PIE and friends).
    pub fn dt_flags_1(&self) -> u64 {
        self.flags_1
    }

    /// Run-time address of the entry point.
    pub fn entry(&self) -> u64 {
        self.entry.wrapping_add(self.exec_virt)
    }

    /// Stack permissions from PT_GNU_STACK.
    pub fn stack_perm(&self) -> SegmentPerm {
        SegmentPerm::from_bits_truncate(self.stack_flags as u32)
    }

    /// RELRO region as `(run-time address, size)`.
    pub fn relro(&self) -> (u64, u64) {
        (self.relro_vaddr.wrapping_add(self.exec_virt), self.relro_memsz)
    }

    /// C-runtime section view, rebased to run-time addresses.
    pub fn section_info(&self) -> SectionInfo {
        let rebase = |addr: u64| addr.wrapping_add(self.exec_virt);
        SectionInfo {
            init: (self.init != 0).then(|| rebase(self.init)),
            fini: (self.fini != 0).then(|| rebase(self.fini)),
            init_array: (self.init_array != 0)
                .then(|| (rebase(self.init_array), self.init_arraysz)),
            fini_array: (self.fini_array != 0)
                .then(|| (rebase(self.fini_array), self.fini_arraysz)),
            eh_frame: (self.eh_frame != 0).then(|| (rebase(self.eh_frame), self.eh_framesz)),
        }
    }

    /// Number of DT_NEEDED entries.
    pub fn needed_count(&self) -> usize {
        self.needed.len()
    }

    /// Name of the `index`th needed library, read from the loaded
    /// string table.
    ///
    /// # Safety
    ///
    /// The image must have been added to a loader after its segments
    /// were copied to `exec_addr`, and that memory must still be mapped.
    pub unsafe fn needed_name(&self, index: usize) -> Result<&str, ElfError> {
        if !self.added {
            return Err(ElfError::InvalidArgument);
        }
        let off = *self.needed.get(index).ok_or(ElfError::InvalidIndex)?;
        let bytes = unsafe { crate::loader::cstr_at(self.strtab.wrapping_add(off)) };
        core::str::from_utf8(bytes).map_err(|_| ElfError::InvalidFile)
    }
}

/// Reads a NUL-terminated byte string out of the file image.
fn read_cstr(file: &[u8], off: usize) -> Result<&[u8], ElfError> {
    let tail = file.get(off..).ok_or(ElfError::InvalidFile)?;
    let len = tail.iter().position(|&b| b == 0).ok_or(ElfError::InvalidFile)?;
    Ok(&tail[..len])
}

//! Raw ELF64 on-disk structures and constants
//!
//! Field names follow the System V ABI so they can be cross-checked
//! against the psABI documents directly. All readers are
//! bounds-checked and little-endian; nothing here touches loaded
//! memory.

use crate::ElfError;

/// e_ident byte indices.
pub const EI_MAG0: usize = 0;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;
pub const EI_ABIVERSION: usize = 8;
pub const EI_NIDENT: usize = 16;

pub const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const ELFOSABI_SYSV: u8 = 0;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

/// Program header types.
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_GNU_STACK: u32 = 0x6474_E551;
pub const PT_GNU_RELRO: u32 = 0x6474_E552;

/// Dynamic table tags.
pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_INIT: i64 = 12;
pub const DT_FINI: i64 = 13;
pub const DT_JMPREL: i64 = 23;
pub const DT_INIT_ARRAY: i64 = 25;
pub const DT_FINI_ARRAY: i64 = 26;
pub const DT_INIT_ARRAYSZ: i64 = 27;
pub const DT_FINI_ARRAYSZ: i64 = 28;
pub const DT_FLAGS_1: i64 = 0x6FFF_FFFB;

/// Symbol bindings.
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

/// Undefined symbol index.
pub const STN_UNDEF: u32 = 0;

/// Supported x86-64 relocation types.
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const SHDR_SIZE: usize = 64;
pub const DYN_SIZE: usize = 16;
pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;

#[inline]
fn read_bytes<const N: usize>(file: &[u8], off: usize) -> Result<[u8; N], ElfError> {
    file.get(off..off + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(ElfError::InvalidFile)
}

#[inline]
pub fn read_u16(file: &[u8], off: usize) -> Result<u16, ElfError> {
    Ok(u16::from_le_bytes(read_bytes(file, off)?))
}

#[inline]
pub fn read_u32(file: &[u8], off: usize) -> Result<u32, ElfError> {
    Ok(u32::from_le_bytes(read_bytes(file, off)?))
}

#[inline]
pub fn read_u64(file: &[u8], off: usize) -> Result<u64, ElfError> {
    Ok(u64::from_le_bytes(read_bytes(file, off)?))
}

#[inline]
pub fn read_i64(file: &[u8], off: usize) -> Result<i64, ElfError> {
    Ok(i64::from_le_bytes(read_bytes(file, off)?))
}

/// ELF file header.
#[derive(Debug, Clone, Copy)]
pub struct Ehdr64 {
    pub e_ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Ehdr64 {
    pub fn parse(file: &[u8]) -> Result<Self, ElfError> {
        let e_ident = read_bytes::<EI_NIDENT>(file, 0)?;
        Ok(Self {
            e_ident,
            e_type: read_u16(file, 16)?,
            e_machine: read_u16(file, 18)?,
            e_version: read_u32(file, 20)?,
            e_entry: read_u64(file, 24)?,
            e_phoff: read_u64(file, 32)?,
            e_shoff: read_u64(file, 40)?,
            e_flags: read_u32(file, 48)?,
            e_phnum: read_u16(file, 56)?,
            e_shnum: read_u16(file, 60)?,
            e_shstrndx: read_u16(file, 62)?,
        })
    }
}

/// Program header entry.
#[derive(Debug, Clone, Copy)]
pub struct Phdr64 {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr64 {
    pub fn parse(file: &[u8], off: usize) -> Result<Self, ElfError> {
        Ok(Self {
            p_type: read_u32(file, off)?,
            p_flags: read_u32(file, off + 4)?,
            p_offset: read_u64(file, off + 8)?,
            p_vaddr: read_u64(file, off + 16)?,
            p_filesz: read_u64(file, off + 32)?,
            p_memsz: read_u64(file, off + 40)?,
            p_align: read_u64(file, off + 48)?,
        })
    }
}

/// Section header entry. Only the fields the section-name sweep uses.
#[derive(Debug, Clone, Copy)]
pub struct Shdr64 {
    pub sh_name: u32,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
}

impl Shdr64 {
    pub fn parse(file: &[u8], off: usize) -> Result<Self, ElfError> {
        Ok(Self {
            sh_name: read_u32(file, off)?,
            sh_addr: read_u64(file, off + 16)?,
            sh_offset: read_u64(file, off + 24)?,
            sh_size: read_u64(file, off + 32)?,
        })
    }
}

/// Dynamic table entry.
#[derive(Debug, Clone, Copy)]
pub struct Dyn64 {
    pub d_tag: i64,
    pub d_val: u64,
}

impl Dyn64 {
    pub fn parse(file: &[u8], off: usize) -> Result<Self, ElfError> {
        Ok(Self { d_tag: read_i64(file, off)?, d_val: read_u64(file, off + 8)? })
    }
}

/// Symbol table entry, as read from loaded memory during linking.
#[derive(Debug, Clone, Copy)]
pub struct Sym64 {
    pub st_name: u32,
    pub st_info: u8,
    pub st_value: u64,
}

impl Sym64 {
    #[inline]
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }
}

/// Relocation-with-addend entry, as read from loaded memory.
#[derive(Debug, Clone, Copy)]
pub struct Rela64 {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl Rela64 {
    #[inline]
    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        self.r_info as u32
    }
}

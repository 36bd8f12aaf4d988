#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! ELF64 loader and runtime linker
//!
//! This crate parses, validates, and links the ELF64 images that make up a
//! running hypervisor: the microkernel itself plus any number of extension
//! images. A parsed [`ElfFile`] yields the load instructions a consumer
//! needs to place each PT_LOAD segment in memory; an [`ElfLoader`] groups
//! loaded images into one symbol namespace, applies x86-64 relocations,
//! and resolves symbols across images.
//!
//! Only the subset of the System V AMD64 psABI that a freestanding kernel
//! and its extensions produce is accepted: 64-bit, little-endian, SysV
//! OS-ABI, `EM_X86_64`, executable or shared object, zero flags.

pub mod file;
pub mod loader;
pub mod types;

pub use file::{ElfFile, LoadInstr, SectionInfo, SegmentPerm};
pub use loader::ElfLoader;

/// Maximum number of PT_LOAD segments retained per image.
///
/// Kernel and extension images are linked into at most four segments
/// (RE text, RO rodata, RW data, BSS). Additional PT_LOAD entries are
/// ignored, not rejected, so images linked for this ABI keep loading.
pub const MAX_SEGMENTS: usize = 4;

/// Maximum number of DT_NEEDED entries retained per image.
pub const MAX_NEEDED: usize = 25;

/// Maximum number of images a single [`ElfLoader`] accepts.
pub const MAX_NUM_MODULES: usize = 75;

/// Errors produced by the ELF loader and linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// A caller-supplied value is outside the API contract.
    InvalidArgument,
    /// The file is structurally malformed in a way that is not a
    /// signature or support problem (truncated tables, bad offsets).
    InvalidFile,
    /// An index is out of bounds.
    InvalidIndex,
    /// The magic bytes are not `\x7fELF`.
    InvalidSignature,
    /// The file is well-formed but not a file this loader supports
    /// (wrong class, endianness, OS-ABI, machine, version, or flags).
    UnsupportedFile,
    /// The loader already holds [`MAX_NUM_MODULES`] images.
    LoaderFull,
    /// Symbol resolution failed in every module.
    NoSuchSymbol,
    /// A relocation type outside the supported set was encountered.
    UnsupportedRelocation,
}

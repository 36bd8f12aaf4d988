//! Architecture-specific definitions.
//!
//! The control-block layouts are plain data and compile everywhere; the
//! instruction wrappers inside are gated on the target architecture.

pub mod x86_64;

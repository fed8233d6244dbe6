//! AArch64-specific code: virtual-memory bring-up, exception vectors, and
//! the cache/TLB/CPU primitives both depend on.

pub mod cache;
pub mod cpu;
pub mod exceptions;
pub mod mmu;

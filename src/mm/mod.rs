//! Memory management.
//!
//! During bring-up this is just physical frame provisioning for the
//! translation tables; everything virtual lives under `arch::aarch64::mmu`.

pub mod frames;

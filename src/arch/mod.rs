//! Architecture-specific code.
//!
//! The `aarch64` module is compiled unconditionally: its privileged
//! operations are stubbed out off-target so the translation-table logic
//! stays exercisable under plain `cargo test`.

pub mod aarch64;

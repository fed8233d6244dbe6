//! Device drivers.
//!
//! Bring-up needs exactly one device: the PL011 serial console.

pub mod uart;

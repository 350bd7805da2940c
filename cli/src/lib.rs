//! Sealreg CLI library.
//!
//! Command definitions live here so the binary stays a thin shell and the
//! argument handling can be tested.

pub mod commands;

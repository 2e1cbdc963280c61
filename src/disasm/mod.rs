//! Disassembly module - single-instruction decoding for the provider
//!
//! Uses iced-x86 for x86/x64 decoding and formatting.

pub mod engine;

pub use engine::{DisassemblyEngine, UNSUPPORTED_PLACEHOLDER};

//! Record codec - byte-exact wire representation of the protocol records
//!
//! Layout rules:
//! - little-endian integers, no padding
//! - handles are 8 bytes regardless of target width
//! - enumerations are `u32` and are validated on decode
//! - strings are fixed arrays of UTF-16 code units, null-padded

pub mod records;
pub mod types;
pub mod wire;

pub use records::{
    InstructionRecord, ModuleEntry, ProcessEntry, Record, SectionEntry, ThreadEntry,
    MAX_INSTRUCTION_LENGTH,
};
pub use types::{
    Architecture, BreakpointRegister, BreakpointSize, BreakpointTrigger, ContinueStatus,
    ControlAction, DebugEventKind, Handle, ProcessAccess, SectionCategory, SectionProtection,
    SectionType,
};
pub use wire::{FixedString, MnemonicString, PathString, SectionName, WireReader, WireWriter};

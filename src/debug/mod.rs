//! Debug module - debug events, hardware breakpoints and the debug loop.
//!
//! Provides:
//! - Tagged-union debug events with per-session register layout
//! - Per-thread debug register allocation
//! - The pull/continue state machine

pub mod breakpoint;
pub mod event;
pub mod session;

pub use breakpoint::{BreakpointTable, HardwareBreakpoint};
pub use event::{
    DebugEvent, DebugEventInfo, ExceptionInfo, RegisterSnapshot, Registers32, Registers64,
};
pub use session::{DebugLoop, DebugState};

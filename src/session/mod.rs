//! Session layer - framed request/response traffic over a duplex stream
//!
//! One session is one connection. The controller sends one request at a
//! time; the provider answers with a single response frame, or, for the
//! enumerations, a run of `Record` frames closed by `EndOfStream`.

pub mod client;
pub mod frame;
pub mod message;
pub mod server;
pub mod transport;

use std::time::Duration;

pub use client::{RecordStream, Session, SessionCloser};
pub use frame::{Frame, FrameHeader, FRAME_MAGIC, HEADER_SIZE};
pub use server::Server;
pub use transport::Duplex;

/// Protocol revision exchanged in `Hello`
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame operation tags
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Hello = 0x01,
    EnumerateProcesses = 0x02,
    OpenProcess = 0x03,
    CloseProcess = 0x04,
    IsProcessValid = 0x05,
    EnumerateSections = 0x06,
    EnumerateModules = 0x07,
    EnumerateThreads = 0x08,
    ReadMemory = 0x09,
    WriteMemory = 0x0a,
    DecodeInstruction = 0x0b,
    ControlProcess = 0x0c,
    SetBreakpoint = 0x0d,
    ClearBreakpoint = 0x0e,
    AttachDebugger = 0x0f,
    DetachDebugger = 0x10,
    PullDebugEvent = 0x11,
    ContinueDebugEvent = 0x12,

    /// One element of a streamed enumeration
    Record = 0x80,
    /// End of a streamed enumeration; a non-zero status reports why it stopped
    EndOfStream = 0x81,
    /// Controller asks to stop the current enumeration
    Cancel = 0x82,
    /// Controller is done with the session
    Close = 0x83,
}

impl Opcode {
    pub const ALL: [Opcode; 22] = [
        Opcode::Hello,
        Opcode::EnumerateProcesses,
        Opcode::OpenProcess,
        Opcode::CloseProcess,
        Opcode::IsProcessValid,
        Opcode::EnumerateSections,
        Opcode::EnumerateModules,
        Opcode::EnumerateThreads,
        Opcode::ReadMemory,
        Opcode::WriteMemory,
        Opcode::DecodeInstruction,
        Opcode::ControlProcess,
        Opcode::SetBreakpoint,
        Opcode::ClearBreakpoint,
        Opcode::AttachDebugger,
        Opcode::DetachDebugger,
        Opcode::PullDebugEvent,
        Opcode::ContinueDebugEvent,
        Opcode::Record,
        Opcode::EndOfStream,
        Opcode::Cancel,
        Opcode::Close,
    ];

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u16 == code)
    }

    /// Requests answered with a record stream
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Opcode::EnumerateProcesses
                | Opcode::EnumerateSections
                | Opcode::EnumerateModules
                | Opcode::EnumerateThreads
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Tunables shared by both ends of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest frame payload accepted or produced
    pub max_payload: usize,

    /// How often a blocked pull re-checks for cancellation
    pub poll_interval: Duration,

    /// Upper bound on a single pull; `None` waits for as long as it takes
    pub event_wait: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload: 1 << 20,
            poll_interval: Duration::from_millis(50),
            event_wait: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_codes() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_code(op as u16), Some(op));
        }
        assert_eq!(Opcode::from_code(0), None);
        assert_eq!(Opcode::from_code(0x7f), None);
        assert!(Opcode::EnumerateModules.is_streaming());
        assert!(!Opcode::PullDebugEvent.is_streaming());
    }
}

//! Debug event model.
//!
//! A [`DebugEvent`] carries exactly one payload shape, selected by its kind.
//! The register snapshot inside an exception payload is shaped by the
//! session's target architecture; encoding or decoding a snapshot of the
//! other width is an `ArchitectureMismatch`.

use crate::error::{ProtocolError, Result};
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, DebugEventKind, Handle, WireReader,
    WireWriter,
};

/// General purpose registers of a 32-bit target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers32 {
    pub eax: u64,
    pub ebx: u64,
    pub ecx: u64,
    pub edx: u64,
    pub edi: u64,
    pub esi: u64,
    pub esp: u64,
    pub ebp: u64,
    pub eip: u64,
}

/// General purpose registers of a 64-bit target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rip: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Register state captured with an exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSnapshot {
    X86(Registers32),
    X64(Registers64),
}

impl RegisterSnapshot {
    /// Number of slots on the wire (general purpose registers + IP)
    pub fn slot_count(arch: Architecture) -> usize {
        match arch {
            Architecture::X86 => 9,
            Architecture::X64 => 17,
        }
    }

    /// An all-zero snapshot of the given shape
    pub fn zeroed(arch: Architecture) -> Self {
        match arch {
            Architecture::X86 => RegisterSnapshot::X86(Registers32::default()),
            Architecture::X64 => RegisterSnapshot::X64(Registers64::default()),
        }
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            RegisterSnapshot::X86(_) => Architecture::X86,
            RegisterSnapshot::X64(_) => Architecture::X64,
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        match self {
            RegisterSnapshot::X86(r) => r.eip,
            RegisterSnapshot::X64(r) => r.rip,
        }
    }

    /// Named registers in wire order
    pub fn named(&self) -> Vec<(&'static str, u64)> {
        match self {
            RegisterSnapshot::X86(r) => vec![
                ("eax", r.eax),
                ("ebx", r.ebx),
                ("ecx", r.ecx),
                ("edx", r.edx),
                ("edi", r.edi),
                ("esi", r.esi),
                ("esp", r.esp),
                ("ebp", r.ebp),
                ("eip", r.eip),
            ],
            RegisterSnapshot::X64(r) => vec![
                ("rax", r.rax),
                ("rbx", r.rbx),
                ("rcx", r.rcx),
                ("rdx", r.rdx),
                ("rdi", r.rdi),
                ("rsi", r.rsi),
                ("rsp", r.rsp),
                ("rbp", r.rbp),
                ("rip", r.rip),
                ("r8", r.r8),
                ("r9", r.r9),
                ("r10", r.r10),
                ("r11", r.r11),
                ("r12", r.r12),
                ("r13", r.r13),
                ("r14", r.r14),
                ("r15", r.r15),
            ],
        }
    }

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_u8(self.architecture() as u8);
        for (_, value) in self.named() {
            w.put_u64(value);
        }
    }

    fn decode_from(r: &mut WireReader<'_>, session: Architecture) -> Result<Self> {
        let found = Architecture::from_wire(r.u8()?)?;
        if found != session {
            return Err(ProtocolError::ArchitectureMismatch {
                expected: session,
                found,
            });
        }
        Ok(match found {
            Architecture::X86 => RegisterSnapshot::X86(Registers32 {
                eax: r.u64()?,
                ebx: r.u64()?,
                ecx: r.u64()?,
                edx: r.u64()?,
                edi: r.u64()?,
                esi: r.u64()?,
                esp: r.u64()?,
                ebp: r.u64()?,
                eip: r.u64()?,
            }),
            Architecture::X64 => RegisterSnapshot::X64(Registers64 {
                rax: r.u64()?,
                rbx: r.u64()?,
                rcx: r.u64()?,
                rdx: r.u64()?,
                rdi: r.u64()?,
                rsi: r.u64()?,
                rsp: r.u64()?,
                rbp: r.u64()?,
                rip: r.u64()?,
                r8: r.u64()?,
                r9: r.u64()?,
                r10: r.u64()?,
                r11: r.u64()?,
                r12: r.u64()?,
                r13: r.u64()?,
                r14: r.u64()?,
                r15: r.u64()?,
            }),
        })
    }
}

/// Exception details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub exception_code: u64,
    pub exception_flags: u64,
    pub exception_address: Handle,
    /// Debug register that raised the exception, if any
    pub caused_by: Option<BreakpointRegister>,
    pub is_first_chance: bool,
    pub registers: RegisterSnapshot,
}

/// Per-kind payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEventInfo {
    CreateProcess {
        file_handle: Handle,
        process_handle: Handle,
    },
    ExitProcess {
        exit_code: u64,
    },
    CreateThread {
        thread_handle: Handle,
    },
    ExitThread {
        exit_code: u64,
    },
    LoadDll {
        file_handle: Handle,
        base_of_dll: Handle,
    },
    UnloadDll {
        base_of_dll: Handle,
    },
    Exception(ExceptionInfo),
}

impl DebugEventInfo {
    pub fn kind(&self) -> DebugEventKind {
        match self {
            DebugEventInfo::CreateProcess { .. } => DebugEventKind::CreateProcess,
            DebugEventInfo::ExitProcess { .. } => DebugEventKind::ExitProcess,
            DebugEventInfo::CreateThread { .. } => DebugEventKind::CreateThread,
            DebugEventInfo::ExitThread { .. } => DebugEventKind::ExitThread,
            DebugEventInfo::LoadDll { .. } => DebugEventKind::LoadDll,
            DebugEventInfo::UnloadDll { .. } => DebugEventKind::UnloadDll,
            DebugEventInfo::Exception(_) => DebugEventKind::Exception,
        }
    }

    /// Encoded payload size for a kind under a session architecture
    pub fn wire_size(kind: DebugEventKind, arch: Architecture) -> usize {
        match kind {
            DebugEventKind::CreateProcess | DebugEventKind::LoadDll => 16,
            DebugEventKind::ExitProcess
            | DebugEventKind::CreateThread
            | DebugEventKind::ExitThread
            | DebugEventKind::UnloadDll => 8,
            DebugEventKind::Exception => 8 + 8 + 8 + 4 + 1 + 1 + 8 * RegisterSnapshot::slot_count(arch),
        }
    }

    pub fn encode_into(&self, w: &mut WireWriter, arch: Architecture) -> Result<()> {
        match self {
            DebugEventInfo::CreateProcess {
                file_handle,
                process_handle,
            } => {
                w.put_handle(*file_handle);
                w.put_handle(*process_handle);
            }
            DebugEventInfo::ExitProcess { exit_code } | DebugEventInfo::ExitThread { exit_code } => {
                w.put_u64(*exit_code);
            }
            DebugEventInfo::CreateThread { thread_handle } => w.put_handle(*thread_handle),
            DebugEventInfo::LoadDll {
                file_handle,
                base_of_dll,
            } => {
                w.put_handle(*file_handle);
                w.put_handle(*base_of_dll);
            }
            DebugEventInfo::UnloadDll { base_of_dll } => w.put_handle(*base_of_dll),
            DebugEventInfo::Exception(info) => {
                let found = info.registers.architecture();
                if found != arch {
                    return Err(ProtocolError::ArchitectureMismatch {
                        expected: arch,
                        found,
                    });
                }
                w.put_u64(info.exception_code);
                w.put_u64(info.exception_flags);
                w.put_handle(info.exception_address);
                w.put_u32(BreakpointRegister::to_wire_optional(info.caused_by));
                w.put_bool(info.is_first_chance);
                info.registers.encode_into(w);
            }
        }
        Ok(())
    }

    /// Decode the payload shape selected by `kind`, and only that shape
    pub fn decode(kind: DebugEventKind, bytes: &[u8], arch: Architecture) -> Result<Self> {
        let mut r = WireReader::new("DebugEvent payload", bytes);
        Self::decode_from(kind, &mut r, arch)
    }

    fn decode_from(kind: DebugEventKind, r: &mut WireReader<'_>, arch: Architecture) -> Result<Self> {
        Ok(match kind {
            DebugEventKind::CreateProcess => DebugEventInfo::CreateProcess {
                file_handle: r.handle()?,
                process_handle: r.handle()?,
            },
            DebugEventKind::ExitProcess => DebugEventInfo::ExitProcess { exit_code: r.u64()? },
            DebugEventKind::CreateThread => DebugEventInfo::CreateThread {
                thread_handle: r.handle()?,
            },
            DebugEventKind::ExitThread => DebugEventInfo::ExitThread { exit_code: r.u64()? },
            DebugEventKind::LoadDll => DebugEventInfo::LoadDll {
                file_handle: r.handle()?,
                base_of_dll: r.handle()?,
            },
            DebugEventKind::UnloadDll => DebugEventInfo::UnloadDll {
                base_of_dll: r.handle()?,
            },
            DebugEventKind::Exception => DebugEventInfo::Exception(ExceptionInfo {
                exception_code: r.u64()?,
                exception_flags: r.u64()?,
                exception_address: r.handle()?,
                caused_by: BreakpointRegister::from_wire_optional(r.u32()?)?,
                is_first_chance: r.bool("first chance flag")?,
                registers: RegisterSnapshot::decode_from(r, arch)?,
            }),
        })
    }
}

/// A debug event raised by the target, waiting for continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent {
    pub continue_status: ContinueStatus,
    pub process_id: Handle,
    pub thread_id: Handle,
    pub info: DebugEventInfo,
}

/// status + process + thread + kind
const EVENT_HEADER_SIZE: usize = 4 + 8 + 8 + 4;

impl DebugEvent {
    pub fn new(process_id: Handle, thread_id: Handle, info: DebugEventInfo) -> Self {
        Self {
            continue_status: ContinueStatus::Handled,
            process_id,
            thread_id,
            info,
        }
    }

    pub fn kind(&self) -> DebugEventKind {
        self.info.kind()
    }

    /// Whether continuing this event ends the target's lifetime
    pub fn is_process_exit(&self) -> bool {
        matches!(self.info, DebugEventInfo::ExitProcess { .. })
    }

    pub fn encode(&self, arch: Architecture) -> Result<Vec<u8>> {
        let mut w = WireWriter::with_capacity(
            EVENT_HEADER_SIZE + DebugEventInfo::wire_size(self.kind(), arch),
        );
        w.put_u32(self.continue_status.to_wire());
        w.put_handle(self.process_id);
        w.put_handle(self.thread_id);
        w.put_u32(self.kind().to_wire());
        self.info.encode_into(&mut w, arch)?;
        Ok(w.into_bytes())
    }

    pub fn decode(bytes: &[u8], arch: Architecture) -> Result<Self> {
        let mut r = WireReader::new("DebugEvent", bytes);
        let continue_status = ContinueStatus::from_wire(r.u32()?)?;
        let process_id = r.handle()?;
        let thread_id = r.handle()?;
        let kind = DebugEventKind::from_wire(r.u32()?)?;
        let needed = DebugEventInfo::wire_size(kind, arch);
        if r.remaining() < needed {
            return Err(ProtocolError::TruncatedRecord {
                record: "DebugEvent",
                expected: EVENT_HEADER_SIZE + needed,
                actual: bytes.len(),
            });
        }
        let info = DebugEventInfo::decode_from(kind, &mut r, arch)?;
        Ok(Self {
            continue_status,
            process_id,
            thread_id,
            info,
        })
    }
}

impl std::fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pid={} tid={}", self.kind(), self.process_id, self.thread_id)?;
        match &self.info {
            DebugEventInfo::ExitProcess { exit_code } | DebugEventInfo::ExitThread { exit_code } => {
                write!(f, " exit_code={exit_code:#x}")
            }
            DebugEventInfo::LoadDll { base_of_dll, .. } | DebugEventInfo::UnloadDll { base_of_dll } => {
                write!(f, " base={base_of_dll}")
            }
            DebugEventInfo::Exception(info) => {
                write!(
                    f,
                    " code={:#x} at {}{}",
                    info.exception_code,
                    info.exception_address,
                    if info.is_first_chance { " (first chance)" } else { "" }
                )?;
                if let Some(register) = info.caused_by {
                    write!(f, " caused by {register}")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn exception(arch: Architecture) -> DebugEvent {
        let registers = match arch {
            Architecture::X86 => RegisterSnapshot::X86(Registers32 {
                eax: 1,
                eip: 0x401000,
                ..Default::default()
            }),
            Architecture::X64 => RegisterSnapshot::X64(Registers64 {
                rax: 1,
                rip: 0x10000,
                r15: 0xdead,
                ..Default::default()
            }),
        };
        DebugEvent::new(
            Handle::from_raw(4321),
            Handle::from_raw(7),
            DebugEventInfo::Exception(ExceptionInfo {
                exception_code: 0x8000_0004,
                exception_flags: 0,
                exception_address: Handle::from_raw(0x10000),
                caused_by: Some(BreakpointRegister::Dr0),
                is_first_chance: true,
                registers,
            }),
        )
    }

    fn every_kind() -> Vec<DebugEventInfo> {
        vec![
            DebugEventInfo::CreateProcess {
                file_handle: Handle::from_raw(0x40),
                process_handle: Handle::from_raw(0x44),
            },
            DebugEventInfo::ExitProcess { exit_code: 3 },
            DebugEventInfo::CreateThread {
                thread_handle: Handle::from_raw(0x48),
            },
            DebugEventInfo::ExitThread { exit_code: 0 },
            DebugEventInfo::LoadDll {
                file_handle: Handle::from_raw(0x50),
                base_of_dll: Handle::from_raw(0x7ff0_0000),
            },
            DebugEventInfo::UnloadDll {
                base_of_dll: Handle::from_raw(0x7ff0_0000),
            },
        ]
    }

    #[test]
    fn test_every_kind_round_trips() {
        for arch in [Architecture::X86, Architecture::X64] {
            let mut events: Vec<DebugEvent> = every_kind()
                .into_iter()
                .map(|info| DebugEvent::new(Handle::from_raw(1), Handle::from_raw(2), info))
                .collect();
            events.push(exception(arch));
            for event in events {
                let bytes = event.encode(arch).unwrap();
                assert_eq!(bytes.len(), EVENT_HEADER_SIZE + DebugEventInfo::wire_size(event.kind(), arch));
                assert_eq!(DebugEvent::decode(&bytes, arch).unwrap(), event);
            }
        }
    }

    #[test]
    fn test_snapshot_shapes() {
        assert_eq!(DebugEventInfo::wire_size(DebugEventKind::Exception, Architecture::X86), 102);
        assert_eq!(DebugEventInfo::wire_size(DebugEventKind::Exception, Architecture::X64), 166);
        assert_eq!(exception(Architecture::X64).encode(Architecture::X64).unwrap().len(), 190);
    }

    #[test]
    fn test_architecture_mismatch() {
        let event = exception(Architecture::X86);
        let err = event.encode(Architecture::X64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchitectureMismatch);

        let bytes = exception(Architecture::X64).encode(Architecture::X64).unwrap();
        let err = DebugEvent::decode(&bytes, Architecture::X86).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchitectureMismatch);
    }

    #[test]
    fn test_truncated_event() {
        let bytes = exception(Architecture::X64).encode(Architecture::X64).unwrap();
        for len in 0..bytes.len() {
            let err = DebugEvent::decode(&bytes[..len], Architecture::X64).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedRecord, "len {len}");
        }
    }

    #[test]
    fn test_payload_decoded_under_its_own_tag_only() {
        let exit = DebugEventInfo::ExitProcess { exit_code: 0x1234 };
        let mut w = WireWriter::new();
        exit.encode_into(&mut w, Architecture::X64).unwrap();
        let bytes = w.into_bytes();
        // An 8-byte payload can never be read as an exception
        let err = DebugEventInfo::decode(DebugEventKind::Exception, &bytes, Architecture::X64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedRecord);
        assert_eq!(
            DebugEventInfo::decode(DebugEventKind::ExitProcess, &bytes, Architecture::X64).unwrap(),
            exit
        );
    }

    #[test]
    fn test_bad_tags_rejected() {
        let bytes = exception(Architecture::X64).encode(Architecture::X64).unwrap();

        let mut bad_kind = bytes.clone();
        bad_kind[20..24].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            DebugEvent::decode(&bad_kind, Architecture::X64).unwrap_err().kind(),
            ErrorKind::InvalidEnumValue
        );

        let mut bad_register = bytes.clone();
        bad_register[48..52].copy_from_slice(&5u32.to_le_bytes());
        assert_eq!(
            DebugEvent::decode(&bad_register, Architecture::X64).unwrap_err().kind(),
            ErrorKind::InvalidEnumValue
        );

        let mut bad_flag = bytes;
        bad_flag[52] = 2;
        assert_eq!(
            DebugEvent::decode(&bad_flag, Architecture::X64).unwrap_err().kind(),
            ErrorKind::InvalidEnumValue
        );
    }
}

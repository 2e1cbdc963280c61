//! Request and response payloads
//!
//! Requests are decoded strictly: every byte of the payload must be
//! consumed. Responses are decoded by the controller, which knows what it
//! asked for.

use super::Opcode;
use crate::debug::HardwareBreakpoint;
use crate::error::{ProtocolError, Result};
use crate::protocol::{
    Architecture, BreakpointRegister, BreakpointSize, BreakpointTrigger, ContinueStatus,
    ControlAction, Handle, ProcessAccess, WireReader, WireWriter,
};

/// A controller request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { version: u16 },
    EnumerateProcesses,
    OpenProcess { id: u64, access: ProcessAccess },
    CloseProcess { process: Handle },
    IsProcessValid { process: Handle },
    EnumerateSections { process: Handle },
    EnumerateModules { process: Handle },
    EnumerateThreads { process: Handle },
    ReadMemory { process: Handle, address: u64, len: u32 },
    WriteMemory { process: Handle, address: u64, data: Vec<u8> },
    DecodeInstruction { address: u64, bytes: Vec<u8> },
    ControlProcess { process: Handle, action: ControlAction },
    SetBreakpoint { thread: Handle, breakpoint: HardwareBreakpoint },
    ClearBreakpoint { thread: Handle, register: BreakpointRegister },
    AttachDebugger { process: Handle },
    DetachDebugger,
    PullDebugEvent,
    ContinueDebugEvent { status: ContinueStatus },
}

fn put_breakpoint(w: &mut WireWriter, bp: &HardwareBreakpoint) {
    w.put_u32(bp.register.to_wire());
    w.put_u64(bp.address);
    w.put_u32(bp.trigger.to_wire());
    w.put_u32(bp.size.to_wire());
}

fn register(r: &mut WireReader<'_>) -> Result<BreakpointRegister> {
    BreakpointRegister::from_wire_optional(r.u32()?)?.ok_or_else(|| {
        ProtocolError::InvalidConfiguration("no debug register selected".into())
    })
}

fn breakpoint(r: &mut WireReader<'_>) -> Result<HardwareBreakpoint> {
    Ok(HardwareBreakpoint {
        register: register(r)?,
        address: r.u64()?,
        trigger: BreakpointTrigger::from_wire(r.u32()?)?,
        size: BreakpointSize::from_wire(r.u32()?)?,
    })
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Hello { .. } => Opcode::Hello,
            Request::EnumerateProcesses => Opcode::EnumerateProcesses,
            Request::OpenProcess { .. } => Opcode::OpenProcess,
            Request::CloseProcess { .. } => Opcode::CloseProcess,
            Request::IsProcessValid { .. } => Opcode::IsProcessValid,
            Request::EnumerateSections { .. } => Opcode::EnumerateSections,
            Request::EnumerateModules { .. } => Opcode::EnumerateModules,
            Request::EnumerateThreads { .. } => Opcode::EnumerateThreads,
            Request::ReadMemory { .. } => Opcode::ReadMemory,
            Request::WriteMemory { .. } => Opcode::WriteMemory,
            Request::DecodeInstruction { .. } => Opcode::DecodeInstruction,
            Request::ControlProcess { .. } => Opcode::ControlProcess,
            Request::SetBreakpoint { .. } => Opcode::SetBreakpoint,
            Request::ClearBreakpoint { .. } => Opcode::ClearBreakpoint,
            Request::AttachDebugger { .. } => Opcode::AttachDebugger,
            Request::DetachDebugger => Opcode::DetachDebugger,
            Request::PullDebugEvent => Opcode::PullDebugEvent,
            Request::ContinueDebugEvent { .. } => Opcode::ContinueDebugEvent,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Request::Hello { version } => w.put_u16(*version),
            Request::EnumerateProcesses | Request::DetachDebugger | Request::PullDebugEvent => {}
            Request::OpenProcess { id, access } => {
                w.put_u64(*id);
                w.put_u32(access.to_wire());
            }
            Request::CloseProcess { process }
            | Request::IsProcessValid { process }
            | Request::EnumerateSections { process }
            | Request::EnumerateModules { process }
            | Request::EnumerateThreads { process }
            | Request::AttachDebugger { process } => w.put_handle(*process),
            Request::ReadMemory {
                process,
                address,
                len,
            } => {
                w.put_handle(*process);
                w.put_u64(*address);
                w.put_u32(*len);
            }
            Request::WriteMemory {
                process,
                address,
                data,
            } => {
                w.put_handle(*process);
                w.put_u64(*address);
                w.put_blob(data);
            }
            Request::DecodeInstruction { address, bytes } => {
                w.put_u64(*address);
                w.put_blob(bytes);
            }
            Request::ControlProcess { process, action } => {
                w.put_handle(*process);
                w.put_u32(action.to_wire());
            }
            Request::SetBreakpoint { thread, breakpoint } => {
                w.put_handle(*thread);
                put_breakpoint(&mut w, breakpoint);
            }
            Request::ClearBreakpoint { thread, register } => {
                w.put_handle(*thread);
                w.put_u32(register.to_wire());
            }
            Request::ContinueDebugEvent { status } => w.put_u32(status.to_wire()),
        }
        w.into_bytes()
    }

    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new("request", payload);
        let request = match opcode {
            Opcode::Hello => Request::Hello { version: r.u16()? },
            Opcode::EnumerateProcesses => Request::EnumerateProcesses,
            Opcode::OpenProcess => Request::OpenProcess {
                id: r.u64()?,
                access: ProcessAccess::from_wire(r.u32()?)?,
            },
            Opcode::CloseProcess => Request::CloseProcess { process: r.handle()? },
            Opcode::IsProcessValid => Request::IsProcessValid { process: r.handle()? },
            Opcode::EnumerateSections => Request::EnumerateSections { process: r.handle()? },
            Opcode::EnumerateModules => Request::EnumerateModules { process: r.handle()? },
            Opcode::EnumerateThreads => Request::EnumerateThreads { process: r.handle()? },
            Opcode::ReadMemory => Request::ReadMemory {
                process: r.handle()?,
                address: r.u64()?,
                len: r.u32()?,
            },
            Opcode::WriteMemory => Request::WriteMemory {
                process: r.handle()?,
                address: r.u64()?,
                data: r.blob()?,
            },
            Opcode::DecodeInstruction => Request::DecodeInstruction {
                address: r.u64()?,
                bytes: r.blob()?,
            },
            Opcode::ControlProcess => Request::ControlProcess {
                process: r.handle()?,
                action: ControlAction::from_wire(r.u32()?)?,
            },
            Opcode::SetBreakpoint => Request::SetBreakpoint {
                thread: r.handle()?,
                breakpoint: breakpoint(&mut r)?,
            },
            Opcode::ClearBreakpoint => Request::ClearBreakpoint {
                thread: r.handle()?,
                register: register(&mut r)?,
            },
            Opcode::AttachDebugger => Request::AttachDebugger { process: r.handle()? },
            Opcode::DetachDebugger => Request::DetachDebugger,
            Opcode::PullDebugEvent => Request::PullDebugEvent,
            Opcode::ContinueDebugEvent => Request::ContinueDebugEvent {
                status: ContinueStatus::from_wire(r.u32()?)?,
            },
            Opcode::Record | Opcode::EndOfStream | Opcode::Cancel | Opcode::Close => {
                return Err(ProtocolError::TransportFailure(format!(
                    "{} is not a request",
                    opcode
                )))
            }
        };
        if r.remaining() != 0 {
            return Err(ProtocolError::InvalidLength {
                field: "request payload",
                length: payload.len() as i64,
            });
        }
        Ok(request)
    }
}

/// `Hello` answer: protocol revision and target architecture
pub fn encode_hello(version: u16, arch: Architecture) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u16(version);
    w.put_u8(arch.bitness() as u8);
    w.into_bytes()
}

pub fn decode_hello(payload: &[u8]) -> Result<(u16, Architecture)> {
    let mut r = WireReader::new("hello", payload);
    let version = r.u16()?;
    let arch = Architecture::from_wire(r.u8()?)?;
    Ok((version, arch))
}

pub fn encode_handle(handle: Handle) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_handle(handle);
    w.into_bytes()
}

pub fn decode_handle(payload: &[u8]) -> Result<Handle> {
    WireReader::new("handle", payload).handle()
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_bool(value);
    w.into_bytes()
}

pub fn decode_bool(payload: &[u8]) -> Result<bool> {
    WireReader::new("bool", payload).bool("bool")
}

pub fn encode_blob(bytes: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(4 + bytes.len());
    w.put_blob(bytes);
    w.into_bytes()
}

pub fn decode_blob(payload: &[u8]) -> Result<Vec<u8>> {
    WireReader::new("memory", payload).blob()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_breakpoint_request_layout() {
        let request = Request::SetBreakpoint {
            thread: Handle::from_raw(0x8000),
            breakpoint: HardwareBreakpoint {
                register: BreakpointRegister::Dr0,
                address: 0x10000,
                trigger: BreakpointTrigger::Execute,
                size: BreakpointSize::Size1,
            },
        };
        let bytes = request.encode();
        assert_eq!(bytes.len(), 8 + 4 + 8 + 4 + 4);
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(Request::decode(Opcode::SetBreakpoint, &bytes).unwrap(), request);
    }

    #[test]
    fn test_requests_decode_strictly() {
        let mut bytes = Request::CloseProcess {
            process: Handle::from_raw(4),
        }
        .encode();
        bytes.push(0);
        let err = Request::decode(Opcode::CloseProcess, &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);

        let err = Request::decode(Opcode::OpenProcess, &[0; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedRecord);

        let mut bytes = Request::ControlProcess {
            process: Handle::from_raw(4),
            action: ControlAction::Resume,
        }
        .encode();
        bytes[8] = 9;
        let err = Request::decode(Opcode::ControlProcess, &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEnumValue);

        assert!(Request::decode(Opcode::Record, &[]).is_err());
    }

    #[test]
    fn test_invalid_register_is_configuration_error() {
        let mut w = WireWriter::new();
        w.put_handle(Handle::from_raw(1));
        w.put_u32(0);
        let err = Request::decode(Opcode::ClearBreakpoint, &w.into_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_hello() {
        let (version, arch) = decode_hello(&encode_hello(1, Architecture::X86)).unwrap();
        assert_eq!((version, arch), (1, Architecture::X86));
        assert!(decode_hello(&[1, 0, 16]).is_err());
    }
}

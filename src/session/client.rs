//! Controller side of a session
//!
//! Every call returns `Result<_, OperationError>` so a failure always names
//! the operation it came from. Enumerations come back as lazy
//! [`RecordStream`]s that must be consumed or dropped before the next call.

use std::marker::PhantomData;
use std::os::unix::net::UnixStream;

use super::frame::Frame;
use super::message::{self, Request};
use super::transport::Duplex;
use super::{Opcode, SessionConfig, PROTOCOL_VERSION};
use crate::debug::{DebugEvent, DebugState, HardwareBreakpoint};
use crate::error::{ErrorKind, OperationError, ProtocolError};
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, ControlAction, Handle, InstructionRecord,
    ModuleEntry, ProcessAccess, ProcessEntry, Record, SectionEntry, ThreadEntry,
};

type OpResult<T> = std::result::Result<T, OperationError>;

/// An open session with a provider
pub struct Session<S: Duplex = UnixStream> {
    stream: S,
    config: SessionConfig,
    arch: Architecture,
    /// Local view of the provider's debug loop
    debug: DebugState,
    pending: Option<DebugEvent>,
    closed: bool,
}

/// Closes a session from another thread, unblocking any call in flight
pub struct SessionCloser<S: Duplex = UnixStream> {
    stream: S,
}

impl<S: Duplex> SessionCloser<S> {
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown() {
            log::debug!("Shutdown failed: {}", e);
        }
    }
}

impl<S: Duplex> Session<S> {
    /// Greet the provider and learn the target architecture
    pub fn open(stream: S, config: SessionConfig) -> OpResult<Self> {
        let mut session = Self {
            stream,
            config,
            arch: Architecture::native(),
            debug: DebugState::Idle,
            pending: None,
            closed: false,
        };
        let payload = session.call(Request::Hello {
            version: PROTOCOL_VERSION,
        })?;
        let (version, arch) = message::decode_hello(&payload)
            .map_err(|e| session.fail(Opcode::Hello, e))?;
        log::info!("Connected: protocol v{}, {} target", version, arch);
        session.arch = arch;
        Ok(session)
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub fn debug_state(&self) -> DebugState {
        self.debug
    }

    /// The event waiting for continuation, if any
    pub fn pending_event(&self) -> Option<&DebugEvent> {
        self.pending.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A handle that can close this session from another thread
    pub fn closer(&self) -> OpResult<SessionCloser<S>> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| OperationError::new(Opcode::Close, &ProtocolError::from(e)))?;
        Ok(SessionCloser { stream })
    }

    /// Record a failure, tearing the session down when it is fatal
    fn fail(&mut self, op: Opcode, err: ProtocolError) -> OperationError {
        let local = !matches!(err, ProtocolError::Remote { .. });
        if local || err.kind().is_session_fatal() {
            self.closed = true;
            self.debug = DebugState::Closed;
            self.pending = None;
        }
        OperationError::new(op, &err)
    }

    fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        frame.write_to(&mut self.stream)
    }

    fn recv(&mut self) -> Result<Frame, ProtocolError> {
        Frame::read_from(&mut self.stream, self.config.max_payload)
    }

    /// Send a request and wait for the first frame of its answer
    fn exchange(&mut self, request: Request) -> OpResult<Frame> {
        let op = request.opcode();
        if self.closed {
            return Err(OperationError::new(op, &ProtocolError::SessionClosed));
        }
        let frame = self
            .send(Frame::ok(op, request.encode()))
            .and_then(|_| self.recv())
            .map_err(|e| self.fail(op, e))?;

        if frame.is_error() && frame.opcode == op {
            return Err(self.fail(op, frame.to_error()));
        }
        Ok(frame)
    }

    /// Single-response call, returning the response payload
    fn call(&mut self, request: Request) -> OpResult<Vec<u8>> {
        let op = request.opcode();
        let frame = self.exchange(request)?;
        if frame.opcode != op {
            let err = ProtocolError::TransportFailure(format!("expected {}, got {}", op, frame.opcode));
            return Err(self.fail(op, err));
        }
        Ok(frame.payload)
    }

    fn stream<T: Record>(&mut self, request: Request) -> OpResult<RecordStream<'_, S, T>> {
        let op = request.opcode();
        let first = self.exchange(request)?;
        Ok(RecordStream {
            session: self,
            op,
            peeked: Some(first),
            done: false,
            _record: PhantomData,
        })
    }

    pub fn enumerate_processes(&mut self) -> OpResult<RecordStream<'_, S, ProcessEntry>> {
        self.stream(Request::EnumerateProcesses)
    }

    pub fn enumerate_sections(&mut self, process: Handle) -> OpResult<RecordStream<'_, S, SectionEntry>> {
        self.stream(Request::EnumerateSections { process })
    }

    pub fn enumerate_modules(&mut self, process: Handle) -> OpResult<RecordStream<'_, S, ModuleEntry>> {
        self.stream(Request::EnumerateModules { process })
    }

    pub fn enumerate_threads(&mut self, process: Handle) -> OpResult<RecordStream<'_, S, ThreadEntry>> {
        self.stream(Request::EnumerateThreads { process })
    }

    pub fn open_process(&mut self, id: u64, access: ProcessAccess) -> OpResult<Handle> {
        let payload = self.call(Request::OpenProcess { id, access })?;
        message::decode_handle(&payload).map_err(|e| self.fail(Opcode::OpenProcess, e))
    }

    pub fn close_process(&mut self, process: Handle) -> OpResult<()> {
        self.call(Request::CloseProcess { process }).map(drop)
    }

    pub fn is_process_valid(&mut self, process: Handle) -> OpResult<bool> {
        let payload = self.call(Request::IsProcessValid { process })?;
        message::decode_bool(&payload).map_err(|e| self.fail(Opcode::IsProcessValid, e))
    }

    pub fn read_memory(&mut self, process: Handle, address: u64, len: usize) -> OpResult<Vec<u8>> {
        let len = u32::try_from(len).map_err(|_| {
            OperationError::new(
                Opcode::ReadMemory,
                &ProtocolError::InvalidLength {
                    field: "memory read",
                    length: len as i64,
                },
            )
        })?;
        let payload = self.call(Request::ReadMemory {
            process,
            address,
            len,
        })?;
        message::decode_blob(&payload).map_err(|e| self.fail(Opcode::ReadMemory, e))
    }

    /// Read at most `len` bytes, settling for the readable prefix when the
    /// range runs off the end of a mapping. Fails only if not even one byte
    /// can be read.
    pub fn read_up_to(&mut self, process: Handle, address: u64, len: usize) -> OpResult<Vec<u8>> {
        let mut want = len;
        loop {
            match self.read_memory(process, address, want) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if want > 1 && e.kind == ErrorKind::Backend => want -= 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn write_memory(&mut self, process: Handle, address: u64, data: &[u8]) -> OpResult<()> {
        self.call(Request::WriteMemory {
            process,
            address,
            data: data.to_vec(),
        })
        .map(drop)
    }

    /// Decode one instruction on the provider. Bytes no rule matches come
    /// back as a record with `length == 0`.
    pub fn decode_instruction(&mut self, bytes: &[u8], address: u64) -> OpResult<InstructionRecord> {
        let payload = self.call(Request::DecodeInstruction {
            address,
            bytes: bytes.to_vec(),
        })?;
        InstructionRecord::decode(&payload).map_err(|e| self.fail(Opcode::DecodeInstruction, e))
    }

    pub fn control_process(&mut self, process: Handle, action: ControlAction) -> OpResult<()> {
        self.call(Request::ControlProcess { process, action }).map(drop)
    }

    pub fn set_hardware_breakpoint(&mut self, thread: Handle, breakpoint: HardwareBreakpoint) -> OpResult<()> {
        self.call(Request::SetBreakpoint { thread, breakpoint }).map(drop)
    }

    pub fn clear_hardware_breakpoint(&mut self, thread: Handle, register: BreakpointRegister) -> OpResult<()> {
        self.call(Request::ClearBreakpoint { thread, register }).map(drop)
    }

    pub fn attach_debugger(&mut self, process: Handle) -> OpResult<()> {
        self.call(Request::AttachDebugger { process })?;
        self.debug = DebugState::Idle;
        self.pending = None;
        Ok(())
    }

    pub fn detach_debugger(&mut self) -> OpResult<()> {
        self.call(Request::DetachDebugger)?;
        if self.debug != DebugState::Closed {
            self.debug = DebugState::Idle;
        }
        self.pending = None;
        Ok(())
    }

    /// Block until the target raises a debug event
    pub fn pull_debug_event(&mut self) -> OpResult<DebugEvent> {
        let previous = self.debug;
        self.debug = DebugState::WaitingForEvent;
        let payload = match self.call(Request::PullDebugEvent) {
            Ok(payload) => payload,
            Err(e) => {
                self.debug = match e.kind {
                    ErrorKind::NotAttached => previous,
                    ErrorKind::Cancelled | ErrorKind::Backend => DebugState::Idle,
                    _ => DebugState::Closed,
                };
                return Err(e);
            }
        };
        let event = DebugEvent::decode(&payload, self.arch)
            .map_err(|e| self.fail(Opcode::PullDebugEvent, e))?;
        self.debug = DebugState::EventDelivered;
        self.pending = Some(event);
        Ok(event)
    }

    /// Acknowledge the delivered event and let the target run
    pub fn continue_debug_event(&mut self, status: ContinueStatus) -> OpResult<()> {
        let result = self.call(Request::ContinueDebugEvent { status });
        let pending = self.pending.take();
        match result {
            Ok(_) => {
                self.debug = if pending.is_some_and(|e| e.is_process_exit()) {
                    DebugState::Closed
                } else {
                    DebugState::Idle
                };
                Ok(())
            }
            Err(e) => {
                self.debug = DebugState::Closed;
                Err(e)
            }
        }
    }

    /// End the session politely
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.send(Frame::empty(Opcode::Close)) {
            log::debug!("Close frame not delivered: {}", e);
        }
        let _ = self.stream.shutdown();
    }
}

impl<S: Duplex> Drop for Session<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Records of one enumeration, pulled from the connection as they are
/// consumed.
///
/// A failure mid-stream is yielded once and ends the stream; collecting
/// into `Result<Vec<_>, _>` discards whatever came before it. Dropping the
/// stream early asks the provider to stop and drains what is in flight.
pub struct RecordStream<'a, S: Duplex, T: Record> {
    session: &'a mut Session<S>,
    op: Opcode,
    peeked: Option<Frame>,
    done: bool,
    _record: PhantomData<T>,
}

impl<S: Duplex, T: Record> RecordStream<'_, S, T> {
    fn next_frame(&mut self) -> Result<Frame, ProtocolError> {
        match self.peeked.take() {
            Some(frame) => Ok(frame),
            None => self.session.recv(),
        }
    }

    fn finish(&mut self, err: ProtocolError) -> Option<OperationError> {
        self.done = true;
        Some(self.session.fail(self.op, err))
    }
}

impl<S: Duplex, T: Record> Iterator for RecordStream<'_, S, T> {
    type Item = OpResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = match self.next_frame() {
            Ok(frame) => frame,
            Err(e) => return self.finish(e).map(Err),
        };

        match frame.opcode {
            Opcode::Record if !frame.is_error() => match T::decode(&frame.payload) {
                Ok(record) => Some(Ok(record)),
                // the record is lost, the stream is still in step
                Err(e) => Some(Err(OperationError::new(self.op, &e))),
            },
            Opcode::EndOfStream if !frame.is_error() => {
                self.done = true;
                None
            }
            Opcode::EndOfStream => self.finish(frame.to_error()).map(Err),
            other => {
                let err = ProtocolError::TransportFailure(format!(
                    "unexpected {} inside {} stream",
                    other, self.op
                ));
                self.finish(err).map(Err)
            }
        }
    }
}

impl<S: Duplex, T: Record> Drop for RecordStream<'_, S, T> {
    fn drop(&mut self) {
        if self.done || self.session.closed {
            return;
        }
        if matches!(&self.peeked, Some(f) if f.opcode == Opcode::EndOfStream) {
            return;
        }
        if let Err(e) = self.session.send(Frame::empty(Opcode::Cancel)) {
            self.session.fail(self.op, e);
            return;
        }
        loop {
            match self.next_frame() {
                Ok(frame) if frame.opcode == Opcode::EndOfStream => break,
                Ok(_) => continue,
                Err(e) => {
                    self.session.fail(self.op, e);
                    break;
                }
            }
        }
    }
}

//! Provider side of a session
//!
//! Each connection gets its own thread plus a reader thread. The reader
//! forwards requests and watches for `Cancel` and `Close`, so a session
//! blocked in a debug-event pull or in the middle of an enumeration still
//! notices the controller going away.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::frame::Frame;
use super::message::{self, Request};
use super::transport::Duplex;
use super::{Opcode, SessionConfig, PROTOCOL_VERSION};
use crate::core::{CancelToken, Provider, TargetBackend};
use crate::debug::DebugLoop;
use crate::error::{ProtocolError, Result};
use crate::protocol::Record;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Serves one provider to any number of sessions
pub struct Server<B: TargetBackend> {
    provider: Arc<Provider<B>>,
    config: SessionConfig,
}

impl<B: TargetBackend> Clone for Server<B> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
        }
    }
}

/// Per-connection state owned by the session thread
struct SessionState {
    id: u64,
    debug: DebugLoop,
    /// Set when the controller closes or disconnects
    closed: CancelToken,
    /// Set by a `Cancel` frame; re-armed for every request
    interrupt: CancelToken,
}

impl<B: TargetBackend> Server<B> {
    pub fn new(provider: Arc<Provider<B>>, config: SessionConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &Arc<Provider<B>> {
        &self.provider
    }

    /// Accept Unix socket connections until the listener fails
    pub fn serve_unix(&self, listener: UnixListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    self.spawn(stream)?;
                }
                Err(e) => log::warn!("Accept failed: {}", e),
            }
        }
        Ok(())
    }

    /// Accept TCP connections until the listener fails
    pub fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.spawn(stream)?;
                }
                Err(e) => log::warn!("Accept failed: {}", e),
            }
        }
        Ok(())
    }

    /// Run a session on its own thread
    pub fn spawn<S: Duplex>(&self, stream: S) -> Result<JoinHandle<()>> {
        let server = self.clone();
        let handle = thread::Builder::new()
            .name("pipeprobe-session".into())
            .spawn(move || {
                if let Err(e) = server.run_session(stream) {
                    log::warn!("Session ended with error: {}", e);
                }
            })?;
        Ok(handle)
    }

    /// Serve one connection on the calling thread until it closes
    pub fn run_session<S: Duplex>(&self, mut stream: S) -> Result<()> {
        let mut state = SessionState {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            debug: DebugLoop::new(),
            closed: CancelToken::new(),
            interrupt: CancelToken::new(),
        };
        log::info!("Session {} opened", state.id);

        let (tx, rx) = mpsc::channel();
        let reader = {
            let stream = stream.try_clone()?;
            let closed = state.closed.clone();
            let interrupt = state.interrupt.clone();
            let max_payload = self.config.max_payload;
            thread::Builder::new()
                .name(format!("pipeprobe-session-{}-reader", state.id))
                .spawn(move || read_loop(stream, tx, closed, interrupt, max_payload))?
        };

        let mut result = Ok(());
        // Ends when the reader hangs up (Close, EOF or a broken frame)
        while let Ok(frame) = rx.recv() {
            state.interrupt.reset();
            if let Err(e) = self.handle(&mut stream, &mut state, frame) {
                result = Err(e);
                break;
            }
            if state.closed.is_cancelled() {
                break;
            }
        }

        if let Err(e) = self.provider.detach_debugger(&mut state.debug) {
            log::debug!("Detach on close failed: {}", e);
        }
        state.closed.cancel();
        let _ = stream.shutdown();
        let _ = reader.join();
        log::info!("Session {} closed", state.id);

        match result {
            Err(ProtocolError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    fn handle<S: Duplex>(&self, stream: &mut S, state: &mut SessionState, frame: Frame) -> Result<()> {
        let op = frame.opcode;
        log::debug!("Session {}: {}", state.id, op);

        let request = if frame.is_error() {
            Err(ProtocolError::TransportFailure(format!(
                "request {} carries status {}",
                op, frame.status
            )))
        } else {
            Request::decode(op, &frame.payload)
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => return self.reply_error(stream, state, op, e),
        };

        let reply = match request {
            Request::EnumerateProcesses => {
                return self.stream_records(stream, state, op, self.provider.enumerate_processes())
            }
            Request::EnumerateSections { process } => {
                return self.stream_records(stream, state, op, self.provider.enumerate_sections(process))
            }
            Request::EnumerateModules { process } => {
                return self.stream_records(stream, state, op, self.provider.enumerate_modules(process))
            }
            Request::EnumerateThreads { process } => {
                return self.stream_records(stream, state, op, self.provider.enumerate_threads(process))
            }
            other => self.dispatch(state, other),
        };

        match reply {
            Ok(payload) => Frame::ok(op, payload).write_to(stream),
            Err(e) => self.reply_error(stream, state, op, e),
        }
    }

    /// Answer a single-response request
    fn dispatch(&self, state: &mut SessionState, request: Request) -> Result<Vec<u8>> {
        let provider = &self.provider;
        match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::InvalidConfiguration(format!(
                        "protocol version {} is not supported (expected {})",
                        version, PROTOCOL_VERSION
                    )));
                }
                Ok(message::encode_hello(PROTOCOL_VERSION, provider.architecture()))
            }
            Request::OpenProcess { id, access } => {
                Ok(message::encode_handle(provider.open_process(id, access)?))
            }
            Request::CloseProcess { process } => {
                if state.debug.target() == Some(process) {
                    provider.detach_debugger(&mut state.debug)?;
                }
                provider.close_process(process)?;
                Ok(Vec::new())
            }
            Request::IsProcessValid { process } => {
                Ok(message::encode_bool(provider.is_process_valid(process)))
            }
            Request::ReadMemory {
                process,
                address,
                len,
            } => {
                // blob length prefix + data must fit in one frame
                if len as usize > self.config.max_payload.saturating_sub(4) {
                    return Err(ProtocolError::InvalidLength {
                        field: "memory read",
                        length: len as i64,
                    });
                }
                let bytes = provider.read_memory(process, address, len as usize)?;
                Ok(message::encode_blob(&bytes))
            }
            Request::WriteMemory {
                process,
                address,
                data,
            } => {
                provider.write_memory(process, address, &data)?;
                Ok(Vec::new())
            }
            Request::DecodeInstruction { address, bytes } => {
                Ok(provider.decode_instruction(&bytes, address).encode())
            }
            Request::ControlProcess { process, action } => {
                provider.control_process(process, action)?;
                Ok(Vec::new())
            }
            Request::SetBreakpoint { thread, breakpoint } => {
                provider.set_hardware_breakpoint(thread, breakpoint)?;
                Ok(Vec::new())
            }
            Request::ClearBreakpoint { thread, register } => {
                provider.clear_hardware_breakpoint(thread, register)?;
                Ok(Vec::new())
            }
            Request::AttachDebugger { process } => {
                provider.attach_debugger(&mut state.debug, process)?;
                Ok(Vec::new())
            }
            Request::DetachDebugger => {
                provider.detach_debugger(&mut state.debug)?;
                Ok(Vec::new())
            }
            Request::PullDebugEvent => {
                let event = provider.pull_debug_event(
                    &mut state.debug,
                    &state.closed,
                    self.config.poll_interval,
                    self.config.event_wait,
                )?;
                event.encode(provider.architecture())
            }
            Request::ContinueDebugEvent { status } => {
                provider.continue_debug_event(&mut state.debug, status)?;
                Ok(Vec::new())
            }
            Request::EnumerateProcesses
            | Request::EnumerateSections { .. }
            | Request::EnumerateModules { .. }
            | Request::EnumerateThreads { .. } => Err(ProtocolError::TransportFailure(
                "enumerations are streamed".into(),
            )),
        }
    }

    /// One `Record` frame per element, then `EndOfStream`
    fn stream_records<S, T, I>(
        &self,
        stream: &mut S,
        state: &mut SessionState,
        op: Opcode,
        items: Result<I>,
    ) -> Result<()>
    where
        S: Duplex,
        T: Record,
        I: Iterator<Item = T>,
    {
        let items = match items {
            Ok(items) => items,
            Err(e) => return self.reply_error(stream, state, op, e),
        };

        let mut sent = 0usize;
        for item in items {
            if state.closed.is_cancelled() {
                return Err(ProtocolError::SessionClosed);
            }
            if state.interrupt.is_cancelled() {
                log::debug!("Session {}: {} cancelled after {} records", state.id, op, sent);
                return Frame::error(Opcode::EndOfStream, &ProtocolError::Cancelled).write_to(stream);
            }
            Frame::ok(Opcode::Record, item.encode()).write_to(stream)?;
            sent += 1;
        }
        log::trace!("Session {}: {} streamed {} records", state.id, op, sent);
        Frame::empty(Opcode::EndOfStream).write_to(stream)
    }

    fn reply_error<S: Duplex>(
        &self,
        stream: &mut S,
        state: &SessionState,
        op: Opcode,
        err: ProtocolError,
    ) -> Result<()> {
        let kind = err.kind();
        Frame::error(op, &err).write_to(stream)?;
        if kind.is_session_fatal() {
            log::warn!("Session {}: {} failed fatally: {}", state.id, op, err);
            return Err(err);
        }
        log::debug!("Session {}: {} failed: {}", state.id, op, err);
        Ok(())
    }
}

/// Reader thread body
fn read_loop<S: Duplex>(
    mut stream: S,
    requests: Sender<Frame>,
    closed: CancelToken,
    interrupt: CancelToken,
    max_payload: usize,
) {
    loop {
        match Frame::read_from(&mut stream, max_payload) {
            Ok(frame) => match frame.opcode {
                Opcode::Cancel => interrupt.cancel(),
                Opcode::Close => break,
                _ => {
                    if requests.send(frame).is_err() {
                        break;
                    }
                }
            },
            Err(ProtocolError::SessionClosed) => break,
            Err(e) => {
                log::warn!("Dropping session: {}", e);
                break;
            }
        }
    }
    closed.cancel();
    interrupt.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SimulatedBackend;
    use crate::error::ErrorKind;
    use crate::protocol::{Architecture, ProcessAccess, ProcessEntry};
    use std::os::unix::net::UnixStream;

    const LIMIT: usize = 1 << 20;

    fn start() -> (UnixStream, JoinHandle<()>) {
        let provider = Arc::new(Provider::new(SimulatedBackend::demo(Architecture::X64)));
        let server = Server::new(provider, SessionConfig::default());
        let (ours, theirs) = UnixStream::pair().unwrap();
        let handle = server.spawn(theirs).unwrap();
        (ours, handle)
    }

    fn roundtrip(stream: &mut UnixStream, request: Request) -> Frame {
        Frame::ok(request.opcode(), request.encode())
            .write_to(stream)
            .unwrap();
        Frame::read_from(stream, LIMIT).unwrap()
    }

    #[test]
    fn test_raw_exchange() {
        let (mut stream, handle) = start();

        let frame = roundtrip(&mut stream, Request::Hello { version: PROTOCOL_VERSION });
        assert_eq!(frame.opcode, Opcode::Hello);
        let (_, arch) = message::decode_hello(&frame.payload).unwrap();
        assert_eq!(arch, Architecture::X64);

        let frame = roundtrip(&mut stream, Request::EnumerateProcesses);
        assert_eq!(frame.opcode, Opcode::Record);
        assert_eq!(ProcessEntry::decode(&frame.payload).unwrap().id, 4321);
        let end = Frame::read_from(&mut stream, LIMIT).unwrap();
        assert_eq!(end.opcode, Opcode::EndOfStream);
        assert!(!end.is_error());

        let frame = roundtrip(
            &mut stream,
            Request::OpenProcess {
                id: 99,
                access: ProcessAccess::Read,
            },
        );
        assert_eq!(frame.to_error().kind(), ErrorKind::InvalidHandle);

        Frame::empty(Opcode::Close).write_to(&mut stream).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_out_of_order_continue_drops_session() {
        let (mut stream, handle) = start();
        let frame = roundtrip(
            &mut stream,
            Request::ContinueDebugEvent {
                status: crate::protocol::ContinueStatus::Handled,
            },
        );
        assert_eq!(frame.to_error().kind(), ErrorKind::OutOfOrderContinuation);
        handle.join().unwrap();
        assert_eq!(
            Frame::read_from(&mut stream, LIMIT).unwrap_err().kind(),
            ErrorKind::SessionClosed
        );
    }
}

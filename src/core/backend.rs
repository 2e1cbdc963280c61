//! Backend - the OS-facing collaborator behind the provider
//!
//! A backend owns the real process/thread/memory state and hands out the
//! opaque [`Handle`]s the rest of the crate passes around. Everything here
//! is called from several session threads at once.

use std::time::Duration;

use thiserror::Error;

use crate::debug::{DebugEvent, HardwareBreakpoint};
use crate::error::ProtocolError;
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, ControlAction, Handle, ModuleEntry,
    ProcessAccess, ProcessEntry, SectionEntry, ThreadEntry,
};

/// Backend-specific errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Process not found: {pid}")]
    ProcessNotFound { pid: u64 },

    #[error("Handle {0} does not resolve")]
    InvalidHandle(Handle),

    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Process {0} is not being debugged")]
    NotDebugging(Handle),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("OS error: {0}")]
    Os(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Os(err.to_string())
    }
}

impl From<BackendError> for ProtocolError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidHandle(handle) => ProtocolError::InvalidHandle(handle),
            BackendError::ProcessNotFound { pid } => {
                ProtocolError::InvalidHandle(Handle::from_raw(pid))
            }
            BackendError::NotDebugging(_) => ProtocolError::NotAttached,
            other => ProtocolError::Backend(other.to_string()),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Platform primitives the provider is built on
pub trait TargetBackend: Send + Sync + 'static {
    /// Width of the targets this backend serves
    fn architecture(&self) -> Architecture;

    /// Snapshot of the running processes
    fn processes(&self) -> BackendResult<Vec<ProcessEntry>>;

    /// Open a process by id
    fn open_process(&self, id: u64, access: ProcessAccess) -> BackendResult<Handle>;

    /// Release a process handle
    fn close_process(&self, process: Handle);

    /// Whether the handle still refers to a live process
    fn is_process_valid(&self, process: Handle) -> bool;

    fn sections(&self, process: Handle) -> BackendResult<Vec<SectionEntry>>;

    fn modules(&self, process: Handle) -> BackendResult<Vec<ModuleEntry>>;

    fn threads(&self, process: Handle) -> BackendResult<Vec<ThreadEntry>>;

    fn read_memory(&self, process: Handle, address: u64, len: usize) -> BackendResult<Vec<u8>>;

    fn write_memory(&self, process: Handle, address: u64, data: &[u8]) -> BackendResult<()>;

    /// Suspend, resume or terminate. Suspend and resume are idempotent.
    fn control(&self, process: Handle, action: ControlAction) -> BackendResult<()>;

    fn attach_debugger(&self, process: Handle) -> BackendResult<()>;

    fn detach_debugger(&self, process: Handle) -> BackendResult<()>;

    /// Wait up to `timeout` for the next debug event of `process`
    fn wait_debug_event(
        &self,
        process: Handle,
        timeout: Duration,
    ) -> BackendResult<Option<DebugEvent>>;

    /// Let the target run past `event`
    fn continue_debug_event(&self, event: &DebugEvent, status: ContinueStatus) -> BackendResult<()>;

    /// Program (`Some`) or clear (`None`) a debug register of a thread
    fn apply_breakpoint(
        &self,
        thread: Handle,
        register: BreakpointRegister,
        breakpoint: Option<HardwareBreakpoint>,
    ) -> BackendResult<()>;
}

//! Linux backend - processes, memory and control through procfs and signals
//!
//! Debug-event delivery and debug registers need a ptrace event loop this
//! backend does not carry; those operations report `Unsupported`.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::backend::{BackendError, BackendResult, TargetBackend};
use super::memory::{self, MemoryError};
use crate::debug::{DebugEvent, HardwareBreakpoint};
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, ControlAction, Handle, ModuleEntry,
    ProcessAccess, ProcessEntry, SectionEntry, ThreadEntry,
};

const HANDLE_BASE: u64 = 0x100;

impl From<MemoryError> for BackendError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::ReadFailed { address, reason } => BackendError::ReadFailed { address, reason },
            MemoryError::WriteFailed { address, reason } => {
                BackendError::WriteFailed { address, reason }
            }
            other => BackendError::Os(other.to_string()),
        }
    }
}

struct HandleTable {
    next: u64,
    open: HashMap<Handle, u32>,
}

/// procfs-backed target access for the local machine
pub struct LinuxBackend {
    handles: Mutex<HandleTable>,
}

impl LinuxBackend {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HandleTable {
                next: HANDLE_BASE,
                open: HashMap::new(),
            }),
        }
    }

    fn pid(&self, process: Handle) -> BackendResult<u32> {
        let table = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        table
            .open
            .get(&process)
            .copied()
            .filter(|pid| is_alive(*pid))
            .ok_or(BackendError::InvalidHandle(process))
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// A pid is alive while its stat file exists and it is not a zombie
fn is_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // comm may contain spaces and parentheses; the state follows the last ')'
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

fn image_path(pid: u32) -> String {
    fs::read_link(format!("/proc/{}/exe", pid))
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|_| fs::read_to_string(format!("/proc/{}/comm", pid)).map(|c| c.trim().to_string()))
        .unwrap_or_default()
}

fn numeric_entries(dir: &str) -> BackendResult<Vec<u64>> {
    let mut ids: Vec<u64> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

impl TargetBackend for LinuxBackend {
    fn architecture(&self) -> Architecture {
        Architecture::native()
    }

    fn processes(&self) -> BackendResult<Vec<ProcessEntry>> {
        Ok(numeric_entries("/proc")?
            .into_iter()
            .map(|pid| ProcessEntry::new(pid, &image_path(pid as u32)))
            .collect())
    }

    fn open_process(&self, id: u64, access: ProcessAccess) -> BackendResult<Handle> {
        let pid = u32::try_from(id).map_err(|_| BackendError::ProcessNotFound { pid: id })?;
        if !is_alive(pid) {
            return Err(BackendError::ProcessNotFound { pid: id });
        }
        let mut table = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        let handle = Handle::from_raw(table.next);
        table.next += 4;
        table.open.insert(handle, pid);
        log::trace!("pid {} opened for {} as {}", pid, access, handle);
        Ok(handle)
    }

    fn close_process(&self, process: Handle) {
        let mut table = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        table.open.remove(&process);
    }

    fn is_process_valid(&self, process: Handle) -> bool {
        self.pid(process).is_ok()
    }

    fn sections(&self, process: Handle) -> BackendResult<Vec<SectionEntry>> {
        let maps = memory::read_maps(self.pid(process)?)?;
        Ok(maps.iter().map(|m| m.to_section()).collect())
    }

    fn modules(&self, process: Handle) -> BackendResult<Vec<ModuleEntry>> {
        let maps = memory::read_maps(self.pid(process)?)?;
        Ok(memory::modules_from_maps(&maps)
            .into_iter()
            .map(|(start, end, path)| ModuleEntry {
                base_address: Handle::from_raw(start),
                size: end - start,
                path: path.as_str().into(),
            })
            .collect())
    }

    fn threads(&self, process: Handle) -> BackendResult<Vec<ThreadEntry>> {
        let pid = self.pid(process)?;
        Ok(numeric_entries(&format!("/proc/{}/task", pid))?
            .into_iter()
            .map(|tid| ThreadEntry {
                handle: Handle::from_raw(tid),
                thread_id: tid,
            })
            .collect())
    }

    fn read_memory(&self, process: Handle, address: u64, len: usize) -> BackendResult<Vec<u8>> {
        Ok(memory::read_process(self.pid(process)?, address, len)?)
    }

    fn write_memory(&self, process: Handle, address: u64, data: &[u8]) -> BackendResult<()> {
        Ok(memory::write_process(self.pid(process)?, address, data)?)
    }

    fn control(&self, process: Handle, action: ControlAction) -> BackendResult<()> {
        let pid = self.pid(process)?;
        let signal = match action {
            ControlAction::Suspend => Signal::SIGSTOP,
            ControlAction::Resume => Signal::SIGCONT,
            ControlAction::Terminate => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid as i32), signal).map_err(|e| BackendError::Os(e.to_string()))
    }

    fn attach_debugger(&self, _process: Handle) -> BackendResult<()> {
        Err(BackendError::Unsupported("debugger attach"))
    }

    fn detach_debugger(&self, process: Handle) -> BackendResult<()> {
        Err(BackendError::NotDebugging(process))
    }

    fn wait_debug_event(&self, process: Handle, _timeout: Duration) -> BackendResult<Option<DebugEvent>> {
        Err(BackendError::NotDebugging(process))
    }

    fn continue_debug_event(&self, event: &DebugEvent, _status: ContinueStatus) -> BackendResult<()> {
        Err(BackendError::NotDebugging(event.process_id))
    }

    fn apply_breakpoint(
        &self,
        _thread: Handle,
        _register: BreakpointRegister,
        _breakpoint: Option<HardwareBreakpoint>,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported("hardware breakpoints"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_visible() {
        let backend = LinuxBackend::new();
        let me = std::process::id() as u64;
        assert!(backend.processes().unwrap().iter().any(|p| p.id == me));

        let handle = backend.open_process(me, ProcessAccess::Read).unwrap();
        assert_ne!(handle.into_raw(), me);
        assert!(backend.is_process_valid(handle));
        assert!(!backend.threads(handle).unwrap().is_empty());
        assert!(backend
            .sections(handle)
            .unwrap()
            .iter()
            .any(|s| s.name == "[stack]"));

        backend.close_process(handle);
        assert!(!backend.is_process_valid(handle));
    }

    #[test]
    fn test_unknown_pid() {
        let backend = LinuxBackend::new();
        assert!(matches!(
            backend.open_process(u64::MAX, ProcessAccess::Read),
            Err(BackendError::ProcessNotFound { .. })
        ));
    }
}

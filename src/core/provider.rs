//! Provider - the capability surface exposed to controllers
//!
//! One [`Provider`] is shared by every session of a server. It validates
//! handles, owns debug-register allocation and drives the per-session
//! [`DebugLoop`] against the backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::backend::{BackendError, TargetBackend};
use crate::debug::{BreakpointTable, DebugEvent, DebugEventInfo, DebugLoop, HardwareBreakpoint};
use crate::disasm::DisassemblyEngine;
use crate::error::{ProtocolError, Result};
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, ControlAction, Handle, InstructionRecord,
    ModuleEntry, ProcessAccess, ProcessEntry, SectionEntry, ThreadEntry,
};

/// Shared flag that aborts blocking provider calls
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Re-arm the token for the next request
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capability surface over a backend
pub struct Provider<B: TargetBackend> {
    backend: B,
    disasm: DisassemblyEngine,
    breakpoints: Mutex<BreakpointTable>,
    /// Handles whose process was terminated or closed through us
    retired: Mutex<HashSet<Handle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<B: TargetBackend> Provider<B> {
    pub fn new(backend: B) -> Self {
        let arch = backend.architecture();
        Self {
            backend,
            disasm: DisassemblyEngine::new(arch),
            breakpoints: Mutex::new(BreakpointTable::new()),
            retired: Mutex::new(HashSet::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn architecture(&self) -> Architecture {
        self.backend.architecture()
    }

    fn resolve(&self, process: Handle) -> Result<()> {
        if lock(&self.retired).contains(&process) || !self.backend.is_process_valid(process) {
            return Err(ProtocolError::InvalidHandle(process));
        }
        Ok(())
    }

    fn retire(&self, process: Handle) {
        lock(&self.retired).insert(process);
    }

    /// Threads of a process, read while the process is still alive
    fn threads_of(&self, process: Handle) -> Vec<Handle> {
        match self.backend.threads(process) {
            Ok(threads) => threads.into_iter().map(|t| t.handle).collect(),
            Err(e) => {
                log::debug!("Thread list of {} unavailable: {}", process, e);
                Vec::new()
            }
        }
    }

    /// Release the debug registers of threads that died with their process
    fn forget_threads(&self, threads: &[Handle]) {
        let mut table = lock(&self.breakpoints);
        for thread in threads {
            table.forget_thread(*thread);
        }
    }

    /// Best-effort snapshot of the running processes, taken now
    pub fn enumerate_processes(&self) -> Result<impl Iterator<Item = ProcessEntry>> {
        let processes = self.backend.processes()?;
        log::debug!("Enumerated {} processes", processes.len());
        Ok(processes.into_iter())
    }

    pub fn open_process(&self, id: u64, access: ProcessAccess) -> Result<Handle> {
        let handle = self.backend.open_process(id, access)?;
        // A recycled handle value refers to a new process
        lock(&self.retired).remove(&handle);
        log::info!("Opened process {} ({}) as {}", id, access, handle);
        Ok(handle)
    }

    pub fn close_process(&self, process: Handle) -> Result<()> {
        self.resolve(process)?;
        self.backend.close_process(process);
        self.retire(process);
        Ok(())
    }

    pub fn is_process_valid(&self, process: Handle) -> bool {
        self.resolve(process).is_ok()
    }

    pub fn enumerate_sections(&self, process: Handle) -> Result<impl Iterator<Item = SectionEntry>> {
        self.resolve(process)?;
        Ok(self.backend.sections(process)?.into_iter())
    }

    pub fn enumerate_modules(&self, process: Handle) -> Result<impl Iterator<Item = ModuleEntry>> {
        self.resolve(process)?;
        Ok(self.backend.modules(process)?.into_iter())
    }

    pub fn enumerate_threads(&self, process: Handle) -> Result<impl Iterator<Item = ThreadEntry>> {
        self.resolve(process)?;
        Ok(self.backend.threads(process)?.into_iter())
    }

    pub fn read_memory(&self, process: Handle, address: u64, len: usize) -> Result<Vec<u8>> {
        self.resolve(process)?;
        Ok(self.backend.read_memory(process, address, len)?)
    }

    pub fn write_memory(&self, process: Handle, address: u64, data: &[u8]) -> Result<()> {
        self.resolve(process)?;
        Ok(self.backend.write_memory(process, address, data)?)
    }

    /// Decode one instruction. Undecodable input yields the zero-length
    /// marker record rather than an error.
    pub fn decode_instruction(&self, bytes: &[u8], address: u64) -> InstructionRecord {
        self.disasm.decode_or_marker(bytes, address)
    }

    pub fn control_process(&self, process: Handle, action: ControlAction) -> Result<()> {
        self.resolve(process)?;
        let threads = match action {
            ControlAction::Terminate => self.threads_of(process),
            _ => Vec::new(),
        };
        self.backend.control(process, action)?;
        if action == ControlAction::Terminate {
            self.forget_threads(&threads);
            self.retire(process);
        }
        log::info!("{} {}", action, process);
        Ok(())
    }

    pub fn set_hardware_breakpoint(&self, thread: Handle, breakpoint: HardwareBreakpoint) -> Result<()> {
        breakpoint.validate(self.architecture())?;

        let mut table = lock(&self.breakpoints);
        table.set(thread, breakpoint)?;
        if let Err(e) = self
            .backend
            .apply_breakpoint(thread, breakpoint.register, Some(breakpoint))
        {
            table.clear(thread, breakpoint.register);
            return Err(e.into());
        }
        log::debug!("Breakpoint {} set on thread {}", breakpoint, thread);
        Ok(())
    }

    pub fn clear_hardware_breakpoint(&self, thread: Handle, register: BreakpointRegister) -> Result<()> {
        let mut table = lock(&self.breakpoints);
        if table.get(thread, register).is_none() {
            return Ok(());
        }
        match self.backend.apply_breakpoint(thread, register, None) {
            Ok(()) => log::debug!("Breakpoint {} cleared on thread {}", register, thread),
            // a dead thread has no registers left to clear
            Err(BackendError::InvalidHandle(_)) => {
                log::debug!("Thread {} is gone; releasing {}", thread, register)
            }
            Err(e) => return Err(e.into()),
        }
        table.clear(thread, register);
        Ok(())
    }

    pub fn breakpoints(&self, thread: Handle) -> Vec<HardwareBreakpoint> {
        lock(&self.breakpoints).thread(thread)
    }

    /// Bind a session's debug loop to a process
    pub fn attach_debugger(&self, debug: &mut DebugLoop, process: Handle) -> Result<()> {
        self.resolve(process)?;
        if let Some(previous) = debug.target() {
            if previous != process {
                self.detach_debugger(debug)?;
            }
        }
        self.backend.attach_debugger(process)?;
        debug.attach(process);
        log::info!("Debugger attached to {}", process);
        Ok(())
    }

    pub fn detach_debugger(&self, debug: &mut DebugLoop) -> Result<()> {
        if let Some(process) = debug.detach() {
            if self.backend.is_process_valid(process) {
                self.backend.detach_debugger(process)?;
            }
            log::info!("Debugger detached from {}", process);
        }
        Ok(())
    }

    /// Block until the attached target raises an event.
    ///
    /// Polls the backend every `poll` so that cancellation and target death
    /// are noticed promptly; both close the debug loop. When `wait` runs out
    /// the loop goes back to `Idle` and the call fails with `Cancelled`.
    pub fn pull_debug_event(
        &self,
        debug: &mut DebugLoop,
        cancel: &CancelToken,
        poll: Duration,
        wait: Option<Duration>,
    ) -> Result<DebugEvent> {
        let target = debug.begin_pull()?;
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if cancel.is_cancelled() {
                debug.close();
                return Err(ProtocolError::SessionClosed);
            }
            if !self.is_process_valid(target) {
                debug.close();
                return Err(ProtocolError::SessionClosed);
            }
            match self.backend.wait_debug_event(target, poll) {
                Ok(Some(event)) => {
                    log::debug!("Debug event: {}", event);
                    debug.deliver(event);
                    return Ok(event);
                }
                Ok(None) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        debug.abandon_wait();
                        return Err(ProtocolError::Cancelled);
                    }
                }
                Err(e) => {
                    debug.abandon_wait();
                    return Err(e.into());
                }
            }
        }
    }

    pub fn continue_debug_event(&self, debug: &mut DebugLoop, status: ContinueStatus) -> Result<()> {
        let event = debug.begin_continue()?;
        let exiting = if event.is_process_exit() {
            self.threads_of(event.process_id)
        } else {
            Vec::new()
        };
        if let Err(e) = self.backend.continue_debug_event(&event, status) {
            debug.close();
            return Err(e.into());
        }
        debug.finish_continue(&event);

        match event.info {
            DebugEventInfo::ExitThread { .. } => lock(&self.breakpoints).forget_thread(event.thread_id),
            DebugEventInfo::ExitProcess { .. } => {
                self.forget_threads(&exiting);
                self.retire(event.process_id);
            }
            _ => {}
        }
        log::debug!("Continued {} with {}", event.kind(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulated::SimulatedBackend;
    use crate::debug::DebugState;
    use crate::error::ErrorKind;
    use crate::protocol::{BreakpointSize, BreakpointTrigger};

    const POLL: Duration = Duration::from_millis(5);

    fn provider() -> (Provider<SimulatedBackend>, Handle, Handle) {
        let sim = SimulatedBackend::new(Architecture::X64);
        sim.add_process(4321, "C:\\app.exe");
        let thread = sim.add_thread(4321, 1);
        let provider = Provider::new(sim);
        let process = provider.open_process(4321, ProcessAccess::Full).unwrap();
        (provider, process, thread)
    }

    fn exec_bp(register: BreakpointRegister) -> HardwareBreakpoint {
        HardwareBreakpoint {
            register,
            address: 0x10000,
            trigger: BreakpointTrigger::Execute,
            size: BreakpointSize::Size1,
        }
    }

    #[test]
    fn test_terminate_invalidates_handle() {
        let (provider, process, _) = provider();
        provider.control_process(process, ControlAction::Suspend).unwrap();
        provider.control_process(process, ControlAction::Suspend).unwrap();
        provider.control_process(process, ControlAction::Resume).unwrap();
        provider.control_process(process, ControlAction::Terminate).unwrap();

        let err = provider.enumerate_sections(process).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        let err = provider.control_process(process, ControlAction::Resume).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_breakpoint_allocation() {
        let (provider, _, thread) = provider();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr0)).unwrap();
        let err = provider
            .set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegisterInUse);

        provider.clear_hardware_breakpoint(thread, BreakpointRegister::Dr0).unwrap();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr0)).unwrap();
        assert_eq!(provider.backend().debug_register(thread, BreakpointRegister::Dr0), Some(exec_bp(BreakpointRegister::Dr0)));
    }

    #[test]
    fn test_terminate_releases_breakpoints() {
        let (provider, process, thread) = provider();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr0)).unwrap();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr3)).unwrap();
        assert_eq!(provider.breakpoints(thread).len(), 2);

        provider.control_process(process, ControlAction::Terminate).unwrap();
        assert!(provider.breakpoints(thread).is_empty());
        provider.clear_hardware_breakpoint(thread, BreakpointRegister::Dr0).unwrap();
    }

    #[test]
    fn test_process_exit_releases_breakpoints() {
        let (provider, process, thread) = provider();
        let mut debug = DebugLoop::new();
        provider.attach_debugger(&mut debug, process).unwrap();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr1)).unwrap();
        provider
            .backend()
            .push_event(4321, thread, DebugEventInfo::ExitProcess { exit_code: 0 });

        let cancel = CancelToken::new();
        provider.pull_debug_event(&mut debug, &cancel, POLL, None).unwrap();
        provider.continue_debug_event(&mut debug, ContinueStatus::Handled).unwrap();
        assert_eq!(debug.state(), DebugState::Closed);
        assert!(provider.breakpoints(thread).is_empty());
    }

    #[test]
    fn test_clear_on_dead_thread_releases_slot() {
        let (provider, _, _) = provider();
        let sim = provider.backend();
        sim.add_process(77, "/bin/short-lived");
        let thread = sim.add_thread(77, 770);
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr2)).unwrap();

        // the process disappears without going through the provider
        sim.remove_process(77);
        provider.clear_hardware_breakpoint(thread, BreakpointRegister::Dr2).unwrap();
        assert!(provider.breakpoints(thread).is_empty());
    }

    #[test]
    fn test_breakpoint_on_unknown_thread_rolls_back() {
        let (provider, _, _) = provider();
        let ghost = Handle::from_raw(0xdead);
        let err = provider
            .set_hardware_breakpoint(ghost, exec_bp(BreakpointRegister::Dr1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        assert!(provider.breakpoints(ghost).is_empty());
    }

    #[test]
    fn test_pull_is_cancellable() {
        let (provider, process, _) = provider();
        let mut debug = DebugLoop::new();
        provider.attach_debugger(&mut debug, process).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = provider.pull_debug_event(&mut debug, &cancel, POLL, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert_eq!(debug.state(), DebugState::Closed);
    }

    #[test]
    fn test_pull_and_continue() {
        let (provider, process, thread) = provider();
        let mut debug = DebugLoop::new();
        provider.attach_debugger(&mut debug, process).unwrap();
        provider.set_hardware_breakpoint(thread, exec_bp(BreakpointRegister::Dr2)).unwrap();
        provider.backend().trigger_breakpoint(thread, BreakpointRegister::Dr2).unwrap();

        let cancel = CancelToken::new();
        let event = provider.pull_debug_event(&mut debug, &cancel, POLL, None).unwrap();
        match event.info {
            DebugEventInfo::Exception(info) => assert_eq!(info.caused_by, Some(BreakpointRegister::Dr2)),
            other => panic!("unexpected {other:?}"),
        }

        let err = provider.pull_debug_event(&mut debug, &cancel, POLL, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfOrderContinuation);
    }

    #[test]
    fn test_pull_wait_expires() {
        let (provider, process, _) = provider();
        let mut debug = DebugLoop::new();
        provider.attach_debugger(&mut debug, process).unwrap();

        let cancel = CancelToken::new();
        let err = provider
            .pull_debug_event(&mut debug, &cancel, POLL, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(debug.state(), DebugState::Idle);
    }

    #[test]
    fn test_decode_never_fails() {
        let (provider, _, _) = provider();
        assert!(provider.decode_instruction(&[0x90], 0).is_valid());
        assert!(!provider.decode_instruction(&[0x06], 0).is_valid());
    }
}

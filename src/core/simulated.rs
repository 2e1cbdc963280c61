//! Simulated target - an in-process backend for tests and demos
//!
//! Holds scripted processes (sections, modules, threads, memory) and a
//! queue of debug events per process. Events are released one at a time:
//! while an event is parked waiting for continuation, the process raises
//! nothing else, like a real debuggee.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::backend::{BackendError, BackendResult, TargetBackend};
use crate::debug::{DebugEvent, DebugEventInfo, ExceptionInfo, HardwareBreakpoint, RegisterSnapshot};
use crate::protocol::{
    Architecture, BreakpointRegister, ContinueStatus, ControlAction, DebugEventKind, Handle,
    ModuleEntry, ProcessAccess, ProcessEntry, SectionEntry, ThreadEntry,
};

/// `EXCEPTION_SINGLE_STEP`, raised by debug-register hits
pub const SINGLE_STEP_CODE: u64 = 0x8000_0004;

const PROCESS_HANDLE_BASE: u64 = 0x1000;
const THREAD_HANDLE_BASE: u64 = 0x8000;

#[derive(Debug, Default)]
struct SimProcess {
    path: String,
    sections: Vec<SectionEntry>,
    modules: Vec<ModuleEntry>,
    threads: Vec<ThreadEntry>,
    memory: BTreeMap<u64, Vec<u8>>,
    suspended: bool,
    terminated: bool,
    debugger: Option<Handle>,
    queue: VecDeque<(Handle, DebugEventInfo)>,
    parked: Option<DebugEvent>,
    continuations: Vec<(DebugEventKind, ContinueStatus)>,
}

#[derive(Debug, Default)]
struct SimState {
    processes: BTreeMap<u64, SimProcess>,
    handles: HashMap<Handle, u64>,
    thread_owner: HashMap<Handle, u64>,
    debug_registers: HashMap<Handle, [Option<HardwareBreakpoint>; 4]>,
    next_handle: u64,
    next_thread: u64,
}

impl SimState {
    fn pid_of(&self, process: Handle) -> BackendResult<u64> {
        self.handles
            .get(&process)
            .copied()
            .filter(|pid| self.processes.contains_key(pid))
            .ok_or(BackendError::InvalidHandle(process))
    }

    fn live(&mut self, process: Handle) -> BackendResult<&mut SimProcess> {
        let pid = self.pid_of(process)?;
        match self.processes.get_mut(&pid) {
            Some(p) if !p.terminated => Ok(p),
            _ => Err(BackendError::InvalidHandle(process)),
        }
    }
}

/// Scriptable in-memory target
pub struct SimulatedBackend {
    arch: Architecture,
    state: Mutex<SimState>,
    wakeup: Condvar,
}

impl SimulatedBackend {
    pub fn new(arch: Architecture) -> Self {
        Self {
            arch,
            state: Mutex::new(SimState {
                next_handle: PROCESS_HANDLE_BASE,
                next_thread: THREAD_HANDLE_BASE,
                ..Default::default()
            }),
            wakeup: Condvar::new(),
        }
    }

    /// A small ready-made target: one process with code, heap, a module
    /// and a main thread.
    pub fn demo(arch: Architecture) -> Self {
        use crate::protocol::{SectionCategory, SectionProtection, SectionType};

        let sim = Self::new(arch);
        sim.add_process(4321, "C:\\app.exe");
        sim.add_section(
            4321,
            SectionEntry {
                base_address: Handle::from_raw(0x10000),
                size: 0x2000,
                section_type: SectionType::Image,
                category: SectionCategory::Code,
                protection: SectionProtection::READ | SectionProtection::EXECUTE,
                name: ".text".into(),
                module_path: "C:\\app.exe".into(),
            },
        );
        sim.add_section(
            4321,
            SectionEntry {
                base_address: Handle::from_raw(0x40000),
                size: 0x1000,
                section_type: SectionType::Private,
                category: SectionCategory::Heap,
                protection: SectionProtection::READ | SectionProtection::WRITE,
                name: "".into(),
                module_path: "".into(),
            },
        );
        sim.add_module(
            4321,
            ModuleEntry {
                base_address: Handle::from_raw(0x10000),
                size: 0x2000,
                path: "C:\\app.exe".into(),
            },
        );
        // push rbp; mov rbp, rsp; nop; pop rbp; ret, then int3 up to the end of .text
        let mut text = vec![0xcc; 0x2000];
        text[..7].copy_from_slice(&[0x55, 0x48, 0x89, 0xe5, 0x90, 0x5d, 0xc3]);
        sim.map_memory(4321, 0x10000, &text);
        sim.add_thread(4321, 1);
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_process(&self, id: u64, path: &str) {
        self.lock().processes.insert(
            id,
            SimProcess {
                path: path.to_string(),
                ..Default::default()
            },
        );
    }

    /// Make a process vanish, as if it exited between two enumerations
    pub fn remove_process(&self, id: u64) {
        self.lock().processes.remove(&id);
        self.wakeup.notify_all();
    }

    pub fn add_section(&self, id: u64, section: SectionEntry) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.sections.push(section);
        }
    }

    pub fn add_module(&self, id: u64, module: ModuleEntry) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.modules.push(module);
        }
    }

    /// Add a thread, returning its handle
    pub fn add_thread(&self, id: u64, thread_id: u64) -> Handle {
        let mut state = self.lock();
        let handle = Handle::from_raw(state.next_thread);
        state.next_thread += 4;
        state.thread_owner.insert(handle, id);
        if let Some(p) = state.processes.get_mut(&id) {
            p.threads.push(ThreadEntry { handle, thread_id });
        }
        handle
    }

    pub fn map_memory(&self, id: u64, address: u64, bytes: &[u8]) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.memory.insert(address, bytes.to_vec());
        }
    }

    /// Queue a debug event raised by `thread`
    pub fn push_event(&self, id: u64, thread: Handle, info: DebugEventInfo) {
        if let Some(p) = self.lock().processes.get_mut(&id) {
            p.queue.push_back((thread, info));
        }
        self.wakeup.notify_all();
    }

    /// Fire the breakpoint programmed in `register` of `thread`
    pub fn trigger_breakpoint(&self, thread: Handle, register: BreakpointRegister) -> BackendResult<()> {
        let mut state = self.lock();
        let bp = state
            .debug_registers
            .get(&thread)
            .and_then(|slots| slots[register.slot()])
            .ok_or(BackendError::InvalidHandle(thread))?;
        let pid = *state
            .thread_owner
            .get(&thread)
            .ok_or(BackendError::InvalidHandle(thread))?;

        let registers = match RegisterSnapshot::zeroed(self.arch) {
            RegisterSnapshot::X86(mut r) => {
                r.eip = bp.address;
                RegisterSnapshot::X86(r)
            }
            RegisterSnapshot::X64(mut r) => {
                r.rip = bp.address;
                RegisterSnapshot::X64(r)
            }
        };
        let info = DebugEventInfo::Exception(ExceptionInfo {
            exception_code: SINGLE_STEP_CODE,
            exception_flags: 0,
            exception_address: Handle::from_raw(bp.address),
            caused_by: Some(register),
            is_first_chance: true,
            registers,
        });
        if let Some(p) = state.processes.get_mut(&pid) {
            p.queue.push_back((thread, info));
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    pub fn debug_register(&self, thread: Handle, register: BreakpointRegister) -> Option<HardwareBreakpoint> {
        self.lock()
            .debug_registers
            .get(&thread)
            .and_then(|slots| slots[register.slot()])
    }

    /// Continuations received so far, oldest first
    pub fn continuations(&self, id: u64) -> Vec<(DebugEventKind, ContinueStatus)> {
        self.lock()
            .processes
            .get(&id)
            .map(|p| p.continuations.clone())
            .unwrap_or_default()
    }

    pub fn is_suspended(&self, id: u64) -> bool {
        self.lock().processes.get(&id).is_some_and(|p| p.suspended)
    }
}

impl TargetBackend for SimulatedBackend {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn processes(&self) -> BackendResult<Vec<ProcessEntry>> {
        Ok(self
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| !p.terminated)
            .map(|(id, p)| ProcessEntry::new(*id, &p.path))
            .collect())
    }

    fn open_process(&self, id: u64, _access: ProcessAccess) -> BackendResult<Handle> {
        let mut state = self.lock();
        match state.processes.get(&id) {
            Some(p) if !p.terminated => {}
            _ => return Err(BackendError::ProcessNotFound { pid: id }),
        }
        let handle = Handle::from_raw(state.next_handle);
        state.next_handle += 4;
        state.handles.insert(handle, id);
        Ok(handle)
    }

    fn close_process(&self, process: Handle) {
        self.lock().handles.remove(&process);
    }

    fn is_process_valid(&self, process: Handle) -> bool {
        self.lock().live(process).is_ok()
    }

    fn sections(&self, process: Handle) -> BackendResult<Vec<SectionEntry>> {
        Ok(self.lock().live(process)?.sections.clone())
    }

    fn modules(&self, process: Handle) -> BackendResult<Vec<ModuleEntry>> {
        Ok(self.lock().live(process)?.modules.clone())
    }

    fn threads(&self, process: Handle) -> BackendResult<Vec<ThreadEntry>> {
        Ok(self.lock().live(process)?.threads.clone())
    }

    fn read_memory(&self, process: Handle, address: u64, len: usize) -> BackendResult<Vec<u8>> {
        let mut state = self.lock();
        let p = state.live(process)?;
        let (base, bytes) = p
            .memory
            .range(..=address)
            .next_back()
            .ok_or(BackendError::ReadFailed {
                address,
                reason: "unmapped".into(),
            })?;
        let start = (address - base) as usize;
        start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or(BackendError::ReadFailed {
                address,
                reason: "range crosses end of mapping".into(),
            })
    }

    fn write_memory(&self, process: Handle, address: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.lock();
        let p = state.live(process)?;
        let (base, bytes) = p
            .memory
            .range_mut(..=address)
            .next_back()
            .ok_or(BackendError::WriteFailed {
                address,
                reason: "unmapped".into(),
            })?;
        let start = (address - *base) as usize;
        let target = start
            .checked_add(data.len())
            .and_then(|end| bytes.get_mut(start..end))
            .ok_or(BackendError::WriteFailed {
                address,
                reason: "range crosses end of mapping".into(),
            })?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn control(&self, process: Handle, action: ControlAction) -> BackendResult<()> {
        let mut state = self.lock();
        let p = state.live(process)?;
        match action {
            ControlAction::Suspend => p.suspended = true,
            ControlAction::Resume => p.suspended = false,
            ControlAction::Terminate => p.terminated = true,
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn attach_debugger(&self, process: Handle) -> BackendResult<()> {
        self.lock().live(process)?.debugger = Some(process);
        Ok(())
    }

    fn detach_debugger(&self, process: Handle) -> BackendResult<()> {
        let mut state = self.lock();
        let p = state.live(process)?;
        p.debugger = None;
        p.parked = None;
        Ok(())
    }

    fn wait_debug_event(&self, process: Handle, timeout: Duration) -> BackendResult<Option<DebugEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let p = state.live(process)?;
            if p.debugger != Some(process) {
                return Err(BackendError::NotDebugging(process));
            }
            if p.parked.is_none() {
                if let Some((thread, info)) = p.queue.pop_front() {
                    let event = DebugEvent::new(process, thread, info);
                    p.parked = Some(event);
                    return Ok(Some(event));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match self.wakeup.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn continue_debug_event(&self, event: &DebugEvent, status: ContinueStatus) -> BackendResult<()> {
        let mut state = self.lock();
        let p = state.live(event.process_id)?;
        if p.parked.take().is_none() {
            return Err(BackendError::Os("no event is parked".into()));
        }
        p.continuations.push((event.kind(), status));
        if event.is_process_exit() {
            p.terminated = true;
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn apply_breakpoint(
        &self,
        thread: Handle,
        register: BreakpointRegister,
        breakpoint: Option<HardwareBreakpoint>,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        let alive = state
            .thread_owner
            .get(&thread)
            .and_then(|pid| state.processes.get(pid))
            .is_some_and(|p| !p.terminated);
        if !alive {
            return Err(BackendError::InvalidHandle(thread));
        }
        state.debug_registers.entry(thread).or_default()[register.slot()] = breakpoint;
        Ok(())
    }
}

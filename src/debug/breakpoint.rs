//! Hardware breakpoints and per-thread debug register allocation.

use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::{Architecture, BreakpointRegister, BreakpointSize, BreakpointTrigger, Handle};

/// A debug-register breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareBreakpoint {
    pub register: BreakpointRegister,
    pub address: u64,
    pub trigger: BreakpointTrigger,
    pub size: BreakpointSize,
}

impl HardwareBreakpoint {
    /// Reject combinations the debug registers cannot express
    pub fn validate(&self, arch: Architecture) -> Result<()> {
        if self.trigger == BreakpointTrigger::Execute && self.size != BreakpointSize::Size1 {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "execute breakpoints must be 1 byte, got {} bytes",
                self.size.bytes()
            )));
        }
        if arch == Architecture::X86 && self.size == BreakpointSize::Size8 {
            return Err(ProtocolError::InvalidConfiguration(
                "8 byte breakpoints need a 64-bit target".into(),
            ));
        }
        if self.address % self.size.bytes() != 0 {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "address {:#x} is not aligned to {} bytes",
                self.address,
                self.size.bytes()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for HardwareBreakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:#x} {} {}b",
            self.register,
            self.address,
            self.trigger,
            self.size.bytes()
        )
    }
}

/// Occupancy of the four debug address registers, per thread
#[derive(Debug, Default)]
pub struct BreakpointTable {
    threads: HashMap<Handle, [Option<HardwareBreakpoint>; 4]>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a register. Never overwrites an occupied slot.
    pub fn set(&mut self, thread: Handle, breakpoint: HardwareBreakpoint) -> Result<()> {
        let slots = self.threads.entry(thread).or_default();
        let slot = &mut slots[breakpoint.register.slot()];
        if slot.is_some() {
            return Err(ProtocolError::RegisterInUse {
                thread,
                register: breakpoint.register,
            });
        }
        *slot = Some(breakpoint);
        Ok(())
    }

    /// Release a register; clearing a free register is a no-op
    pub fn clear(&mut self, thread: Handle, register: BreakpointRegister) -> Option<HardwareBreakpoint> {
        let slots = self.threads.get_mut(&thread)?;
        let previous = slots[register.slot()].take();
        if slots.iter().all(Option::is_none) {
            self.threads.remove(&thread);
        }
        previous
    }

    pub fn get(&self, thread: Handle, register: BreakpointRegister) -> Option<HardwareBreakpoint> {
        self.threads
            .get(&thread)
            .and_then(|slots| slots[register.slot()])
    }

    /// Breakpoints currently set on a thread
    pub fn thread(&self, thread: Handle) -> Vec<HardwareBreakpoint> {
        self.threads
            .get(&thread)
            .map(|slots| slots.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every allocation for a thread that went away
    pub fn forget_thread(&mut self, thread: Handle) {
        self.threads.remove(&thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn bp(register: BreakpointRegister) -> HardwareBreakpoint {
        HardwareBreakpoint {
            register,
            address: 0x10000,
            trigger: BreakpointTrigger::Execute,
            size: BreakpointSize::Size1,
        }
    }

    #[test]
    fn test_register_in_use_then_clear_and_retry() {
        let mut table = BreakpointTable::new();
        let thread = Handle::from_raw(7);
        table.set(thread, bp(BreakpointRegister::Dr0)).unwrap();

        let err = table.set(thread, bp(BreakpointRegister::Dr0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegisterInUse);

        // Other threads have their own registers
        table.set(Handle::from_raw(8), bp(BreakpointRegister::Dr0)).unwrap();

        assert_eq!(table.clear(thread, BreakpointRegister::Dr0), Some(bp(BreakpointRegister::Dr0)));
        table.set(thread, bp(BreakpointRegister::Dr0)).unwrap();
    }

    #[test]
    fn test_clear_free_register_is_noop() {
        let mut table = BreakpointTable::new();
        assert_eq!(table.clear(Handle::from_raw(1), BreakpointRegister::Dr3), None);
    }

    #[test]
    fn test_all_four_slots() {
        let mut table = BreakpointTable::new();
        let thread = Handle::from_raw(7);
        for register in BreakpointRegister::ALL {
            table.set(thread, bp(*register)).unwrap();
        }
        assert_eq!(table.thread(thread).len(), 4);
        table.forget_thread(thread);
        assert!(table.thread(thread).is_empty());
    }

    #[test]
    fn test_validation_policy() {
        let mut wide_exec = bp(BreakpointRegister::Dr1);
        wide_exec.size = BreakpointSize::Size4;
        assert_eq!(
            wide_exec.validate(Architecture::X64).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );

        let qword = HardwareBreakpoint {
            register: BreakpointRegister::Dr2,
            address: 0x2000,
            trigger: BreakpointTrigger::Write,
            size: BreakpointSize::Size8,
        };
        assert!(qword.validate(Architecture::X64).is_ok());
        assert!(qword.validate(Architecture::X86).is_err());

        let unaligned = HardwareBreakpoint { address: 0x2002, ..qword };
        assert!(unaligned.validate(Architecture::X64).is_err());
    }
}

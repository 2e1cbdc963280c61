//! Debug loop state machine.
//!
//! ```text
//! Idle --pull--> WaitingForEvent --event--> EventDelivered --continue--> Idle
//!   \______________________ teardown / target exit ______________________> Closed
//! ```
//!
//! Pulling again before continuing, or continuing with nothing delivered,
//! closes the loop.

use super::event::DebugEvent;
use crate::error::{ProtocolError, Result};
use crate::protocol::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugState {
    #[default]
    Idle,
    WaitingForEvent,
    EventDelivered,
    Closed,
}

#[derive(Debug, Default)]
pub struct DebugLoop {
    state: DebugState,
    target: Option<Handle>,
    pending: Option<DebugEvent>,
}

impl DebugLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DebugState {
        self.state
    }

    pub fn target(&self) -> Option<Handle> {
        self.target
    }

    pub fn pending(&self) -> Option<&DebugEvent> {
        self.pending.as_ref()
    }

    /// Bind to a target. This is also how a closed loop is reopened.
    pub fn attach(&mut self, target: Handle) {
        self.target = Some(target);
        self.pending = None;
        self.state = DebugState::Idle;
    }

    pub fn detach(&mut self) -> Option<Handle> {
        self.pending = None;
        if self.state != DebugState::Closed {
            self.state = DebugState::Idle;
        }
        self.target.take()
    }

    /// Enter `WaitingForEvent`, returning the target to wait on
    pub fn begin_pull(&mut self) -> Result<Handle> {
        match self.state {
            DebugState::Closed => Err(ProtocolError::SessionClosed),
            DebugState::WaitingForEvent | DebugState::EventDelivered => {
                self.close();
                Err(ProtocolError::OutOfOrderContinuation(
                    "previous debug event was not continued",
                ))
            }
            DebugState::Idle => {
                let target = self.target.ok_or(ProtocolError::NotAttached)?;
                self.state = DebugState::WaitingForEvent;
                Ok(target)
            }
        }
    }

    pub fn deliver(&mut self, event: DebugEvent) {
        debug_assert_eq!(self.state, DebugState::WaitingForEvent);
        self.pending = Some(event);
        self.state = DebugState::EventDelivered;
    }

    /// The wait ended without an event; try again later
    pub fn abandon_wait(&mut self) {
        if self.state == DebugState::WaitingForEvent {
            self.state = DebugState::Idle;
        }
    }

    /// Leave `EventDelivered`, handing back the event to acknowledge
    pub fn begin_continue(&mut self) -> Result<DebugEvent> {
        match (self.state, self.pending.take()) {
            (DebugState::Closed, _) => Err(ProtocolError::SessionClosed),
            (DebugState::EventDelivered, Some(event)) => Ok(event),
            _ => {
                self.close();
                Err(ProtocolError::OutOfOrderContinuation(
                    "no debug event is waiting for continuation",
                ))
            }
        }
    }

    /// Record a completed continuation
    pub fn finish_continue(&mut self, event: &DebugEvent) {
        self.state = if event.is_process_exit() {
            self.target = None;
            DebugState::Closed
        } else {
            DebugState::Idle
        };
    }

    pub fn close(&mut self) {
        self.pending = None;
        self.state = DebugState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::event::DebugEventInfo;
    use crate::error::ErrorKind;

    fn thread_event() -> DebugEvent {
        DebugEvent::new(
            Handle::from_raw(1),
            Handle::from_raw(2),
            DebugEventInfo::CreateThread {
                thread_handle: Handle::from_raw(2),
            },
        )
    }

    #[test]
    fn test_pull_requires_attach() {
        let mut dl = DebugLoop::new();
        assert_eq!(dl.begin_pull().unwrap_err().kind(), ErrorKind::NotAttached);
        assert_eq!(dl.state(), DebugState::Idle);
    }

    #[test]
    fn test_alternation() {
        let mut dl = DebugLoop::new();
        dl.attach(Handle::from_raw(1));
        dl.begin_pull().unwrap();
        dl.deliver(thread_event());
        assert_eq!(dl.state(), DebugState::EventDelivered);

        let event = dl.begin_continue().unwrap();
        dl.finish_continue(&event);
        assert_eq!(dl.state(), DebugState::Idle);
        dl.begin_pull().unwrap();
    }

    #[test]
    fn test_double_pull_closes() {
        let mut dl = DebugLoop::new();
        dl.attach(Handle::from_raw(1));
        dl.begin_pull().unwrap();
        dl.deliver(thread_event());
        let err = dl.begin_pull().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfOrderContinuation);
        assert_eq!(dl.state(), DebugState::Closed);
        assert_eq!(dl.begin_pull().unwrap_err().kind(), ErrorKind::SessionClosed);

        // Reattaching reopens
        dl.attach(Handle::from_raw(1));
        dl.begin_pull().unwrap();
    }

    #[test]
    fn test_continue_without_event() {
        let mut dl = DebugLoop::new();
        dl.attach(Handle::from_raw(1));
        assert_eq!(
            dl.begin_continue().unwrap_err().kind(),
            ErrorKind::OutOfOrderContinuation
        );
        assert_eq!(dl.state(), DebugState::Closed);
    }

    #[test]
    fn test_process_exit_closes() {
        let mut dl = DebugLoop::new();
        dl.attach(Handle::from_raw(1));
        dl.begin_pull().unwrap();
        dl.deliver(DebugEvent::new(
            Handle::from_raw(1),
            Handle::from_raw(2),
            DebugEventInfo::ExitProcess { exit_code: 0 },
        ));
        let event = dl.begin_continue().unwrap();
        dl.finish_continue(&event);
        assert_eq!(dl.state(), DebugState::Closed);
        assert_eq!(dl.target(), None);
    }
}

//! pipeprobe - remote process introspection over a framed session protocol
//!
//! A provider exposes processes, memory sections, modules, single-instruction
//! decoding and a hardware-breakpoint debug loop; a controller drives it over
//! a duplex byte stream.
//!
//! Layout:
//! - [`protocol`]: byte-exact records and scalar wire types
//! - [`debug`]: debug events, breakpoints and the debug loop state machine
//! - [`disasm`]: iced-x86 backed instruction decoding
//! - [`core`]: target backends and the shared [`core::Provider`]
//! - [`session`]: framing, the provider server and the controller client
//! - [`ui`]: the interactive controller

pub mod core;
pub mod debug;
pub mod disasm;
pub mod error;
pub mod protocol;
pub mod session;
pub mod ui;

pub use error::{ErrorKind, OperationError, ProtocolError, Result};

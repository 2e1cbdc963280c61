//! Core module - target backends and the provider built on them
//!
//! This module contains the OS-facing [`TargetBackend`] implementations
//! and the [`Provider`] that sessions call into.

pub mod backend;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;
pub mod provider;
pub mod simulated;

// Re-export common types
pub use backend::{BackendError, BackendResult, TargetBackend};
#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;
pub use provider::{CancelToken, Provider};
pub use simulated::SimulatedBackend;

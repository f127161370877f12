//! Kernel-wide error types.
//!
//! Every recoverable failure in the kernel is reported through
//! [`KernelError`]; structural invariant violations (corrupted scheduler
//! list, bad Ring-3 selectors) panic instead and halt the machine.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },
    AlreadyMapped {
        addr: usize,
    },
    /// A mapping verification pass found a page without the required flags
    MappingVerification {
        addr: usize,
    },

    /// Task / scheduler errors
    TaskNotFound {
        id: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Hardware errors
    HardwareError {
        device: &'static str,
        code: u32,
    },
    Timeout {
        operation: &'static str,
    },

    /// Executable loading errors
    BadExecutable {
        reason: &'static str,
    },

    /// I/O through the VFS collaborator failed
    IoError {
        operation: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at 0x{:x}", addr),
            Self::AlreadyMapped { addr } => {
                write!(f, "Address 0x{:x} is already mapped to another frame", addr)
            }
            Self::MappingVerification { addr } => {
                write!(f, "Mapping verification failed at 0x{:x}", addr)
            }
            Self::TaskNotFound { id } => write!(f, "Task {} not found", id),
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::HardwareError { device, code } => {
                write!(f, "Hardware error on {}: code 0x{:x}", device, code)
            }
            Self::Timeout { operation } => write!(f, "Timeout during {}", operation),
            Self::BadExecutable { reason } => write!(f, "Bad executable: {}", reason),
            Self::IoError { operation } => write!(f, "I/O error during {}", operation),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

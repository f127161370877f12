//! Ember Kernel Library
//!
//! Core of a 32-bit x86 kernel: the two-level paging MMU, the preemptive
//! task scheduler with its Ring-0 to Ring-3 path, the AHCI/SATA storage
//! engine and the ELF32/flat executable loader, plus the DMA buffer pool
//! and MMIO plumbing they share.
//!
//! The library is `no_std`. On hosted targets (anything with an OS) it
//! links `std` and uses the system allocator so the unit-test suite runs
//! under the standard harness; only the inline-assembly paths are
//! excluded there.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal: the kernel heap backs the global allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod loader;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod timer;
pub mod vfs;

#[cfg(test)]
mod test_support;

// Re-exports for the boot binary and external users.
pub use error::{KernelError, KernelResult};
pub use mm::{PageFlags, PhysAddr, VirtAddr};
pub use sched::{Priority, Task, TaskId, TaskState};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}

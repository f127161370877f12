//! Kernel heap bring-up.
//!
//! The heap lives inside the kernel identity window and feeds the global
//! `linked_list_allocator` instance declared in `lib.rs`. Hosted builds
//! use the system allocator instead and this module is a no-op there.

/// Virtual base of the kernel heap (inside the identity window).
pub const HEAP_START: usize = 0xC800_0000;
/// Heap size: 64 MiB.
pub const HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Hand the heap region to the global allocator.
///
/// # Safety
///
/// Must be called exactly once, after paging has the identity window
/// active, and the region must not be used for anything else.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn init() {
    // SAFETY: The caller guarantees the region is mapped and exclusive.
    unsafe {
        crate::ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
    println!(
        "[MM] Kernel heap: {:#x} .. {:#x} ({} MiB)",
        HEAP_START,
        HEAP_START + HEAP_SIZE,
        HEAP_SIZE / (1024 * 1024)
    );
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() {}

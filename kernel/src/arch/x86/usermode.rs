//! Ring-0 to Ring-3 transition.
//!
//! `enter_usermode` builds an IRET frame on the current kernel stack and
//! executes `iretd`, dropping to Ring 3. It never returns; the user
//! program leaves only through an interrupt or system call gate.

use crate::arch::context::{CpuContext, USER_CS, USER_DS};

/// Drop to Ring 3 at `ctx.eip` with `ctx.esp` as the user stack.
///
/// Panics if the context's CS/SS are not Ring-3 selectors; entering user
/// mode with kernel selectors is a structural invariant violation.
///
/// # Safety
///
/// - `ctx.eip` must point at mapped, user-accessible code.
/// - `ctx.esp` must point into a mapped, user-writable stack.
/// - The active page directory must contain the user mappings.
pub unsafe fn enter_usermode(ctx: &CpuContext) -> ! {
    assert!(
        ctx.cs & 0x3 == 3 && ctx.ss & 0x3 == 3,
        "usermode entry with non-Ring-3 selectors (cs={:#x} ss={:#x})",
        ctx.cs,
        ctx.ss
    );

    // SAFETY: The iretd frame is built on the current kernel stack with
    // the caller-guaranteed user EIP/ESP; data selectors are loaded with
    // the user data segment before the transition.
    unsafe {
        core::arch::asm!(
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov fs, {sel:x}",
            "mov gs, {sel:x}",
            // iretd pops EIP, CS, EFLAGS, ESP, SS.
            "push {ss}",
            "push {esp}",
            "push {eflags}",
            "push {cs}",
            "push {eip}",
            "iretd",
            sel = in(reg) USER_DS as u32,
            ss = in(reg) USER_DS as u32,
            esp = in(reg) ctx.esp,
            eflags = in(reg) ctx.eflags,
            cs = in(reg) USER_CS as u32,
            eip = in(reg) ctx.eip,
            options(noreturn)
        );
    }
}

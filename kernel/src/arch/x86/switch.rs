//! i386 context switch.
//!
//! `context_switch` saves the callee-saved registers, ESP, a resume EIP
//! and EFLAGS of the outgoing task into its [`CpuContext`], then loads the
//! incoming task's context and jumps to its EIP. EFLAGS travels with the
//! context so the interrupt-disable state at the switch point is restored
//! when the outgoing task is resumed. Callers must hold interrupts off.

use crate::arch::context::CpuContext;

/// Switch from `old` to `new`.
///
/// Returns (into `old`'s saved EIP) when `old` is scheduled again.
///
/// # Safety
///
/// - Both pointers must reference live, distinct `CpuContext` records.
/// - Interrupts must be disabled around the call.
/// - `new` must describe either a previously saved context or a freshly
///   prepared one whose EIP/ESP are valid to enter.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut CpuContext, new: *const CpuContext) {
    // Field offsets into CpuContext (checked by a unit test):
    //   edi=0 esi=4 ebx=8 ebp=12 esp=16 eip=20 eflags=24
    core::arch::naked_asm!(
        "mov eax, [esp + 4]", // old
        "mov edx, [esp + 8]", // new
        // Save outgoing callee-saved registers.
        "mov [eax + 0], edi",
        "mov [eax + 4], esi",
        "mov [eax + 8], ebx",
        "mov [eax + 12], ebp",
        // Save outgoing ESP and a resume EIP pointing at the ret below.
        "mov [eax + 16], esp",
        "lea ecx, [2f]",
        "mov [eax + 20], ecx",
        // Save outgoing EFLAGS (preserves the IF state across the switch).
        "pushfd",
        "pop ecx",
        "mov [eax + 24], ecx",
        // Switch stacks, then load the incoming EFLAGS from the new stack.
        "mov esp, [edx + 16]",
        "push dword ptr [edx + 24]",
        "popfd",
        // Load incoming callee-saved registers.
        "mov edi, [edx + 0]",
        "mov esi, [edx + 4]",
        "mov ebx, [edx + 8]",
        "mov ebp, [edx + 12]",
        // Jump to the incoming EIP (trampoline for fresh tasks, the
        // resume label below for previously switched-out ones).
        "jmp dword ptr [edx + 20]",
        "2:",
        "ret",
    );
}

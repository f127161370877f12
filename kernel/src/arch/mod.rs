//! Architecture support.
//!
//! The kernel targets 32-bit x86. Everything that touches inline assembly
//! lives under [`x86`] and is compiled only for that target; the shims in
//! this module degrade to no-ops on hosted builds so the rest of the
//! kernel (and its unit tests) stays target-independent.

pub mod context;

#[cfg(target_arch = "x86")]
pub mod x86;

/// Run `f` with interrupts disabled, restoring the previous interrupt
/// flag afterwards (pushf/cli/popf discipline).
pub fn without_interrupts<R, F: FnOnce() -> R>(f: F) -> R {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let flags = x86::save_and_disable_interrupts();
        let result = f();
        x86::restore_interrupts(flags);
        result
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        f()
    }
}

/// Invalidate the TLB entry covering `virt`.
pub fn flush_tlb_entry(virt: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::flush_tlb(virt);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = virt;
}

/// Halt until the next interrupt.
pub fn halt() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::halt();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    core::hint::spin_loop();
}

/// Halt forever with interrupts disabled. Terminal state for panics and
/// structural invariant violations.
pub fn halt_forever() -> ! {
    loop {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        x86::disable_interrupts_and_halt();
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        core::hint::spin_loop();
    }
}

/// Signal end-of-interrupt for the given IRQ line.
pub fn end_of_interrupt(irq: u8) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::end_of_interrupt(irq);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = irq;
}

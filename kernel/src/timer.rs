//! Tick accounting for the 100 Hz scheduler timer.
//!
//! The hardware timer (PIT or APIC timer, programmed by the interrupt
//! layer) fires every 10 ms. Each tick advances the monotonic counter and
//! drives the scheduler; `sleep_until_tick` math everywhere derives from
//! [`MS_PER_TICK`], so changing the tick rate scales the sleep arithmetic
//! with it.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler timer frequency.
pub const TICK_HZ: u64 = 100;
/// Milliseconds per tick.
pub const MS_PER_TICK: u64 = 1000 / TICK_HZ;

/// Timer IRQ line (vector 32 after remap).
pub const TIMER_IRQ: u8 = 0;

/// Monotonic tick counter, incremented by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter by one and return the new value.
pub fn advance() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Convert a sleep duration to ticks: `ceil(ms / MS_PER_TICK)`, at least
/// one full tick.
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(MS_PER_TICK).max(1)
}

/// Timer interrupt body: bump the counter, run the scheduler tick, then
/// acknowledge the IRQ.
pub fn timer_interrupt() {
    let now = advance();
    crate::sched::scheduler::on_tick(now);
    crate::arch::end_of_interrupt(TIMER_IRQ);
}

//! MMIO window management.
//!
//! Paging is on, so drivers must not touch raw physical addresses. A
//! request for a physical range gets a stable virtual address inside the
//! kernel-reserved window [`MMIO_BASE`] .. `MMIO_BASE + MMIO_WINDOW_SIZE`,
//! mapped present + writable + cache-disabled. Requests for the same
//! physical base return the same virtual address.

use alloc::vec::Vec;
use core::cell::UnsafeCell;

use spin::Mutex;

use super::{
    align_down_4k, align_up_4k, paging::AddressSpace, PageFlags, PhysAddr, VirtAddr, MMIO_BASE,
    MMIO_WINDOW_SIZE, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// A 32-bit memory-mapped hardware register.
///
/// Every access is a volatile load or store, so reads and writes are
/// sequenced hardware effects and never elided or reordered against each
/// other by the compiler.
#[repr(transparent)]
pub struct Mmio32(UnsafeCell<u32>);

impl Mmio32 {
    pub const fn new(value: u32) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Read the register.
    pub fn read(&self) -> u32 {
        // SAFETY: &self guarantees the cell's memory is valid; volatile
        // reads of device registers have no memory-safety side effects.
        unsafe { core::ptr::read_volatile(self.0.get()) }
    }

    /// Write the register.
    pub fn write(&self, value: u32) {
        // SAFETY: As in `read`; hardware semantics of the store are the
        // caller's business.
        unsafe { core::ptr::write_volatile(self.0.get(), value) }
    }

    /// Read-modify-write.
    pub fn update(&self, f: impl FnOnce(u32) -> u32) {
        self.write(f(self.read()));
    }
}

// SAFETY: Mmio32 is a plain 32-bit cell; cross-thread access ordering is
// the hardware's concern and the kernel serializes driver access.
unsafe impl Send for Mmio32 {}
// SAFETY: As above.
unsafe impl Sync for Mmio32 {}

struct MmioMapping {
    phys_base: PhysAddr,
    virt_base: VirtAddr,
    pages: usize,
}

/// Allocator for the kernel MMIO virtual window.
pub struct MmioWindow {
    next: u32,
    mappings: Vec<MmioMapping>,
}

impl MmioWindow {
    pub const fn new() -> Self {
        Self {
            next: MMIO_BASE,
            mappings: Vec::new(),
        }
    }

    /// Return a virtual window covering physical [phys, phys + size).
    ///
    /// Repeated calls for the same physical base return the same virtual
    /// address. New ranges are mapped into `space` cache-disabled.
    pub fn ensure_physical_accessible(
        &mut self,
        space: &mut AddressSpace,
        phys: PhysAddr,
        size: usize,
    ) -> KernelResult<VirtAddr> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }

        let phys_base = PhysAddr::new(align_down_4k(phys.as_u32()));
        let offset = phys.as_u32() - phys_base.as_u32();
        let span = align_up_4k(offset + size as u32) as usize;
        let pages = span / PAGE_SIZE;

        for mapping in &self.mappings {
            if mapping.phys_base == phys_base && pages <= mapping.pages {
                return Ok(mapping.virt_base.add(offset));
            }
        }

        let end = MMIO_BASE as u64 + MMIO_WINDOW_SIZE as u64;
        if self.next as u64 + span as u64 > end {
            return Err(KernelError::ResourceExhausted {
                resource: "mmio window",
            });
        }

        let virt_base = VirtAddr::new(self.next);
        space.map_region(virt_base, phys_base, pages, PageFlags::mmio())?;
        self.next += span as u32;
        self.mappings.push(MmioMapping {
            phys_base,
            virt_base,
            pages,
        });

        log::debug!(
            "mmio: phys {:#x}+{:#x} -> virt {:#x}",
            phys_base.as_u32(),
            span,
            virt_base.as_u32()
        );
        Ok(virt_base.add(offset))
    }
}

/// Global MMIO window, shared by every driver.
static MMIO_WINDOW: Mutex<MmioWindow> = Mutex::new(MmioWindow::new());

/// Map a physical range through the global window and the kernel address
/// space. Drivers call this with a BAR value and get back a pointer-safe
/// virtual base.
pub fn ensure_physical_accessible(phys: PhysAddr, size: usize) -> KernelResult<VirtAddr> {
    crate::arch::without_interrupts(|| {
        let mut space = super::paging::kernel_space().lock();
        MMIO_WINDOW
            .lock()
            .ensure_physical_accessible(&mut space, phys, size)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_physical_base_returns_same_virtual() {
        let mut space = AddressSpace::new_kernel().expect("kernel space");
        let mut window = MmioWindow::new();

        let a = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEB0_0000), 0x2000)
            .expect("first map");
        let b = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEB0_0000), 0x2000)
            .expect("second map");
        assert_eq!(a, b);
        assert_eq!(a.as_u32(), MMIO_BASE);
    }

    #[test]
    fn mappings_are_uncached_and_cover_the_range() {
        let mut space = AddressSpace::new_kernel().expect("kernel space");
        let mut window = MmioWindow::new();

        let virt = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEB0_0000), 0x1800)
            .expect("map");
        for page in 0..2 {
            let flags = space
                .get_flags(virt.add(page * PAGE_SIZE as u32))
                .expect("mapped");
            assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_CACHE));
        }
        assert_eq!(
            space.virt_to_phys(virt),
            Some(PhysAddr::new(0xFEB0_0000))
        );
    }

    #[test]
    fn unaligned_physical_base_keeps_its_offset() {
        let mut space = AddressSpace::new_kernel().expect("kernel space");
        let mut window = MmioWindow::new();

        let virt = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEB0_0080), 0x100)
            .expect("map");
        assert_eq!(virt.page_offset(), 0x80);
        assert_eq!(
            space.virt_to_phys(virt),
            Some(PhysAddr::new(0xFEB0_0080))
        );
    }

    #[test]
    fn distinct_ranges_get_distinct_windows() {
        let mut space = AddressSpace::new_kernel().expect("kernel space");
        let mut window = MmioWindow::new();

        let a = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEB0_0000), 0x1000)
            .expect("map a");
        let b = window
            .ensure_physical_accessible(&mut space, PhysAddr::new(0xFEC0_0000), 0x1000)
            .expect("map b");
        assert_ne!(a, b);
    }

    #[test]
    fn mmio32_read_write_round_trip() {
        let reg = Mmio32::new(0);
        reg.write(0xDEAD_BEE0);
        assert_eq!(reg.read(), 0xDEAD_BEE0);
        reg.update(|v| v | 1);
        assert_eq!(reg.read(), 0xDEAD_BEE1);
    }
}

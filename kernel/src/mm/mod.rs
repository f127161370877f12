//! Memory management: 32-bit two-level paging, the MMIO window, the user
//! page manager and the kernel heap.

pub mod heap;
pub mod mmio;
pub mod paging;
pub mod user;

use bitflags::bitflags;

/// Size of a 4 KiB page.
pub const PAGE_SIZE: usize = 4096;
/// Size of a 4 MiB large page (kernel identity window only).
pub const LARGE_PAGE_SIZE: usize = 4 * 1024 * 1024;

/// Base of the always-present kernel identity window.
pub const KERNEL_BASE: u32 = 0xC000_0000;
/// Size of the kernel identity window (phys 0 .. this, in 4 MiB pages).
pub const KERNEL_WINDOW_SIZE: u32 = 0x2000_0000;

/// Base of the kernel-reserved MMIO virtual window.
pub const MMIO_BASE: u32 = 0xE000_0000;
/// Size of the MMIO virtual window.
pub const MMIO_WINDOW_SIZE: u32 = 0x1000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Physical frame number (address >> 12).
    pub const fn frame(&self) -> u32 {
        self.0 >> 12
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn add(&self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub const fn align_down(&self) -> Self {
        Self(align_down_4k(self.0))
    }

    pub const fn page_offset(&self) -> u32 {
        self.0 & (PAGE_SIZE as u32 - 1)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

/// Align an address down to a 4 KiB boundary.
pub const fn align_down_4k(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

/// Align an address up to a 4 KiB boundary.
pub const fn align_up_4k(addr: u32) -> u32 {
    (addr.wrapping_add(PAGE_SIZE as u32 - 1)) & !(PAGE_SIZE as u32 - 1)
}

bitflags! {
    /// Page directory / page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

impl PageFlags {
    /// The flag triple every user mapping must carry.
    pub fn user_rw() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER
    }

    /// Flags for an MMIO mapping: present, writable, uncached.
    pub fn mmio() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::NO_CACHE
    }
}

/// Translate a kernel-window virtual address to physical.
///
/// The identity window maps `KERNEL_BASE + p` to physical `p`; anything
/// outside the window has no direct physical counterpart.
pub fn kernel_virt_to_phys(virt: usize) -> Option<PhysAddr> {
    let base = KERNEL_BASE as u64;
    let v = virt as u64;
    if (base..base + KERNEL_WINDOW_SIZE as u64).contains(&v) {
        Some(PhysAddr::new((v - base) as u32))
    } else {
        None
    }
}

/// Translate a physical address into the kernel identity window.
pub fn phys_to_kernel_virt(phys: PhysAddr) -> Option<VirtAddr> {
    if phys.as_u32() < KERNEL_WINDOW_SIZE {
        Some(VirtAddr::new(KERNEL_BASE + phys.as_u32()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down_4k(0x1234), 0x1000);
        assert_eq!(align_up_4k(0x1234), 0x2000);
        assert_eq!(align_down_4k(0x1000), 0x1000);
        assert_eq!(align_up_4k(0x1000), 0x1000);
        assert_eq!(align_up_4k(0), 0);
    }

    #[test]
    fn kernel_window_translation_round_trips() {
        let phys = PhysAddr::new(0x0010_0000);
        let virt = phys_to_kernel_virt(phys).unwrap();
        assert_eq!(virt.as_u32(), 0xC010_0000);
        assert_eq!(kernel_virt_to_phys(virt.as_usize()), Some(phys));
        assert_eq!(kernel_virt_to_phys(0x1000), None);
        assert_eq!(phys_to_kernel_virt(PhysAddr::new(0x2000_0000)), None);
    }
}

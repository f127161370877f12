//! User page manager.
//!
//! Maps user regions with the PRESENT | WRITABLE | USER triple, patches
//! USER onto pages an earlier kernel mapping already claimed, and copies
//! kernel buffers into user memory. The [`UserMemory`] trait is the seam
//! the loader and scheduler write user memory through; on bare metal the
//! implementation is [`KernelUserMemory`], which performs the raw copies
//! after checking page flags.

use alloc::vec::Vec;

use super::{
    paging::AddressSpace, PageFlags, PhysAddr, VirtAddr, KERNEL_BASE, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Lowest valid user virtual address (2 MiB).
pub const USER_BASE: u32 = 0x0020_0000;
/// First address above the user window (3 GiB).
pub const USER_LIMIT: u32 = KERNEL_BASE;

/// Number of leading destination bytes re-compared after `copy_to_user`.
#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
const COPY_SMOKE_BYTES: usize = 16;

/// Whether `addr` lies inside the user window.
pub const fn is_user_addr(addr: u32) -> bool {
    addr >= USER_BASE && addr < USER_LIMIT
}

/// Writable view of user memory.
///
/// The kernel implementation writes through the shared address space;
/// tests substitute a sparse in-memory implementation so loader and
/// scheduler logic runs on the host.
pub trait UserMemory {
    /// Map `[start, start + size)` user-accessible, read-write.
    fn map_region(&mut self, start: VirtAddr, size: usize, label: &str) -> KernelResult<()>;

    /// Ensure the page holding `page` is user-accessible (patching USER
    /// onto an existing kernel mapping if needed).
    fn ensure_user(&mut self, page: VirtAddr) -> KernelResult<()>;

    /// Copy bytes into user memory.
    fn copy_out(&mut self, dst: VirtAddr, src: &[u8]) -> KernelResult<()>;

    /// Zero a span of user memory.
    fn zero(&mut self, dst: VirtAddr, len: usize) -> KernelResult<()>;

    /// Read bytes back from user memory.
    fn read_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()>;

    /// Read a little-endian u32 from user memory.
    fn read_u32(&self, addr: VirtAddr) -> KernelResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_in(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32 into user memory.
    fn write_u32(&mut self, addr: VirtAddr, value: u32) -> KernelResult<()> {
        self.copy_out(addr, &value.to_le_bytes())
    }
}

/// Map a user region into `space` with PRESENT | WRITABLE | USER.
///
/// Pages already mapped without USER are patched in place, not remapped.
/// After mapping, a verification pass re-reads the flags of every page
/// and fails unless all three bits are set; this is mandatory and catches
/// directory/table state left inconsistent by earlier kernel mappings.
pub fn map_user_region(
    space: &mut AddressSpace,
    start: VirtAddr,
    size: usize,
    label: &str,
) -> KernelResult<()> {
    if size == 0 {
        return Err(KernelError::InvalidArgument {
            name: "size",
            value: "zero",
        });
    }
    let first = start.align_down();
    let end = start.as_u32().checked_add(size as u32 - 1).ok_or(
        KernelError::InvalidAddress {
            addr: start.as_usize(),
        },
    )?;
    if !is_user_addr(first.as_u32()) || !is_user_addr(end) {
        return Err(KernelError::InvalidAddress {
            addr: start.as_usize(),
        });
    }

    let pages = ((end - first.as_u32()) as usize / PAGE_SIZE) + 1;
    for i in 0..pages {
        let page = first.add((i * PAGE_SIZE) as u32);
        match space.get_flags(page) {
            Some(flags) if !flags.contains(PageFlags::USER) => {
                space.set_page_user(page)?;
                space.set_flags(page, PageFlags::WRITABLE)?;
            }
            Some(_) => {}
            None => {
                // User pages are backed identity inside the user window.
                space.map_page(page, PhysAddr::new(page.as_u32()), PageFlags::user_rw())?;
            }
        }
    }

    // Verification pass: every page must now carry the full triple.
    for i in 0..pages {
        let page = first.add((i * PAGE_SIZE) as u32);
        let flags = space.get_flags(page).unwrap_or(PageFlags::empty());
        if !flags.contains(PageFlags::user_rw()) {
            log::error!(
                "user region '{}': page {:#x} failed verification (flags {:?})",
                label,
                page.as_u32(),
                flags
            );
            return Err(KernelError::MappingVerification {
                addr: page.as_usize(),
            });
        }
    }
    Ok(())
}

/// Check that every destination page of `[dst, dst + len)` is writable at
/// user privilege.
pub fn check_user_writable(space: &AddressSpace, dst: VirtAddr, len: usize) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let mut page = dst.align_down();
    let end = dst.as_u32() + (len as u32 - 1);
    loop {
        let flags = space.get_flags(page).unwrap_or(PageFlags::empty());
        if !flags.contains(PageFlags::user_rw()) {
            return Err(KernelError::MappingVerification {
                addr: page.as_usize(),
            });
        }
        if page.as_u32() + (PAGE_SIZE as u32 - 1) >= end {
            break;
        }
        page = page.add(PAGE_SIZE as u32);
    }
    Ok(())
}

/// Copy a kernel buffer into user memory, page-sized chunk by chunk.
///
/// Each destination page is checked for user-writability before anything
/// is written. After the copy the first [`COPY_SMOKE_BYTES`] destination
/// bytes are compared back against the source as a smoke test.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn copy_to_user(space: &AddressSpace, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
    check_user_writable(space, dst, src.len())?;

    let mut copied = 0usize;
    while copied < src.len() {
        let page_room = PAGE_SIZE - (dst.as_usize() + copied) % PAGE_SIZE;
        let chunk = page_room.min(src.len() - copied);
        // SAFETY: The destination span was verified mapped user-writable
        // above; source and destination cannot overlap because the source
        // is a kernel-heap buffer outside the user window.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                (dst.as_usize() + copied) as *mut u8,
                chunk,
            );
        }
        copied += chunk;
    }

    let probe = src.len().min(COPY_SMOKE_BYTES);
    // SAFETY: The destination was just written and remains mapped.
    let written = unsafe { core::slice::from_raw_parts(dst.as_usize() as *const u8, probe) };
    if written != &src[..probe] {
        return Err(KernelError::HardwareError {
            device: "memory",
            code: dst.as_u32(),
        });
    }
    Ok(())
}

/// User-memory backend over the kernel address space.
pub struct KernelUserMemory<'a> {
    space: &'a mut AddressSpace,
}

impl<'a> KernelUserMemory<'a> {
    pub fn new(space: &'a mut AddressSpace) -> Self {
        Self { space }
    }
}

impl UserMemory for KernelUserMemory<'_> {
    fn map_region(&mut self, start: VirtAddr, size: usize, label: &str) -> KernelResult<()> {
        map_user_region(self.space, start, size, label)
    }

    fn ensure_user(&mut self, page: VirtAddr) -> KernelResult<()> {
        let page = page.align_down();
        match self.space.get_flags(page) {
            None => Err(KernelError::UnmappedMemory {
                addr: page.as_usize(),
            }),
            Some(flags) if flags.contains(PageFlags::USER) => Ok(()),
            Some(_) => self.space.set_page_user(page),
        }
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn copy_out(&mut self, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
        copy_to_user(self.space, dst, src)
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn copy_out(&mut self, _dst: VirtAddr, _src: &[u8]) -> KernelResult<()> {
        // Raw user-memory writes exist only on the bare-metal target.
        Err(KernelError::NotInitialized {
            subsystem: "user memory",
        })
    }

    fn zero(&mut self, dst: VirtAddr, len: usize) -> KernelResult<()> {
        let zeros = [0u8; 256];
        let mut off = 0usize;
        while off < len {
            let chunk = (len - off).min(zeros.len());
            self.copy_out(dst.add(off as u32), &zeros[..chunk])?;
            off += chunk;
        }
        Ok(())
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn read_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
        if !self.space.is_mapped(src) {
            return Err(KernelError::UnmappedMemory {
                addr: src.as_usize(),
            });
        }
        // SAFETY: The source page is mapped; the span stays within the
        // user window checked by the caller's mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_usize() as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn read_in(&self, _src: VirtAddr, _dst: &mut [u8]) -> KernelResult<()> {
        Err(KernelError::NotInitialized {
            subsystem: "user memory",
        })
    }
}

/// Collect the flag state of a user region, for diagnostics.
pub fn region_flags(space: &AddressSpace, start: VirtAddr, pages: usize) -> Vec<Option<PageFlags>> {
    (0..pages)
        .map(|i| space.get_flags(start.add((i * PAGE_SIZE) as u32)))
        .collect()
}

//! Two-level 32-bit paging: page directory, page tables and the
//! [`AddressSpace`] object that owns them.
//!
//! Table memory is owned by the address space (boxed, arena style) rather
//! than reached through raw physical pointers; the directory entries still
//! carry the physical frame numbers the hardware consumes. The kernel
//! identity window [`KERNEL_BASE`] .. `KERNEL_BASE + KERNEL_WINDOW_SIZE`
//! is built from 4 MiB large pages and is present in every address space.

use alloc::{boxed::Box, vec::Vec};
use core::{
    alloc::Layout,
    ops::{Index, IndexMut},
    ptr::NonNull,
};

use super::{
    align_down_4k, PageFlags, PhysAddr, VirtAddr, KERNEL_BASE, KERNEL_WINDOW_SIZE, LARGE_PAGE_SIZE,
    PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page directory or page table.
pub const TABLE_ENTRIES: usize = 1024;

/// First directory index of the kernel identity window.
pub const KERNEL_DIR_INDEX: usize = (KERNEL_BASE >> 22) as usize;

/// Directory index for a virtual address.
pub const fn dir_index(virt: VirtAddr) -> usize {
    (virt.as_u32() >> 22) as usize
}

/// Table index for a virtual address.
pub const fn table_index(virt: VirtAddr) -> usize {
    ((virt.as_u32() >> 12) & 0x3FF) as usize
}

/// Page directory / page table entry: 20-bit frame number plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Create an empty/unused entry
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_large(&self) -> bool {
        self.0 & PageFlags::LARGE.bits() != 0
    }

    /// Physical frame number this entry points to.
    pub const fn frame(&self) -> u32 {
        self.0 >> 12
    }

    /// Physical address this entry points to.
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & 0xFFFF_F000)
    }

    /// Flags of this entry.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    /// Point this entry at a frame with the given flags.
    pub fn set(&mut self, frame: u32, flags: PageFlags) {
        self.0 = (frame << 12) | flags.bits();
    }

    pub fn set_addr(&mut self, addr: PhysAddr, flags: PageFlags) {
        self.set(addr.frame(), flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Raw entry value as the hardware sees it.
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// A page table (or page directory) with 1024 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Allocate a zeroed page table from the kernel heap, failing cleanly on
/// exhaustion instead of aborting.
fn try_alloc_table() -> KernelResult<Box<PageTable>> {
    let layout = Layout::new::<PageTable>();
    // SAFETY: The layout of PageTable has non-zero size.
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut PageTable;
    if ptr.is_null() {
        return Err(KernelError::OutOfMemory {
            requested: layout.size(),
        });
    }
    // SAFETY: `ptr` was just allocated with PageTable's layout and zeroed;
    // all-zero bits are a valid PageTable (every entry empty).
    Ok(unsafe { Box::from_raw(ptr) })
}

/// Reference to a second-level table: owned by this address space, or
/// shared from the kernel address space (`copy_kernel_mappings`).
enum TableSlot {
    None,
    Owned(Box<PageTable>),
    Shared(SharedTable),
}

/// Non-owning pointer to a kernel-owned page table.
///
/// The kernel address space is 'static and tables are only mutated with
/// interrupts disabled, so sharing its tables into user address spaces is
/// sound under the kernel's single-mutator discipline.
struct SharedTable(NonNull<PageTable>);

// SAFETY: See the SharedTable invariant above; access is serialized by the
// interrupts-off discipline around every page-table mutation.
unsafe impl Send for SharedTable {}
// SAFETY: As above.
unsafe impl Sync for SharedTable {}

/// A 32-bit two-level address space.
pub struct AddressSpace {
    directory: Box<PageTable>,
    tables: Vec<TableSlot>,
    is_kernel: bool,
}

impl AddressSpace {
    /// Create an empty address space (no kernel window).
    pub fn new() -> KernelResult<Self> {
        let directory = try_alloc_table()?;
        let mut tables = Vec::new();
        tables.resize_with(TABLE_ENTRIES, || TableSlot::None);
        Ok(Self {
            directory,
            tables,
            is_kernel: false,
        })
    }

    /// Create the kernel address space: identity window mapped with 4 MiB
    /// global pages, everything else empty.
    pub fn new_kernel() -> KernelResult<Self> {
        let mut space = Self::new()?;
        space.is_kernel = true;

        let window_flags =
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::LARGE | PageFlags::GLOBAL;
        let large_pages = (KERNEL_WINDOW_SIZE as usize / LARGE_PAGE_SIZE) as u32;
        for i in 0..large_pages {
            let phys = PhysAddr::new(i * LARGE_PAGE_SIZE as u32);
            space.directory[KERNEL_DIR_INDEX + i as usize].set_addr(phys, window_flags);
        }
        Ok(space)
    }

    pub const fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Physical address of the page directory (CR3 value).
    pub fn directory_phys(&self) -> PhysAddr {
        let addr = &*self.directory as *const PageTable as usize;
        match super::kernel_virt_to_phys(addr) {
            Some(phys) => phys,
            // Off-target (hosted tests) the directory is an opaque token.
            None => PhysAddr::new((addr as u64 & 0xFFFF_F000) as u32),
        }
    }

    fn table(&self, idx: usize) -> Option<&PageTable> {
        match &self.tables[idx] {
            TableSlot::None => None,
            TableSlot::Owned(table) => Some(table),
            // SAFETY: Shared tables point into the 'static kernel address
            // space (SharedTable invariant).
            TableSlot::Shared(ptr) => Some(unsafe { ptr.0.as_ref() }),
        }
    }

    fn table_mut(&mut self, idx: usize) -> Option<&mut PageTable> {
        match &mut self.tables[idx] {
            TableSlot::None => None,
            TableSlot::Owned(table) => Some(table),
            // SAFETY: Shared tables point into the 'static kernel address
            // space; mutation is serialized by the interrupts-off rule.
            TableSlot::Shared(ptr) => Some(unsafe { &mut *ptr.0.as_ptr() }),
        }
    }

    /// Map one 4 KiB page.
    ///
    /// Fails if the page is already mapped to a different frame; remapping
    /// the same frame updates the flags. The TLB entry is invalidated.
    pub fn map_page(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> KernelResult<()> {
        let virt = virt.align_down();
        let phys = PhysAddr::new(align_down_4k(phys.as_u32()));
        let dir = dir_index(virt);

        if self.directory[dir].is_large() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_usize(),
            });
        }

        let mut dir_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if flags.contains(PageFlags::USER) {
            dir_flags |= PageFlags::USER;
        }

        if matches!(self.tables[dir], TableSlot::None) {
            let table = try_alloc_table()?;
            self.directory[dir].set_addr(table_phys(&table), dir_flags);
            self.tables[dir] = TableSlot::Owned(table);
        } else if flags.contains(PageFlags::USER) {
            // Propagate USER to the directory entry, or the leaf flag is
            // ineffective.
            let entry = &mut self.directory[dir];
            let raw_flags = entry.flags() | PageFlags::USER;
            entry.set(entry.frame(), raw_flags);
        }

        let tidx = table_index(virt);
        let table = self
            .table_mut(dir)
            .expect("directory entry present without table");
        let entry = &mut table[tidx];
        if entry.is_present() && entry.frame() != phys.frame() {
            return Err(KernelError::AlreadyMapped {
                addr: virt.as_usize(),
            });
        }
        entry.set(phys.frame(), flags | PageFlags::PRESENT);

        crate::arch::flush_tlb_entry(virt.as_usize());
        Ok(())
    }

    /// Unmap one 4 KiB page and invalidate its TLB entry.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> KernelResult<()> {
        let virt = virt.align_down();
        let dir = dir_index(virt);

        if self.directory[dir].is_large() {
            return Err(KernelError::InvalidAddress {
                addr: virt.as_usize(),
            });
        }

        let tidx = table_index(virt);
        let entry = self
            .table_mut(dir)
            .map(|table| &mut table[tidx])
            .filter(|entry| entry.is_present())
            .ok_or(KernelError::UnmappedMemory {
                addr: virt.as_usize(),
            })?;
        entry.clear();

        crate::arch::flush_tlb_entry(virt.as_usize());
        Ok(())
    }

    /// Map `count` consecutive pages. Atomic: if any page fails, pages
    /// already mapped by this call are unmapped before the error returns.
    pub fn map_region(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        for i in 0..count {
            let page = virt.add((i * PAGE_SIZE) as u32);
            let frame = PhysAddr::new(phys.as_u32() + (i * PAGE_SIZE) as u32);
            if let Err(err) = self.map_page(page, frame, flags) {
                for j in (0..i).rev() {
                    let _ = self.unmap_page(virt.add((j * PAGE_SIZE) as u32));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmap `count` consecutive pages.
    pub fn unmap_region(&mut self, virt: VirtAddr, count: usize) -> KernelResult<()> {
        for i in 0..count {
            self.unmap_page(virt.add((i * PAGE_SIZE) as u32))?;
        }
        Ok(())
    }

    /// Whether `virt` has a present translation.
    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        let dir = dir_index(virt);
        let dir_entry = self.directory[dir];
        if dir_entry.is_large() {
            return dir_entry.is_present();
        }
        if !dir_entry.is_present() {
            return false;
        }
        self.table(dir)
            .map(|table| table[table_index(virt)].is_present())
            .unwrap_or(false)
    }

    /// Flags of the entry mapping `virt`, if present.
    pub fn get_flags(&self, virt: VirtAddr) -> Option<PageFlags> {
        let dir = dir_index(virt);
        let dir_entry = self.directory[dir];
        if dir_entry.is_large() {
            return dir_entry.is_present().then(|| dir_entry.flags());
        }
        let entry = self.table(dir)?[table_index(virt)];
        entry.is_present().then(|| entry.flags())
    }

    /// Translate a virtual address to physical.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let dir = dir_index(virt);
        let dir_entry = self.directory[dir];
        if dir_entry.is_large() {
            if !dir_entry.is_present() {
                return None;
            }
            let base = dir_entry.addr().as_u32();
            return Some(PhysAddr::new(
                base | (virt.as_u32() & (LARGE_PAGE_SIZE as u32 - 1)),
            ));
        }
        let entry = self.table(dir)?[table_index(virt)];
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::new(entry.addr().as_u32() | virt.page_offset()))
    }

    /// OR flag bits into an existing mapping, preserving the frame.
    pub fn set_flags(&mut self, virt: VirtAddr, flags: PageFlags) -> KernelResult<()> {
        let virt = virt.align_down();
        let dir = dir_index(virt);

        if self.directory[dir].is_large() {
            return Err(KernelError::InvalidAddress {
                addr: virt.as_usize(),
            });
        }

        if flags.contains(PageFlags::USER) {
            let entry = &mut self.directory[dir];
            if entry.is_present() {
                let raw_flags = entry.flags() | PageFlags::USER;
                entry.set(entry.frame(), raw_flags);
            }
        }

        let tidx = table_index(virt);
        let entry = self
            .table_mut(dir)
            .map(|table| &mut table[tidx])
            .filter(|entry| entry.is_present())
            .ok_or(KernelError::UnmappedMemory {
                addr: virt.as_usize(),
            })?;
        let merged = entry.flags() | flags;
        let frame = entry.frame();
        entry.set(frame, merged);

        crate::arch::flush_tlb_entry(virt.as_usize());
        Ok(())
    }

    /// Make an existing mapping user-accessible, preserving its frame.
    pub fn set_page_user(&mut self, virt: VirtAddr) -> KernelResult<()> {
        self.set_flags(virt, PageFlags::USER)
    }

    /// Duplicate every directory entry at or above [`KERNEL_BASE`] into
    /// `target`, sharing this space's page tables rather than copying
    /// them. Every address space sees the same kernel mappings.
    pub fn copy_kernel_mappings(&self, target: &mut AddressSpace) {
        for dir in KERNEL_DIR_INDEX..TABLE_ENTRIES {
            let entry = self.directory[dir];
            if !entry.is_present() {
                continue;
            }
            target.directory[dir] = entry;
            if !entry.is_large() {
                let table = match &self.tables[dir] {
                    TableSlot::Owned(table) => NonNull::from(&**table),
                    TableSlot::Shared(ptr) => ptr.0,
                    TableSlot::None => continue,
                };
                target.tables[dir] = TableSlot::Shared(SharedTable(table));
            }
        }
    }
}

lazy_static::lazy_static! {
    /// The kernel's own address space. Its mappings above [`KERNEL_BASE`]
    /// are shared into every user address space; mutation happens only
    /// with interrupts disabled.
    static ref KERNEL_SPACE: spin::Mutex<AddressSpace> = spin::Mutex::new(
        AddressSpace::new_kernel().expect("kernel address space allocation"),
    );
}

/// Access the kernel address space.
pub fn kernel_space() -> &'static spin::Mutex<AddressSpace> {
    &KERNEL_SPACE
}

/// Physical address of an owned table, as stored in a directory entry.
fn table_phys(table: &PageTable) -> PhysAddr {
    let addr = table as *const PageTable as usize;
    match super::kernel_virt_to_phys(addr) {
        Some(phys) => phys,
        // Off-target the value is an opaque token; the walk goes through
        // the owned boxes, never through this address.
        None => PhysAddr::new((addr as u64 & 0xFFFF_F000) as u32),
    }
}

//! DMA buffer pool.
//!
//! A fixed pool of physically contiguous, alignment-constrained buffers
//! for device command structures and data transfers. Each slot keeps the
//! original (unaligned) allocation so `free` really releases it. Physical
//! addresses are derived through an injected translator: the kernel
//! window math on bare metal, an identity mock in tests.

use alloc::{boxed::Box, vec, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Number of slots in the pool.
pub const DMA_POOL_SLOTS: usize = 128;

/// ISA DMA cannot address memory at or above 16 MiB.
pub const ISA_PHYS_LIMIT: u64 = 16 * 1024 * 1024;

/// ISA DMA transfers must not cross a 64 KiB boundary.
const ISA_BOUNDARY: u64 = 64 * 1024;

/// Virtual-to-physical translation hook.
pub type PhysTranslate = fn(usize) -> Option<u64>;

/// Handle to an allocated DMA buffer. Copyable metadata; the backing
/// memory is owned by the pool slot until `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    virt: usize,
    phys: u64,
    size: usize,
    align: usize,
    slot: u16,
}

impl DmaBuffer {
    pub fn virt_addr(&self) -> usize {
        self.virt
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Raw pointer for device-visible writes.
    ///
    /// # Safety
    ///
    /// The buffer must still be allocated in its pool; the caller must
    /// not write past `size` bytes.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.virt as *mut u8
    }
}

/// Check the ISA DMA constraints for a physical range.
pub fn validate_isa(phys: u64, size: usize) -> KernelResult<()> {
    if phys + size as u64 > ISA_PHYS_LIMIT {
        return Err(KernelError::InvalidAddress { addr: phys as usize });
    }
    if (phys % ISA_BOUNDARY) + size as u64 > ISA_BOUNDARY {
        return Err(KernelError::InvalidAddress { addr: phys as usize });
    }
    Ok(())
}

struct PoolSlot {
    /// Original allocation; dropping it returns the memory.
    backing: Box<[u8]>,
    buffer: DmaBuffer,
}

/// Statistics counters for the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaPoolStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub failures: u64,
    pub slots_in_use: usize,
}

/// Fixed-capacity DMA buffer pool.
pub struct DmaPool {
    slots: Vec<Option<PoolSlot>>,
    translate: PhysTranslate,
    allocations: u64,
    deallocations: u64,
    failures: u64,
}

impl DmaPool {
    pub fn new(translate: PhysTranslate) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(DMA_POOL_SLOTS, || None);
        Self {
            slots,
            translate,
            allocations: 0,
            deallocations: 0,
            failures: 0,
        }
    }

    /// Allocate a buffer of `size` bytes whose physical base is
    /// `align`-aligned.
    pub fn alloc(&mut self, size: usize, align: usize) -> KernelResult<DmaBuffer> {
        self.alloc_inner(size, align, false)
    }

    /// Allocate a buffer that also satisfies the ISA DMA constraints
    /// (below 16 MiB, no 64 KiB boundary crossing).
    pub fn alloc_isa(&mut self, size: usize, align: usize) -> KernelResult<DmaBuffer> {
        self.alloc_inner(size, align, true)
    }

    fn alloc_inner(&mut self, size: usize, align: usize, isa: bool) -> KernelResult<DmaBuffer> {
        if size == 0 {
            self.failures += 1;
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }
        if !align.is_power_of_two() {
            self.failures += 1;
            return Err(KernelError::InvalidArgument {
                name: "align",
                value: "not a power of two",
            });
        }

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.failures += 1;
                return Err(KernelError::ResourceExhausted {
                    resource: "dma buffers",
                });
            }
        };

        // Over-allocate by the alignment, then align the start up.
        let backing = vec![0u8; size + align].into_boxed_slice();
        let raw = backing.as_ptr() as usize;
        let virt = (raw + align - 1) & !(align - 1);

        let phys = match (self.translate)(virt) {
            Some(phys) => phys,
            None => {
                self.failures += 1;
                return Err(KernelError::InvalidAddress { addr: virt });
            }
        };
        if phys & (align as u64 - 1) != 0 {
            self.failures += 1;
            return Err(KernelError::InvalidAddress { addr: virt });
        }
        if isa {
            if let Err(err) = validate_isa(phys, size) {
                self.failures += 1;
                return Err(err);
            }
        }

        let buffer = DmaBuffer {
            virt,
            phys,
            size,
            align,
            slot: slot as u16,
        };
        self.slots[slot] = Some(PoolSlot { backing, buffer });
        self.allocations += 1;
        Ok(buffer)
    }

    /// Release a buffer, dropping the original allocation with it.
    pub fn free(&mut self, buffer: &DmaBuffer) -> KernelResult<()> {
        let slot = buffer.slot as usize;
        let entry = self
            .slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(KernelError::InvalidArgument {
                name: "buffer",
                value: "not allocated",
            })?;
        if entry.buffer.virt != buffer.virt {
            return Err(KernelError::InvalidArgument {
                name: "buffer",
                value: "slot mismatch",
            });
        }
        self.slots[slot] = None;
        self.deallocations += 1;
        Ok(())
    }

    /// Re-derive the physical address of a buffer and compare it with the
    /// recorded one; defends against remapping under a live device.
    pub fn is_valid(&self, buffer: &DmaBuffer) -> bool {
        let Some(entry) = self.slots.get(buffer.slot as usize).and_then(Option::as_ref) else {
            return false;
        };
        entry.buffer.virt == buffer.virt && (self.translate)(buffer.virt) == Some(buffer.phys)
    }

    pub fn stats(&self) -> DmaPoolStats {
        DmaPoolStats {
            allocations: self.allocations,
            deallocations: self.deallocations,
            failures: self.failures,
            slots_in_use: self.slots.iter().filter(|slot| slot.is_some()).count(),
        }
    }
}

/// Global pool used by drivers.
static DMA_POOL: Mutex<Option<DmaPool>> = Mutex::new(None);

/// Initialize the global pool with the kernel-window translator.
pub fn init() {
    let mut pool = DMA_POOL.lock();
    if pool.is_none() {
        *pool = Some(DmaPool::new(kernel_translate));
        println!("[DMA] Pool ready: {} slots", DMA_POOL_SLOTS);
    }
}

fn kernel_translate(virt: usize) -> Option<u64> {
    crate::mm::kernel_virt_to_phys(virt).map(|p| p.as_u64())
}

/// Execute a closure with the global pool (mutable access).
pub fn with_pool<R, F: FnOnce(&mut DmaPool) -> R>(f: F) -> KernelResult<R> {
    let mut pool = DMA_POOL.lock();
    pool.as_mut().map(f).ok_or(KernelError::NotInitialized {
        subsystem: "dma pool",
    })
}

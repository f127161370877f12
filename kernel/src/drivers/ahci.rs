//! AHCI/SATA storage engine.
//!
//! A DMA-driven command dispatcher over the HBA register file: controller
//! discovery and BIOS handoff, per-port bring-up (command list, FIS
//! receive area, command tables), command-slot arbitration against
//! `SACT | CI` plus the software claim flags, H2D FIS construction with
//! LBA28/LBA48 selection, and IRQ acknowledgment. All register access
//! goes through [`Mmio32`] cells inside `#[repr(C)]` register blocks, so
//! every load and store is volatile and bit-exact.
//!
//! Timeouts are bounded spins with injectable limits; on timeout the
//! operation fails cleanly and releases any claimed slot.

use alloc::string::String;
use core::ptr::NonNull;

use spin::Mutex;

use super::{
    dma::{DmaBuffer, DmaPool},
    pci::{self, PciDevice},
};
use crate::{
    error::{KernelError, KernelResult},
    mm::mmio::Mmio32,
};

/// SATA drive signature.
pub const SIG_SATA: u32 = 0x0000_0101;
/// ATAPI device signature.
pub const SIG_ATAPI: u32 = 0xEB14_0101;
/// Enclosure management bridge signature.
pub const SIG_SEMB: u32 = 0xC33C_0101;
/// Port multiplier signature.
pub const SIG_PM: u32 = 0x9669_0101;

// GHC bits.
const GHC_AE: u32 = 1 << 31;
const GHC_IE: u32 = 1 << 1;

// BOHC bits.
const BOHC_BIOS_OWNED: u32 = 1 << 0;
const BOHC_OS_OWNED: u32 = 1 << 1;

// PxCMD bits.
const CMD_ST: u32 = 1 << 0;
const CMD_SUD: u32 = 1 << 1;
const CMD_POD: u32 = 1 << 2;
const CMD_FRE: u32 = 1 << 4;
const CMD_FR: u32 = 1 << 14;
const CMD_CR: u32 = 1 << 15;
const CMD_ICC_MASK: u32 = 0xF << 28;
const CMD_ICC_ACTIVE: u32 = 1 << 28;

// PxIS bits.
const IS_TFES: u32 = 1 << 30;
const IS_PCS: u32 = 1 << 6;

// PxSSTS device detection.
const SSTS_DET_MASK: u32 = 0xF;
const SSTS_DET_PRESENT: u32 = 3;

const FIS_TYPE_REG_H2D: u8 = 0x27;

// ATA command set.
const ATA_READ_DMA: u8 = 0xC8;
const ATA_READ_DMA_EXT: u8 = 0x25;
const ATA_WRITE_DMA: u8 = 0xCA;
const ATA_WRITE_DMA_EXT: u8 = 0x35;
const ATA_IDENTIFY: u8 = 0xEC;
const ATA_FLUSH_CACHE: u8 = 0xE7;
const ATA_IDLE_IMMEDIATE: u8 = 0xE1;

/// First LBA that needs 48-bit addressing.
const LBA28_LIMIT: u64 = 1 << 28;

pub const SECTOR_SIZE: usize = 512;

/// Command slots per port (architectural maximum).
pub const MAX_SLOTS: usize = 32;
/// PRDT entries per command table.
const PRDT_PER_TABLE: usize = 8;
/// Largest byte count one PRDT entry can carry.
const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Default spin bound for command completion (roughly 5 s of MMIO polls).
pub const DEFAULT_COMMAND_SPIN: u32 = 5_000_000;
/// Spin bound for port start/stop state changes.
pub const DEFAULT_PORT_SPIN: u32 = 10_000;
/// Spin bound for the BIOS handoff (roughly 25 s).
pub const DEFAULT_HANDOFF_SPIN: u32 = 25_000_000;

// ---------------------------------------------------------------------------
// Register file
// ---------------------------------------------------------------------------

/// Per-port register block (offset 0x100 + 0x80 * port in the HBA).
#[repr(C)]
pub struct HbaPort {
    pub clb: Mmio32,
    pub clbu: Mmio32,
    pub fb: Mmio32,
    pub fbu: Mmio32,
    pub is: Mmio32,
    pub ie: Mmio32,
    pub cmd: Mmio32,
    _rsv0: Mmio32,
    pub tfd: Mmio32,
    pub sig: Mmio32,
    pub ssts: Mmio32,
    pub sctl: Mmio32,
    pub serr: Mmio32,
    pub sact: Mmio32,
    pub ci: Mmio32,
    pub sntf: Mmio32,
    pub fbs: Mmio32,
    _rsv1: [Mmio32; 11],
    _vendor: [Mmio32; 4],
}

/// HBA generic registers followed by the 32 port blocks.
#[repr(C)]
pub struct HbaMem {
    pub cap: Mmio32,
    pub ghc: Mmio32,
    pub is: Mmio32,
    pub pi: Mmio32,
    pub vs: Mmio32,
    pub ccc_ctl: Mmio32,
    pub ccc_pts: Mmio32,
    pub em_loc: Mmio32,
    pub em_ctl: Mmio32,
    pub cap2: Mmio32,
    pub bohc: Mmio32,
    _rsv: [Mmio32; 29],
    _vendor: [Mmio32; 24],
    pub ports: [HbaPort; 32],
}

// ---------------------------------------------------------------------------
// DMA command structures
// ---------------------------------------------------------------------------

/// Command list header (32 per port, 32 bytes each).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HbaCommandHeader {
    /// CFL in bits 0..5, W at bit 6, plus attention bits.
    pub flags: u16,
    /// Number of PRDT entries.
    pub prdtl: u16,
    /// Bytes transferred, written back by the HBA.
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    _rsv: [u32; 4],
}

const HEADER_WRITE: u16 = 1 << 6;

/// Physical region descriptor (scatter-gather entry).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HbaPrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    _rsv: u32,
    /// Byte count minus one in bits 0..22, interrupt-on-completion at 31.
    pub dbc: u32,
}

const PRDT_IOC: u32 = 1 << 31;

/// Command table: received FIS area plus the PRDT.
#[repr(C)]
pub struct HbaCommandTable {
    pub cfis: [u8; 64],
    pub acmd: [u8; 16],
    _rsv: [u8; 48],
    pub prdt: [HbaPrdtEntry; PRDT_PER_TABLE],
}

/// Register host-to-device FIS.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FisRegH2D {
    pub fis_type: u8,
    /// Port multiplier in bits 0..4, C (command) at bit 7.
    pub pmport_c: u8,
    pub command: u8,
    pub feature_lo: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub feature_hi: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    pub icc: u8,
    pub control: u8,
    _rsv: [u8; 4],
}

const FIS_COMMAND_BIT: u8 = 0x80;

impl FisRegH2D {
    fn command(command: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            pmport_c: FIS_COMMAND_BIT,
            command,
            ..Self::default()
        }
    }
}

/// Build the H2D FIS for a sector read or write, choosing LBA28 commands
/// below 2^28 and the EXT (LBA48) forms above.
pub fn build_rw_fis(lba: u64, count: u16, write: bool) -> FisRegH2D {
    let lba48 = lba >= LBA28_LIMIT;
    let mut fis = FisRegH2D::command(match (write, lba48) {
        (false, false) => ATA_READ_DMA,
        (false, true) => ATA_READ_DMA_EXT,
        (true, false) => ATA_WRITE_DMA,
        (true, true) => ATA_WRITE_DMA_EXT,
    });

    fis.lba0 = lba as u8;
    fis.lba1 = (lba >> 8) as u8;
    fis.lba2 = (lba >> 16) as u8;
    if lba48 {
        fis.device = 1 << 6;
        fis.lba3 = (lba >> 24) as u8;
        fis.lba4 = (lba >> 32) as u8;
        fis.lba5 = (lba >> 40) as u8;
        fis.count_lo = count as u8;
        fis.count_hi = (count >> 8) as u8;
    } else {
        // LBA mode with the top nibble of the 28-bit address in DEVICE.
        fis.device = (1 << 6) | ((lba >> 24) & 0xF) as u8;
        fis.count_lo = count as u8;
    }
    fis
}

/// Build the IDENTIFY DEVICE FIS.
pub fn build_identify_fis() -> FisRegH2D {
    FisRegH2D::command(ATA_IDENTIFY)
}

/// Build the IDLE IMMEDIATE FIS used during spin-up.
///
/// `features = 0x44` is preserved from the original firmware bring-up
/// sequence; power-management hint, hardware-specific.
pub fn build_spin_up_fis() -> FisRegH2D {
    let mut fis = FisRegH2D::command(ATA_IDLE_IMMEDIATE);
    fis.feature_lo = 0x44;
    fis
}

// ---------------------------------------------------------------------------
// IDENTIFY decoding
// ---------------------------------------------------------------------------

/// Decoded IDENTIFY DEVICE data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial: String,
    pub total_sectors: u64,
}

fn identify_string(words: &[u16], range: core::ops::Range<usize>) -> String {
    let mut out = String::new();
    for &word in &words[range] {
        for byte in [(word >> 8) as u8, word as u8] {
            if byte != 0 {
                out.push(byte as char);
            }
        }
    }
    String::from(out.trim())
}

/// Parse a 256-word IDENTIFY DEVICE block: model (words 27..47, swapped),
/// serial (words 10..20), LBA48 sector count (words 100..104) with the
/// LBA28 count (words 60..62) as fallback.
pub fn parse_identify(words: &[u16; 256]) -> DeviceInfo {
    let lba48 = words[100] as u64
        | (words[101] as u64) << 16
        | (words[102] as u64) << 32
        | (words[103] as u64) << 48;
    let lba28 = words[60] as u64 | (words[61] as u64) << 16;
    DeviceInfo {
        model: identify_string(words, 27..47),
        serial: identify_string(words, 10..20),
        total_sectors: if lba48 != 0 { lba48 } else { lba28 },
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Device class behind a port, from the signature register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    None,
    Sata,
    Atapi,
    Semb,
    PortMultiplier,
}

/// Classify a port signature.
pub fn classify_signature(sig: u32) -> DeviceType {
    match sig {
        SIG_SATA => DeviceType::Sata,
        SIG_ATAPI => DeviceType::Atapi,
        SIG_SEMB => DeviceType::Semb,
        SIG_PM => DeviceType::PortMultiplier,
        _ => DeviceType::None,
    }
}

/// Transfer statistics per port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// Pointer into the MMIO register window.
///
/// The window mapping is permanent (the MMIO allocator never unmaps), so
/// the pointer stays valid for the controller's lifetime.
struct RegPtr<T>(NonNull<T>);

// SAFETY: See the RegPtr invariant; register access is serialized by the
// controller lock.
unsafe impl<T> Send for RegPtr<T> {}

/// One AHCI port: registers, DMA structures and slot bookkeeping.
pub struct AhciPort {
    pub port_num: u8,
    regs: RegPtr<HbaPort>,
    pub present: bool,
    pub signature: u32,
    pub device_type: DeviceType,
    cmd_list: Option<DmaBuffer>,
    fis_buffer: Option<DmaBuffer>,
    cmd_tables: [Option<DmaBuffer>; MAX_SLOTS],
    command_slots: [bool; MAX_SLOTS],
    /// Slots the HBA actually implements (NCS + 1).
    slot_count: u32,
    supports_64bit: bool,
    pub initialized: bool,
    pub info: Option<DeviceInfo>,
    pub stats: PortStats,
    /// Spin bounds; fields rather than constants so tests can shrink them.
    pub port_spin_limit: u32,
    pub command_spin_limit: u32,
}

impl AhciPort {
    pub fn new(port_num: u8, regs: NonNull<HbaPort>, slot_count: u32, supports_64bit: bool) -> Self {
        Self {
            port_num,
            regs: RegPtr(regs),
            present: false,
            signature: 0,
            device_type: DeviceType::None,
            cmd_list: None,
            fis_buffer: None,
            cmd_tables: [None; MAX_SLOTS],
            command_slots: [false; MAX_SLOTS],
            slot_count: slot_count.min(MAX_SLOTS as u32),
            supports_64bit,
            initialized: false,
            info: None,
            stats: PortStats::default(),
            port_spin_limit: DEFAULT_PORT_SPIN,
            command_spin_limit: DEFAULT_COMMAND_SPIN,
        }
    }

    /// The register block, with a lifetime decoupled from `&self`: the
    /// MMIO window mapping is permanent, and slot bookkeeping must be
    /// mutable while registers are polled.
    fn regs<'a>(&self) -> &'a HbaPort {
        // SAFETY: RegPtr invariant; the register block outlives the port.
        unsafe { self.regs.0.as_ref() }
    }

    /// Read SSTS/SIG and classify what (if anything) is attached.
    pub fn probe(&mut self) -> DeviceType {
        let regs = self.regs();
        let det = regs.ssts.read() & SSTS_DET_MASK;
        if det != SSTS_DET_PRESENT {
            self.present = false;
            self.device_type = DeviceType::None;
            return DeviceType::None;
        }
        self.present = true;
        self.signature = regs.sig.read();
        self.device_type = classify_signature(self.signature);
        self.device_type
    }

    /// Allocate the command list, FIS receive area and the 32 command
    /// tables; link every header to its table and program CLB/FB. On any
    /// failure, everything allocated so far is freed in reverse order.
    pub fn allocate_dma(&mut self, pool: &mut DmaPool) -> KernelResult<()> {
        let cmd_list = pool.alloc(MAX_SLOTS * core::mem::size_of::<HbaCommandHeader>(), 1024)?;
        let fis_buffer = match pool.alloc(256, 256) {
            Ok(buf) => buf,
            Err(err) => {
                let _ = pool.free(&cmd_list);
                return Err(err);
            }
        };

        let mut tables: [Option<DmaBuffer>; MAX_SLOTS] = [None; MAX_SLOTS];
        for slot in 0..MAX_SLOTS {
            match pool.alloc(core::mem::size_of::<HbaCommandTable>(), 128) {
                Ok(buf) => tables[slot] = Some(buf),
                Err(err) => {
                    for prev in (0..slot).rev() {
                        if let Some(buf) = tables[prev].take() {
                            let _ = pool.free(&buf);
                        }
                    }
                    let _ = pool.free(&fis_buffer);
                    let _ = pool.free(&cmd_list);
                    return Err(err);
                }
            }
        }

        // Link each header to its command table.
        for slot in 0..MAX_SLOTS {
            let table = tables[slot].expect("table allocated above");
            // SAFETY: cmd_list is a live pool buffer sized for MAX_SLOTS
            // headers; the slot index is in range.
            let header = unsafe {
                &mut *(cmd_list.virt_addr() as *mut HbaCommandHeader).add(slot)
            };
            header.flags = 0;
            header.prdtl = 0;
            header.prdbc = 0;
            header.ctba = table.phys_addr() as u32;
            header.ctbau = if self.supports_64bit {
                (table.phys_addr() >> 32) as u32
            } else {
                0
            };
        }

        let regs = self.regs();
        regs.clb.write(cmd_list.phys_addr() as u32);
        regs.fb.write(fis_buffer.phys_addr() as u32);
        if self.supports_64bit {
            regs.clbu.write((cmd_list.phys_addr() >> 32) as u32);
            regs.fbu.write((fis_buffer.phys_addr() >> 32) as u32);
        } else {
            regs.clbu.write(0);
            regs.fbu.write(0);
        }

        self.cmd_list = Some(cmd_list);
        self.fis_buffer = Some(fis_buffer);
        self.cmd_tables = tables;
        Ok(())
    }

    /// Free all DMA structures in reverse allocation order.
    pub fn free_dma(&mut self, pool: &mut DmaPool) {
        for slot in (0..MAX_SLOTS).rev() {
            if let Some(buf) = self.cmd_tables[slot].take() {
                let _ = pool.free(&buf);
            }
        }
        if let Some(buf) = self.fis_buffer.take() {
            let _ = pool.free(&buf);
        }
        if let Some(buf) = self.cmd_list.take() {
            let _ = pool.free(&buf);
        }
    }

    fn wait_cmd_clear(&self, mask: u32) -> KernelResult<()> {
        for _ in 0..self.port_spin_limit {
            if self.regs().cmd.read() & mask == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout {
            operation: "port state change",
        })
    }

    fn wait_cmd_set(&self, mask: u32) -> KernelResult<()> {
        for _ in 0..self.port_spin_limit {
            if self.regs().cmd.read() & mask == mask {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout {
            operation: "port state change",
        })
    }

    /// Start command processing: FRE first, then ST, with the interface
    /// forced active.
    pub fn start(&mut self) -> KernelResult<()> {
        let regs = self.regs();

        // A port must be stopped before it can be started.
        regs.cmd.update(|c| c & !(CMD_ST | CMD_FRE));
        self.wait_cmd_clear(CMD_CR)?;

        // Drop stale interrupt status before enabling anything.
        regs.is.write(regs.is.read());

        regs.cmd.update(|c| c | CMD_FRE);
        self.wait_cmd_set(CMD_FR)?;

        regs.cmd
            .update(|c| (c & !CMD_ICC_MASK) | CMD_ICC_ACTIVE | CMD_SUD | CMD_POD);
        regs.cmd.update(|c| c | CMD_ST);
        self.wait_cmd_set(CMD_CR)?;
        Ok(())
    }

    /// Stop the port: the symmetric inverse of [`AhciPort::start`].
    pub fn stop(&mut self) -> KernelResult<()> {
        let regs = self.regs();
        regs.cmd.update(|c| c & !CMD_ST);
        self.wait_cmd_clear(CMD_CR)?;
        regs.cmd.update(|c| c & !CMD_FRE);
        self.wait_cmd_clear(CMD_FR)?;
        Ok(())
    }

    /// Lowest slot that neither the hardware (`SACT | CI`) nor software
    /// claims.
    pub fn find_cmdslot(&self) -> Option<usize> {
        let regs = self.regs();
        let busy = regs.sact.read() | regs.ci.read();
        (0..self.slot_count as usize)
            .find(|&slot| busy & (1 << slot) == 0 && !self.command_slots[slot])
    }

    /// Dispatch one command: fill the header and command table, claim the
    /// slot, issue it and spin for completion. On task-file error or
    /// timeout the slot is released before the error returns.
    pub fn send_command(
        &mut self,
        slot: usize,
        fis: &FisRegH2D,
        buffer: Option<&DmaBuffer>,
        size: usize,
        write: bool,
    ) -> KernelResult<()> {
        if slot >= self.slot_count as usize {
            return Err(KernelError::InvalidArgument {
                name: "slot",
                value: "out of range",
            });
        }
        if buffer.is_some() && (size == 0 || size > PRDT_MAX_BYTES) {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "out of range",
            });
        }
        let cmd_list = self.cmd_list.ok_or(KernelError::NotInitialized {
            subsystem: "ahci port",
        })?;
        let table_buf = self.cmd_tables[slot].ok_or(KernelError::NotInitialized {
            subsystem: "ahci port",
        })?;

        // SAFETY: Both buffers are live pool allocations sized for their
        // structures; the slot index was bounds-checked above.
        let header = unsafe { &mut *(cmd_list.virt_addr() as *mut HbaCommandHeader).add(slot) };
        let table = unsafe { &mut *(table_buf.virt_addr() as *mut HbaCommandTable) };

        let cfl = (core::mem::size_of::<FisRegH2D>() / 4) as u16; // dwords
        header.flags = cfl | if write { HEADER_WRITE } else { 0 };
        header.prdtl = if buffer.is_some() { 1 } else { 0 };
        header.prdbc = 0;

        table.cfis.fill(0);
        table.acmd.fill(0);
        // SAFETY: FisRegH2D is 20 bytes, well inside the 64-byte CFIS area.
        unsafe {
            core::ptr::copy_nonoverlapping(
                fis as *const FisRegH2D as *const u8,
                table.cfis.as_mut_ptr(),
                core::mem::size_of::<FisRegH2D>(),
            );
        }

        if let Some(buf) = buffer {
            table.prdt[0] = HbaPrdtEntry {
                dba: buf.phys_addr() as u32,
                dbau: if self.supports_64bit {
                    (buf.phys_addr() >> 32) as u32
                } else {
                    0
                },
                _rsv: 0,
                dbc: (size as u32 - 1) | PRDT_IOC,
            };
        }

        let regs = self.regs();
        // Acknowledge any stale status, then issue.
        regs.is.write(regs.is.read());
        self.command_slots[slot] = true;
        regs.ci.write(1 << slot);

        for _ in 0..self.command_spin_limit {
            if regs.ci.read() & (1 << slot) == 0 {
                // Completion: acknowledge status, release the slot.
                regs.is.write(regs.is.read());
                self.command_slots[slot] = false;
                return Ok(());
            }
            let is = regs.is.read();
            if is & IS_TFES != 0 {
                regs.is.write(is);
                self.command_slots[slot] = false;
                self.stats.errors += 1;
                let tfd = regs.tfd.read();
                log::error!(
                    "ahci port {}: task file error (TFD {:#x})",
                    self.port_num,
                    tfd
                );
                return Err(KernelError::HardwareError {
                    device: "ahci",
                    code: tfd,
                });
            }
            core::hint::spin_loop();
        }

        self.command_slots[slot] = false;
        self.stats.timeouts += 1;
        log::warn!("ahci port {}: command timeout (slot {})", self.port_num, slot);
        Err(KernelError::Timeout {
            operation: "ahci command",
        })
    }

    /// Read `count` sectors starting at `lba` into a DMA buffer.
    pub fn read_sectors(&mut self, lba: u64, count: u16, buf: &DmaBuffer) -> KernelResult<()> {
        let bytes = count as usize * SECTOR_SIZE;
        if count == 0 || bytes > buf.size() {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "buffer too small",
            });
        }
        let slot = self.find_cmdslot().ok_or(KernelError::ResourceExhausted {
            resource: "command slots",
        })?;
        let fis = build_rw_fis(lba, count, false);
        self.send_command(slot, &fis, Some(buf), bytes, false)?;
        self.stats.reads += 1;
        self.stats.bytes_read += bytes as u64;
        Ok(())
    }

    /// Write `count` sectors starting at `lba` from a DMA buffer.
    pub fn write_sectors(&mut self, lba: u64, count: u16, buf: &DmaBuffer) -> KernelResult<()> {
        let bytes = count as usize * SECTOR_SIZE;
        if count == 0 || bytes > buf.size() {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "buffer too small",
            });
        }
        let slot = self.find_cmdslot().ok_or(KernelError::ResourceExhausted {
            resource: "command slots",
        })?;
        let fis = build_rw_fis(lba, count, true);
        self.send_command(slot, &fis, Some(buf), bytes, true)?;
        self.stats.writes += 1;
        self.stats.bytes_written += bytes as u64;
        Ok(())
    }

    /// Flush the device write cache.
    pub fn flush_cache(&mut self) -> KernelResult<()> {
        let slot = self.find_cmdslot().ok_or(KernelError::ResourceExhausted {
            resource: "command slots",
        })?;
        let fis = FisRegH2D::command(ATA_FLUSH_CACHE);
        self.send_command(slot, &fis, None, 0, false)
    }

    /// Issue IDENTIFY DEVICE and decode the result.
    pub fn identify_device(&mut self, buf: &DmaBuffer) -> KernelResult<DeviceInfo> {
        if buf.size() < SECTOR_SIZE {
            return Err(KernelError::InvalidArgument {
                name: "buf",
                value: "short identify buffer",
            });
        }
        let slot = self.find_cmdslot().ok_or(KernelError::ResourceExhausted {
            resource: "command slots",
        })?;
        let fis = build_identify_fis();
        self.send_command(slot, &fis, Some(buf), SECTOR_SIZE, false)?;

        // SAFETY: The buffer is at least 512 bytes and the device just
        // DMA'd the identify block into it.
        let words = unsafe { &*(buf.virt_addr() as *const [u16; 256]) };
        let info = parse_identify(words);
        log::info!(
            "ahci port {}: '{}' serial '{}', {} sectors",
            self.port_num,
            info.model,
            info.serial,
            info.total_sectors
        );
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Spin up the attached device with IDLE IMMEDIATE.
    pub fn spin_up_device(&mut self) -> KernelResult<()> {
        let slot = self.find_cmdslot().ok_or(KernelError::ResourceExhausted {
            resource: "command slots",
        })?;
        let fis = build_spin_up_fis();
        self.send_command(slot, &fis, None, 0, false)
    }

    /// IRQ service: record error/connect conditions and acknowledge the
    /// port interrupt status. Never blocks, never frees anything.
    pub fn handle_interrupt(&mut self) {
        let regs = self.regs();
        let is = regs.is.read();
        if is == 0 {
            return;
        }
        if is & IS_TFES != 0 {
            self.stats.errors += 1;
            log::error!(
                "ahci port {}: task file error in IRQ (TFD {:#x})",
                self.port_num,
                regs.tfd.read()
            );
        }
        if is & IS_PCS != 0 {
            log::info!("ahci port {}: connect state change", self.port_num);
        }
        regs.is.write(is);
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Decoded HBA CAP register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbaCapabilities {
    pub port_count: u32,
    pub command_slots: u32,
    pub supports_64bit: bool,
    pub supports_ncq: bool,
}

/// Decode CAP: NP in bits 0..5, NCS in bits 8..13, SNCQ at 30, S64A at 31.
pub fn decode_capabilities(cap: u32) -> HbaCapabilities {
    HbaCapabilities {
        port_count: (cap & 0x1F) + 1,
        command_slots: ((cap >> 8) & 0x1F) + 1,
        supports_64bit: cap & (1 << 31) != 0,
        supports_ncq: cap & (1 << 30) != 0,
    }
}

/// Split the VS register into (major, minor).
pub fn decode_version(vs: u32) -> (u16, u16) {
    ((vs >> 16) as u16, vs as u16)
}

/// The AHCI host bus adapter.
pub struct AhciController {
    pub pci_device: PciDevice,
    pub abar_phys: u64,
    abar: RegPtr<HbaMem>,
    pub ports: [Option<AhciPort>; 32],
    pub ports_implemented: u32,
    pub port_count: u32,
    pub command_slots: u32,
    pub supports_64bit: bool,
    pub supports_ncq: bool,
    pub initialized: bool,
    pub handoff_spin_limit: u32,
}

impl AhciController {
    /// Build a controller over an already-accessible register file. The
    /// bare-metal path maps BAR5 through the MMIO window first; tests
    /// hand in an in-memory register block.
    pub fn from_registers(pci_device: PciDevice, abar_phys: u64, abar: NonNull<HbaMem>) -> Self {
        Self {
            pci_device,
            abar_phys,
            abar: RegPtr(abar),
            ports: core::array::from_fn(|_| None),
            ports_implemented: 0,
            port_count: 0,
            command_slots: 0,
            supports_64bit: false,
            supports_ncq: false,
            initialized: false,
            handoff_spin_limit: DEFAULT_HANDOFF_SPIN,
        }
    }

    /// The HBA register file, with a lifetime decoupled from `&self`
    /// (see [`AhciPort::regs`]).
    fn hba<'a>(&self) -> &'a HbaMem {
        // SAFETY: RegPtr invariant; the register block outlives the
        // controller.
        unsafe { self.abar.0.as_ref() }
    }

    /// Claim HBA ownership from firmware. If the BIOS-owned bit is set,
    /// raise the OS-owned bit and wait (bounded) for the firmware to let
    /// go; a timeout is logged but not fatal.
    pub fn bios_handoff(&mut self) {
        let hba = self.hba();
        let bohc = hba.bohc.read();
        if bohc & BOHC_BIOS_OWNED == 0 {
            return;
        }
        log::info!("ahci: requesting HBA ownership from firmware");
        hba.bohc.write(bohc | BOHC_OS_OWNED);
        for _ in 0..self.handoff_spin_limit {
            if hba.bohc.read() & BOHC_BIOS_OWNED == 0 {
                return;
            }
            core::hint::spin_loop();
        }
        log::warn!("ahci: BIOS handoff timed out; proceeding anyway");
    }

    /// Enable AHCI mode, then global interrupts.
    pub fn enable(&mut self) {
        let hba = self.hba();
        hba.ghc.update(|g| g | GHC_AE);
        hba.ghc.update(|g| g | GHC_IE);
    }

    /// Full bring-up: handoff, capability decode, AHCI enable and per-port
    /// initialization for every implemented port.
    pub fn init(&mut self, pool: &mut DmaPool) -> KernelResult<()> {
        self.bios_handoff();

        let hba = self.hba();
        let caps = decode_capabilities(hba.cap.read());
        self.port_count = caps.port_count;
        self.command_slots = caps.command_slots;
        self.supports_64bit = caps.supports_64bit;
        self.supports_ncq = caps.supports_ncq;
        self.ports_implemented = hba.pi.read();
        let (major, minor) = decode_version(hba.vs.read());

        log::info!(
            "ahci: version {}.{:02x}, {} ports (PI {:#010x}), {} slots{}{}",
            major,
            minor,
            self.port_count,
            self.ports_implemented,
            self.command_slots,
            if self.supports_64bit { ", 64-bit" } else { "" },
            if self.supports_ncq { ", NCQ" } else { "" },
        );

        self.enable();

        for port_num in 0..32u8 {
            if self.ports_implemented & (1 << port_num) == 0 {
                continue;
            }
            if let Err(err) = self.init_port(port_num, pool) {
                log::warn!("ahci: port {} init failed: {}", port_num, err);
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// Initialize one implemented port.
    pub fn init_port(&mut self, port_num: u8, pool: &mut DmaPool) -> KernelResult<()> {
        let regs = NonNull::from(&self.hba().ports[port_num as usize]);
        let mut port = AhciPort::new(port_num, regs, self.command_slots, self.supports_64bit);

        let device_type = port.probe();
        if !port.present {
            self.ports[port_num as usize] = Some(port);
            return Ok(());
        }
        log::info!(
            "ahci: port {} signature {:#010x} ({:?})",
            port_num,
            port.signature,
            device_type
        );
        if !matches!(device_type, DeviceType::Sata | DeviceType::Atapi) {
            self.ports[port_num as usize] = Some(port);
            return Ok(());
        }

        port.allocate_dma(pool)?;

        // Clear pending status, then unmask the per-port interrupts we
        // service: device-to-host FIS, task file error, connect change.
        let regs = port.regs();
        regs.is.write(regs.is.read());
        regs.ie.write(1 | IS_TFES | IS_PCS);

        if let Err(err) = port.start() {
            port.free_dma(pool);
            return Err(err);
        }

        port.initialized = true;
        self.ports[port_num as usize] = Some(port);
        Ok(())
    }

    /// Global IRQ service: fan out to every signaled, initialized port,
    /// then acknowledge the HBA interrupt status by writing it back.
    pub fn handle_interrupt(&mut self) {
        let pending = self.hba().is.read();
        if pending == 0 {
            return;
        }
        for port_num in 0..32 {
            if pending & (1 << port_num) == 0 {
                continue;
            }
            if let Some(port) = self.ports[port_num].as_mut() {
                if port.initialized {
                    port.handle_interrupt();
                }
            }
        }
        self.hba().is.write(pending);
    }

    /// Stop every started port and release its DMA structures.
    pub fn shutdown(&mut self, pool: &mut DmaPool) {
        for slot in self.ports.iter_mut() {
            if let Some(port) = slot.as_mut() {
                if port.initialized {
                    let _ = port.stop();
                    port.free_dma(pool);
                    port.initialized = false;
                }
            }
        }
        self.initialized = false;
    }
}

/// Global controller instance.
static AHCI: Mutex<Option<AhciController>> = Mutex::new(None);

/// Discover and initialize the AHCI controller on the PCI bus.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    let device = pci::find_device_by_class(pci::CLASS_MASS_STORAGE, pci::SUBCLASS_SATA)
        .filter(PciDevice::is_ahci)
        .or_else(|| {
            pci::KNOWN_AHCI_IDS
                .iter()
                .find_map(|&(vendor, dev)| pci::find_device(vendor, dev))
        })
        .ok_or(KernelError::NotFound {
            resource: "ahci controller",
            id: 0,
        })?;

    pci::enable_bus_mastering(&device)?;
    pci::enable_memory_space(&device)?;

    let bar = device.bars[5];
    if !bar.is_valid {
        return Err(KernelError::HardwareError {
            device: "ahci",
            code: 5,
        });
    }
    let abar_phys = bar.address;
    let abar_virt = crate::mm::mmio::ensure_physical_accessible(
        crate::mm::PhysAddr::new(abar_phys as u32),
        core::mem::size_of::<HbaMem>(),
    )?;
    let abar = NonNull::new(abar_virt.as_usize() as *mut HbaMem).ok_or(
        KernelError::InvalidAddress {
            addr: abar_virt.as_usize(),
        },
    )?;

    log::info!(
        "ahci: controller {:04x}:{:04x} at {:02x}:{:02x}.{} ABAR {:#x} IRQ {}",
        device.vendor_id,
        device.device_id,
        device.bus,
        device.device,
        device.function,
        abar_phys,
        device.interrupt_line
    );

    let mut controller = AhciController::from_registers(device, abar_phys, abar);
    super::dma::with_pool(|pool| controller.init(pool))??;
    *AHCI.lock() = Some(controller);
    Ok(())
}

/// Execute a closure with the global controller.
pub fn with_controller<R, F: FnOnce(&mut AhciController) -> R>(f: F) -> KernelResult<R> {
    let mut ahci = AHCI.lock();
    ahci.as_mut().map(f).ok_or(KernelError::NotInitialized {
        subsystem: "ahci",
    })
}

/// IRQ entry: service the controller and acknowledge the interrupt line.
pub fn irq_handler(vector: u8) {
    let _ = with_controller(|controller| controller.handle_interrupt());
    crate::arch::end_of_interrupt(vector.saturating_sub(32));
}

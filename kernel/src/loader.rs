//! Executable loader: flat binaries and ELF32 (static and simple PIE).
//!
//! The pipeline reads the whole file through the VFS collaborator into a
//! kernel buffer (doubling on growth up to [`EXEC_MAX_SIZE`]), detects
//! the format, loads segments through the user page manager, applies
//! R_386_RELATIVE fixups for position-independent executables, and
//! finally spawns a Ring-3 task at the entry point. Each stage logs a
//! numbered STEP line so a failed exec leaves a readable trail.

use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    elf,
    error::{KernelError, KernelResult},
    mm::{align_down_4k, user::UserMemory, VirtAddr, PAGE_SIZE},
    sched::{Priority, Scheduler, TaskId},
    vfs::{self, Vfs},
};

/// Load address of flat binaries (and their entry point).
pub const EXEC_CODE_BASE: u32 = 0x0040_0000;

/// Upper bound on executable file size.
pub const EXEC_MAX_SIZE: usize = 16 * 1024 * 1024;

/// First base handed to a PIE; later loads step by [`PIE_BASE_STEP`].
pub const PIE_BASE_START: u32 = 0x0400_0000;
/// Distance between consecutive PIE load bases (16 MiB).
pub const PIE_BASE_STEP: u32 = 0x0100_0000;

/// Initial size of the read buffer (doubled as the file grows past it).
const READ_BUFFER_INITIAL: usize = 8 * 1024;

/// Next PIE load base; every ET_DYN image gets a fresh one.
static NEXT_PIE_BASE: AtomicU32 = AtomicU32::new(PIE_BASE_START);

fn take_pie_base() -> u32 {
    NEXT_PIE_BASE.fetch_add(PIE_BASE_STEP, Ordering::Relaxed)
}

/// A loaded user image, ready to be wrapped in a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point after relocation.
    pub entry: u32,
    /// Relocation delta applied to every segment (0 for ET_EXEC/flat).
    pub delta: u32,
    /// Lowest mapped code address.
    pub code_base: u32,
    /// Span of the mapped image in bytes.
    pub code_size: u32,
    pub is_pie: bool,
}

/// Read a whole executable through the VFS into a kernel buffer, growing
/// it by doubling, bounded by [`EXEC_MAX_SIZE`].
pub fn read_executable(vfs: &mut dyn Vfs, path: &str) -> KernelResult<Vec<u8>> {
    let fd = vfs.open(path, vfs::O_RDONLY)?;
    let mut image: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_INITIAL];
    let result = loop {
        match vfs.read(fd, &mut buf) {
            Ok(0) => break Ok(image),
            Ok(n) => {
                if image.len() + n > EXEC_MAX_SIZE {
                    break Err(KernelError::BadExecutable {
                        reason: "executable exceeds EXEC_MAX_SIZE",
                    });
                }
                image.extend_from_slice(&buf[..n]);
                if image.len() == buf.len() {
                    // Double-on-grow: larger reads for larger files.
                    buf.resize(buf.len() * 2, 0);
                }
            }
            Err(err) => break Err(err),
        }
    };
    let _ = vfs.close(fd);
    result
}

/// Load a flat binary at [`EXEC_CODE_BASE`]: map, copy, verify.
pub fn load_flat(user: &mut dyn UserMemory, image: &[u8]) -> KernelResult<LoadedImage> {
    if image.is_empty() {
        return Err(KernelError::BadExecutable {
            reason: "empty flat binary",
        });
    }
    let base = VirtAddr::new(EXEC_CODE_BASE);
    user.map_region(base, image.len(), "flat-exec")?;
    user.copy_out(base, image)?;

    // Verify the first bytes landed.
    let probe_len = image.len().min(16);
    let mut probe = [0u8; 16];
    user.read_in(base, &mut probe[..probe_len])?;
    if probe[..probe_len] != image[..probe_len] {
        return Err(KernelError::BadExecutable {
            reason: "flat image verification failed",
        });
    }

    Ok(LoadedImage {
        entry: EXEC_CODE_BASE,
        delta: 0,
        code_base: EXEC_CODE_BASE,
        code_size: image.len() as u32,
        is_pie: false,
    })
}

/// Map the file offset of an image virtual address via its containing
/// PT_LOAD segment.
fn vaddr_to_offset(phdrs: &[elf::Elf32ProgramHeader], vaddr: u32) -> KernelResult<u32> {
    phdrs
        .iter()
        .filter(|p| p.p_type == elf::PT_LOAD)
        .find(|p| vaddr >= p.p_vaddr && vaddr < p.p_vaddr + p.p_filesz)
        .map(|p| p.p_offset + (vaddr - p.p_vaddr))
        .ok_or(KernelError::BadExecutable {
            reason: "relocation table outside any segment",
        })
}

/// Load an ELF32 image: PT_LOAD segments (with bss zero-fill) and, for
/// ET_DYN, a fresh load base plus R_386_RELATIVE fixups.
pub fn load_elf(user: &mut dyn UserMemory, image: &[u8]) -> KernelResult<LoadedImage> {
    let header = elf::validate_header(image)?;
    let phdrs = elf::program_headers(image, &header)?;

    let is_pie = header.e_type == elf::ET_DYN;
    let delta = if is_pie { take_pie_base() } else { 0 };

    let mut lowest = u32::MAX;
    let mut highest = 0u32;

    for phdr in phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD) {
        if phdr.p_memsz == 0 {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(KernelError::BadExecutable {
                reason: "segment file size exceeds memory size",
            });
        }
        let file_end = phdr.p_offset as usize + phdr.p_filesz as usize;
        if file_end > image.len() {
            return Err(KernelError::BadExecutable {
                reason: "segment data out of bounds",
            });
        }

        let vaddr = phdr.p_vaddr.wrapping_add(delta);
        let page_start = align_down_4k(vaddr);
        let span = (vaddr - page_start) as usize + phdr.p_memsz as usize;
        user.map_region(VirtAddr::new(page_start), span, "elf-segment")?;
        user.copy_out(
            VirtAddr::new(vaddr),
            &image[phdr.p_offset as usize..file_end],
        )?;
        if phdr.p_memsz > phdr.p_filesz {
            // Zero the bss tail.
            user.zero(
                VirtAddr::new(vaddr + phdr.p_filesz),
                (phdr.p_memsz - phdr.p_filesz) as usize,
            )?;
        }

        lowest = lowest.min(page_start);
        highest = highest.max(vaddr + phdr.p_memsz);
    }

    if lowest == u32::MAX {
        return Err(KernelError::BadExecutable {
            reason: "no loadable segments",
        });
    }

    if is_pie {
        apply_relative_relocations(user, image, &phdrs, delta)?;
    }

    Ok(LoadedImage {
        entry: header.e_entry.wrapping_add(delta),
        delta,
        code_base: lowest,
        code_size: highest - lowest,
        is_pie,
    })
}

/// Walk PT_DYNAMIC for DT_REL/DT_RELSZ/DT_RELENT and add `delta` to the
/// word at `r_offset + delta` for every R_386_RELATIVE entry.
fn apply_relative_relocations(
    user: &mut dyn UserMemory,
    image: &[u8],
    phdrs: &[elf::Elf32ProgramHeader],
    delta: u32,
) -> KernelResult<()> {
    let Some(dynamic) = phdrs.iter().find(|p| p.p_type == elf::PT_DYNAMIC) else {
        return Ok(());
    };
    let entries = elf::dynamic_entries(image, dynamic)?;
    let Some((table_vaddr, count)) = elf::rel_table(&entries)? else {
        return Ok(());
    };
    let table_offset = vaddr_to_offset(phdrs, table_vaddr)?;

    let mut applied = 0usize;
    for index in 0..count {
        let rel = elf::rel_entry(image, table_offset, index)?;
        if rel.r_type() != elf::R_386_RELATIVE {
            continue;
        }
        let target = VirtAddr::new(rel.r_offset.wrapping_add(delta));
        let value = user.read_u32(target)?;
        user.write_u32(target, value.wrapping_add(delta))?;
        applied += 1;
    }
    log::debug!("applied {} R_386_RELATIVE relocations (delta {:#x})", applied, delta);
    Ok(())
}

/// Load `path` and run it as a user task.
///
/// The numbered STEP trail mirrors the loader's stages; on failure the
/// kernel buffer is dropped and the error propagates.
pub fn exec_load_and_run(
    vfs: &mut dyn Vfs,
    user: &mut dyn UserMemory,
    sched: &mut Scheduler,
    path: &str,
    argv: &[&str],
) -> KernelResult<TaskId> {
    println!("[EXEC] STEP 0: exec '{}'", path);
    let path = vfs::normalize_path(path);
    let (_, name) = vfs::split_path(&path);

    println!("[EXEC] STEP 1: reading '{}'", path);
    let image = read_executable(vfs, &path)?;
    println!("[EXEC] STEP 2: {} bytes read", image.len());

    let loaded = if elf::is_elf(&image) {
        println!("[EXEC] STEP 3: ELF image");
        load_elf(user, &image)?
    } else {
        println!("[EXEC] STEP 3: flat image");
        load_flat(user, &image)?
    };
    println!(
        "[EXEC] STEP 4: loaded at {:#x}..{:#x} (entry {:#x}{})",
        loaded.code_base,
        loaded.code_base + loaded.code_size,
        loaded.entry,
        if loaded.is_pie { ", PIE" } else { "" }
    );

    println!("[EXEC] STEP 5: spawning user task '{}'", name);
    let task = sched.spawn_user_task(
        name,
        Priority::Normal,
        user,
        loaded.entry,
        loaded.code_base,
        loaded.code_size,
        argv,
    )?;
    println!("[EXEC] STEP 6: task {} ready", task);
    Ok(task)
    // The kernel image buffer drops here, success or not.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{elf_builder::ElfBuilder, MockUserMemory, MockVfs};

    #[test]
    fn flat_binaries_load_at_the_fixed_base() {
        let mut user = MockUserMemory::new();
        let image = [0xCCu8, 0x90, 0x90, 0xC3];
        let loaded = load_flat(&mut user, &image).expect("load");
        assert_eq!(loaded.entry, EXEC_CODE_BASE);
        assert_eq!(loaded.delta, 0);
        assert!(!loaded.is_pie);

        let mut copied = [0u8; 4];
        user.read_in(VirtAddr::new(EXEC_CODE_BASE), &mut copied)
            .expect("read back");
        assert_eq!(copied, image);
    }

    #[test]
    fn empty_flat_binaries_are_rejected() {
        let mut user = MockUserMemory::new();
        assert!(load_flat(&mut user, &[]).is_err());
    }

    #[test]
    fn static_elf_segments_are_copied_and_bss_zeroed() {
        let code = [0xB8u8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let image = ElfBuilder::new(elf::ET_EXEC, 0x0040_0000)
            .segment(0x0040_0000, &code, 0x2000)
            .build();

        let mut user = MockUserMemory::new();
        let loaded = load_elf(&mut user, &image).expect("load");
        assert_eq!(loaded.entry, 0x0040_0000);
        assert_eq!(loaded.code_base, 0x0040_0000);
        assert!(loaded.code_size >= 0x2000);

        let mut copied = [0u8; 6];
        user.read_in(VirtAddr::new(0x0040_0000), &mut copied).expect("read");
        assert_eq!(copied, code);
        // The bss tail is zero.
        let mut tail = [0xFFu8; 16];
        user.read_in(VirtAddr::new(0x0040_0000 + 0x1800), &mut tail).expect("read");
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn pie_loads_get_distinct_bases_a_step_apart() {
        let image = ElfBuilder::new(elf::ET_DYN, 0x100)
            .segment(0, &[0x90u8; 32], 0x1000)
            .build();

        let mut user = MockUserMemory::new();
        let first = load_elf(&mut user, &image).expect("first load");
        let second = load_elf(&mut user, &image).expect("second load");

        assert!(first.is_pie);
        assert!(first.delta >= PIE_BASE_START);
        assert_eq!(first.entry, first.delta + 0x100);
        // Later loads land a positive multiple of one PIE slot higher.
        // (Other tests may also take bases from the shared counter, so
        // the distance is a multiple rather than exactly one step.)
        assert!(second.delta > first.delta);
        assert_eq!((second.delta - first.delta) % PIE_BASE_STEP, 0);
        assert_eq!(second.entry - first.entry, second.delta - first.delta);
    }

    #[test]
    fn relative_relocations_are_rebased_by_delta() {
        // Word at image vaddr 0x10 holds a pointer to vaddr 0x20.
        let mut seg = [0u8; 64];
        seg[0x10..0x14].copy_from_slice(&0x20u32.to_le_bytes());
        let image = ElfBuilder::new(elf::ET_DYN, 0x0)
            .segment(0, &seg, 0x1000)
            .relocations(0x2000, &[0x10])
            .build();

        let mut user = MockUserMemory::new();
        let loaded = load_elf(&mut user, &image).expect("load");
        let fixed = user
            .read_u32(VirtAddr::new(loaded.delta + 0x10))
            .expect("read");
        assert_eq!(fixed, loaded.delta + 0x20);
    }

    #[test]
    fn segment_data_past_the_file_end_is_rejected() {
        let mut image = ElfBuilder::new(elf::ET_EXEC, 0x0040_0000)
            .segment(0x0040_0000, &[0x90u8; 32], 0x1000)
            .build();
        let len = image.len();
        image.truncate(len - 16);
        let mut user = MockUserMemory::new();
        assert!(load_elf(&mut user, &image).is_err());
    }

    #[test]
    fn read_executable_grows_its_buffer_and_respects_the_cap() {
        let mut vfs = MockVfs::new();
        let big = vec![0xABu8; 3 * READ_BUFFER_INITIAL];
        vfs.add_file("/bin/big", big.clone());
        let image = read_executable(&mut vfs, "/bin/big").expect("read");
        assert_eq!(image, big);
        assert_eq!(vfs.open_count(), 0, "fd leaked");

        assert!(matches!(
            read_executable(&mut vfs, "/bin/missing"),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn exec_pipeline_spawns_a_user_task() {
        let mut vfs = MockVfs::new();
        vfs.add_file("/bin/app", vec![0xCC, 0xC3]);
        let mut user = MockUserMemory::new();
        let mut sched = Scheduler::new();
        sched.init().expect("init");

        let task = exec_load_and_run(&mut vfs, &mut user, &mut sched, "//bin/./app", &["app"])
            .expect("exec");
        let record = sched.task(task).expect("task record");
        assert!(record.is_user());
        assert_eq!(record.user_entry, Some(EXEC_CODE_BASE));
        assert_eq!(record.name, "app");
    }

    #[test]
    fn exec_of_a_missing_file_fails_cleanly() {
        let mut vfs = MockVfs::new();
        let mut user = MockUserMemory::new();
        let mut sched = Scheduler::new();
        sched.init().expect("init");
        assert!(exec_load_and_run(&mut vfs, &mut user, &mut sched, "/bin/ghost", &[]).is_err());
        // Only the idle task exists.
        assert_eq!(sched.task_count(), 1);
    }

    #[test]
    fn two_pie_tasks_run_at_disjoint_entries() {
        let image = ElfBuilder::new(elf::ET_DYN, 0x100)
            .segment(0, &[0x90u8; 32], 0x1000)
            .build();
        let mut vfs = MockVfs::new();
        vfs.add_file("/bin/pie", image);
        let mut user = MockUserMemory::new();
        let mut sched = Scheduler::new();
        sched.init().expect("init");

        let a = exec_load_and_run(&mut vfs, &mut user, &mut sched, "/bin/pie", &[]).expect("a");
        let b = exec_load_and_run(&mut vfs, &mut user, &mut sched, "/bin/pie", &[]).expect("b");
        let entry_a = sched.task(a).unwrap().user_entry.unwrap();
        let entry_b = sched.task(b).unwrap().user_entry.unwrap();
        assert!(entry_b > entry_a);
        assert_eq!((entry_b - entry_a) % PIE_BASE_STEP, 0);
    }
}

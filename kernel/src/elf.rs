//! ELF32 parsing for the executable loader.
//!
//! Only what the loader needs: identification, program-header iteration
//! (PT_LOAD, PT_DYNAMIC) and the DT_REL relocation tables used to apply
//! R_386_RELATIVE fixups to position-independent executables.

use alloc::vec::Vec;
use core::mem;

use crate::error::{KernelError, KernelResult};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const EM_386: u16 = 3;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const DT_NULL: i32 = 0;
pub const DT_REL: i32 = 17;
pub const DT_RELSZ: i32 = 18;
pub const DT_RELENT: i32 = 19;

pub const R_386_RELATIVE: u8 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Dyn {
    pub d_tag: i32,
    pub d_val: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Rel {
    pub r_offset: u32,
    pub r_info: u32,
}

impl Elf32Rel {
    pub fn r_type(&self) -> u8 {
        self.r_info as u8
    }

    pub fn r_sym(&self) -> u32 {
        self.r_info >> 8
    }
}

/// Whether the buffer starts with the ELF magic.
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ELF_MAGIC
}

fn read_struct<T: Copy>(data: &[u8], offset: usize) -> KernelResult<T> {
    let size = mem::size_of::<T>();
    if offset.checked_add(size).is_none_or(|end| end > data.len()) {
        return Err(KernelError::BadExecutable {
            reason: "structure out of bounds",
        });
    }
    // SAFETY: The span [offset, offset+size) is in bounds (checked above)
    // and T is a plain #[repr(C)] value type; read_unaligned copes with
    // the byte buffer's alignment.
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

/// Validate the identification and machine fields and return the header.
///
/// Accepts 32-bit little-endian i386 executables of type ET_EXEC or
/// ET_DYN; everything else is rejected with a reasoned error.
pub fn validate_header(data: &[u8]) -> KernelResult<Elf32Header> {
    if data.len() < mem::size_of::<Elf32Header>() {
        return Err(KernelError::BadExecutable {
            reason: "file shorter than the ELF header",
        });
    }
    let header: Elf32Header = read_struct(data, 0)?;

    if header.e_ident[..4] != ELF_MAGIC {
        return Err(KernelError::BadExecutable {
            reason: "bad ELF magic",
        });
    }
    if header.e_ident[4] != ELFCLASS32 {
        return Err(KernelError::BadExecutable {
            reason: "not a 32-bit ELF",
        });
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(KernelError::BadExecutable {
            reason: "not little-endian",
        });
    }
    if header.e_ident[6] != EV_CURRENT {
        return Err(KernelError::BadExecutable {
            reason: "bad ELF version",
        });
    }
    if header.e_machine != EM_386 {
        return Err(KernelError::BadExecutable {
            reason: "not an i386 executable",
        });
    }
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(KernelError::BadExecutable {
            reason: "not an executable (ET_EXEC or ET_DYN)",
        });
    }
    Ok(header)
}

/// Collect the program headers.
pub fn program_headers(data: &[u8], header: &Elf32Header) -> KernelResult<Vec<Elf32ProgramHeader>> {
    let mut headers = Vec::with_capacity(header.e_phnum as usize);
    if header.e_phoff == 0 || header.e_phnum == 0 {
        return Ok(headers);
    }
    if (header.e_phentsize as usize) < mem::size_of::<Elf32ProgramHeader>() {
        return Err(KernelError::BadExecutable {
            reason: "program header entry too small",
        });
    }
    for i in 0..header.e_phnum as usize {
        let offset = header.e_phoff as usize + i * header.e_phentsize as usize;
        headers.push(read_struct(data, offset)?);
    }
    Ok(headers)
}

/// Dynamic-section entries of a PT_DYNAMIC segment, up to DT_NULL.
pub fn dynamic_entries(data: &[u8], phdr: &Elf32ProgramHeader) -> KernelResult<Vec<Elf32Dyn>> {
    let mut entries = Vec::new();
    let count = phdr.p_filesz as usize / mem::size_of::<Elf32Dyn>();
    for i in 0..count {
        let entry: Elf32Dyn =
            read_struct(data, phdr.p_offset as usize + i * mem::size_of::<Elf32Dyn>())?;
        if entry.d_tag == DT_NULL {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// The DT_REL relocation table described by a dynamic section, if any:
/// `(file_offset_of_table, entry_count)`.
///
/// `DT_REL` holds the table's virtual address inside the image; the
/// caller maps it back to a file offset via the containing segment.
pub fn rel_table(entries: &[Elf32Dyn]) -> KernelResult<Option<(u32, usize)>> {
    let mut rel = None;
    let mut relsz = None;
    let mut relent = mem::size_of::<Elf32Rel>() as u32;
    for entry in entries {
        match entry.d_tag {
            DT_REL => rel = Some(entry.d_val),
            DT_RELSZ => relsz = Some(entry.d_val),
            DT_RELENT => relent = entry.d_val,
            _ => {}
        }
    }
    match (rel, relsz) {
        (Some(rel), Some(relsz)) => {
            if relent as usize != mem::size_of::<Elf32Rel>() {
                return Err(KernelError::BadExecutable {
                    reason: "unexpected DT_RELENT",
                });
            }
            Ok(Some((rel, relsz as usize / relent as usize)))
        }
        (None, _) => Ok(None),
        (Some(_), None) => Err(KernelError::BadExecutable {
            reason: "DT_REL without DT_RELSZ",
        }),
    }
}

/// Read one relocation record out of the file image.
pub fn rel_entry(data: &[u8], table_offset: u32, index: usize) -> KernelResult<Elf32Rel> {
    read_struct(
        data,
        table_offset as usize + index * mem::size_of::<Elf32Rel>(),
    )
}

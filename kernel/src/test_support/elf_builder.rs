//! Minimal ELF32 image builder for loader tests.

use alloc::vec::Vec;

use crate::elf::{DT_NULL, DT_REL, DT_RELENT, DT_RELSZ, ELF_MAGIC, EM_386, PT_DYNAMIC, PT_LOAD, R_386_RELATIVE};

struct Segment {
    vaddr: u32,
    data: Vec<u8>,
    memsz: u32,
}

/// Builds a syntactically valid ELF32 image with PT_LOAD segments and an
/// optional DT_REL table of R_386_RELATIVE entries.
pub struct ElfBuilder {
    e_type: u16,
    entry: u32,
    segments: Vec<Segment>,
    relocs: Option<(u32, Vec<u32>)>,
}

impl ElfBuilder {
    pub fn new(e_type: u16, entry: u32) -> Self {
        Self {
            e_type,
            entry,
            segments: Vec::new(),
            relocs: None,
        }
    }

    /// Add a PT_LOAD segment; `memsz` beyond the data becomes bss.
    pub fn segment(mut self, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Add a DT_REL table at image address `table_vaddr` with one
    /// R_386_RELATIVE entry per offset.
    pub fn relocations(mut self, table_vaddr: u32, offsets: &[u32]) -> Self {
        self.relocs = Some((table_vaddr, offsets.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        const EHSIZE: u32 = 52;
        const PHENTSIZE: u32 = 32;

        let phnum = self.segments.len() + if self.relocs.is_some() { 2 } else { 0 };
        let mut offset = EHSIZE + PHENTSIZE * phnum as u32;

        // Lay out file offsets for every payload.
        let seg_offsets: Vec<u32> = self
            .segments
            .iter()
            .map(|seg| {
                let this = offset;
                offset += seg.data.len() as u32;
                this
            })
            .collect();
        let (rel_off, rel_size, dyn_off) = match &self.relocs {
            Some((_, offsets)) => {
                let rel_off = offset;
                let rel_size = offsets.len() as u32 * 8;
                let dyn_off = rel_off + rel_size;
                (rel_off, rel_size, dyn_off)
            }
            None => (0, 0, 0),
        };

        let mut out = Vec::new();

        // ELF header.
        out.extend_from_slice(&ELF_MAGIC);
        out.extend_from_slice(&[1, 1, 1]); // class, data, version
        out.extend_from_slice(&[0; 9]); // osabi, abiversion, padding
        push_u16(&mut out, self.e_type);
        push_u16(&mut out, EM_386);
        push_u32(&mut out, 1); // e_version
        push_u32(&mut out, self.entry);
        push_u32(&mut out, EHSIZE); // e_phoff
        push_u32(&mut out, 0); // e_shoff
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, EHSIZE as u16);
        push_u16(&mut out, PHENTSIZE as u16);
        push_u16(&mut out, phnum as u16);
        push_u16(&mut out, 0); // e_shentsize
        push_u16(&mut out, 0); // e_shnum
        push_u16(&mut out, 0); // e_shstrndx

        // Program headers.
        for (seg, &file_off) in self.segments.iter().zip(&seg_offsets) {
            push_phdr(
                &mut out,
                PT_LOAD,
                file_off,
                seg.vaddr,
                seg.data.len() as u32,
                seg.memsz,
            );
        }
        if let Some((table_vaddr, _)) = &self.relocs {
            push_phdr(&mut out, PT_LOAD, rel_off, *table_vaddr, rel_size, rel_size);
            push_phdr(&mut out, PT_DYNAMIC, dyn_off, 0, 4 * 8, 4 * 8);
        }

        // Payloads, in layout order.
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        if let Some((table_vaddr, offsets)) = &self.relocs {
            for &r_offset in offsets {
                push_u32(&mut out, r_offset);
                push_u32(&mut out, R_386_RELATIVE as u32); // r_info: sym 0
            }
            for (tag, val) in [
                (DT_REL, *table_vaddr),
                (DT_RELSZ, rel_size),
                (DT_RELENT, 8),
                (DT_NULL, 0),
            ] {
                push_u32(&mut out, tag as u32);
                push_u32(&mut out, val);
            }
        }
        out
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_phdr(out: &mut Vec<u8>, p_type: u32, offset: u32, vaddr: u32, filesz: u32, memsz: u32) {
    push_u32(out, p_type);
    push_u32(out, offset);
    push_u32(out, vaddr);
    push_u32(out, vaddr); // p_paddr
    push_u32(out, filesz);
    push_u32(out, memsz);
    push_u32(out, 7); // p_flags: RWX
    push_u32(out, 0x1000); // p_align
}

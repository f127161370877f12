//! Shared test doubles for the hardware seams: sparse user memory and an
//! in-memory VFS.

use alloc::{boxed::Box, collections::BTreeMap, string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::{align_down_4k, user::UserMemory, VirtAddr, PAGE_SIZE},
    vfs::{Fd, Vfs},
};

pub mod elf_builder;

/// Identity virtual-to-physical translation for DMA pool tests.
pub fn identity_translate(virt: usize) -> Option<u64> {
    Some(virt as u64)
}

/// Sparse page-granular user memory.
pub struct MockUserMemory {
    pages: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
    /// (start, size, label) of every map_region call, in order.
    pub regions: Vec<(u32, usize, String)>,
}

impl MockUserMemory {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: Vec::new(),
        }
    }

    pub fn is_mapped(&self, addr: VirtAddr) -> bool {
        self.pages.contains_key(&align_down_4k(addr.as_u32()))
    }

    pub fn read_c_string(&self, addr: VirtAddr) -> String {
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            let mut byte = [0u8; 1];
            self.read_in(cursor, &mut byte).expect("string runs off mapped memory");
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            cursor = cursor.add(1);
        }
        String::from_utf8(out).expect("non-utf8 user string")
    }

    fn for_each_chunk<F>(&mut self, start: VirtAddr, len: usize, mut f: F) -> KernelResult<()>
    where
        F: FnMut(&mut [u8], usize),
    {
        let mut done = 0usize;
        while done < len {
            let addr = start.as_u32() as usize + done;
            let page = align_down_4k(addr as u32);
            let offset = addr - page as usize;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let mem = self
                .pages
                .get_mut(&page)
                .ok_or(KernelError::UnmappedMemory { addr })?;
            f(&mut mem[offset..offset + chunk], done);
            done += chunk;
        }
        Ok(())
    }
}

impl Default for MockUserMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserMemory for MockUserMemory {
    fn map_region(&mut self, start: VirtAddr, size: usize, label: &str) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }
        let first = align_down_4k(start.as_u32());
        let last = align_down_4k(start.as_u32() + size as u32 - 1);
        let mut page = first;
        loop {
            self.pages.entry(page).or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            if page >= last {
                break;
            }
            page += PAGE_SIZE as u32;
        }
        self.regions.push((start.as_u32(), size, String::from(label)));
        Ok(())
    }

    fn ensure_user(&mut self, page: VirtAddr) -> KernelResult<()> {
        if self.is_mapped(page) {
            Ok(())
        } else {
            Err(KernelError::UnmappedMemory {
                addr: page.as_usize(),
            })
        }
    }

    fn copy_out(&mut self, dst: VirtAddr, src: &[u8]) -> KernelResult<()> {
        self.for_each_chunk(dst, src.len(), |mem, done| {
            mem.copy_from_slice(&src[done..done + mem.len()]);
        })
    }

    fn zero(&mut self, dst: VirtAddr, len: usize) -> KernelResult<()> {
        self.for_each_chunk(dst, len, |mem, _| mem.fill(0))
    }

    fn read_in(&self, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
        let mut done = 0usize;
        while done < dst.len() {
            let addr = src.as_u32() as usize + done;
            let page = align_down_4k(addr as u32);
            let offset = addr - page as usize;
            let chunk = (PAGE_SIZE - offset).min(dst.len() - done);
            let mem = self
                .pages
                .get(&page)
                .ok_or(KernelError::UnmappedMemory { addr })?;
            dst[done..done + chunk].copy_from_slice(&mem[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

/// In-memory VFS with open-handle bookkeeping.
pub struct MockVfs {
    files: BTreeMap<String, Vec<u8>>,
    open: BTreeMap<Fd, (String, usize)>,
    next_fd: Fd,
    pub closed: Vec<Fd>,
}

impl MockVfs {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            open: BTreeMap::new(),
            next_fd: 3,
            closed: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(String::from(path), data);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for MockVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MockVfs {
    fn open(&mut self, path: &str, _flags: u32) -> KernelResult<Fd> {
        if !self.files.contains_key(path) {
            return Err(KernelError::NotFound {
                resource: "file",
                id: 0,
            });
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, (String::from(path), 0));
        Ok(fd)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> KernelResult<usize> {
        let (path, pos) = self.open.get_mut(&fd).ok_or(KernelError::IoError {
            operation: "read",
        })?;
        let data = &self.files[path.as_str()];
        let n = buf.len().min(data.len() - *pos);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn close(&mut self, fd: Fd) -> KernelResult<()> {
        self.open.remove(&fd).ok_or(KernelError::IoError {
            operation: "close",
        })?;
        self.closed.push(fd);
        Ok(())
    }
}

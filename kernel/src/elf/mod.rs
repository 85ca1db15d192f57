//! ELF64 executable loader.
//!
//! Parses `ET_EXEC` images, reserves their whole `PT_LOAD` virtual range in
//! the active page maps, copies the segments in and zero-fills the BSS
//! tails. Teardown after the program returns is the caller's job via
//! `page_map::clean_page_maps` rooted at the first load address.

use x86_64::VirtAddr;

use crate::constants::memory::FRAME_SIZE;
use crate::error::{ErrorKind, KernelResult};
use crate::memory::page_map;

pub const ET_EXEC: u16 = 2;
pub const PT_LOAD: u32 = 1;

const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
/// Executables must link into the upper half of the address space.
const LOWEST_APP_ADDRESS: u64 = 0xFFFF_8000_0000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
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
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

const _: () = assert!(core::mem::size_of::<Elf64Ehdr>() == 64);
const _: () = assert!(core::mem::size_of::<Elf64Phdr>() == 56);

/// A validated in-memory ELF image.
pub struct ElfFile<'a> {
    bytes: &'a [u8],
    header: Elf64Ehdr,
}

impl<'a> ElfFile<'a> {
    /// Validates the magic, the object type and the program-header table
    /// bounds.
    pub fn parse(bytes: &'a [u8]) -> KernelResult<Self> {
        if bytes.len() < core::mem::size_of::<Elf64Ehdr>() {
            return Err(ErrorKind::InvalidFormat);
        }
        if bytes[..4] != ELF_MAGIC {
            return Err(ErrorKind::InvalidFormat);
        }
        let header = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Elf64Ehdr) };
        if header.e_type != ET_EXEC {
            return Err(ErrorKind::InvalidFormat);
        }
        if header.e_phentsize as usize != core::mem::size_of::<Elf64Phdr>() {
            return Err(ErrorKind::InvalidFormat);
        }
        let table_end = header.e_phoff as usize
            + header.e_phnum as usize * header.e_phentsize as usize;
        if table_end > bytes.len() {
            return Err(ErrorKind::InvalidFormat);
        }
        Ok(ElfFile { bytes, header })
    }

    pub fn header(&self) -> &Elf64Ehdr {
        &self.header
    }

    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    pub fn program_headers(&self) -> impl Iterator<Item = Elf64Phdr> + '_ {
        let base = self.header.e_phoff as usize;
        let entsize = self.header.e_phentsize as usize;
        (0..self.header.e_phnum as usize).map(move |i| unsafe {
            core::ptr::read_unaligned(self.bytes.as_ptr().add(base + i * entsize) as *const Elf64Phdr)
        })
    }

    /// Lowest `p_vaddr` across `PT_LOAD` headers. Taking the first header's
    /// address is not enough: linkers may emit non-contiguous segments.
    pub fn first_load_address(&self) -> Option<u64> {
        self.load_range().map(|(min, _)| min)
    }

    /// `(vaddr_min, vaddr_max)` over every `PT_LOAD` segment.
    pub fn load_range(&self) -> Option<(u64, u64)> {
        let mut vaddr_min = u64::MAX;
        let mut vaddr_max = 0;
        for phdr in self.program_headers() {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            vaddr_min = vaddr_min.min(phdr.p_vaddr);
            vaddr_max = vaddr_max.max(phdr.p_vaddr + phdr.p_memsz);
        }
        if vaddr_max == 0 {
            None
        } else {
            Some((vaddr_min, vaddr_max))
        }
    }

    /// Number of 4 KiB pages covering the whole load range.
    pub fn num_load_pages(&self) -> usize {
        match self.load_range() {
            Some((min, max)) => ((max - min) as usize).div_ceil(FRAME_SIZE),
            None => 0,
        }
    }
}

/// Maps the load range of `file` into the active address space and copies
/// every `PT_LOAD` segment there. Returns the entry point address.
///
/// Nothing is unmapped on failure: the caller tears down with
/// `clean_page_maps(first_load_address)` whether the load succeeded or not.
pub fn load_elf(file: &ElfFile) -> KernelResult<u64> {
    let (vaddr_min, _) = file.load_range().ok_or(ErrorKind::InvalidFormat)?;
    if vaddr_min < LOWEST_APP_ADDRESS {
        return Err(ErrorKind::InvalidFormat);
    }

    page_map::setup_page_maps(VirtAddr::new(vaddr_min), file.num_load_pages())?;

    for phdr in file.program_headers() {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let file_end = phdr.p_offset as usize + phdr.p_filesz as usize;
        if file_end > file.bytes.len() {
            return Err(ErrorKind::InvalidFormat);
        }
        unsafe {
            let dst = phdr.p_vaddr as *mut u8;
            core::ptr::copy_nonoverlapping(
                file.bytes.as_ptr().add(phdr.p_offset as usize),
                dst,
                phdr.p_filesz as usize,
            );
            core::ptr::write_bytes(
                dst.add(phdr.p_filesz as usize),
                0,
                (phdr.p_memsz - phdr.p_filesz) as usize,
            );
        }
    }
    Ok(file.entry())
}

/// Signature of a loaded program's entry point.
pub type EntryPoint = extern "C" fn(i32, *const *const u8) -> i32;

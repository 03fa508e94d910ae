//! ELF32 executable format.

use zerocopy::{AsBytes, FromBytes};

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// File header.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct ElfHdr {
    pub magic: u32,
    pub elf: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program section header.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

/// Loadable program segment.
pub const ELF_PROG_LOAD: u32 = 1;

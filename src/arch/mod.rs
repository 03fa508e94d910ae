//! Machine-dependent layer.
//!
//! The rest of the kernel sees one flat surface: the types and constants
//! below, plus the operations re-exported from the active implementation.
//! `x86` is the real thing; `hosted` is a stub used when the crate is built
//! for the host (unit tests, `cargo check`), where interrupts do not exist
//! and lock ownership is tracked per thread.

use cfg_if::cfg_if;

use bitflags::bitflags;

cfg_if! {
    if #[cfg(all(target_arch = "x86", not(test)))] {
        pub mod x86;
        pub use x86::*;
    } else {
        mod hosted;
        pub use hosted::*;
    }
}

/// Page size in bytes.
pub const PGSIZE: usize = 4096;

// Memory layout. The kernel is linked high; physical memory is mapped
// starting at KERNBASE, devices at DEVSPACE.

/// Start of extended memory.
pub const EXTMEM: usize = 0x10_0000;

/// Top of usable physical memory.
pub const PHYSTOP: usize = 0xE00_0000;

/// Other devices are at high addresses.
pub const DEVSPACE: usize = 0xFE00_0000;

/// First kernel virtual address.
pub const KERNBASE: usize = 0x8000_0000;

/// Address where the kernel is linked.
pub const KERNLINK: usize = KERNBASE + EXTMEM;

/// Kernel virtual address of a physical address.
pub const fn p2v(pa: usize) -> usize {
    pa + KERNBASE
}

/// Physical address of a kernel virtual address.
pub const fn v2p(va: usize) -> usize {
    va - KERNBASE
}

pub const fn pgroundup(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

// Two-level 32-bit page tables: a page directory of NPDENTRIES entries,
// each pointing at a page table of NPTENTRIES entries.

pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

const PTXSHIFT: usize = 12;
const PDXSHIFT: usize = 22;

/// Page directory index of a virtual address.
pub const fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & 0x3FF
}

/// Page table index of a virtual address.
pub const fn ptx(va: usize) -> usize {
    (va >> PTXSHIFT) & 0x3FF
}

bitflags! {
    /// Page table entry flags.
    pub struct PteFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Writeable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// 4 MiB page (page directory only).
        const PS = 1 << 7;
    }
}

/// Address portion of a page table entry.
pub const fn pte_addr(pte: usize) -> usize {
    pte & !0xFFF
}

// Traps. Low 32 vectors are processor-defined exceptions; device IRQs are
// routed at T_IRQ0 and up; the system call gate is its own vector.

pub const T_PGFLT: usize = 14;
pub const T_SYSCALL: usize = 64;
pub const T_IRQ0: usize = 32;

pub const IRQ_TIMER: usize = 0;
pub const IRQ_KBD: usize = 1;
pub const IRQ_COM1: usize = 4;
pub const IRQ_E1000: usize = 11;
pub const IRQ_MOUSE: usize = 12;
pub const IRQ_IDE: usize = 14;
pub const IRQ_ERROR: usize = 19;
pub const IRQ_SPURIOUS: usize = 31;

/// Interrupt-enable bit in EFLAGS.
pub const FL_IF: u32 = 0x200;

// Segment selectors.

pub const SEG_KCODE: u16 = 1;
pub const SEG_KDATA: u16 = 2;
pub const SEG_UCODE: u16 = 3;
pub const SEG_UDATA: u16 = 4;
pub const SEG_TSS: u16 = 5;

pub const DPL_USER: u16 = 3;

/// One contiguous kernel mapping: virtual [virt, virt + (end - start))
/// maps physical [start, end).
pub struct KmapEntry {
    pub virt: usize,
    pub start: usize,
    pub end: usize,
    pub perm: PteFlags,
}

/// Saved registers for kernel context switches. Everything else is either
/// callee-saved on the kernel stack or does not need saving; the stack
/// pointer is the address of the context itself.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: 0,
        }
    }
}

/// Layout of the per-process trap frame built by the trap entry stubs.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    // registers as pushed by pushad
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings, such as from user to kernel
    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            oesp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            gs: 0,
            padding1: 0,
            fs: 0,
            padding2: 0,
            es: 0,
            padding3: 0,
            ds: 0,
            padding4: 0,
            trapno: 0,
            err: 0,
            eip: 0,
            cs: 0,
            padding5: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            padding6: 0,
        }
    }
}

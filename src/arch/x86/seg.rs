//! Segmentation: per-CPU GDT, TSS, and the IDT.
//!
//! x86 requires segments even though the kernel uses flat 32-bit mappings;
//! the only interesting segment state is the TSS, which tells the CPU which
//! kernel stack to switch to on a trap from user mode.

use core::cell::UnsafeCell;

use crate::arch::x86::asm::{lgdt, lidt, ltr};
use crate::arch::x86::trapasm::vectors;
use crate::arch::{cpu_id, DPL_USER, SEG_KCODE, SEG_KDATA, SEG_TSS, T_SYSCALL};
use crate::param::NCPU;

const NSEGS: usize = 6;

// Application segment type bits.
const STA_X: u32 = 0x8;
const STA_W: u32 = 0x2;
const STA_R: u32 = 0x2;

// System segment type: available 32-bit TSS.
const STS_T32A: u32 = 0x9;

// Gate types.
const STS_IG32: u32 = 0xE;
const STS_TG32: u32 = 0xF;

/// One GDT entry, packed into its hardware representation.
#[derive(Copy, Clone)]
#[repr(transparent)]
struct SegDesc(u64);

impl SegDesc {
    const fn null() -> Self {
        Self(0)
    }

    /// Normal segment: 4 KiB granularity, 32-bit, present.
    const fn seg(typ: u32, base: u32, lim: u32, dpl: u32) -> Self {
        Self::raw(typ, base, lim >> 12, dpl, 1)
    }

    /// System segment: byte granularity, used for the TSS.
    const fn seg16(typ: u32, base: u32, lim: u32, dpl: u32) -> Self {
        Self::raw(typ, base, lim, dpl, 0)
    }

    const fn raw(typ: u32, base: u32, lim: u32, dpl: u32, gran: u32) -> Self {
        let lo = ((base & 0xFFFF) << 16) | (lim & 0xFFFF);
        let hi = ((base >> 16) & 0xFF)
            | (typ << 8)
            | (1 << 12) // descriptor type: application unless typ says system
            | (dpl << 13)
            | (1 << 15) // present
            | (lim & 0xF_0000)
            | (1 << 22) // 32-bit
            | (gran << 23)
            | (base & 0xFF00_0000);
        Self(((hi as u64) << 32) | lo as u64)
    }

    const fn system(typ: u32, base: u32, lim: u32, dpl: u32) -> Self {
        // Same as raw but with the S bit clear.
        let d = Self::seg16(typ, base, lim, dpl).0;
        Self(d & !(1u64 << (32 + 12)))
    }
}

/// One IDT gate.
#[derive(Copy, Clone)]
#[repr(transparent)]
struct GateDesc(u64);

impl GateDesc {
    const fn null() -> Self {
        Self(0)
    }

    fn gate(is_trap: bool, sel: u16, off: u32, dpl: u32) -> Self {
        let typ = if is_trap { STS_TG32 } else { STS_IG32 };
        let lo = ((sel as u32) << 16) | (off & 0xFFFF);
        let hi = (off & 0xFFFF_0000) | (1 << 15) | (dpl << 13) | (typ << 8);
        Self(((hi as u64) << 32) | lo as u64)
    }
}

/// Task state segment. Only ss0/esp0 and the I/O map base matter here.
#[derive(Copy, Clone)]
#[repr(C)]
struct TaskState {
    link: u32,
    esp0: u32,
    ss0: u16,
    padding1: u16,
    unused: [u32; 22],
    padding2: u16,
    iomb: u16,
}

impl TaskState {
    const fn zero() -> Self {
        Self {
            link: 0,
            esp0: 0,
            ss0: 0,
            padding1: 0,
            unused: [0; 22],
            padding2: 0,
            iomb: 0,
        }
    }
}

struct CpuSeg {
    gdt: [SegDesc; NSEGS],
    ts: TaskState,
}

struct PerCpu([UnsafeCell<CpuSeg>; NCPU]);

// SAFETY: each CPU touches only its own slot, with interrupts disabled.
unsafe impl Sync for PerCpu {}

static SEGS: PerCpu = PerCpu(
    array_macro::array![_ => UnsafeCell::new(CpuSeg { gdt: [SegDesc::null(); NSEGS], ts: TaskState::zero() }); NCPU],
);

struct Idt(UnsafeCell<[GateDesc; 256]>);

// SAFETY: written once at boot, read-only afterwards.
unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([GateDesc::null(); 256]));

/// Build the interrupt descriptor table. Run once on the boot CPU.
pub unsafe fn trap_vector_init() {
    // SAFETY: runs before interrupts are enabled anywhere.
    let idt = unsafe { &mut *IDT.0.get() };
    for (i, gate) in idt.iter_mut().enumerate() {
        // SAFETY: vectors is a table of valid stub addresses.
        *gate = GateDesc::gate(false, SEG_KCODE << 3, unsafe { vectors[i] }, 0);
    }
    // The system call gate is a trap gate reachable from user mode.
    idt[T_SYSCALL] = GateDesc::gate(true, SEG_KCODE << 3, unsafe { vectors[T_SYSCALL] }, DPL_USER as u32);
}

/// Install the IDT on the executing CPU.
pub unsafe fn load_idt() {
    unsafe { lidt(IDT.0.get() as *const u8, (256 * 8) as u16) };
}

/// Set up the flat kernel/user segments on the executing CPU.
pub unsafe fn seginit() {
    // SAFETY: interrupts are off and this is the executing CPU's slot.
    let seg = unsafe { &mut *SEGS.0[cpu_id()].get() };
    seg.gdt[SEG_KCODE as usize] = SegDesc::seg(STA_X | STA_R, 0, 0xFFFF_FFFF, 0);
    seg.gdt[SEG_KDATA as usize] = SegDesc::seg(STA_W, 0, 0xFFFF_FFFF, 0);
    seg.gdt[crate::arch::SEG_UCODE as usize] =
        SegDesc::seg(STA_X | STA_R, 0, 0xFFFF_FFFF, DPL_USER as u32);
    seg.gdt[crate::arch::SEG_UDATA as usize] =
        SegDesc::seg(STA_W, 0, 0xFFFF_FFFF, DPL_USER as u32);
    unsafe { lgdt(seg.gdt.as_ptr() as *const u8, (NSEGS * 8) as u16) };
}

/// Point the executing CPU's TSS at the given kernel stack top, so traps
/// from user mode land on the right stack.
pub unsafe fn switch_user_segment(esp0: usize) {
    // SAFETY: interrupts are off and this is the executing CPU's slot.
    let seg = unsafe { &mut *SEGS.0[cpu_id()].get() };
    seg.ts.ss0 = SEG_KDATA << 3;
    seg.ts.esp0 = esp0 as u32;
    // Forbid I/O instructions from user space.
    seg.ts.iomb = 0xFFFF;
    seg.gdt[SEG_TSS as usize] = SegDesc::system(
        STS_T32A,
        &seg.ts as *const TaskState as u32,
        (core::mem::size_of::<TaskState>() - 1) as u32,
        0,
    );
    unsafe { ltr(SEG_TSS << 3) };
}

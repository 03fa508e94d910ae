//! 32-bit x86 implementation of the machine layer.

use core::arch::global_asm;

use arrayvec::ArrayVec;

use crate::arch::{
    v2p, KmapEntry, PteFlags, DEVSPACE, EXTMEM, FL_IF, KERNBASE, KERNLINK, NPDENTRIES, PHYSTOP,
};
use crate::kernel::kernel;

pub mod asm;
pub mod ioapic;
pub mod kbd;
pub mod lapic;
pub mod mp;
pub mod picirq;
pub mod seg;
pub mod swtch;
pub mod timer;
pub mod trapasm;
pub mod uart;

pub use asm::{halt, inb, inl, insl, lcr3, outb, outl, outsl};
pub use seg::switch_user_segment;
pub use swtch::swtch;
pub use trapasm::trapret;

pub unsafe fn intr_on() {
    unsafe { asm::sti() };
}

pub unsafe fn intr_off() {
    unsafe { asm::cli() };
}

pub fn intr_get() -> bool {
    asm::read_eflags() & FL_IF != 0
}

/// Index of the executing CPU. Must be called with interrupts disabled to
/// keep the answer from changing under the caller's feet.
pub fn cpu_id() -> usize {
    let apicid = lapic::id();
    for (i, cpu) in kernel().cpus_slice().iter().enumerate() {
        // SAFETY: apicid is written once during mpinit, before other CPUs run.
        if unsafe { (*cpu.get()).apicid } == apicid {
            return i;
        }
    }
    panic!("cpu_id: unknown apicid");
}

/// Opaque token identifying the executing CPU for lock ownership.
pub fn lock_token() -> *mut u8 {
    kernel().current_cpu_raw() as *mut u8
}

/// The fixed kernel mappings, present in every page directory: the low I/O
/// space, kernel text and read-only data, kernel data plus free memory, and
/// the device window.
pub fn kmap() -> ArrayVec<KmapEntry, 4> {
    extern "C" {
        // Linker-provided section boundaries.
        static etext: [u8; 0];
    }
    // SAFETY: only the address of the symbol is taken.
    let etext = unsafe { etext.as_ptr() as usize };

    let mut map = ArrayVec::new();
    map.push(KmapEntry {
        virt: KERNBASE,
        start: 0,
        end: EXTMEM,
        perm: PteFlags::W,
    });
    map.push(KmapEntry {
        virt: KERNLINK,
        start: v2p(KERNLINK),
        end: v2p(etext),
        perm: PteFlags::empty(),
    });
    map.push(KmapEntry {
        virt: etext,
        start: v2p(etext),
        end: PHYSTOP,
        perm: PteFlags::W,
    });
    map.push(KmapEntry {
        virt: DEVSPACE,
        start: DEVSPACE,
        end: 0usize.wrapping_sub(1) & !0xFFF,
        perm: PteFlags::W,
    });
    map
}

// Boot page directory: virtual [0, 4MB) and [KERNBASE, KERNBASE+4MB) both
// map physical [0, 4MB) with one 4 MiB page each, enough to turn paging on
// and jump high. Replaced by the real kernel page directory in kmain.
#[repr(align(4096))]
pub struct BootPgDir(pub [u32; NPDENTRIES]);

const PTE_P: u32 = 0x001;
const PTE_W: u32 = 0x002;
const PTE_PS: u32 = 0x080;

const fn boot_pgdir() -> BootPgDir {
    let mut pgdir = [0u32; NPDENTRIES];
    pgdir[0] = PTE_P | PTE_W | PTE_PS;
    pgdir[KERNBASE >> 22] = PTE_P | PTE_W | PTE_PS;
    BootPgDir(pgdir)
}

#[no_mangle]
pub static ENTRYPGDIR: BootPgDir = boot_pgdir();

// The boot loader enters here in 32-bit protected mode with paging off.
// Turn on 4 MiB pages, point cr3 at the boot page directory, enable paging
// and write protection, then jump to kmain on a fresh high stack.
global_asm!(
    r#"
.set CR4_PSE,     0x10
.set CR0_PG,      0x80000000
.set CR0_WP,      0x10000
.set KERNBASE,    0x80000000

.section .text

# Multiboot header, for boot loaders that look for one.
.p2align 2
.long 0x1BADB002
.long 0
.long -0x1BADB002

.globl entry
entry:
    mov eax, cr4
    or eax, CR4_PSE
    mov cr4, eax

    mov eax, offset ENTRYPGDIR
    sub eax, KERNBASE
    mov cr3, eax

    mov eax, cr0
    or eax, CR0_PG | CR0_WP
    mov cr0, eax

    mov esp, offset entry_stack_top
    mov eax, offset kmain
    jmp eax

.section .bss
.p2align 4
entry_stack:
    .space 4096
entry_stack_top:
"#
);

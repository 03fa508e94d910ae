//! Trap entry stubs: one vector per interrupt number, a common register
//! save path, and the return path used both for trap return and for the
//! first entry of a forked process into user space.

use core::arch::global_asm;

extern "C" {
    /// Table of the 256 vector stub addresses, installed into the IDT.
    pub static vectors: [u32; 256];

    /// Trap return path; pops a TrapFrame and executes iret.
    pub fn trapret();
}

// Vectors 8, 10-14 and 17 push an error code in hardware; the others get a
// zero pushed so the TrapFrame layout is uniform.
global_asm!(
    r#"
.altmacro

.macro vecstub n
vector\n:
    .if (\n == 8) || ((\n >= 10) && (\n <= 14)) || (\n == 17)
    .else
    push 0
    .endif
    push \n
    jmp alltraps
.endm

.macro vecentry n
    .long vector\n
.endm

.section .text
.set i, 0
.rept 256
    vecstub %i
    .set i, i + 1
.endr

alltraps:
    push ds
    push es
    push fs
    push gs
    pushad

    # Load the kernel data segment descriptors.
    mov ax, (2 << 3)
    mov ds, ax
    mov es, ax

    # Call trap(tf), where tf points at the frame just built.
    push esp
    call trap
    add esp, 4

.globl trapret
trapret:
    popad
    pop gs
    pop fs
    pop es
    pop ds
    add esp, 8
    iretd

.section .rodata
.globl vectors
.p2align 2
vectors:
.set i, 0
.rept 256
    vecentry %i
    .set i, i + 1
.endr
"#
);

//! Kernel context switch.

use core::arch::global_asm;

use crate::arch::Context;

extern "C" {
    /// Save the current register context at `*old` and switch to `new`.
    pub fn swtch(old: *mut *mut Context, new: *mut Context);
}

// Save current callee-saved registers on the stack, making a Context at the
// stack top; store its address in *old, switch stacks to new, pop the new
// context's registers and return to its saved eip.
global_asm!(
    r#"
.globl swtch
swtch:
    mov eax, [esp + 4]
    mov edx, [esp + 8]

    push ebp
    push ebx
    push esi
    push edi

    mov [eax], esp
    mov esp, edx

    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

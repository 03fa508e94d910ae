//! Trap dispatch: the single entry point for faults, device interrupts
//! and system calls, reached from the vector stubs with a trap frame on
//! the current kernel stack.

#[cfg(all(target_arch = "x86", not(test)))]
mod handler {
    use crate::arch::x86::{asm, kbd, lapic, picirq, uart};
    use crate::arch::{
        TrapFrame, IRQ_COM1, IRQ_E1000, IRQ_IDE, IRQ_KBD, IRQ_MOUSE, IRQ_SPURIOUS, IRQ_TIMER,
        T_IRQ0, T_SYSCALL,
    };
    use crate::kernel::kernel;
    use crate::proc::{myproc, ProcState};
    use crate::println;
    use crate::syscall::syscall;

    fn eoi() {
        if lapic::present() {
            lapic::eoi();
        } else {
            // SAFETY: the PICs own their ports.
            unsafe { picirq::eoi() };
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn trap(tf: *mut TrapFrame) {
        // SAFETY: tf points at the frame the stubs just built.
        let trapno = unsafe { (*tf).trapno } as usize;

        if trapno == T_SYSCALL {
            let p = myproc();
            // SAFETY: syscalls only arrive from user mode, so p is live.
            unsafe {
                if (*p).killed() {
                    kernel().procs().exit_current();
                }
                (*(*p).data_raw()).tf = tf;
                syscall();
                if (*p).killed() {
                    kernel().procs().exit_current();
                }
            }
            return;
        }

        match trapno {
            t if t == T_IRQ0 + IRQ_TIMER => {
                if crate::arch::cpu_id() == 0 {
                    let mut ticks = kernel().ticks.lock();
                    *ticks = ticks.wrapping_add(1);
                    ticks.wakeup();
                }
                eoi();
            }
            t if t == T_IRQ0 + IRQ_IDE => {
                kernel().ide.intr();
                eoi();
            }
            t if t == T_IRQ0 + IRQ_KBD => {
                kernel().console.intr(kbd::getc);
                eoi();
            }
            t if t == T_IRQ0 + IRQ_COM1 => {
                kernel().console.intr(uart::getc);
                eoi();
            }
            t if t == T_IRQ0 + IRQ_MOUSE => {
                kernel().mouse.intr();
                eoi();
            }
            t if t == T_IRQ0 + IRQ_E1000 => {
                kernel().net.e1000.intr();
                eoi();
            }
            t if t == T_IRQ0 + IRQ_SPURIOUS => {
                println!(
                    "cpu{}: spurious interrupt at {:#x}",
                    crate::arch::cpu_id(),
                    // SAFETY: as above.
                    unsafe { (*tf).eip },
                );
                eoi();
            }
            _ => {
                let p = myproc();
                // SAFETY: as above; cs selects the originating ring.
                if p.is_null() || unsafe { (*tf).cs } & 3 == 0 {
                    // A fault in the kernel itself is fatal.
                    println!(
                        "unexpected trap {} from cpu {} eip {:#x} (cr2={:#x})",
                        trapno,
                        crate::arch::cpu_id(),
                        unsafe { (*tf).eip },
                        asm::rcr2(),
                    );
                    panic!("trap");
                }

                // A faulting user process is killed.
                unsafe {
                    println!(
                        "pid {}: trap {} err {} on cpu {} eip {:#x} addr {:#x} -- kill proc",
                        crate::proc::current_pid(),
                        trapno,
                        (*tf).err,
                        crate::arch::cpu_id(),
                        (*tf).eip,
                        asm::rcr2(),
                    );
                    (*p).kill();
                }
            }
        }

        let p = myproc();
        if p.is_null() {
            return;
        }

        // Force the process to exit if it has been killed and is in user
        // space; a killed process in kernel space runs until it reaches
        // the regular return path.
        // SAFETY: p is the current process.
        unsafe {
            if (*p).killed() && (*tf).cs & 3 == 3 {
                kernel().procs().exit_current();
            }

            // Preempt at the tick.
            if trapno == T_IRQ0 + IRQ_TIMER {
                let state = (*(*p).info.get_mut_raw()).state;
                if state == ProcState::Running {
                    kernel().procs().yield_current();
                }
            }

            if (*p).killed() && (*tf).cs & 3 == 3 {
                kernel().procs().exit_current();
            }
        }
    }
}

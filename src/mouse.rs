//! PS/2 mouse: a character device delivering the controller's 3-byte
//! movement packets to user space.

use crate::file::{Devsw, MOUSE_MAJOR};
use crate::kernel::kernel;
use crate::lock::Sleepablelock;
use crate::proc::myproc;

const QUEUE_SIZE: usize = 256;

const PS2_DATA: u16 = 0x60;
const PS2_STATUS: u16 = 0x64;
const PS2_CMD: u16 = 0x64;

struct MouseQueue {
    buf: [u8; QUEUE_SIZE],
    r: usize,
    w: usize,
}

pub struct Mouse {
    queue: Sleepablelock<MouseQueue>,
}

impl Mouse {
    pub const fn new() -> Self {
        Self {
            queue: Sleepablelock::new("mouse", MouseQueue {
                buf: [0; QUEUE_SIZE],
                r: 0,
                w: 0,
            }),
        }
    }

    /// Enable the PS/2 aux device and register the character device.
    pub fn init(&self) {
        kernel().devsw.lock()[MOUSE_MAJOR as usize] = Devsw {
            read: Some(mouse_read),
            write: None,
        };

        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: boot-time controller programming.
        unsafe {
            use crate::arch::{x86, IRQ_MOUSE};

            wait_write();
            x86::outb(PS2_CMD, 0xA8); // enable aux interface

            // Enable the aux interrupt in the controller config byte.
            wait_write();
            x86::outb(PS2_CMD, 0x20);
            wait_read();
            let status = x86::inb(PS2_DATA) | 2;
            wait_write();
            x86::outb(PS2_CMD, 0x60);
            wait_write();
            x86::outb(PS2_DATA, status);

            aux_cmd(0xF6); // set defaults
            aux_cmd(0xF4); // enable data reporting

            x86::ioapic::enable(IRQ_MOUSE, 0);
            x86::picirq::enable(IRQ_MOUSE);
        }
    }

    /// Interrupt handler: pull one byte from the controller into the
    /// packet queue.
    pub fn intr(&self) {
        // SAFETY: the PS/2 controller owns ports 0x60/0x64.
        let status = unsafe { crate::arch::inb(PS2_STATUS) };
        if status & 1 == 0 || status & 0x20 == 0 {
            return;
        }
        let data = unsafe { crate::arch::inb(PS2_DATA) };

        let mut queue = self.queue.lock();
        if queue.w.wrapping_sub(queue.r) < QUEUE_SIZE {
            let w = queue.w;
            queue.buf[w % QUEUE_SIZE] = data;
            queue.w = w.wrapping_add(1);
            queue.wakeup();
        }
    }

    /// Blocking read; returns exactly the requested number of bytes, or
    /// -1 when the process is killed while waiting.
    fn read(&self, dst: *mut u8, n: i32) -> i32 {
        let target = n;
        let mut n = n;
        let mut dst = dst;

        let mut queue = self.queue.lock();
        while n > 0 {
            while queue.r == queue.w {
                let p = myproc();
                // SAFETY: null-checked; p is the current process.
                if !p.is_null() && unsafe { (*p).killed() } {
                    return -1;
                }
                queue.sleep();
            }
            let c = queue.buf[queue.r % QUEUE_SIZE];
            queue.r = queue.r.wrapping_add(1);
            // SAFETY: the caller validated [dst, dst+target).
            unsafe {
                *dst = c;
                dst = dst.add(1);
            }
            n -= 1;
        }
        target - n
    }
}

fn mouse_read(_minor: u16, dst: *mut u8, n: i32, _off: u32) -> i32 {
    kernel().mouse.read(dst, n)
}

#[cfg(all(target_arch = "x86", not(test)))]
unsafe fn wait_write() {
    for _ in 0..100_000 {
        // SAFETY: status reads are side-effect free.
        if unsafe { crate::arch::inb(PS2_STATUS) } & 2 == 0 {
            return;
        }
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
unsafe fn wait_read() {
    for _ in 0..100_000 {
        // SAFETY: status reads are side-effect free.
        if unsafe { crate::arch::inb(PS2_STATUS) } & 1 == 1 {
            return;
        }
    }
}

/// Send a command to the mouse itself (through the controller).
#[cfg(all(target_arch = "x86", not(test)))]
unsafe fn aux_cmd(cmd: u8) {
    unsafe {
        wait_write();
        crate::arch::outb(PS2_CMD, 0xD4);
        wait_write();
        crate::arch::outb(PS2_DATA, cmd);
    }
}

//! 8250 serial port (COM1), mirrored alongside the CGA console.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86::asm::{inb, outb};
use crate::arch::x86::{ioapic, picirq};
use crate::arch::IRQ_COM1;

const COM1: u16 = 0x3F8;

static PRESENT: AtomicBool = AtomicBool::new(false);

pub unsafe fn init() {
    unsafe {
        // Turn off the FIFO.
        outb(COM1 + 2, 0);

        // 9600 baud, 8 data bits, 1 stop bit, parity off.
        outb(COM1 + 3, 0x80); // Unlock divisor
        outb(COM1, (115200u32 / 9600) as u8);
        outb(COM1 + 1, 0);
        outb(COM1 + 3, 0x03); // Lock divisor, 8 data bits.
        outb(COM1 + 4, 0);
        outb(COM1 + 1, 0x01); // Enable receive interrupts.

        // If status is 0xFF, no serial port.
        if inb(COM1 + 5) == 0xFF {
            return;
        }
        PRESENT.store(true, Ordering::Release);

        // Acknowledge pre-existing interrupt conditions; enable interrupts.
        let _ = inb(COM1 + 2);
        let _ = inb(COM1);
        ioapic::enable(IRQ_COM1, 0);
        picirq::enable(IRQ_COM1);
    }
}

pub fn putc(c: u8) {
    if !PRESENT.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: COM1 is this driver's port range.
    unsafe {
        for _ in 0..128 {
            if inb(COM1 + 5) & 0x20 != 0 {
                break;
            }
        }
        outb(COM1, c);
    }
}

pub fn getc() -> Option<u8> {
    if !PRESENT.load(Ordering::Acquire) {
        return None;
    }
    // SAFETY: COM1 is this driver's port range.
    unsafe {
        if inb(COM1 + 5) & 0x01 == 0 {
            None
        } else {
            Some(inb(COM1))
        }
    }
}

//! I/O APIC driver: routes device interrupts to CPUs on APIC systems.

use crate::arch::{p2v, T_IRQ0};

const IOAPIC_PA: usize = 0xFEC0_0000;

const REG_ID: u32 = 0x00;
const REG_VER: u32 = 0x01;
const REG_TABLE: u32 = 0x10;

const INT_DISABLED: u32 = 0x0001_0000;

#[repr(C)]
struct IoApicMmio {
    reg: u32,
    pad: [u32; 3],
    data: u32,
}

fn mmio() -> *mut IoApicMmio {
    p2v(IOAPIC_PA) as *mut IoApicMmio
}

unsafe fn read(reg: u32) -> u32 {
    let io = mmio();
    unsafe {
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*io).reg), reg);
        core::ptr::read_volatile(core::ptr::addr_of!((*io).data))
    }
}

unsafe fn write(reg: u32, data: u32) {
    let io = mmio();
    unsafe {
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*io).reg), reg);
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*io).data), data);
    }
}

/// Mask all redirection entries. Devices enable theirs with `enable`.
pub unsafe fn init() {
    // SAFETY: the I/O APIC is mapped at IOAPIC_PA on APIC systems.
    let maxintr = unsafe { read(REG_VER) } >> 16 & 0xFF;
    let _id = unsafe { read(REG_ID) } >> 24;

    // Mark all interrupts edge-triggered, active high, disabled, and not
    // routed to any CPU.
    for i in 0..=maxintr {
        unsafe {
            write(REG_TABLE + 2 * i, INT_DISABLED | (T_IRQ0 as u32 + i));
            write(REG_TABLE + 2 * i + 1, 0);
        }
    }
}

/// Route the given IRQ to the given CPU, edge-triggered active-high.
pub unsafe fn enable(irq: usize, cpu_apicid: u8) {
    unsafe {
        write(REG_TABLE + 2 * irq as u32, (T_IRQ0 + irq) as u32);
        write(REG_TABLE + 2 * irq as u32 + 1, (cpu_apicid as u32) << 24);
    }
}

//! Intel E1000 network driver.
//!
//! Found by a linear PCI scan at boot; transmit and receive run over two
//! 16-descriptor rings backed by packet buffers. Only the receive-timer
//! interrupt is enabled; transmit completion is observed through the
//! descriptor-done bit when the ring slot is reused.

use core::sync::atomic::{AtomicUsize, Ordering};

use array_macro::array;

use super::pci;
use super::{Mbuf, MbufPool, NetDevice};
use crate::arch::v2p;
use crate::kernel::kernel;
use crate::lock::Spinlock;

const TX_RING_SIZE: usize = 16;
const RX_RING_SIZE: usize = 16;

const PCI_VENDOR_INTEL: u16 = 0x8086;
const PCI_DEVICE_E1000: u16 = 0x100E;

// Register offsets, in bytes.
const E1000_CTL: usize = 0x0000;
const E1000_ICR: usize = 0x00C0;
const E1000_IMS: usize = 0x00D0;
const E1000_RCTL: usize = 0x0100;
const E1000_TCTL: usize = 0x0400;
const E1000_RDBAL: usize = 0x2800;
const E1000_RDBAH: usize = 0x2804;
const E1000_RDLEN: usize = 0x2808;
const E1000_RDH: usize = 0x2810;
const E1000_RDT: usize = 0x2818;
const E1000_TDBAL: usize = 0x3800;
const E1000_TDBAH: usize = 0x3804;
const E1000_TDLEN: usize = 0x3808;
const E1000_TDH: usize = 0x3810;
const E1000_TDT: usize = 0x3818;

const E1000_CTL_RST: u32 = 0x0400_0000;
const E1000_CTL_SLU: u32 = 0x0000_0040;
const E1000_CTL_FRCSPD: u32 = 0x0000_0800;
const E1000_CTL_FRCDPLX: u32 = 0x0000_1000;

const E1000_RCTL_EN: u32 = 0x0000_0002;
const E1000_RCTL_BAM: u32 = 0x0000_8000;
const E1000_RCTL_SZ_2048: u32 = 0x0000_0000;
const E1000_RCTL_SECRC: u32 = 0x0400_0000;

const E1000_TCTL_EN: u32 = 0x0000_0002;
const E1000_TCTL_PSP: u32 = 0x0000_0008;

const E1000_IMS_RXT0: u32 = 0x0000_0080;

const E1000_TXD_STAT_DD: u8 = 0x01;
const E1000_TXD_CMD_EOP: u8 = 0x01;
const E1000_TXD_CMD_RS: u8 = 0x08;

const E1000_RXD_STAT_DD: u8 = 0x01;

/// Legacy transmit descriptor.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct TxDesc {
    addr: u64,
    length: u16,
    cso: u8,
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

impl TxDesc {
    const fn zero() -> Self {
        Self {
            addr: 0,
            length: 0,
            cso: 0,
            cmd: 0,
            status: 0,
            css: 0,
            special: 0,
        }
    }
}

/// Legacy receive descriptor.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct RxDesc {
    addr: u64,
    length: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

impl RxDesc {
    const fn zero() -> Self {
        Self {
            addr: 0,
            length: 0,
            checksum: 0,
            status: 0,
            errors: 0,
            special: 0,
        }
    }
}

struct E1000Inner {
    tx_ring: [TxDesc; TX_RING_SIZE],
    rx_ring: [RxDesc; RX_RING_SIZE],
    tx_mbufs: [Option<Mbuf>; TX_RING_SIZE],
    rx_mbufs: [Option<Mbuf>; RX_RING_SIZE],
}

pub struct E1000 {
    /// MMIO base; the device window is identity-mapped, so the physical
    /// BAR doubles as the pointer. Zero when no NIC was found.
    regs: AtomicUsize,

    inner: Spinlock<E1000Inner>,
}

impl E1000 {
    pub const fn new() -> Self {
        Self {
            regs: AtomicUsize::new(0),
            inner: Spinlock::new("e1000", E1000Inner {
                tx_ring: [TxDesc::zero(); TX_RING_SIZE],
                rx_ring: [RxDesc::zero(); RX_RING_SIZE],
                tx_mbufs: array![_ => None; TX_RING_SIZE],
                rx_mbufs: array![_ => None; RX_RING_SIZE],
            }),
        }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        let base = self.regs.load(Ordering::Acquire);
        // SAFETY: base is the device's MMIO window.
        unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        let base = self.regs.load(Ordering::Acquire);
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
    }

    /// Probe the PCI bus and bring the device up: reset, force link,
    /// install the rings, enable receive and transmit, and unmask only
    /// the receive-timer interrupt.
    pub fn init(&self, pool: &MbufPool) {
        let Some(f) = pci::find(PCI_VENDOR_INTEL, PCI_DEVICE_E1000) else {
            return;
        };
        f.enable_bus_master();
        self.regs.store(f.bar0() as usize, Ordering::Release);

        // Reset, with interrupts masked across it.
        self.write_reg(E1000_IMS, 0);
        self.write_reg(E1000_CTL, self.read_reg(E1000_CTL) | E1000_CTL_RST);
        self.write_reg(E1000_IMS, 0);

        // Force link up, speed and duplex.
        self.write_reg(
            E1000_CTL,
            self.read_reg(E1000_CTL) | E1000_CTL_SLU | E1000_CTL_FRCSPD | E1000_CTL_FRCDPLX,
        );

        let mut inner = self.inner.lock();

        for i in 0..RX_RING_SIZE {
            let m = pool.alloc(0).expect("e1000: out of packet buffers");
            inner.rx_ring[i] = RxDesc {
                addr: v2p(m.head_ptr() as usize) as u64,
                ..RxDesc::zero()
            };
            inner.rx_mbufs[i] = Some(m);
        }
        self.write_reg(E1000_RDBAL, v2p(inner.rx_ring.as_ptr() as usize) as u32);
        self.write_reg(E1000_RDBAH, 0);
        self.write_reg(E1000_RDLEN, core::mem::size_of_val(&inner.rx_ring) as u32);
        self.write_reg(E1000_RDH, 0);
        self.write_reg(E1000_RDT, RX_RING_SIZE as u32 - 1);
        self.write_reg(
            E1000_RCTL,
            E1000_RCTL_EN | E1000_RCTL_BAM | E1000_RCTL_SZ_2048 | E1000_RCTL_SECRC,
        );

        for i in 0..TX_RING_SIZE {
            inner.tx_ring[i].status = E1000_TXD_STAT_DD;
            inner.tx_mbufs[i] = None;
        }
        self.write_reg(E1000_TDBAL, v2p(inner.tx_ring.as_ptr() as usize) as u32);
        self.write_reg(E1000_TDBAH, 0);
        self.write_reg(E1000_TDLEN, core::mem::size_of_val(&inner.tx_ring) as u32);
        self.write_reg(E1000_TDH, 0);
        self.write_reg(E1000_TDT, 0);
        self.write_reg(E1000_TCTL, E1000_TCTL_EN | E1000_TCTL_PSP);

        drop(inner);

        self.write_reg(E1000_IMS, E1000_IMS_RXT0);

        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: boot-time interrupt routing.
        unsafe {
            use crate::arch::{x86, IRQ_E1000};
            x86::ioapic::enable(IRQ_E1000, 0);
            x86::picirq::enable(IRQ_E1000);
        }
    }

    /// Receive interrupt: walk the ring from tail+1 while the
    /// descriptor-done bit is set, handing each completed frame to the
    /// stack and reseating a fresh buffer.
    pub fn intr(&self) {
        if self.regs.load(Ordering::Acquire) == 0 {
            return;
        }
        // Reading ICR acknowledges the interrupt.
        let _ = self.read_reg(E1000_ICR);

        loop {
            let mut inner = self.inner.lock();
            let tail = (self.read_reg(E1000_RDT) as usize + 1) % RX_RING_SIZE;
            if inner.rx_ring[tail].status & E1000_RXD_STAT_DD == 0 {
                break;
            }

            let mut m = inner.rx_mbufs[tail].take().expect("e1000: lost rx buffer");
            m.set_len(inner.rx_ring[tail].length as usize);

            let fresh = kernel()
                .net
                .pool
                .alloc(0)
                .expect("e1000: out of packet buffers");
            inner.rx_ring[tail] = RxDesc {
                addr: v2p(fresh.head_ptr() as usize) as u64,
                ..RxDesc::zero()
            };
            inner.rx_mbufs[tail] = Some(fresh);
            self.write_reg(E1000_RDT, tail as u32);
            drop(inner);

            // Hand the frame up without holding the driver lock: the
            // stack may transmit replies through us.
            kernel().net.rx(m);
        }
    }
}

impl NetDevice for E1000 {
    /// Put one frame on the wire; drops it when the NIC is absent or the
    /// ring is full.
    fn transmit(&self, m: Mbuf) {
        if self.regs.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let tail = self.read_reg(E1000_TDT) as usize;
        if inner.tx_ring[tail].status & E1000_TXD_STAT_DD == 0 {
            // Ring full; drop.
            return;
        }

        inner.tx_ring[tail] = TxDesc {
            addr: v2p(m.head_ptr() as usize) as u64,
            length: m.len() as u16,
            cmd: E1000_TXD_CMD_EOP | E1000_TXD_CMD_RS,
            ..TxDesc::zero()
        };
        // Keep the buffer alive until the descriptor is reused.
        inner.tx_mbufs[tail] = Some(m);
        self.write_reg(E1000_TDT, ((tail + 1) % TX_RING_SIZE) as u32);
    }
}

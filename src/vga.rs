//! VGA mode switching. The only mode programmed beyond the boot text mode
//! is 13h (320x200x256), used by graphical user programs together with the
//! mapvga system call.

use crate::arch::{inb, outb};

const VGA_MISC_WRITE: u16 = 0x3C2;
const VGA_CRTC_INDEX: u16 = 0x3D4;
const VGA_CRTC_DATA: u16 = 0x3D5;
const VGA_SEQ_INDEX: u16 = 0x3C4;
const VGA_SEQ_DATA: u16 = 0x3C5;
const VGA_GC_INDEX: u16 = 0x3CE;
const VGA_GC_DATA: u16 = 0x3CF;
const VGA_AC_INDEX: u16 = 0x3C0;
const VGA_AC_WRITE: u16 = 0x3C0;

/// Register dump for mode 13h: MISC, 5 SEQ, 25 CRTC, 9 GC, 21 AC.
#[rustfmt::skip]
static MODE_13H: [u8; 61] = [
    // MISC
    0x63,
    // SEQ
    0x03, 0x01, 0x0F, 0x00, 0x0E,
    // CRTC
    0x5F, 0x4F, 0x50, 0x82, 0x54, 0x80, 0xBF, 0x1F,
    0x00, 0x41, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xE0, 0x9C, 0x8E, 0x28, 0x40, 0x96, 0xB9, 0xA3,
    0xFF,
    // GC
    0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x05, 0x0F,
    0xFF,
    // AC
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
    0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x41, 0x00, 0x0F, 0x00, 0x00,
];

unsafe fn write_regs(regs: &[u8; 61]) {
    let mut regs = regs.iter().copied();
    let mut next = || regs.next().unwrap();

    unsafe {
        outb(VGA_MISC_WRITE, next());

        for i in 0..5 {
            outb(VGA_SEQ_INDEX, i);
            outb(VGA_SEQ_DATA, next());
        }

        // Unlock CRTC registers 0-7.
        outb(VGA_CRTC_INDEX, 0x03);
        let v = inb(VGA_CRTC_DATA);
        outb(VGA_CRTC_DATA, v | 0x80);
        outb(VGA_CRTC_INDEX, 0x11);
        let v = inb(VGA_CRTC_DATA);
        outb(VGA_CRTC_DATA, v & !0x80);

        for i in 0..25 {
            outb(VGA_CRTC_INDEX, i);
            let mut val = next();
            if i == 0x03 {
                val |= 0x80;
            } else if i == 0x11 {
                val &= !0x80;
            }
            outb(VGA_CRTC_DATA, val);
        }

        for i in 0..9 {
            outb(VGA_GC_INDEX, i);
            outb(VGA_GC_DATA, next());
        }

        for i in 0..21 {
            let _ = inb(0x3DA);
            outb(VGA_AC_INDEX, i);
            outb(VGA_AC_WRITE, next());
        }

        let _ = inb(0x3DA);
        outb(VGA_AC_INDEX, 0x20);
    }
}

/// Switch the adapter to the requested mode. Only mode 13h is known;
/// anything else is invalid-argument.
pub fn set_mode(mode: i32) -> Result<(), ()> {
    if mode != 0x13 {
        return Err(());
    }
    // SAFETY: the VGA adapter owns these ports.
    unsafe { write_regs(&MODE_13H) };
    Ok(())
}

//! PIO-based IDE disk driver.
//!
//! One request queue, serviced head-first: `rw` appends the buffer and, if
//! it is at the head, starts the hardware; the completion interrupt
//! finishes the head buffer, wakes its owner, and starts the next request.
//!
//! The same driver serves the file system partition and raw whole-disk
//! access: a buffer with the RAW flag bypasses the partition offset. The
//! raw path is exported as the `disk` character device.

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{inb, insl, outb, outsl};
use crate::bio::{BlockDevice, Buf, BufEntry, BufFlags};
use crate::file::{Devsw, DISK_MAJOR};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, FSOFFSET, FSSIZE, NDISK};

const SECTOR_SIZE: usize = 512;
const SECTORS_PER_BLOCK: u32 = (BSIZE / SECTOR_SIZE) as u32;

const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;
const IDE_DF: u8 = 0x20;
const IDE_ERR: u8 = 0x01;

const IDE_CMD_READ: u8 = 0x20;
const IDE_CMD_WRITE: u8 = 0x30;

/// The head of the queue is the request the hardware is working on.
struct IdeQueue {
    head: *mut BufEntry,
}

// SAFETY: the raw queue pointers are only touched under the queue lock.
unsafe impl Send for IdeQueue {}

pub struct Ide {
    queue: Spinlock<IdeQueue>,
    present: [AtomicBool; NDISK],
}

impl Ide {
    pub const fn new() -> Self {
        Self {
            queue: Spinlock::new("ide", IdeQueue {
                head: ptr::null_mut(),
            }),
            present: [const { AtomicBool::new(false) }; NDISK],
        }
    }

    /// Probe the two drives and register the raw disk device.
    pub fn init(&self) {
        kernel().devsw.lock()[DISK_MAJOR as usize] = Devsw {
            read: Some(disk_read),
            write: Some(disk_write),
        };

        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: boot-time probe of the driver's own port range.
        unsafe {
            use crate::arch::{x86, IRQ_IDE};

            x86::ioapic::enable(IRQ_IDE, 0);
            x86::picirq::enable(IRQ_IDE);
            idewait(false);

            for drive in 0..NDISK {
                outb(0x1F6, 0xE0 | ((drive as u8) << 4));
                for _ in 0..1000 {
                    if inb(0x1F7) != 0 {
                        self.present[drive].store(true, Ordering::Release);
                        break;
                    }
                }
            }

            // Switch back to drive 0.
            outb(0x1F6, 0xE0);
        }
    }

    pub fn drive_present(&self, drive: usize) -> bool {
        drive < NDISK && self.present[drive].load(Ordering::Acquire)
    }

    /// Sync a buffer with the disk: write when dirty, read when not
    /// valid. Sleeps until the interrupt handler reports completion.
    fn iderw(&self, b: &mut Buf<'_>) {
        assert!(
            b.flags & (BufFlags::VALID | BufFlags::DIRTY) != BufFlags::VALID,
            "iderw: nothing to do"
        );
        assert!(self.drive_present(b.dev as usize), "iderw: disk not present");

        let entry = b.entry() as *const BufEntry as *mut BufEntry;
        let mut queue = self.queue.lock();

        // Append to the queue.
        // SAFETY: queue links are guarded by the queue lock.
        unsafe {
            *(*entry).qnext_raw() = ptr::null_mut();
            let mut pp = &mut queue.head as *mut *mut BufEntry;
            while !(*pp).is_null() {
                pp = (**pp).qnext_raw();
            }
            *pp = entry;
        }

        // Start the disk if this request is at the head.
        if queue.head == entry {
            // SAFETY: the head request owns the hardware.
            unsafe { start(entry) };
        }

        // Wait for the request to finish.
        while b.flags_raw() & (BufFlags::VALID | BufFlags::DIRTY) != BufFlags::VALID {
            // SAFETY: entry outlives the wait.
            unsafe { (*entry).waitchannel.sleep(&mut queue) };
        }
    }

    /// Completion interrupt: finish the head request, wake its owner, and
    /// start the next one.
    pub fn intr(&self) {
        let mut queue = self.queue.lock();

        let b = queue.head;
        if b.is_null() {
            return;
        }
        // SAFETY: queue links are guarded by the queue lock; the head's
        // contents are ours while its owner sleeps.
        unsafe {
            queue.head = *(*b).qnext_raw();

            let inner = &mut *(*b).inner_raw();
            if !inner.flags.contains(BufFlags::DIRTY) && idewait(true).is_ok() {
                insl(0x1F0, inner.data.as_mut_ptr() as *mut u32, BSIZE / 4);
            }
            inner.flags.insert(BufFlags::VALID);
            inner.flags.remove(BufFlags::DIRTY);
            (*b).waitchannel.wakeup();

            if !queue.head.is_null() {
                start(queue.head);
            }
        }
    }
}

impl BlockDevice for Ide {
    fn rw(&self, b: &mut Buf<'_>) {
        self.iderw(b);
    }
}

/// Wait for the disk to become ready; with `checkerr`, report error bits.
unsafe fn idewait(checkerr: bool) -> Result<(), ()> {
    let mut r;
    loop {
        // SAFETY: status reads of the driver's own port.
        r = unsafe { inb(0x1F7) };
        if r & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
            break;
        }
    }
    if checkerr && r & (IDE_DF | IDE_ERR) != 0 {
        return Err(());
    }
    Ok(())
}

/// Kick the hardware for the request at the head of the queue.
/// The caller must hold the queue lock.
unsafe fn start(b: *mut BufEntry) {
    assert!(!b.is_null(), "idestart");

    // SAFETY: the head request's contents are ours; the ports are the
    // driver's own.
    unsafe {
        let inner = &*(*b).inner_raw();
        let raw = inner.flags.contains(BufFlags::RAW);
        assert!(
            (inner.blockno as usize) < FSSIZE || raw,
            "idestart: incorrect blockno"
        );

        let mut blockno = inner.blockno;
        // The file system partition of drive 0 starts at FSOFFSET.
        if inner.dev == 0 && !raw {
            blockno += FSOFFSET;
        }
        let sector = blockno * SECTORS_PER_BLOCK;

        let _ = idewait(false);
        outb(0x3F6, 0); // generate interrupts
        outb(0x1F2, SECTORS_PER_BLOCK as u8);
        outb(0x1F3, sector as u8);
        outb(0x1F4, (sector >> 8) as u8);
        outb(0x1F5, (sector >> 16) as u8);
        outb(
            0x1F6,
            0xE0 | (((inner.dev & 1) as u8) << 4) | ((sector >> 24) as u8 & 0x0F),
        );
        if inner.flags.contains(BufFlags::DIRTY) {
            outb(0x1F7, IDE_CMD_WRITE);
            outsl(0x1F0, inner.data.as_ptr() as *const u32, BSIZE / 4);
        } else {
            outb(0x1F7, IDE_CMD_READ);
        }
    }
}

/// Raw block-device read: minor number selects the drive.
fn disk_read(minor: u16, dst: *mut u8, n: i32, off: u32) -> i32 {
    let dev = minor as u32;
    if !kernel().ide.drive_present(dev as usize) {
        return -1;
    }

    let mut tot = 0usize;
    let n = n as usize;
    let mut off = off as usize;
    while tot < n {
        let mut bp = kernel().bcache.get(dev, (off / BSIZE) as u32);
        if !bp.flags.contains(BufFlags::VALID) {
            bp.flags.insert(BufFlags::RAW);
            kernel().ide.iderw(&mut bp);
        }
        let m = (n - tot).min(BSIZE - off % BSIZE);
        // SAFETY: the caller validated [dst, dst+n).
        unsafe {
            ptr::copy_nonoverlapping(bp.data.as_ptr().add(off % BSIZE), dst.add(tot), m);
        }
        tot += m;
        off += m;
    }
    n as i32
}

/// Raw block-device write, read-modify-write through the cache.
fn disk_write(minor: u16, src: *const u8, n: i32, off: u32) -> i32 {
    let dev = minor as u32;
    if !kernel().ide.drive_present(dev as usize) {
        return -1;
    }

    let mut tot = 0usize;
    let n = n as usize;
    let mut off = off as usize;
    while tot < n {
        let mut bp = kernel().bcache.get(dev, (off / BSIZE) as u32);
        let m = (n - tot).min(BSIZE - off % BSIZE);
        if !bp.flags.contains(BufFlags::VALID) && m < BSIZE {
            // Partial write into an uncached block: fetch it first.
            bp.flags.insert(BufFlags::RAW);
            kernel().ide.iderw(&mut bp);
        }
        // SAFETY: the caller validated [src, src+n).
        unsafe {
            ptr::copy_nonoverlapping(src.add(tot), bp.data.as_mut_ptr().add(off % BSIZE), m);
        }
        bp.flags.insert(BufFlags::DIRTY | BufFlags::RAW);
        kernel().ide.iderw(&mut bp);
        tot += m;
        off += m;
    }
    n as i32
}

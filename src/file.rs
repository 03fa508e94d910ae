//! The global open-file table and the devsw table of device functions.

use core::cell::UnsafeCell;

use crate::fs::{RcInode, Stat};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::AllocatedPipe;

pub const CONSOLE_MAJOR: u16 = 1;
pub const DISK_MAJOR: u16 = 2;
pub const MOUSE_MAJOR: u16 = 3;

pub type DevRead = fn(minor: u16, dst: *mut u8, n: i32, off: u32) -> i32;
pub type DevWrite = fn(minor: u16, src: *const u8, n: i32, off: u32) -> i32;

/// Device functions for one major device number.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<DevRead>,
    pub write: Option<DevWrite>,
}

impl Devsw {
    pub const fn none() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode,
        major: u16,
        minor: u16,
        off: UnsafeCell<u32>,
    },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// SAFETY: off is the only interior-mutable field; concurrent readers of a
// shared descriptor race on the offset exactly as they do in every Unix.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    const fn none() -> Self {
        Self::new(FileType::None, false, false)
    }

    /// Copy file metadata to a Stat.
    pub fn stat(&self) -> Result<Stat, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let guard = kernel().fs().ilock(ip);
                Ok(guard.stat())
            }
            _ => Err(()),
        }
    }

    /// Read from the file into `addr`, a validated user address.
    pub fn read(&self, addr: *mut u8, n: i32) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(addr, n as usize),
            FileType::Inode { ip, off } => {
                let mut guard = kernel().fs().ilock(ip);
                // SAFETY: the caller validated the range, and user memory
                // is mapped while in the kernel.
                let dst = unsafe { core::slice::from_raw_parts_mut(addr, n as usize) };
                // SAFETY: off is only shared between holders of this
                // descriptor.
                let cur = unsafe { *off.get() };
                let r = guard.read_bytes(dst, cur);
                unsafe { *off.get() = cur.wrapping_add(r as u32) };
                Ok(r)
            }
            FileType::Device { major, minor, off, .. } => {
                let dev = kernel().devsw.lock()[*major as usize];
                let read = dev.read.ok_or(())?;
                // SAFETY: as above.
                let cur = unsafe { *off.get() };
                let r = read(*minor, addr, n, cur);
                if r < 0 {
                    return Err(());
                }
                unsafe { *off.get() = cur.wrapping_add(r as u32) };
                Ok(r as usize)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write to the file from `addr`, a validated user address.
    pub fn write(&self, addr: *const u8, n: i32) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(addr, n as usize),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time, so a large write cannot
                // overflow the log transaction limit: inode, indirect
                // blocks, allocation bitmap blocks, and two blocks of
                // slop for unaligned writes.
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE) as i32;
                let mut written = 0i32;
                while written < n {
                    let chunk = (n - written).min(max);
                    let tx = kernel().fs().begin_tx();
                    let mut guard = kernel().fs().ilock(ip);
                    // SAFETY: the caller validated the range.
                    let src = unsafe {
                        core::slice::from_raw_parts(addr.add(written as usize), chunk as usize)
                    };
                    // SAFETY: as in read.
                    let cur = unsafe { *off.get() };
                    let r = guard.write_bytes(src, cur, &tx)?;
                    unsafe { *off.get() = cur.wrapping_add(r as u32) };
                    if r != chunk as usize {
                        // Error of some kind: short write.
                        return Err(());
                    }
                    written += chunk;
                }
                Ok(n as usize)
            }
            FileType::Device { major, minor, off, .. } => {
                let dev = kernel().devsw.lock()[*major as usize];
                let write = dev.write.ok_or(())?;
                // SAFETY: as in read.
                let cur = unsafe { *off.get() };
                let r = write(*minor, addr, n, cur);
                if r < 0 {
                    return Err(());
                }
                unsafe { *off.get() = cur.wrapping_add(r as u32) };
                Ok(r as usize)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Reposition the offset; pipes cannot seek.
    pub fn seek(&self, offset: i32, whence: i32) -> Result<u32, ()> {
        let (size, off) = match &self.typ {
            FileType::Inode { ip, off } | FileType::Device { ip, off, .. } => {
                let guard = kernel().fs().ilock(ip);
                (guard.size, off)
            }
            _ => return Err(()),
        };

        // SAFETY: as in read.
        let cur = unsafe { *off.get() };
        let new = match whence {
            0 => offset,                  // SEEK_SET
            1 => cur as i32 + offset,     // SEEK_CUR
            2 => size as i32 + offset,    // SEEK_END
            _ => return Err(()),
        };
        if new < 0 {
            return Err(());
        }
        unsafe { *off.get() = new as u32 };
        Ok(new as u32)
    }
}

struct FSlot {
    refcnt: u32,
}

/// The global open-file table.
pub struct FileTable {
    slots: Spinlock<[FSlot; NFILE]>,
    files: [UnsafeCell<File>; NFILE],
}

// SAFETY: a slot's File is only (re)initialised while its refcnt is zero,
// under the table lock.
unsafe impl Sync for FileTable {}

/// A reference-counted handle to an open file. Duplicate with
/// `FileTable::dup`, release with `FileTable::close`.
pub struct RcFile {
    idx: usize,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            slots: Spinlock::new("ftable", [const { FSlot { refcnt: 0 } }; NFILE]),
            files: [const { UnsafeCell::new(File::none()) }; NFILE],
        }
    }

    /// Allocate a file structure; hands the file back when the table is
    /// full, so the caller can release what it carries.
    pub fn alloc(&self, file: File) -> Result<RcFile, File> {
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.refcnt == 0 {
                slot.refcnt = 1;
                // SAFETY: refcnt was zero; nobody else refers to the slot.
                unsafe { *self.files[i].get() = file };
                return Ok(RcFile { idx: i });
            }
        }
        Err(file)
    }

    pub fn dup(&self, h: &RcFile) -> RcFile {
        let mut slots = self.slots.lock();
        slots[h.idx].refcnt += 1;
        RcFile { idx: h.idx }
    }

    /// The file behind a handle. Valid as long as any handle to the slot
    /// exists.
    pub fn get(&self, h: &RcFile) -> &File {
        // SAFETY: the handle keeps refcnt above zero, so the slot is not
        // reinitialised.
        unsafe { &*self.files[h.idx].get() }
    }

    /// Drop one reference; the last close releases the underlying object.
    pub fn close(&self, h: RcFile) {
        let mut slots = self.slots.lock();
        slots[h.idx].refcnt -= 1;
        if slots[h.idx].refcnt > 0 {
            return;
        }
        // SAFETY: refcnt just hit zero and the table lock is held, so the
        // slot is exclusively ours.
        let file = unsafe { core::mem::replace(&mut *self.files[h.idx].get(), File::none()) };
        drop(slots);

        match file.typ {
            FileType::Pipe { pipe } => pipe.close(file.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let tx = kernel().fs().begin_tx();
                kernel().fs().iput(&tx, ip);
            }
            FileType::None => {}
        }
    }
}

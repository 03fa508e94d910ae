//! Inodes.
//!
//! An inode describes a single unnamed file: type, link count, size,
//! ownership and permission bits, and the list of blocks holding the
//! content — NDIRECT direct blocks, one single-indirect block and one
//! double-indirect block.
//!
//! The in-memory inode table provides the synchronisation point for
//! inodes used by multiple processes: at most one cached inode exists per
//! (device, inode number); the table's spinlock guards slot identity and
//! reference counts, and each inode's sleep-lock guards its contents.
//!
//! A typical sequence is
//!   ip = itable.get(dev, inum)       // reference, no I/O, no lock
//!   guard = fs.ilock(&ip)            // lock, reading from disk if needed
//!   ... examine and modify through the guard ...
//!   drop(guard)                      // unlock
//!   fs.iput(&tx, ip)                 // release the reference
//!
//! get is separate from ilock so that system calls can keep long-term
//! references (open files, working directories) and lock only for short
//! periods; the separation also avoids deadlock during path lookup.

use core::mem;
use core::ops::{Deref, DerefMut};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::path::FileName;
use super::stat::{Stat, T_DEV, T_DIR, T_FILE};
use super::superblock::IPB;
use super::{Fs, Tx, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT};
use crate::bio::BufData;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NINODE};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

impl InodeType {
    pub(super) fn to_disk(self) -> (i16, i16, i16) {
        match self {
            InodeType::None => (0, 0, 0),
            InodeType::Dir => (T_DIR, 0, 0),
            InodeType::File => (T_FILE, 0, 0),
            InodeType::Device { major, minor } => (T_DEV, major as i16, minor as i16),
        }
    }

    pub(super) fn from_disk(typ: i16, major: i16, minor: i16) -> Self {
        match typ {
            0 => InodeType::None,
            T_DIR => InodeType::Dir,
            T_FILE => InodeType::File,
            T_DEV => InodeType::Device {
                major: major as u16,
                minor: minor as u16,
            },
            _ => panic!("bad inode type on disk"),
        }
    }
}

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; zero means a free slot.
    pub typ: i16,

    /// Major and minor device number (device nodes only).
    pub major: i16,
    pub minor: i16,

    /// Number of links to this inode in the file system.
    pub nlink: i16,

    /// Size of file in bytes.
    pub size: u32,

    /// Permission bits and ownership.
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pad: u16,

    /// Data block addresses: NDIRECT direct, then one single-indirect and
    /// one double-indirect.
    pub addrs: [u32; NDIRECT + 2],
}

const_assert!(IPB >= 1);
const_assert!(BSIZE % mem::size_of::<u32>() == 0);

/// In-memory copy of an inode, guarded by the entry's sleep-lock.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub addrs: [u32; NDIRECT + 2],
}

impl InodeInner {
    const fn zero() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            addrs: [0; NDIRECT + 2],
        }
    }
}

/// A directory is a file containing a sequence of these.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

impl Default for Dirent {
    fn default() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

impl Dirent {
    /// Fill in the name, NUL-terminated when shorter than DIRSIZ.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// The slice that exactly contains the name.
    pub fn name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        // SAFETY: the prefix contains no NUL, and len <= DIRSIZ.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// Identity and reference count of a cached inode, guarded by the table
/// spinlock.
pub(super) struct ISlot {
    pub(super) dev: u32,
    pub(super) inum: u32,
    pub(super) refcnt: u32,
}

/// The in-memory inode table.
pub struct Itable {
    pub(super) slots: Spinlock<[ISlot; NINODE]>,
    pub(super) entries: [Sleeplock<InodeInner>; NINODE],
}

/// A reference-counted handle to a cached inode. Does not imply the lock;
/// release with `Fs::iput` inside a transaction.
pub struct RcInode {
    pub dev: u32,
    pub inum: u32,
    pub(super) idx: usize,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            slots: Spinlock::new("itable", [const {
                ISlot {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }
            }; NINODE]),
            entries: [const { Sleeplock::new("inode", InodeInner::zero()) }; NINODE],
        }
    }

    /// Find the inode with the given number on `dev` and return a
    /// reference to its in-memory copy; does not lock it or read it from
    /// disk.
    pub fn get(&self, dev: u32, inum: u32) -> RcInode {
        let mut slots = self.slots.lock();

        let mut empty = None;
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.refcnt > 0 && slot.dev == dev && slot.inum == inum {
                slot.refcnt += 1;
                return RcInode { dev, inum, idx: i };
            }
            if empty.is_none() && slot.refcnt == 0 {
                empty = Some(i);
            }
        }

        let idx = empty.expect("itable: no inodes");
        slots[idx] = ISlot {
            dev,
            inum,
            refcnt: 1,
        };
        // SAFETY: refcnt was zero, so nobody holds or can acquire the
        // entry's sleep-lock.
        unsafe { (*self.entries[idx].get_mut_raw()).valid = false };
        RcInode { dev, inum, idx }
    }

    /// Take another reference to the same inode.
    pub fn dup(&self, ip: &RcInode) -> RcInode {
        let mut slots = self.slots.lock();
        slots[ip.idx].refcnt += 1;
        RcInode {
            dev: ip.dev,
            inum: ip.inum,
            idx: ip.idx,
        }
    }

    pub fn root(&self) -> RcInode {
        self.get(crate::param::ROOTDEV, super::ROOTINO)
    }

    /// Whether any inode of `dev` is still referenced; blocks umount.
    /// The unmounter's own single handle on `exempt_inum` is tolerated.
    pub fn busy(&self, dev: u32, exempt_inum: u32) -> bool {
        let slots = self.slots.lock();
        slots.iter().any(|s| {
            s.dev == dev && s.refcnt > 0 && !(s.inum == exempt_inum && s.refcnt == 1)
        })
    }
}

/// A locked inode: the holder may read and modify the inode and its
/// content. Unlock by dropping; this does not release the reference.
pub struct InodeGuard<'s> {
    pub dev: u32,
    pub inum: u32,
    pub(super) fs: &'s Fs,
    pub(super) guard: SleeplockGuard<'s, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl InodeGuard<'_> {
    /// Copy the in-memory inode to disk. Must be called after every
    /// change to a field that lives on disk.
    pub fn update(&self, tx: &Tx<'_>) {
        let sb = self.fs.superblock(self.dev);
        let mut bp = self.fs.bread(self.dev, sb.iblock(self.inum));

        const_assert!(IPB <= BSIZE / mem::size_of::<Dinode>());
        const_assert!(mem::align_of::<BufData>() % mem::align_of::<Dinode>() == 0);
        // SAFETY: dip is aligned and inside bp.data; the buffer is locked.
        let dip = unsafe {
            &mut *(bp.data.as_mut_ptr() as *mut Dinode).add(self.inum as usize % IPB)
        };

        let inner = &self.guard;
        let (typ, major, minor) = inner.typ.to_disk();
        dip.typ = typ;
        dip.major = major;
        dip.minor = minor;
        dip.nlink = inner.nlink;
        dip.size = inner.size;
        dip.mode = inner.mode;
        dip.uid = inner.uid;
        dip.gid = inner.gid;
        dip.addrs.copy_from_slice(&inner.addrs);
        tx.write(&mut bp);
    }

    /// Discard the inode's contents, freeing every data block and both
    /// indirect trees.
    pub fn truncate(&mut self, tx: &Tx<'_>) {
        let dev = self.dev;

        for i in 0..NDIRECT {
            let addr = self.guard.addrs[i];
            if addr != 0 {
                tx.bfree(dev, addr);
                self.guard.addrs[i] = 0;
            }
        }

        let indirect = self.guard.addrs[NDIRECT];
        if indirect != 0 {
            self.free_indirect(tx, indirect, 1);
            self.guard.addrs[NDIRECT] = 0;
        }

        let dindirect = self.guard.addrs[NDIRECT + 1];
        if dindirect != 0 {
            self.free_indirect(tx, dindirect, 2);
            self.guard.addrs[NDIRECT + 1] = 0;
        }

        self.guard.size = 0;
        self.update(tx);
    }

    /// Free an indirect tree of the given depth, including its root.
    fn free_indirect(&self, tx: &Tx<'_>, root: u32, depth: u32) {
        let mut addrs = [0u32; NINDIRECT];
        {
            let bp = self.fs.bread(self.dev, root);
            // SAFETY: u32 has no internal structure; data is 4-aligned.
            let (prefix, data, _) = unsafe { bp.data.align_to::<u32>() };
            debug_assert_eq!(prefix.len(), 0, "truncate: buf data unaligned");
            addrs.copy_from_slice(data);
        }
        for a in addrs {
            if a != 0 {
                if depth > 1 {
                    self.free_indirect(tx, a, depth - 1);
                } else {
                    tx.bfree(self.dev, a);
                }
            }
        }
        tx.bfree(self.dev, root);
    }

    /// Disk address of the nth content block, allocating through the
    /// transaction when the block does not exist yet.
    fn bmap_internal(&mut self, bn: usize, tx: Option<&Tx<'_>>) -> Result<u32, ()> {
        fn pick(
            fs: &Fs,
            dev: u32,
            table: u32,
            index: usize,
            tx: Option<&Tx<'_>>,
        ) -> Result<u32, ()> {
            let mut bp = fs.bread(dev, table);
            // SAFETY: u32 has no internal structure; data is 4-aligned.
            let (_, data, _) = unsafe { bp.data.align_to_mut::<u32>() };
            let mut addr = data[index];
            if addr == 0 {
                let tx = tx.ok_or(())?;
                addr = tx.balloc(dev)?;
                data[index] = addr;
                tx.write(&mut bp);
            }
            Ok(addr)
        }

        if bn < NDIRECT {
            let mut addr = self.guard.addrs[bn];
            if addr == 0 {
                addr = tx.ok_or(())?.balloc(self.dev)?;
                self.guard.addrs[bn] = addr;
            }
            return Ok(addr);
        }

        let bn = bn - NDIRECT;
        if bn < NINDIRECT {
            let mut table = self.guard.addrs[NDIRECT];
            if table == 0 {
                table = tx.ok_or(())?.balloc(self.dev)?;
                self.guard.addrs[NDIRECT] = table;
            }
            return pick(self.fs, self.dev, table, bn, tx);
        }

        let bn = bn - NINDIRECT;
        if bn < NINDIRECT * NINDIRECT {
            let mut table = self.guard.addrs[NDIRECT + 1];
            if table == 0 {
                table = tx.ok_or(())?.balloc(self.dev)?;
                self.guard.addrs[NDIRECT + 1] = table;
            }
            let mid = pick(self.fs, self.dev, table, bn / NINDIRECT, tx)?;
            return pick(self.fs, self.dev, mid, bn % NINDIRECT, tx);
        }

        // Past the double-indirect tree.
        Err(())
    }

    /// Copy data from the inode content at `off` into `dst`; returns the
    /// number of bytes copied.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32) -> usize {
        let size = self.guard.size;
        let mut n = dst.len() as u32;
        if off > size || off.wrapping_add(n) < off {
            return 0;
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot = 0u32;
        let mut off = off;
        while tot < n {
            let Ok(addr) = self.bmap_internal(off as usize / BSIZE, None) else {
                break;
            };
            let bp = self.fs.bread(self.dev, addr);
            let m = (n - tot).min(BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            dst[tot as usize..(tot + m) as usize]
                .copy_from_slice(&bp.data[begin..begin + m as usize]);
            tot += m;
            off += m;
        }
        tot as usize
    }

    /// Copy an on-disk structure out of the inode content.
    pub fn read_obj<T: AsBytes + FromBytes>(&mut self, dst: &mut T, off: u32) -> Result<(), ()> {
        if self.read_bytes(dst.as_bytes_mut(), off) == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Copy `src` into the inode content at `off`, growing the file when
    /// writing at its end. Fails with out-of-space past the
    /// double-indirect tree or when the bitmap is exhausted.
    pub fn write_bytes(&mut self, src: &[u8], off: u32, tx: &Tx<'_>) -> Result<usize, ()> {
        let n = src.len() as u32;
        if off > self.guard.size {
            return Err(());
        }
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot = 0u32;
        let mut off = off;
        while tot < n {
            let addr = self.bmap_internal(off as usize / BSIZE, Some(tx))?;
            let mut bp = self.fs.bread(self.dev, addr);
            let m = (n - tot).min(BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            bp.data[begin..begin + m as usize]
                .copy_from_slice(&src[tot as usize..(tot + m) as usize]);
            tx.write(&mut bp);
            tot += m;
            off += m;
        }

        if off > self.guard.size {
            self.guard.size = off;
        }

        // Write the inode back even when the size is unchanged: bmap may
        // have added blocks to addrs.
        self.update(tx);
        Ok(tot as usize)
    }

    pub fn write_obj<T: AsBytes>(&mut self, src: &T, off: u32, tx: &Tx<'_>) -> Result<(), ()> {
        if self.write_bytes(src.as_bytes(), off, tx)? == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Look for a directory entry by name; returns the entry's inode and
    /// the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.guard.typ, InodeType::Dir, "dirlookup not DIR");

        let mut de = Dirent::default();
        for off in (0..self.guard.size).step_by(DIRENT_SIZE) {
            self.read_obj(&mut de, off).expect("dirlookup: read");
            if de.inum != 0 && de.name() == name {
                let ip = self.fs.itable.get(self.dev, de.inum as u32);
                return Ok((ip, off));
            }
        }
        Err(())
    }

    /// Write a new directory entry (name, inum) into the directory.
    pub fn dirlink(&mut self, name: &FileName, inum: u32, tx: &Tx<'_>) -> Result<(), ()> {
        // The name must not be present.
        if let Ok((ip, _)) = self.dirlookup(name) {
            self.fs.iput(tx, ip);
            return Err(());
        }

        // Look for an empty slot.
        let mut de = Dirent::default();
        let mut off = self.guard.size;
        for o in (0..self.guard.size).step_by(DIRENT_SIZE) {
            self.read_obj(&mut de, o).expect("dirlink: read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        de.inum = inum as u16;
        de.set_name(name);
        self.write_obj(&de, off, tx)
    }

    /// Find the name of a directory entry by its inode number; used by
    /// the upward walk of getcwd.
    pub fn name_of(&mut self, inum: u32, out: &mut [u8; DIRSIZ]) -> Result<usize, ()> {
        let mut de = Dirent::default();
        for off in (0..self.guard.size).step_by(DIRENT_SIZE) {
            self.read_obj(&mut de, off).expect("name_of: read");
            if de.inum as u32 == inum {
                let name = de.name().as_bytes();
                out[..name.len()].copy_from_slice(name);
                return Ok(name.len());
            }
        }
        Err(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::default();
        for off in ((2 * DIRENT_SIZE) as u32..self.guard.size).step_by(DIRENT_SIZE) {
            self.read_obj(&mut de, off).expect("is_dir_empty: read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }

    /// Copy stat information out of the inode.
    pub fn stat(&self) -> Stat {
        let inner = &self.guard;
        let (typ, major, minor) = inner.typ.to_disk();
        Stat {
            typ,
            _pad0: 0,
            dev: self.dev as i32,
            ino: self.inum,
            nlink: inner.nlink,
            _pad1: 0,
            size: inner.size,
            mode: inner.mode as u32,
            uid: inner.uid as u32,
            gid: inner.gid as u32,
            rdev: ((major as u32) << 16) | (minor as u32 & 0xFFFF),
        }
    }
}

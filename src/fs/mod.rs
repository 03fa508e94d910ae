//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes).
//!   + Names: paths like /usr/share/fortunes, with mount redirection.
//!
//! The system-call-level operations that tie these to processes and
//! permissions live in the syscall layer; this module owns everything
//! from the superblock down.

use core::mem;

use arrayvec::ArrayVec;
use spin::Once;

use crate::bio::{bwrite, BlockDevice, Buf};
use crate::kernel::kernel;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::BSIZE;

mod inode;
mod log;
mod mount;
mod path;
mod stat;
mod superblock;

pub use inode::{
    Dinode, Dirent, InodeGuard, InodeInner, InodeType, Itable, RcInode, DIRENT_SIZE,
};
pub use log::Log;
pub use mount::MountTable;
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEV, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB, IPB};

/// Root inode number.
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 11;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Directory entry name length.
pub const DIRSIZ: usize = 14;

// Permission bits, per class.
pub const PERM_R: u32 = 4;
pub const PERM_W: u32 = 2;
pub const PERM_X: u32 = 1;

/// Unix-style mode check: pick the owner, group or other class of the
/// inode's mode bits and require every needed bit. uid 0 bypasses.
pub fn perm_ok(uid: u32, gid: u32, inner: &InodeInner, needed: u32) -> bool {
    if uid == 0 {
        return true;
    }
    let mode = inner.mode as u32;
    let perms = if uid == inner.uid as u32 {
        (mode >> 6) & 7
    } else if gid == inner.gid as u32 {
        (mode >> 3) & 7
    } else {
        mode & 7
    };
    needed & perms == needed
}

pub struct Fs {
    /// The block device carrying every drive, bound at init.
    device: Once<&'static dyn BlockDevice>,

    /// One superblock per mounted device, keyed by device number.
    superblocks: Spinlock<ArrayVec<(u32, Superblock), 4>>,

    /// The journal, on the root device.
    log: Once<Sleepablelock<Log>>,

    pub itable: Itable,

    pub mounts: MountTable,
}

impl Fs {
    pub const fn new() -> Self {
        Self {
            device: Once::new(),
            superblocks: Spinlock::new("superblocks", ArrayVec::new_const()),
            log: Once::new(),
            itable: Itable::new(),
            mounts: MountTable::new(),
        }
    }

    /// Read the root superblock and replay the log. Must run in process
    /// context (it sleeps on disk I/O); the first forkret calls it.
    pub fn init(&self, dev: u32, device: &'static dyn BlockDevice) {
        let _ = self.device.call_once(|| device);
        let sb = self.read_superblock(dev);
        let _ = self
            .log
            .call_once(|| Sleepablelock::new("log", Log::new(dev, sb.logstart, device)));
    }

    fn read_superblock(&self, dev: u32) -> Superblock {
        if let Some(sb) = self.lookup_superblock(dev) {
            return sb;
        }
        // Read outside the table lock; block I/O sleeps.
        let buf = self.bread(dev, 1);
        let sb = Superblock::new(&buf);
        drop(buf);

        let mut sbs = self.superblocks.lock();
        if !sbs.iter().any(|(d, _)| *d == dev) {
            sbs.push((dev, sb));
        }
        sb
    }

    fn lookup_superblock(&self, dev: u32) -> Option<Superblock> {
        let sbs = self.superblocks.lock();
        sbs.iter().find(|(d, _)| *d == dev).map(|(_, sb)| *sb)
    }

    pub fn superblock(&self, dev: u32) -> Superblock {
        self.lookup_superblock(dev)
            .expect("fs: superblock not read")
    }

    fn device(&self) -> &'static dyn BlockDevice {
        *self.device.get().expect("fs: no device")
    }

    fn log(&self) -> &Sleepablelock<Log> {
        self.log.get().expect("fs: no log")
    }

    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'static> {
        kernel().bcache.read(dev, blockno, self.device())
    }

    /// Begin a transaction; it ends (and possibly commits) when the
    /// returned handle is dropped.
    pub fn begin_tx(&self) -> Tx<'_> {
        self.log().begin_op();
        Tx { fs: self }
    }

    /// Lock the given inode, reading it from disk if necessary.
    pub fn ilock(&self, ip: &RcInode) -> InodeGuard<'_> {
        let mut guard = self.itable.entries[ip.idx].lock();
        if !guard.valid {
            let sb = self.superblock(ip.dev);
            let bp = self.bread(ip.dev, sb.iblock(ip.inum));
            // SAFETY: dip is aligned and inside bp.data; the buffer is
            // locked.
            let dip = unsafe {
                &*(bp.data.as_ptr() as *const Dinode).add(ip.inum as usize % IPB)
            };
            guard.typ = InodeType::from_disk(dip.typ, dip.major, dip.minor);
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.mode = dip.mode;
            guard.uid = dip.uid;
            guard.gid = dip.gid;
            guard.addrs.copy_from_slice(&dip.addrs);
            drop(bp);
            guard.valid = true;
            assert_ne!(guard.typ, InodeType::None, "ilock: no type");
        }
        InodeGuard {
            dev: ip.dev,
            inum: ip.inum,
            fs: self,
            guard,
        }
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference and the inode has no links, the inode and its content
    /// are freed on disk — which is why every iput runs in a transaction.
    pub fn iput(&self, tx: &Tx<'_>, ip: RcInode) {
        let slots = self.itable.slots.lock();
        if slots[ip.idx].refcnt == 1 {
            // SAFETY: refcnt == 1 means nobody else holds the sleep-lock
            // or can acquire it: with nlink == 0 no directory entry leads
            // here any more.
            let inner = unsafe { &*self.itable.entries[ip.idx].get_mut_raw() };
            if inner.valid && inner.nlink == 0 {
                drop(slots);

                // The lock cannot block: we hold the only reference.
                let mut guard = self.ilock(&ip);
                guard.truncate(tx);
                guard.typ = InodeType::None;
                guard.update(tx);
                guard.valid = false;
                drop(guard);

                self.itable.slots.lock()[ip.idx].refcnt -= 1;
                return;
            }
        }
        let mut slots = slots;
        slots[ip.idx].refcnt -= 1;
    }

    /// Allocate an inode on `dev` with the given type and ownership.
    /// Fails with out-of-space when the inode table is exhausted.
    pub fn alloc_inode(
        &self,
        dev: u32,
        typ: InodeType,
        mode: u16,
        uid: u16,
        gid: u16,
        tx: &Tx<'_>,
    ) -> Result<RcInode, ()> {
        let sb = self.superblock(dev);
        for inum in 1..sb.ninodes {
            let mut bp = self.bread(dev, sb.iblock(inum));
            // SAFETY: dip is aligned and inside bp.data; the buffer is
            // locked.
            let dip = unsafe {
                &mut *(bp.data.as_mut_ptr() as *mut Dinode).add(inum as usize % IPB)
            };
            if dip.typ == 0 {
                // A free inode: claim and mark it allocated on disk.
                *dip = zeroed_dinode();
                let (t, major, minor) = typ.to_disk();
                dip.typ = t;
                dip.major = major;
                dip.minor = minor;
                dip.mode = mode;
                dip.uid = uid;
                dip.gid = gid;
                tx.write(&mut bp);
                drop(bp);
                return Ok(self.itable.get(dev, inum));
            }
        }
        Err(())
    }

    /// Resolve a path to an inode reference.
    pub fn namei(&self, path: &Path, cwd: &RcInode, tx: &Tx<'_>) -> Result<RcInode, ()> {
        Ok(self.namex(path, false, cwd, tx)?.0)
    }

    /// Resolve a path to its parent directory and final name component.
    pub fn nameiparent<'p>(
        &self,
        path: &'p Path,
        cwd: &RcInode,
        tx: &Tx<'_>,
    ) -> Result<(RcInode, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true, cwd, tx)?;
        Ok((ip, name.ok_or(())?))
    }

    /// Walk a path component by component, traversing mount redirections
    /// in both directions: entering a mounted file system when hitting
    /// its mount point, and leaving it when ".." crosses out of its root.
    fn namex<'p>(
        &self,
        mut path: &'p Path,
        parent: bool,
        cwd: &RcInode,
        tx: &Tx<'_>,
    ) -> Result<(RcInode, Option<&'p FileName>), ()> {
        let mut ptr = if path.is_absolute() {
            self.itable.root()
        } else {
            self.itable.dup(cwd)
        };

        while let Some((new_path, name)) = path.skipelem() {
            path = new_path;

            // ".." at the root of a mounted file system climbs to the
            // mount point first.
            if name.as_bytes() == b".." && ptr.inum == ROOTINO {
                if let Some((mp_dev, mp_inum)) = self.mounts.mount_point(ptr.dev) {
                    self.iput(tx, ptr);
                    ptr = self.itable.get(mp_dev, mp_inum);
                }
            }

            let mut ip = self.ilock(&ptr);
            if ip.typ != InodeType::Dir {
                drop(ip);
                self.iput(tx, ptr);
                return Err(());
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let next = ip.dirlookup(name);
            drop(ip);
            self.iput(tx, ptr);

            let (next, _) = next?;
            // Entering a mounted file system.
            ptr = match self.mounts.mounted_dev(next.dev, next.inum) {
                Some(mdev) => {
                    self.iput(tx, next);
                    self.itable.get(mdev, ROOTINO)
                }
                None => next,
            };
        }

        if parent {
            self.iput(tx, ptr);
            return Err(());
        }
        Ok((ptr, None))
    }

    /// Mount device `dev` on the directory `dir`. Reads the new device's
    /// superblock; at most one file system per device.
    pub fn mount(&self, dev: u32, dir: &RcInode) -> Result<(), ()> {
        let _ = self.read_superblock(dev);
        self.mounts.add(dev, dir.dev, dir.inum)
    }

    /// Undo a mount, refusing while any inode of the mounted device is
    /// still referenced apart from the caller's own handle on the
    /// mount point.
    pub fn umount(&self, dir: &RcInode) -> Result<(), ()> {
        // Name resolution enters the mounted file system, so the caller
        // usually hands us the mounted root; accept the mount point too.
        let (mounted, exempt) = match self.mounts.mounted_dev(dir.dev, dir.inum) {
            Some(mounted) => (mounted, 0),
            None if dir.inum == ROOTINO && self.mounts.mount_point(dir.dev).is_some() => {
                (dir.dev, ROOTINO)
            }
            _ => return Err(()),
        };

        if self.itable.busy(mounted, exempt) {
            return Err(());
        }
        let (mp_dev, mp_inum) = self.mounts.mount_point(mounted).ok_or(())?;
        let _ = self.mounts.remove(mp_dev, mp_inum)?;
        Ok(())
    }

    /// Build the absolute path of `cwd` into `out` by walking ".."
    /// upwards, mapping each mounted root back to its mount point.
    /// Returns the length written.
    pub fn getcwd(&self, cwd: &RcInode, out: &mut [u8], tx: &Tx<'_>) -> Result<usize, ()> {
        let mut temp = [0u8; 256];
        let mut pos = temp.len();

        let mut ip = self.itable.dup(cwd);
        loop {
            // At a root? Either the real one or a mounted one.
            if ip.inum == ROOTINO {
                match self.mounts.mount_point(ip.dev) {
                    Some((mp_dev, mp_inum)) => {
                        self.iput(tx, ip);
                        ip = self.itable.get(mp_dev, mp_inum);
                        continue;
                    }
                    None => {
                        self.iput(tx, ip);
                        break;
                    }
                }
            }

            let mut guard = self.ilock(&ip);
            // SAFETY: ".." contains no NUL.
            let parent = guard.dirlookup(unsafe { FileName::from_bytes(b"..") });
            drop(guard);
            let Ok((pip, _)) = parent else {
                self.iput(tx, ip);
                return Err(());
            };

            let mut pguard = self.ilock(&pip);
            let mut name = [0u8; DIRSIZ];
            let n = match pguard.name_of(ip.inum, &mut name) {
                Ok(n) => n,
                Err(()) => {
                    drop(pguard);
                    self.iput(tx, pip);
                    self.iput(tx, ip);
                    return Err(());
                }
            };
            drop(pguard);

            if pos < n + 1 {
                self.iput(tx, pip);
                self.iput(tx, ip);
                return Err(());
            }
            pos -= n;
            temp[pos..pos + n].copy_from_slice(&name[..n]);
            pos -= 1;
            temp[pos] = b'/';

            self.iput(tx, ip);
            ip = pip;
        }

        if pos == temp.len() {
            pos -= 1;
            temp[pos] = b'/';
        }

        let len = temp.len() - pos;
        if out.len() < len {
            return Err(());
        }
        out[..len].copy_from_slice(&temp[pos..]);
        Ok(len)
    }
}

/// A file system transaction: every persistent mutation between begin_tx
/// and drop is committed atomically through the log.
pub struct Tx<'s> {
    pub fs: &'s Fs,
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.fs.log().end_op();
    }
}

impl Tx<'_> {
    /// Route a modified buffer: through the log on its own device, or
    /// straight to the device for mounted drives (their updates are not
    /// journaled).
    pub fn write(&self, b: &mut Buf<'_>) {
        let mut log = self.fs.log().lock();
        if b.dev == log.dev {
            log.write(b);
        } else {
            drop(log);
            bwrite(b, self.fs.device());
        }
    }

    /// Zero a block.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut buf = kernel().bcache.get(dev, bno);
        buf.data.0.fill(0);
        buf.flags.insert(crate::bio::BufFlags::VALID);
        self.write(&mut buf);
    }

    /// Allocate a zeroed disk block. Fails with out-of-space when the
    /// bitmap is exhausted.
    pub fn balloc(&self, dev: u32) -> Result<u32, ()> {
        let sb = self.fs.superblock(dev);
        for b in num_iter::range_step(0, sb.size, BPB) {
            let mut bp = self.fs.bread(dev, sb.bblock(b));
            for bi in 0..BPB.min(sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp.data[(bi / 8) as usize] & m == 0 {
                    // The block is free: mark it in use.
                    bp.data[(bi / 8) as usize] |= m;
                    self.write(&mut bp);
                    drop(bp);
                    self.bzero(dev, b + bi);
                    return Ok(b + bi);
                }
            }
        }
        Err(())
    }

    /// Free a disk block.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock(dev);
        let mut bp = self.fs.bread(dev, sb.bblock(b));
        let bi = b as usize % BPB as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data[bi / 8] & m, 0, "freeing free block");
        bp.data[bi / 8] &= !m;
        self.write(&mut bp);
    }
}

fn zeroed_dinode() -> Dinode {
    // SAFETY: Dinode is plain old data; all-zero is valid.
    unsafe { mem::zeroed() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use zerocopy::AsBytes;

    use super::*;
    use crate::bio::BufFlags;
    use crate::param::{LOGSIZE, MAXOPBLOCKS};

    const FS_BLOCKS: u32 = 512;
    const NLOG: u32 = LOGSIZE as u32 + 1;
    const LOGSTART: u32 = 2;
    const TEST_NINODES: u32 = 64;
    const INODESTART: u32 = LOGSTART + NLOG;
    const NINODEBLOCKS: u32 = TEST_NINODES / IPB as u32 + 1;
    const BMAPSTART: u32 = INODESTART + NINODEBLOCKS;
    const DATASTART: u32 = BMAPSTART + 1;

    /// An in-memory disk shared by any number of device numbers. I/O
    /// completes synchronously, so nothing ever sleeps on it.
    struct MemDisk {
        disks: Mutex<HashMap<u32, Vec<[u8; BSIZE]>>>,
    }

    impl MemDisk {
        fn new() -> Self {
            Self {
                disks: Mutex::new(HashMap::new()),
            }
        }

        fn install(&self, dev: u32, image: Vec<[u8; BSIZE]>) {
            self.disks.lock().unwrap().insert(dev, image);
        }

        /// Peek at the raw on-disk block, bypassing the cache; for
        /// asserting what actually hit stable storage.
        fn read_raw(&self, dev: u32, bno: u32) -> [u8; BSIZE] {
            self.disks.lock().unwrap()[&dev][bno as usize]
        }

        fn write_raw(&self, dev: u32, bno: u32, data: &[u8; BSIZE]) {
            self.disks.lock().unwrap().get_mut(&dev).unwrap()[bno as usize] = *data;
        }
    }

    impl BlockDevice for MemDisk {
        fn rw(&self, b: &mut Buf<'_>) {
            let mut disks = self.disks.lock().unwrap();
            let disk = disks.get_mut(&b.dev).expect("memdisk: unknown device");
            let bno = b.blockno as usize;
            if b.flags.contains(BufFlags::DIRTY) {
                disk[bno] = b.data.0;
                b.flags.remove(BufFlags::DIRTY);
            } else {
                b.data.0 = disk[bno];
            }
            b.flags.insert(BufFlags::VALID);
        }
    }

    /// Build a minimal file system image: superblock, empty log, a root
    /// directory with "." and "..", and a bitmap covering the metadata.
    fn mkfs() -> Vec<[u8; BSIZE]> {
        let mut blocks = vec![[0u8; BSIZE]; FS_BLOCKS as usize];

        let sb = Superblock {
            size: FS_BLOCKS,
            nblocks: FS_BLOCKS - DATASTART,
            ninodes: TEST_NINODES,
            nlog: NLOG,
            logstart: LOGSTART,
            inodestart: INODESTART,
            bmapstart: BMAPSTART,
        };
        blocks[1][..mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());

        // Root directory inode.
        let mut root = zeroed_dinode();
        root.typ = T_DIR;
        root.nlink = 1;
        root.size = (2 * DIRENT_SIZE) as u32;
        root.mode = 0o755;
        root.addrs[0] = DATASTART;
        let off = ROOTINO as usize % IPB * mem::size_of::<Dinode>();
        blocks[INODESTART as usize][off..off + mem::size_of::<Dinode>()]
            .copy_from_slice(root.as_bytes());

        // "." and "..".
        let mut data = [0u8; BSIZE];
        let mut de_bytes = [0u8; DIRENT_SIZE];
        de_bytes[0] = ROOTINO as u8;
        de_bytes[2] = b'.';
        data[..DIRENT_SIZE].copy_from_slice(&de_bytes);
        de_bytes[2] = b'.';
        de_bytes[3] = b'.';
        data[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&de_bytes);
        blocks[DATASTART as usize] = data;

        // Mark the metadata blocks and the root data block used.
        for b in 0..=DATASTART {
            blocks[BMAPSTART as usize][(b / 8) as usize] |= 1 << (b % 8);
        }

        blocks
    }

    /// A fresh file system on a fresh device number; device numbers are
    /// unique per test so the shared buffer cache never aliases blocks.
    fn fresh_fs() -> (&'static Fs, &'static MemDisk, u32, RcInode) {
        static NEXT_DEV: AtomicU32 = AtomicU32::new(100);
        let dev = NEXT_DEV.fetch_add(1, Ordering::Relaxed);

        let disk = Box::leak(Box::new(MemDisk::new()));
        disk.install(dev, mkfs());

        let fs = Box::leak(Box::new(Fs::new()));
        fs.init(dev, disk);
        let root = fs.itable.get(dev, ROOTINO);
        (fs, disk, dev, root)
    }

    fn name(bytes: &[u8]) -> &FileName {
        // SAFETY: test names contain no NUL.
        unsafe { FileName::from_bytes(bytes) }
    }

    fn path(bytes: &[u8]) -> &Path {
        // SAFETY: test paths contain no NUL.
        unsafe { Path::from_bytes(bytes) }
    }

    /// Count the free bits in the bitmap, through the cache.
    fn free_bits(fs: &Fs, dev: u32) -> u32 {
        let sb = fs.superblock(dev);
        let bp = fs.bread(dev, sb.bblock(0));
        let mut free = 0;
        for b in 0..sb.size {
            if bp.data[(b / 8) as usize] & (1 << (b % 8)) == 0 {
                free += 1;
            }
        }
        free
    }

    /// Count allocated dinodes, through the cache.
    fn used_inodes(fs: &Fs, dev: u32) -> u32 {
        let sb = fs.superblock(dev);
        let mut used = 0;
        for inum in 1..sb.ninodes {
            let bp = fs.bread(dev, sb.iblock(inum));
            // SAFETY: dip is aligned and inside bp.data.
            let dip = unsafe {
                &*(bp.data.as_ptr() as *const Dinode).add(inum as usize % IPB)
            };
            if dip.typ != 0 {
                used += 1;
            }
        }
        used
    }

    #[test]
    fn write_then_read_back_any_range() {
        let (fs, _disk, _dev, root) = fresh_fs();
        let tx = fs.begin_tx();
        let ip_ref = create(fs, path(b"/data"), InodeType::File, 0o644, 0, 0, &root, &tx)
            .expect("create");

        let mut guard = fs.ilock(&ip_ref);
        let pattern: Vec<u8> = (0..1300u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(guard.write_bytes(&pattern, 0, &tx), Ok(1300));
        assert_eq!(guard.size, 1300);

        // Writing at the current size grows the file.
        assert_eq!(guard.write_bytes(b"tail", 1300, &tx), Ok(4));
        assert_eq!(guard.size, 1304);

        let mut back = vec![0u8; 1304];
        assert_eq!(guard.read_bytes(&mut back, 0), 1304);
        assert_eq!(&back[..1300], &pattern[..]);
        assert_eq!(&back[1300..], b"tail");

        // An unaligned interior range reads back the same bytes.
        let mut mid = vec![0u8; 700];
        assert_eq!(guard.read_bytes(&mut mid, 333), 700);
        assert_eq!(&mid[..], &back[333..1033]);

        drop(guard);
        fs.iput(&tx, ip_ref);
    }

    #[test]
    fn create_adds_exactly_one_dirent_and_no_data_blocks() {
        let (fs, _disk, dev, root) = fresh_fs();
        let free_before = free_bits(fs, dev);

        let tx = fs.begin_tx();
        let ip_ref = create(fs, path(b"/foo"), InodeType::File, 0o644, 0, 0, &root, &tx)
            .expect("create");

        // The new dirent is in the root, with a non-zero inum.
        let mut rootg = fs.ilock(&root);
        let (found, _) = rootg.dirlookup(name(b"foo")).expect("dirlookup foo");
        assert_eq!(found.inum, ip_ref.inum);
        assert_ne!(found.inum, 0);
        drop(rootg);
        fs.iput(&tx, found);

        // The new inode is an empty file with one link.
        let g = fs.ilock(&ip_ref);
        assert_eq!(g.typ, InodeType::File);
        assert_eq!(g.nlink, 1);
        assert_eq!(g.size, 0);
        drop(g);
        fs.iput(&tx, ip_ref);
        drop(tx);

        // An empty file allocates no data blocks.
        assert_eq!(free_bits(fs, dev), free_before);
    }

    #[test]
    fn mkdir_then_rmdir_restores_bitmap_and_inodes() {
        let (fs, _disk, dev, root) = fresh_fs();
        let free_before = free_bits(fs, dev);
        let inodes_before = used_inodes(fs, dev);

        {
            let tx = fs.begin_tx();
            let dir = create(fs, path(b"/d"), InodeType::Dir, 0o755, 0, 0, &root, &tx)
                .expect("mkdir");
            fs.iput(&tx, dir);
        }
        assert_eq!(free_bits(fs, dev), free_before - 1); // the dir's dirent block
        assert_eq!(used_inodes(fs, dev), inodes_before + 1);

        {
            let tx = fs.begin_tx();
            unlink(fs, path(b"/d"), 0, 0, &root, &tx).expect("rmdir");
        }
        assert_eq!(free_bits(fs, dev), free_before);
        assert_eq!(used_inodes(fs, dev), inodes_before);
    }

    #[test]
    fn unlink_refuses_nonempty_directory() {
        let (fs, _disk, _dev, root) = fresh_fs();
        let tx = fs.begin_tx();
        let dir = create(fs, path(b"/d"), InodeType::Dir, 0o755, 0, 0, &root, &tx).unwrap();
        fs.iput(&tx, dir);
        let f = create(fs, path(b"/d/f"), InodeType::File, 0o644, 0, 0, &root, &tx).unwrap();
        fs.iput(&tx, f);

        assert!(unlink(fs, path(b"/d"), 0, 0, &root, &tx).is_err());
        unlink(fs, path(b"/d/f"), 0, 0, &root, &tx).expect("unlink file");
        unlink(fs, path(b"/d"), 0, 0, &root, &tx).expect("rmdir now empty");
    }

    #[test]
    fn link_shares_an_inode_and_unlink_drops_a_name() {
        let (fs, _disk, _dev, root) = fresh_fs();
        let tx = fs.begin_tx();
        let f = create(fs, path(b"/a"), InodeType::File, 0o644, 0, 0, &root, &tx).unwrap();

        link(fs, path(b"/a"), path(b"/b"), 0, 0, &root, &tx).expect("link");
        {
            let g = fs.ilock(&f);
            assert_eq!(g.nlink, 2);
        }

        let via_b = fs.namei(path(b"/b"), &root, &tx).expect("namei /b");
        assert_eq!(via_b.inum, f.inum);
        fs.iput(&tx, via_b);

        unlink(fs, path(b"/a"), 0, 0, &root, &tx).expect("unlink /a");
        {
            let g = fs.ilock(&f);
            assert_eq!(g.nlink, 1);
        }
        fs.iput(&tx, f);
    }

    #[test]
    fn commit_installs_blocks_only_at_transaction_end() {
        let (fs, disk, dev, _root) = fresh_fs();
        let target = DATASTART + 3;

        let tx = fs.begin_tx();
        {
            let mut bp = fs.bread(dev, target);
            bp.data.0[..4].copy_from_slice(b"ABCD");
            tx.write(&mut bp);
        }
        // Still uncommitted: the home location is untouched.
        assert_ne!(&disk.read_raw(dev, target)[..4], b"ABCD");
        drop(tx);
        // Commit installed the block.
        assert_eq!(&disk.read_raw(dev, target)[..4], b"ABCD");
        // And the log header is clear again.
        assert_eq!(&disk.read_raw(dev, LOGSTART)[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn crash_mid_commit_is_replayed_on_next_mount() {
        static NEXT_DEV: AtomicU32 = AtomicU32::new(900);
        let dev = NEXT_DEV.fetch_add(1, Ordering::Relaxed);

        let disk = Box::leak(Box::new(MemDisk::new()));
        let mut image = mkfs();

        // Two staged blocks were written to the log region, and the
        // header made it out — but the crash hit before the install.
        let a = DATASTART + 10;
        let b = DATASTART + 11;
        let mut alpha = [0u8; BSIZE];
        alpha[..5].copy_from_slice(b"alpha");
        let mut beta = [0u8; BSIZE];
        beta[..4].copy_from_slice(b"beta");
        image[(LOGSTART + 1) as usize] = alpha;
        image[(LOGSTART + 2) as usize] = beta;
        let header = &mut image[LOGSTART as usize];
        header[..4].copy_from_slice(&2u32.to_ne_bytes());
        header[4..8].copy_from_slice(&a.to_ne_bytes());
        header[8..12].copy_from_slice(&b.to_ne_bytes());

        // The home locations still hold stale contents.
        image[a as usize][..5].copy_from_slice(b"STALE");
        image[b as usize][..5].copy_from_slice(b"STALE");
        disk.install(dev, image);

        // Mounting replays the log.
        let fs = Box::leak(Box::new(Fs::new()));
        fs.init(dev, disk);

        assert_eq!(&disk.read_raw(dev, a)[..5], b"alpha");
        assert_eq!(&disk.read_raw(dev, b)[..4], b"beta");
        assert_eq!(&disk.read_raw(dev, LOGSTART)[..4], &[0, 0, 0, 0]);

        // Reads through the cache agree.
        let bp = fs.bread(dev, a);
        assert_eq!(&bp.data[..5], b"alpha");
    }

    #[test]
    fn permission_matrix() {
        let mut inner = InodeInner {
            valid: true,
            typ: InodeType::File,
            nlink: 1,
            size: 0,
            mode: 0o600,
            uid: 1000,
            gid: 1000,
            addrs: [0; NDIRECT + 2],
        };

        // Owner uid 1000, mode 0600.
        assert!(!perm_ok(1001, 1001, &inner, PERM_R)); // other
        assert!(perm_ok(1000, 1000, &inner, PERM_R)); // owner
        assert!(perm_ok(1000, 1000, &inner, PERM_W));
        assert!(perm_ok(0, 0, &inner, PERM_R | PERM_W)); // root

        // Group class.
        inner.mode = 0o640;
        assert!(perm_ok(1001, 1000, &inner, PERM_R)); // same gid
        assert!(!perm_ok(1001, 1000, &inner, PERM_W));

        // Execute.
        inner.mode = 0o755;
        assert!(perm_ok(1001, 1001, &inner, PERM_X));
        inner.mode = 0o644;
        assert!(!perm_ok(1001, 1001, &inner, PERM_X));
    }

    #[test]
    fn perm_denied_surfaces_through_create() {
        let (fs, _disk, _dev, root) = fresh_fs();
        // Root directory is 0755 owned by 0: others cannot create in it.
        let tx = fs.begin_tx();
        assert!(create(fs, path(b"/nope"), InodeType::File, 0o644, 1000, 1000, &root, &tx)
            .is_err());
        // Root can.
        let f = create(fs, path(b"/yes"), InodeType::File, 0o644, 0, 0, &root, &tx).unwrap();
        fs.iput(&tx, f);
    }

    #[test]
    fn sequential_reads_cycle_the_cache_without_panic() {
        let (fs, _disk, dev, _root) = fresh_fs();
        // Far more blocks than the pool has buffers.
        for round in 0..3 {
            for bno in DATASTART..DATASTART + 3 * crate::param::NBUF as u32 {
                let bp = fs.bread(dev, bno);
                assert_eq!(bp.blockno, bno, "round {}", round);
            }
        }
    }

    #[test]
    fn at_most_one_cached_inode_per_number() {
        let (fs, _disk, dev, root) = fresh_fs();
        let again = fs.itable.get(dev, ROOTINO);
        assert_eq!(again.idx, root.idx);
        let tx = fs.begin_tx();
        fs.iput(&tx, again);
    }

    #[test]
    fn bitmap_exhaustion_fails_with_out_of_space() {
        let (fs, _disk, _dev, root) = fresh_fs();
        let f = {
            let tx = fs.begin_tx();
            create(fs, path(b"/big"), InodeType::File, 0o644, 0, 0, &root, &tx).unwrap()
        };

        // Keep appending in log-sized chunks until the bitmap runs dry;
        // this must surface as an error, not a panic.
        let chunk = [0xA5u8; (MAXOPBLOCKS - 4) / 2 * BSIZE];
        let mut off = 0u32;
        let mut failed = false;
        for _ in 0..2 * FS_BLOCKS as usize {
            let tx = fs.begin_tx();
            let mut g = fs.ilock(&f);
            match g.write_bytes(&chunk, off, &tx) {
                Ok(n) => off += n as u32,
                Err(()) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "writes kept succeeding past the device size");

        let tx = fs.begin_tx();
        fs.iput(&tx, f);
    }

    #[test]
    fn mount_redirects_lookup_and_umount_requires_idle() {
        let (fs, disk, dev_a, root) = fresh_fs();
        let dev_b = dev_a + 5000;
        disk.install(dev_b, mkfs());

        // /mnt on the root device.
        {
            let tx = fs.begin_tx();
            let mnt = create(fs, path(b"/mnt"), InodeType::Dir, 0o755, 0, 0, &root, &tx)
                .expect("mkdir /mnt");
            fs.mount(dev_b, &mnt).expect("mount");
            fs.iput(&tx, mnt);
        }

        // Creating under /mnt lands on the mounted device.
        let f = {
            let tx = fs.begin_tx();
            let f = create(fs, path(b"/mnt/f"), InodeType::File, 0o644, 0, 0, &root, &tx)
                .expect("create through mount point");
            assert_eq!(f.dev, dev_b);
            f
        };

        // ".." from inside the mounted root climbs back out.
        {
            let tx = fs.begin_tx();
            let broot = fs.itable.get(dev_b, ROOTINO);
            let up = fs.namei(path(b".."), &broot, &tx).expect("dotdot");
            assert_eq!(up.dev, dev_a);
            assert_eq!(up.inum, ROOTINO);
            fs.iput(&tx, up);
            fs.iput(&tx, broot);
        }

        // getcwd from the mounted root names the mount point.
        {
            let tx = fs.begin_tx();
            let broot = fs.itable.get(dev_b, ROOTINO);
            let mut buf = [0u8; 64];
            let n = fs.getcwd(&broot, &mut buf, &tx).expect("getcwd");
            assert_eq!(&buf[..n], b"/mnt");
            fs.iput(&tx, broot);
        }

        // Busy: a file on the mounted device blocks umount.
        {
            let tx = fs.begin_tx();
            let mnt = fs.namei(path(b"/mnt"), &root, &tx).expect("namei /mnt");
            assert!(fs.umount(&mnt).is_err());
            fs.iput(&tx, f);
            fs.umount(&mnt).expect("umount after idle");
            fs.iput(&tx, mnt);
        }
    }

    #[test]
    fn double_indirect_blocks_reach_past_the_single_tree() {
        let (fs, _disk, _dev, root) = fresh_fs();
        let f = {
            let tx = fs.begin_tx();
            create(fs, path(b"/sparse"), InodeType::File, 0o644, 0, 0, &root, &tx).unwrap()
        };

        // Fill past the direct and single-indirect trees so the
        // double-indirect tree engages, then round-trip reads across
        // both boundaries.
        let single = (NDIRECT * BSIZE) as u32;
        let double = ((NDIRECT + NINDIRECT) * BSIZE) as u32;
        let chunk = [0x5Au8; BSIZE];
        let mut off = 0;
        while off < double + 2 * BSIZE as u32 {
            let tx = fs.begin_tx();
            let mut g = fs.ilock(&f);
            let n = g.write_bytes(&chunk, off, &tx).expect("write");
            off += n as u32;
        }

        let mut g = fs.ilock(&f);
        let mut back = [0u8; 64];
        for boundary in [single, double] {
            back.fill(0);
            assert_eq!(g.read_bytes(&mut back, boundary - 32), 64);
            assert!(back.iter().all(|&b| b == 0x5A));
        }
        drop(g);

        let tx = fs.begin_tx();
        fs.iput(&tx, f);
    }
}

/// Create an inode at `path` with the given type and ownership, wiring up
/// "." and ".." for directories. Returns the created (or, for an existing
/// regular file, found) inode, unlocked.
pub fn create(
    fs: &Fs,
    path: &Path,
    typ: InodeType,
    mode: u16,
    uid: u32,
    gid: u32,
    cwd: &RcInode,
    tx: &Tx<'_>,
) -> Result<RcInode, ()> {
    let (dp_ref, name) = fs.nameiparent(path, cwd, tx)?;
    let mut dp = fs.ilock(&dp_ref);

    // Writing the parent directory needs write permission on it.
    if !perm_ok(uid, gid, &dp, PERM_W) {
        drop(dp);
        fs.iput(tx, dp_ref);
        return Err(());
    }

    if let Ok((ip_ref, _)) = dp.dirlookup(name) {
        drop(dp);
        fs.iput(tx, dp_ref);
        let ip = fs.ilock(&ip_ref);
        if typ == InodeType::File && ip.typ == InodeType::File {
            drop(ip);
            return Ok(ip_ref);
        }
        drop(ip);
        fs.iput(tx, ip_ref);
        return Err(());
    }

    let Ok(ip_ref) = fs.alloc_inode(dp.dev, typ, mode, uid as u16, gid as u16, tx) else {
        drop(dp);
        fs.iput(tx, dp_ref);
        return Err(());
    };
    let mut ip = fs.ilock(&ip_ref);
    ip.nlink = 1;
    ip.update(tx);

    if typ == InodeType::Dir {
        // "." and "..". No nlink++ for ".": avoid a cyclic link count.
        dp.nlink += 1; // for ".."
        dp.update(tx);

        let inum = ip.inum;
        // SAFETY: "." and ".." contain no NUL.
        ip.dirlink(unsafe { FileName::from_bytes(b".") }, inum, tx)
            .and_then(|()| ip.dirlink(unsafe { FileName::from_bytes(b"..") }, dp.inum, tx))
            .expect("create dots");
    }

    dp.dirlink(name, ip.inum, tx).expect("create: dirlink");
    drop(ip);
    drop(dp);
    fs.iput(tx, dp_ref);
    Ok(ip_ref)
}

/// Link `new` as another name for the inode at `old`.
pub fn link(
    fs: &Fs,
    old: &Path,
    new: &Path,
    uid: u32,
    gid: u32,
    cwd: &RcInode,
    tx: &Tx<'_>,
) -> Result<(), ()> {
    let ip_ref = fs.namei(old, cwd, tx)?;
    let mut ip = fs.ilock(&ip_ref);
    if ip.typ == InodeType::Dir {
        drop(ip);
        fs.iput(tx, ip_ref);
        return Err(());
    }
    ip.nlink += 1;
    ip.update(tx);
    drop(ip);

    let undo = |fs: &Fs, ip_ref: RcInode| {
        let mut ip = fs.ilock(&ip_ref);
        ip.nlink -= 1;
        ip.update(tx);
        drop(ip);
        fs.iput(tx, ip_ref);
    };

    let Ok((dp_ref, name)) = fs.nameiparent(new, cwd, tx) else {
        undo(fs, ip_ref);
        return Err(());
    };
    let mut dp = fs.ilock(&dp_ref);
    if dp.dev != ip_ref.dev
        || !perm_ok(uid, gid, &dp, PERM_W)
        || dp.dirlink(name, ip_ref.inum, tx).is_err()
    {
        drop(dp);
        fs.iput(tx, dp_ref);
        undo(fs, ip_ref);
        return Err(());
    }
    drop(dp);
    fs.iput(tx, dp_ref);
    fs.iput(tx, ip_ref);
    Ok(())
}

/// Remove the directory entry at `path`; the inode itself is freed when
/// the last reference goes away.
pub fn unlink(
    fs: &Fs,
    path: &Path,
    uid: u32,
    gid: u32,
    cwd: &RcInode,
    tx: &Tx<'_>,
) -> Result<(), ()> {
    let (dp_ref, name) = fs.nameiparent(path, cwd, tx)?;
    let mut dp = fs.ilock(&dp_ref);

    let bail = |fs: &Fs, dp: InodeGuard<'_>, dp_ref: RcInode| {
        drop(dp);
        fs.iput(tx, dp_ref);
        Err(())
    };

    if !perm_ok(uid, gid, &dp, PERM_W) {
        return bail(fs, dp, dp_ref);
    }

    // Cannot unlink "." or "..".
    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        return bail(fs, dp, dp_ref);
    }

    let Ok((ip_ref, off)) = dp.dirlookup(name) else {
        return bail(fs, dp, dp_ref);
    };
    let mut ip = fs.ilock(&ip_ref);
    assert!(ip.nlink >= 1, "unlink: nlink < 1");

    if ip.typ == InodeType::Dir && !ip.is_dir_empty() {
        drop(ip);
        fs.iput(tx, ip_ref);
        return bail(fs, dp, dp_ref);
    }

    dp.write_obj(&Dirent::default(), off, tx)
        .expect("unlink: write");
    if ip.typ == InodeType::Dir {
        dp.nlink -= 1;
        dp.update(tx);
    }
    drop(dp);
    fs.iput(tx, dp_ref);

    ip.nlink -= 1;
    ip.update(tx);
    drop(ip);
    fs.iput(tx, ip_ref);
    Ok(())
}

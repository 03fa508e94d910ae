//! Buffer cache.
//!
//! A fixed pool of buffers holding cached copies of disk blocks, giving
//! the rest of the kernel a synchronisation point for each (device,
//! block number) pair: at most one buffer caches any given block, and a
//! buffer's contents are only read or written while its sleep-lock is
//! held. An LRU list decides which buffer to recycle.

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use bitflags::bitflags;

use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NBUF};
use crate::proc::WaitChannel;

bitflags! {
    pub struct BufFlags: u32 {
        /// The data has been read from disk.
        const VALID = 1 << 0;
        /// The data must be written to disk.
        const DIRTY = 1 << 1;
        /// Address the raw disk, not the file system partition.
        const RAW = 1 << 2;
    }
}

/// The sector payload, aligned so callers may overlay u32-based on-disk
/// structures on it.
#[repr(align(4))]
pub struct BufData(pub [u8; BSIZE]);

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Everything guarded by the buffer's sleep-lock. The disk interrupt
/// handler also touches this, through `inner_raw`, for the one buffer at
/// the head of the driver queue while its owner sleeps.
pub struct BufInner {
    pub dev: u32,
    pub blockno: u32,
    pub flags: BufFlags,
    pub data: BufData,
}

pub struct BufEntry {
    inner: Sleeplock<BufInner>,

    /// Signalled by the disk interrupt when the buffer's request is done.
    pub waitchannel: WaitChannel,

    /// Next buffer in the driver's request queue; guarded by the driver
    /// lock.
    qnext: UnsafeCell<*mut BufEntry>,
}

// SAFETY: qnext is only touched under the disk driver's lock.
unsafe impl Sync for BufEntry {}

impl BufEntry {
    const fn new() -> Self {
        Self {
            inner: Sleeplock::new("buffer", BufInner {
                dev: 0,
                blockno: 0,
                flags: BufFlags::empty(),
                data: BufData([0; BSIZE]),
            }),
            waitchannel: WaitChannel::new(),
            qnext: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    /// Raw access to the sleep-locked contents, for the disk driver
    /// servicing this buffer while its owner sleeps.
    ///
    /// # Safety
    ///
    /// The caller must be the disk driver holding its queue lock, and the
    /// buffer must be on the queue.
    pub unsafe fn inner_raw(&self) -> *mut BufInner {
        self.inner.get_mut_raw()
    }

    /// # Safety
    ///
    /// See `inner_raw`; only for queue manipulation under the driver lock.
    pub unsafe fn qnext_raw(&self) -> *mut *mut BufEntry {
        self.qnext.get()
    }
}

/// Identity and LRU position of each buffer, guarded by the cache lock.
/// Index NBUF is the list sentinel; most-recently-used is next of the
/// sentinel, recycling scans from its prev.
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

struct BcacheMeta {
    metas: [BufMeta; NBUF + 1],
}

const SENTINEL: usize = NBUF;

impl BcacheMeta {
    const fn new() -> Self {
        let mut metas = [const {
            BufMeta {
                dev: u32::MAX,
                blockno: u32::MAX,
                refcnt: 0,
                prev: 0,
                next: 0,
            }
        }; NBUF + 1];
        let mut i = 0;
        while i <= NBUF {
            metas[i].next = (i + 1) % (NBUF + 1);
            metas[i].prev = (i + NBUF) % (NBUF + 1);
            i += 1;
        }
        Self { metas }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.metas[i].prev, self.metas[i].next);
        self.metas[prev].next = next;
        self.metas[next].prev = prev;
    }

    /// Insert at the most-recently-used end.
    fn push_front(&mut self, i: usize) {
        let next = self.metas[SENTINEL].next;
        self.metas[i].next = next;
        self.metas[i].prev = SENTINEL;
        self.metas[next].prev = i;
        self.metas[SENTINEL].next = i;
    }
}

pub struct Bcache {
    meta: Spinlock<BcacheMeta>,
    entries: [BufEntry; NBUF],
}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            meta: Spinlock::new("bcache", BcacheMeta::new()),
            entries: [const { BufEntry::new() }; NBUF],
        }
    }

    /// Return a locked buffer for the given block, without reading it:
    /// either the cached one, or the least-recently-used unreferenced
    /// clean buffer recycled for this key.
    pub fn get(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut meta = self.meta.lock();

        // Is the block already cached?
        let mut i = meta.metas[SENTINEL].next;
        while i != SENTINEL {
            let m = &mut meta.metas[i];
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                drop(meta);
                return self.make_buf(i);
            }
            i = meta.metas[i].next;
        }

        // Not cached; recycle the least recently used clean buffer.
        let mut i = meta.metas[SENTINEL].prev;
        while i != SENTINEL {
            if meta.metas[i].refcnt == 0 {
                // SAFETY: refcnt is zero, so nobody holds or can acquire
                // the sleep-lock until we publish the new identity.
                let inner = unsafe { &mut *self.entries[i].inner_raw() };
                assert!(
                    !inner.flags.contains(BufFlags::DIRTY),
                    "bget: dirty buffer on free list"
                );
                inner.dev = dev;
                inner.blockno = blockno;
                inner.flags = BufFlags::empty();
                let m = &mut meta.metas[i];
                m.dev = dev;
                m.blockno = blockno;
                m.refcnt = 1;
                drop(meta);
                return self.make_buf(i);
            }
            i = meta.metas[i].prev;
        }

        panic!("bget: no buffers");
    }

    fn make_buf(&self, idx: usize) -> Buf<'_> {
        // The sleep-lock is taken after the cache lock is dropped;
        // holding a spinlock across a sleep is forbidden.
        let guard = self.entries[idx].inner.lock();
        Buf {
            cache: self,
            idx,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn read<'s>(&'s self, dev: u32, blockno: u32, device: &dyn BlockDevice) -> Buf<'s> {
        let mut b = self.get(dev, blockno);
        if !b.flags.contains(BufFlags::VALID) {
            device.rw(&mut b);
        }
        b
    }

    /// Take an extra reference to a locked buffer, keeping it in the
    /// cache (and un-recyclable) after the guard is dropped.
    pub fn pin(&'static self, b: &Buf<'_>) -> BufRef {
        let mut meta = self.meta.lock();
        meta.metas[b.idx].refcnt += 1;
        BufRef {
            cache: self,
            idx: b.idx,
            dev: b.dev,
            blockno: b.blockno,
        }
    }

    /// Release one reference; the buffer re-enters the LRU list at the
    /// front when nobody holds it any more.
    fn relse(&self, idx: usize) {
        let mut meta = self.meta.lock();
        meta.metas[idx].refcnt -= 1;
        if meta.metas[idx].refcnt == 0 {
            meta.unlink(idx);
            meta.push_front(idx);
        }
    }
}

/// A device that can synchronise one buffer with stable storage: write it
/// out when dirty, read it in when not valid. On return the buffer is
/// valid and not dirty.
pub trait BlockDevice: Sync {
    fn rw(&self, b: &mut Buf<'_>);
}

/// A locked buffer: the holder may read and modify the contents.
pub struct Buf<'s> {
    cache: &'s Bcache,
    idx: usize,
    guard: ManuallyDrop<SleeplockGuard<'s, BufInner>>,
}

impl Buf<'_> {
    /// The cache entry, for the disk driver's request queue.
    pub fn entry(&self) -> &BufEntry {
        &self.cache.entries[self.idx]
    }

    /// Re-read the flags through the raw pointer; needed while sleeping
    /// on the disk, when the interrupt handler updates them.
    pub fn flags_raw(&self) -> BufFlags {
        // SAFETY: reads of the flags word race only with the disk
        // interrupt, and are ordered by the driver's queue lock.
        unsafe { (*self.cache.entries[self.idx].inner_raw()).flags }
    }
}

impl Deref for Buf<'_> {
    type Target = BufInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cache.relse(self.idx);
    }
}

/// An unlocked reference to a cached buffer, pinning it in the cache.
/// Used by the log to keep dirty blocks from being recycled until they
/// are committed.
pub struct BufRef {
    cache: &'static Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
}

impl BufRef {
    /// Re-lock the buffer, consuming the pin into the returned guard.
    pub fn lock(self) -> Buf<'static> {
        let cache = self.cache;
        let idx = self.idx;
        core::mem::forget(self);
        let guard = cache.entries[idx].inner.lock();
        Buf {
            cache,
            idx,
            guard: ManuallyDrop::new(guard),
        }
    }
}

impl Drop for BufRef {
    fn drop(&mut self) {
        self.cache.relse(self.idx);
    }
}

/// Write a locked buffer's contents to disk.
pub fn bwrite(b: &mut Buf<'_>, device: &dyn BlockDevice) {
    b.flags.insert(BufFlags::DIRTY);
    device.rw(b);
}

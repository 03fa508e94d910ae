//! The journal: write-ahead, redo-only logging that makes groups of block
//! writes atomic.
//!
//! A transaction contains the updates of multiple FS system calls; the
//! log commits only when no FS system call is active, so a commit never
//! writes an uncommitted call's updates. A system call brackets its
//! updates with begin_op/end_op; begin_op waits when the log is close to
//! running out of space.
//!
//! On-disk format: a header block holding the count and target block
//! numbers, followed by the logged blocks themselves. If the header count
//! is non-zero on boot, recovery replays those blocks into their homes
//! before any other file system I/O.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;

use crate::bio::{bwrite, BlockDevice, Buf, BufFlags, BufRef};
use crate::kernel::kernel;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    pub dev: u32,
    start: u32,

    /// How many FS system calls are executing?
    outstanding: i32,

    /// In commit(); please wait.
    committing: bool,

    /// The active block set: pinned, dirty buffers to be committed.
    bufs: ArrayVec<BufRef, LOGSIZE>,

    device: &'static dyn BlockDevice,
}

/// Contents of the on-disk header block.
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    /// Set up the log for `dev` and run crash recovery.
    pub fn new(dev: u32, start: u32, device: &'static dyn BlockDevice) -> Self {
        let mut log = Self {
            dev,
            start,
            outstanding: 0,
            committing: false,
            bufs: ArrayVec::new(),
            device,
        };
        log.recover();
        log
    }

    fn read(&self, blockno: u32) -> Buf<'static> {
        kernel().bcache.read(self.dev, blockno, self.device)
    }

    /// Read the header block into the in-memory block set.
    fn read_head(&mut self) {
        let buf = self.read(self.start);

        const_assert!(mem::align_of::<crate::bio::BufData>() % mem::align_of::<LogHeader>() == 0);
        // SAFETY: the data is large enough, aligned, and contains only
        // u32s; the buffer is locked.
        let lh = unsafe { &*(buf.data.as_ptr() as *const LogHeader) };
        let n = lh.n as usize;
        let blocks: ArrayVec<u32, LOGSIZE> = lh.block[..n.min(LOGSIZE)].iter().copied().collect();
        drop(buf);

        for b in blocks {
            let buf = self.read(b);
            self.bufs.push(kernel().bcache.pin(&buf));
        }
    }

    /// Write the in-memory block set into the on-disk header. This is the
    /// true commit point.
    fn write_head(&mut self) {
        let mut buf = self.read(self.start);

        // SAFETY: as in read_head; the buffer is locked for writing.
        let lh = unsafe { &mut *(buf.data.as_mut_ptr() as *mut LogHeader) };
        lh.n = self.bufs.len() as u32;
        for (db, b) in izip!(&mut lh.block, &self.bufs) {
            *db = b.blockno;
        }
        bwrite(&mut buf, self.device);
    }

    /// Copy committed blocks from the log region to their home locations.
    fn install_trans(&mut self) {
        let bufs = mem::take(&mut self.bufs);
        for (tail, dbuf) in bufs.into_iter().enumerate() {
            // Log block.
            let lbuf = self.read(self.start + tail as u32 + 1);

            // Home block.
            let mut dbuf = dbuf.lock();
            dbuf.data.copy_from_slice(&lbuf.data[..]);
            dbuf.flags.insert(BufFlags::VALID);
            bwrite(&mut dbuf, self.device);
        }
    }

    fn recover(&mut self) {
        self.read_head();

        // If committed, copy from the log to home locations.
        self.install_trans();

        // Clear the log.
        self.write_head();
    }

    /// Copy modified blocks from the cache into the log region.
    fn write_log(&mut self) {
        for (tail, from) in self.bufs.iter().enumerate() {
            // Log block.
            let mut to = kernel()
                .bcache
                .read(self.dev, self.start + tail as u32 + 1, self.device);

            // Cache block.
            let from = kernel().bcache.read(self.dev, from.blockno, self.device);
            to.data.copy_from_slice(&from.data[..]);
            bwrite(&mut to, self.device);
        }
    }

    fn commit(&mut self) {
        if !self.bufs.is_empty() {
            // Write modified blocks from the cache to the log region.
            self.write_log();

            // Write the header to disk: the real commit.
            self.write_head();

            // Install the writes to their home locations.
            self.install_trans();

            // Erase the transaction from the log.
            self.write_head();
        }
    }

    /// Record that the caller has modified `b` and pin it in the cache;
    /// commit will do the disk write. Replaces a direct bwrite.
    pub fn write(&mut self, b: &mut Buf<'_>) {
        assert!(self.bufs.len() < LOGSIZE, "too big a transaction");
        assert!(self.outstanding >= 1, "log write outside of transaction");

        b.flags.insert(BufFlags::DIRTY);
        if self.bufs.iter().all(|buf| buf.blockno != b.blockno) {
            self.bufs.push(kernel().bcache.pin(b));
        }
    }
}

impl Sleepablelock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.bufs.len() as i32 + (guard.outstanding + 1) * MAXOPBLOCKS as i32
                    > LOGSIZE as i32
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call; commits if this was the
    /// last outstanding operation.
    pub fn end_op(&self) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op while committing");

        if guard.outstanding == 0 {
            // No transaction is in flight, and the lock is still held so
            // none can start; commit without holding the lock, since the
            // disk writes sleep.
            guard.committing = true;
            guard.reacquire_after(|| {
                // SAFETY: committing is set, so no other thread touches
                // the log until it is cleared.
                unsafe { &mut *self.get_mut_raw() }.commit()
            });
            guard.committing = false;
        }

        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the space reserved.
        guard.wakeup();
    }
}

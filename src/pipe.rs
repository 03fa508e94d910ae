//! In-memory pipes: a single bounded ring with a reader channel and a
//! writer channel. Closing the write end wakes readers to see EOF.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::file::{File, FileType, RcFile};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::page::Page;
use crate::proc::{myproc, WaitChannel};

const PIPESIZE: usize = 512;

pub(crate) struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// Signalled when there are unread bytes in the ring.
    read_waitchannel: WaitChannel,

    /// Signalled when space opens up in the ring.
    write_waitchannel: WaitChannel,
}

enum PipeError {
    WaitForIo,
    InvalidStatus,
}

impl Pipe {
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new("pipe", PipeInner {
                data: [0; PIPESIZE],
                nread: 0,
                nwrite: 0,
                readopen: true,
                writeopen: true,
            }),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        }
    }

    /// Read up to `n` bytes; sleeps while the pipe is empty and the write
    /// end is still open. A read against a closed write end returns 0.
    pub fn read(&self, addr: *mut u8, n: usize) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(addr, n) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => {
                    self.read_waitchannel.sleep(&mut inner);
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Write `n` bytes, sleeping whenever the ring fills. Fails when the
    /// read end is closed or the process is killed.
    pub fn write(&self, addr: *const u8, n: usize) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(
                // SAFETY: the caller validated [addr, addr+n).
                unsafe { addr.add(written) },
                n - written,
            ) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < n {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Close one end; returns whether the pipe is now fully closed.
    fn close_end(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }
        !inner.readopen && !inner.writeopen
    }
}

impl PipeInner {
    fn killed() -> bool {
        let p = myproc();
        // SAFETY: null-checked; p is the current process.
        !p.is_null() && unsafe { (*p).killed() }
    }

    fn try_write(&mut self, addr: *const u8, n: usize) -> Result<usize, PipeError> {
        if !self.readopen || Self::killed() {
            return Err(PipeError::InvalidStatus);
        }
        for i in 0..n {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // Ring full; report how far we got.
                return Ok(i);
            }
            // SAFETY: the caller validated the source range.
            let ch = unsafe { *addr.add(i) };
            self.data[self.nwrite as usize % PIPESIZE] = ch;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    fn try_read(&mut self, addr: *mut u8, n: usize) -> Result<usize, PipeError> {
        if self.nread == self.nwrite {
            if self.writeopen {
                if Self::killed() {
                    return Err(PipeError::InvalidStatus);
                }
                return Err(PipeError::WaitForIo);
            }
            // Write end closed: EOF.
            return Ok(0);
        }

        for i in 0..n {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            let ch = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
            // SAFETY: the caller validated the destination range.
            unsafe { *addr.add(i) = ch };
        }
        Ok(n)
    }
}

/// An owning pointer to a page-allocated Pipe, shared by the two file
/// table entries for its ends. The pipe is freed when both are closed.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: the pipe's state is behind its spinlock.
unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl core::ops::Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr refers to a live Pipe until both ends are closed.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Allocate a pipe and its two file table entries: (read end, write
    /// end).
    pub fn alloc() -> Result<(RcFile, RcFile), ()> {
        const_assert!(core::mem::size_of::<Pipe>() <= crate::arch::PGSIZE);

        let page = kernel().kmem.lock().alloc().ok_or(())?;
        let ptr = page.into_addr() as *mut MaybeUninit<Pipe>;
        // SAFETY: the page is owned and large enough.
        let ptr = NonNull::from(unsafe { (*ptr).write(Pipe::new()) });

        let f0 = kernel().ftable.alloc(File::new(
            FileType::Pipe {
                pipe: AllocatedPipe { ptr },
            },
            true,
            false,
        ));
        let f0 = match f0 {
            Ok(f0) => f0,
            Err(_) => {
                // SAFETY: the page came from the allocator above.
                kernel().kmem.lock().free(unsafe { Page::from_addr(ptr.as_ptr() as usize) });
                return Err(());
            }
        };

        let f1 = kernel().ftable.alloc(File::new(
            FileType::Pipe {
                pipe: AllocatedPipe { ptr },
            },
            false,
            true,
        ));
        match f1 {
            Ok(f1) => Ok((f0, f1)),
            Err(_) => {
                // No write end was created; mark it closed so closing the
                // read end frees the page.
                // SAFETY: ptr refers to the live Pipe.
                let _ = unsafe { ptr.as_ref() }.close_end(true);
                kernel().ftable.close(f0);
                Err(())
            }
        }
    }

    /// Close one end; frees the backing page once both are gone.
    pub fn close(self, writable: bool) {
        if self.close_end(writable) {
            // SAFETY: both ends are closed; nobody refers to the pipe.
            kernel()
                .kmem
                .lock()
                .free(unsafe { Page::from_addr(self.ptr.as_ptr() as usize) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_across_chunked_reads() {
        let pipe = Box::new(Pipe::new());
        let src: Vec<u8> = (0..100u8).collect();
        assert_eq!(pipe.write(src.as_ptr(), 100), Ok(100));

        let mut out = Vec::new();
        let mut chunk = [0u8; 10];
        for _ in 0..10 {
            let r = pipe.read(chunk.as_mut_ptr(), 10).unwrap();
            assert_eq!(r, 10);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, src);
    }

    #[test]
    fn read_after_write_end_closed_is_eof() {
        let pipe = Box::new(Pipe::new());
        assert_eq!(pipe.write(b"ab".as_ptr(), 2), Ok(2));
        assert!(!pipe.close_end(true));

        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(buf.as_mut_ptr(), 8), Ok(2));
        assert_eq!(&buf[..2], b"ab");
        // Drained and the write end is gone: EOF.
        assert_eq!(pipe.read(buf.as_mut_ptr(), 8), Ok(0));
    }

    #[test]
    fn write_fails_after_read_end_closed() {
        let pipe = Box::new(Pipe::new());
        assert!(!pipe.close_end(false));
        assert_eq!(pipe.write(b"x".as_ptr(), 1), Err(()));
    }

    #[test]
    fn ring_wraps_cleanly() {
        let pipe = Box::new(Pipe::new());
        let mut buf = [0u8; PIPESIZE];

        // Fill, drain, and fill again so the indices wrap.
        let chunk = [7u8; PIPESIZE];
        assert_eq!(pipe.write(chunk.as_ptr(), PIPESIZE), Ok(PIPESIZE));
        assert_eq!(pipe.read(buf.as_mut_ptr(), PIPESIZE), Ok(PIPESIZE));

        let chunk = [9u8; 300];
        assert_eq!(pipe.write(chunk.as_ptr(), 300), Ok(300));
        assert_eq!(pipe.read(buf.as_mut_ptr(), PIPESIZE), Ok(300));
        assert!(buf[..300].iter().all(|&b| b == 9));
    }
}

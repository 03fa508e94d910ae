//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and packet buffers. Allocates whole 4096-byte pages.

use core::ptr;

use crate::arch::PGSIZE;
use crate::page::Page;

struct Run {
    next: *mut Run,
}

/// Free list of page frames, threaded through the frames themselves.
///
/// # Safety
///
/// The list has no cycle. If `head` is null the list is empty; otherwise
/// `head` is the first element and every element is a valid free page.
pub struct Kmem {
    head: *mut Run,
    nfree: usize,
}

// SAFETY: Kmem is always used behind a spinlock.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            nfree: 0,
        }
    }

    /// Hand the frames between `start` and `end` to the allocator.
    ///
    /// # Safety
    ///
    /// The range must be unused memory, page-aligned, and handed over only
    /// once.
    pub unsafe fn free_range(&mut self, start: usize, end: usize) {
        for pa in num_iter::range_step(start, end, PGSIZE) {
            // SAFETY: per the contract, each frame in the range is unowned.
            self.free(unsafe { Page::from_addr(pa) });
        }
    }

    /// Free one page. The page is zeroed to catch dangling references.
    pub fn free(&mut self, mut page: Page) {
        page.write_bytes(0);
        let r = page.into_addr() as *mut Run;
        // SAFETY: the page was owned, so linking it in cannot form a cycle.
        unsafe { (*r).next = self.head };
        self.head = r;
        self.nfree += 1;
    }

    /// Allocate one page, or fail with out-of-memory.
    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is a valid free page by the invariant.
        let next = unsafe { (*self.head).next };
        let addr = core::mem::replace(&mut self.head, next) as usize;
        self.nfree -= 1;
        // SAFETY: the frame is unlinked and now exclusively owned.
        Some(unsafe { Page::from_addr(addr) })
    }

    pub fn nfree(&self) -> usize {
        self.nfree
    }
}

//! Virtual memory: two-level 32-bit page tables.
//!
//! The lower half of every address space is the user program; the upper
//! half is a kernel mapping identical in every process, so the kernel can
//! run on any process's page table and can dereference user pointers
//! directly after validating them against the process size.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{
    self, p2v, pdx, pgrounddown, pgroundup, pte_addr, ptx, v2p, PteFlags, EXTMEM, KERNBASE,
    NPDENTRIES, PGSIZE,
};
use crate::fs::InodeGuard;
use crate::kernel::kernel;
use crate::page::Page;
use crate::proc::Proc;

/// VGA frame buffer, mappable into user space with the mapvga call.
const VGA_FRAMEBUF: usize = 0xA_0000;
const VGA_FRAMEBUF_LEN: usize = 64 * 1024;

/// The kernel-only page directory, used when no process is running.
static KPGDIR: AtomicUsize = AtomicUsize::new(0);

/// Return the page-table entry for virtual address `va` in `pgdir`,
/// allocating the page table page when `alloc` is set.
unsafe fn walkpgdir(pgdir: *mut u32, va: usize, alloc: bool) -> Option<*mut u32> {
    // SAFETY: pgdir is a valid page directory per the caller.
    let pde = unsafe { pgdir.add(pdx(va)) };
    let pgtab = if PteFlags::from_bits_truncate(unsafe { *pde } as usize).contains(PteFlags::P) {
        p2v(pte_addr(unsafe { *pde } as usize)) as *mut u32
    } else {
        if !alloc {
            return None;
        }
        let pt = kernel().kmem.lock().alloc()?;
        // Freed pages are zeroed, so all entries start non-present.
        let pgtab = pt.into_addr() as *mut u32;
        // The permissions here are overly generous; the page table
        // entries, if any, restrict them further.
        unsafe {
            *pde = (v2p(pgtab as usize) | (PteFlags::P | PteFlags::W | PteFlags::U).bits()) as u32;
        }
        pgtab
    };
    Some(unsafe { pgtab.add(ptx(va)) })
}

/// Create PTEs for virtual addresses starting at `va` that refer to
/// physical addresses starting at `pa`.
unsafe fn mappages(
    pgdir: *mut u32,
    va: usize,
    size: usize,
    mut pa: usize,
    perm: PteFlags,
) -> Result<(), ()> {
    let mut a = pgrounddown(va);
    let last = pgrounddown(va + size - 1);
    loop {
        let pte = unsafe { walkpgdir(pgdir, a, true) }.ok_or(())?;
        // SAFETY: pte points into an owned page table page.
        unsafe {
            assert!(
                !PteFlags::from_bits_truncate(*pte as usize).contains(PteFlags::P),
                "remap"
            );
            *pte = (pa | perm.bits() | PteFlags::P.bits()) as u32;
        }
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Set up a page directory with the kernel part mapped and the user part
/// empty. Fails with out-of-memory.
pub unsafe fn setupkvm() -> Option<*mut u32> {
    let pt = kernel().kmem.lock().alloc()?;
    let pgdir = pt.into_addr() as *mut u32;
    for k in arch::kmap() {
        if unsafe { mappages(pgdir, k.virt, k.end - k.start, k.start, k.perm) }.is_err() {
            unsafe { freevm(pgdir) };
            return None;
        }
    }
    Some(pgdir)
}

/// Allocate the kernel-only page directory and switch to it. Boot only.
pub unsafe fn kvmalloc() {
    let pgdir = unsafe { setupkvm() }.expect("kvmalloc");
    KPGDIR.store(pgdir as usize, Ordering::Release);
    unsafe { switchkvm() };
}

/// Switch the hardware page table register to the kernel-only table.
pub unsafe fn switchkvm() {
    unsafe { arch::lcr3(v2p(KPGDIR.load(Ordering::Acquire))) };
}

/// Switch the TSS and the page table to the given process's.
pub unsafe fn switchuvm(p: &Proc) {
    unsafe {
        crate::lock::push_off();
        // SAFETY: the caller guarantees p is not being torn down.
        let data = &*p.data_raw();
        assert!(data.kstack != 0, "switchuvm: no kstack");
        assert!(!data.pgdir.is_null(), "switchuvm: no pgdir");
        arch::switch_user_segment(data.kstack + PGSIZE);
        arch::lcr3(v2p(data.pgdir as usize));
        crate::lock::pop_off();
    }
}

/// Load the initcode binary into address 0 of a fresh page directory.
pub unsafe fn inituvm(pgdir: *mut u32, init: &[u8]) {
    assert!(init.len() < PGSIZE, "inituvm: more than a page");
    let mut mem = kernel().kmem.lock().alloc().expect("inituvm: out of memory");
    mem.as_mut_slice()[..init.len()].copy_from_slice(init);
    let pa = v2p(mem.into_addr());
    unsafe { mappages(pgdir, 0, PGSIZE, pa, PteFlags::W | PteFlags::U) }.expect("inituvm");
}

/// Load a program segment into `pgdir` at virtual address `addr`, reading
/// `sz` bytes from the inode starting at `offset`. The pages must already
/// be mapped and `addr` page-aligned.
pub unsafe fn loaduvm(
    pgdir: *mut u32,
    addr: usize,
    ip: &mut InodeGuard<'_>,
    offset: u32,
    sz: usize,
) -> Result<(), ()> {
    assert_eq!(addr % PGSIZE, 0, "loaduvm: addr must be page aligned");
    for i in num_iter::range_step(0, sz, PGSIZE) {
        let pte = unsafe { walkpgdir(pgdir, addr + i, false) }.expect("loaduvm: address not mapped");
        let pa = pte_addr(unsafe { *pte } as usize);
        let n = core::cmp::min(sz - i, PGSIZE);
        // SAFETY: pa is a frame owned by this page directory.
        let dst = unsafe { core::slice::from_raw_parts_mut(p2v(pa) as *mut u8, n) };
        if ip.read_bytes(dst, offset + i as u32) != n {
            return Err(());
        }
    }
    Ok(())
}

/// Grow the user segment from `oldsz` to `newsz` by allocating and
/// mapping zeroed pages. Returns the new size.
pub unsafe fn allocuvm(pgdir: *mut u32, oldsz: usize, newsz: usize) -> Result<usize, ()> {
    if newsz >= KERNBASE {
        return Err(());
    }
    if newsz < oldsz {
        return Ok(oldsz);
    }

    for a in num_iter::range_step(pgroundup(oldsz), newsz, PGSIZE) {
        let Some(mem) = kernel().kmem.lock().alloc() else {
            unsafe { deallocuvm(pgdir, a, oldsz) };
            return Err(());
        };
        let pa = v2p(mem.into_addr());
        if unsafe { mappages(pgdir, a, PGSIZE, pa, PteFlags::W | PteFlags::U) }.is_err() {
            // SAFETY: the frame is unmapped and still owned here.
            kernel().kmem.lock().free(unsafe { Page::from_addr(p2v(pa)) });
            unsafe { deallocuvm(pgdir, a, oldsz) };
            return Err(());
        }
    }
    Ok(newsz)
}

/// Shrink the user segment from `oldsz` to `newsz`, freeing the mapped
/// pages. Returns the new size.
pub unsafe fn deallocuvm(pgdir: *mut u32, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut a = pgroundup(newsz);
    while a < oldsz {
        match unsafe { walkpgdir(pgdir, a, false) } {
            None => {
                // No page table here; skip to the next page directory slot.
                a = pgroundup((pdx(a) + 1) << 22);
                continue;
            }
            Some(pte) => {
                let ent = unsafe { *pte } as usize;
                if PteFlags::from_bits_truncate(ent).contains(PteFlags::P) {
                    let pa = pte_addr(ent);
                    assert_ne!(pa, 0, "deallocuvm");
                    // Device frames (the VGA window) are not the
                    // allocator's to reclaim.
                    if pa >= EXTMEM {
                        // SAFETY: the frame was allocated by allocuvm.
                        kernel().kmem.lock().free(unsafe { Page::from_addr(p2v(pa)) });
                    }
                    unsafe { *pte = 0 };
                }
            }
        }
        a += PGSIZE;
    }
    newsz
}

/// Free a page directory and all the user pages it maps.
pub unsafe fn freevm(pgdir: *mut u32) {
    assert!(!pgdir.is_null(), "freevm: no pgdir");
    unsafe {
        deallocuvm(pgdir, KERNBASE, 0);
        for i in 0..NPDENTRIES {
            let pde = *pgdir.add(i) as usize;
            if PteFlags::from_bits_truncate(pde).contains(PteFlags::P) {
                kernel()
                    .kmem
                    .lock()
                    .free(Page::from_addr(p2v(pte_addr(pde))));
            }
        }
        kernel().kmem.lock().free(Page::from_addr(pgdir as usize));
    }
}

/// Clear the user-access bit on a page, making an inaccessible guard page
/// below the user stack.
pub unsafe fn clearpteu(pgdir: *mut u32, uva: usize) {
    let pte = unsafe { walkpgdir(pgdir, uva, false) }.expect("clearpteu");
    unsafe { *pte = (*pte as usize & !PteFlags::U.bits()) as u32 };
}

/// Copy a parent's address space for fork: a fresh page directory with a
/// deep copy of every user page.
pub unsafe fn copyuvm(pgdir: *mut u32, sz: usize) -> Option<*mut u32> {
    let new = unsafe { setupkvm() }?;

    for i in num_iter::range_step(0, sz, PGSIZE) {
        let pte = unsafe { walkpgdir(pgdir, i, false) }.expect("copyuvm: pte should exist");
        let ent = unsafe { *pte } as usize;
        assert!(
            PteFlags::from_bits_truncate(ent).contains(PteFlags::P),
            "copyuvm: page not present"
        );
        let pa = pte_addr(ent);
        let flags = PteFlags::from_bits_truncate(ent) & (PteFlags::W | PteFlags::U);

        let Some(mut mem) = kernel().kmem.lock().alloc() else {
            unsafe { freevm(new) };
            return None;
        };
        // SAFETY: pa is a mapped user frame of PGSIZE bytes.
        let src = unsafe { core::slice::from_raw_parts(p2v(pa) as *const u8, PGSIZE) };
        mem.as_mut_slice().copy_from_slice(src);
        let mem_pa = v2p(mem.into_addr());
        if unsafe { mappages(new, i, PGSIZE, mem_pa, flags) }.is_err() {
            kernel()
                .kmem
                .lock()
                // SAFETY: the copy is unmapped and still owned here.
                .free(unsafe { Page::from_addr(p2v(mem_pa)) });
            unsafe { freevm(new) };
            return None;
        }
    }
    Some(new)
}

/// Map user virtual address `uva` to a kernel pointer, checking that it is
/// a present, user-accessible page.
unsafe fn uva2ka(pgdir: *mut u32, uva: usize) -> Option<*mut u8> {
    let pte = unsafe { walkpgdir(pgdir, uva, false) }?;
    let ent = unsafe { *pte } as usize;
    let flags = PteFlags::from_bits_truncate(ent);
    if !flags.contains(PteFlags::P) || !flags.contains(PteFlags::U) {
        return None;
    }
    Some(p2v(pte_addr(ent)) as *mut u8)
}

/// Copy bytes into user virtual address `va` of a page directory that is
/// not necessarily the current one. Used by exec for the new stack.
pub unsafe fn copyout(pgdir: *mut u32, mut va: usize, mut src: &[u8]) -> Result<(), ()> {
    while !src.is_empty() {
        let va0 = pgrounddown(va);
        let ka = unsafe { uva2ka(pgdir, va0) }.ok_or(())?;
        let off = va - va0;
        let n = core::cmp::min(PGSIZE - off, src.len());
        // SAFETY: ka points at a mapped frame; [off, off+n) is in bounds.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), ka.add(off), n) };
        src = &src[n..];
        va += n;
    }
    Ok(())
}

/// Map the 64 KiB VGA frame buffer at a caller-chosen, page-aligned user
/// virtual address.
pub unsafe fn mapvga(pgdir: *mut u32, va: usize) -> Result<(), ()> {
    if va % PGSIZE != 0 || va >= KERNBASE || va + VGA_FRAMEBUF_LEN > KERNBASE {
        return Err(());
    }
    unsafe {
        mappages(
            pgdir,
            va,
            VGA_FRAMEBUF_LEN,
            VGA_FRAMEBUF,
            PteFlags::W | PteFlags::U,
        )
    }
}

//! exec: replace the current process image with a program loaded from the
//! file system.
//!
//! The new page table is built completely before the commit point; any
//! failure up to then leaves the caller's image intact.

use core::mem;

use arrayvec::ArrayVec;

use crate::arch::{pgroundup, PGSIZE};
use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{perm_ok, InodeType, Path, PERM_X};
use crate::kernel::kernel;
use crate::param::MAXARG;
use crate::proc::myproc;
use crate::vm;

pub fn exec(path: &Path, argv: &ArrayVec<&[u8], MAXARG>) -> Result<usize, ()> {
    let p = myproc();
    assert!(!p.is_null(), "exec");
    // SAFETY: p is the current process.
    let data = unsafe { &mut *(*p).data_raw() };
    let cwd = data.cwd.as_ref().ok_or(())?;
    let fs = kernel().fs();

    let mut elf = ElfHdr::default();
    let mut sz;
    let mut pgdir;

    {
        let tx = fs.begin_tx();
        let ip_ref = fs.namei(path, cwd, &tx)?;
        let mut ip = fs.ilock(&ip_ref);

        let bail = |ip, ip_ref| {
            drop(ip);
            fs.iput(&tx, ip_ref);
            Err(())
        };

        // Running a program requires execute permission on it.
        if ip.typ != InodeType::File || !perm_ok(data.uid, data.gid, &ip, PERM_X) {
            return bail(ip, ip_ref);
        }

        if ip.read_obj(&mut elf, 0).is_err() || elf.magic != ELF_MAGIC {
            return bail(ip, ip_ref);
        }

        pgdir = match unsafe { vm::setupkvm() } {
            Some(pgdir) => pgdir,
            None => return bail(ip, ip_ref),
        };

        // Load each loadable program segment into fresh user pages.
        sz = 0usize;
        let mut ph = ProgHdr::default();
        for i in 0..elf.phnum {
            let off = elf.phoff + (i as u32) * mem::size_of::<ProgHdr>() as u32;
            let mut fail = ip.read_obj(&mut ph, off).is_err();
            if !fail && ph.typ == ELF_PROG_LOAD {
                fail = ph.memsz < ph.filesz
                    || ph.vaddr.checked_add(ph.memsz).is_none()
                    || ph.vaddr as usize % PGSIZE != 0;
                if !fail {
                    match unsafe { vm::allocuvm(pgdir, sz, (ph.vaddr + ph.memsz) as usize) } {
                        Ok(newsz) => sz = newsz,
                        Err(()) => fail = true,
                    }
                }
                if !fail {
                    fail = unsafe {
                        vm::loaduvm(pgdir, ph.vaddr as usize, &mut ip, ph.off, ph.filesz as usize)
                    }
                    .is_err();
                }
            }
            if fail {
                drop(ip);
                fs.iput(&tx, ip_ref);
                unsafe { vm::freevm(pgdir) };
                return Err(());
            }
        }

        drop(ip);
        fs.iput(&tx, ip_ref);
    }

    // Allocate two pages past the image: the lower one is an inaccessible
    // stack guard, the upper one is the user stack.
    sz = pgroundup(sz);
    let stack_top = match unsafe { vm::allocuvm(pgdir, sz, sz + 2 * PGSIZE) } {
        Ok(newsz) => newsz,
        Err(()) => {
            unsafe { vm::freevm(pgdir) };
            return Err(());
        }
    };
    // SAFETY: the guard page was just mapped.
    unsafe { vm::clearpteu(pgdir, stack_top - 2 * PGSIZE) };
    let mut sp = stack_top;

    // Push argument strings, then the array of pointers to them.
    let argc = argv.len();
    let mut ustack = [0u32; 3 + MAXARG + 1];
    let mut ok = true;
    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp &= !3; // word-align
        if unsafe { vm::copyout(pgdir, sp, arg) }.is_err()
            || unsafe { vm::copyout(pgdir, sp + arg.len(), &[0u8]) }.is_err()
        {
            ok = false;
            break;
        }
        ustack[3 + i] = sp as u32;
    }
    if ok {
        ustack[3 + argc] = 0;

        // Fake return program counter, argc, argv.
        ustack[0] = 0xFFFF_FFFF;
        ustack[1] = argc as u32;
        ustack[2] = (sp - (argc + 1) * 4) as u32;

        let frame = (3 + argc + 1) * 4;
        sp -= frame;
        // SAFETY: reinterpreting the stack image as bytes.
        let bytes = unsafe { core::slice::from_raw_parts(ustack.as_ptr() as *const u8, frame) };
        ok = unsafe { vm::copyout(pgdir, sp, bytes) }.is_ok();
    }
    if !ok {
        unsafe { vm::freevm(pgdir) };
        return Err(());
    }

    // Save the program name for debugging.
    let mut rest = path;
    let mut last = None;
    while let Some((next, name)) = rest.skipelem() {
        rest = next;
        last = Some(name);
    }
    if let Some(name) = last {
        data.set_name(name.as_bytes());
    }

    // Commit to the new image.
    let old_pgdir = data.pgdir;
    data.pgdir = pgdir;
    data.sz = stack_top;
    // SAFETY: tf points into the process's kernel stack.
    unsafe {
        (*data.tf).eip = elf.entry;
        (*data.tf).esp = sp as u32;
        vm::switchuvm(&*p);
        vm::freevm(old_pgdir);
    }
    Ok(argc)
}

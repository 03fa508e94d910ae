//! System call dispatch and argument marshalling.
//!
//! Arguments live on the user stack: argument n of the current call is
//! the word at esp + 4 + 4n. Every fetched pointer is validated against
//! the process size before the kernel touches it; user memory is mapped
//! while in the kernel, so a validated pointer can be dereferenced
//! directly.

use crate::file::{File, RcFile};
use crate::fs::Path;
use crate::kernel::kernel;
use crate::println;
use crate::proc::{myproc, ProcData};

mod file;
mod net;
mod proc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;
pub const SYS_MOUNT: usize = 22;
pub const SYS_UMOUNT: usize = 23;
pub const SYS_SOCKET: usize = 24;
pub const SYS_CONNECT: usize = 25;
pub const SYS_SEND: usize = 26;
pub const SYS_RECV: usize = 27;
pub const SYS_CLOSE_SOCKET: usize = 28;
pub const SYS_SETCONSOLEMODE: usize = 29;
pub const SYS_LSEEK: usize = 30;
pub const SYS_SETUID: usize = 31;
pub const SYS_GETUID: usize = 32;
pub const SYS_SETGID: usize = 33;
pub const SYS_GETGID: usize = 34;
pub const SYS_CHOWN: usize = 35;
pub const SYS_CHMOD: usize = 36;
pub const SYS_GETCWD: usize = 37;
pub const SYS_SETVIDEOMODE: usize = 38;
pub const SYS_MAPVGA: usize = 39;
pub const SYS_PS: usize = 40;
pub const SYS_CRASH: usize = 41;

/// Dispatch the system call in the current trap frame; the result (or
/// -1) lands in eax.
pub unsafe fn syscall() {
    let p = myproc();
    assert!(!p.is_null(), "syscall without a process");
    // SAFETY: p is the current process, in a syscall.
    let data = unsafe { &mut *(*p).data_raw() };
    let num = unsafe { (*data.tf).eax } as usize;

    let ret = match num {
        SYS_FORK => proc::sys_fork(),
        SYS_EXIT => proc::sys_exit(),
        SYS_WAIT => proc::sys_wait(),
        SYS_PIPE => file::sys_pipe(),
        SYS_READ => file::sys_read(),
        SYS_KILL => proc::sys_kill(),
        SYS_EXEC => file::sys_exec(),
        SYS_FSTAT => file::sys_fstat(),
        SYS_CHDIR => file::sys_chdir(),
        SYS_DUP => file::sys_dup(),
        SYS_GETPID => proc::sys_getpid(),
        SYS_SBRK => proc::sys_sbrk(),
        SYS_SLEEP => proc::sys_sleep(),
        SYS_UPTIME => proc::sys_uptime(),
        SYS_OPEN => file::sys_open(),
        SYS_WRITE => file::sys_write(),
        SYS_MKNOD => file::sys_mknod(),
        SYS_UNLINK => file::sys_unlink(),
        SYS_LINK => file::sys_link(),
        SYS_MKDIR => file::sys_mkdir(),
        SYS_CLOSE => file::sys_close(),
        SYS_MOUNT => file::sys_mount(),
        SYS_UMOUNT => file::sys_umount(),
        SYS_SOCKET => net::sys_socket(),
        SYS_CONNECT => net::sys_connect(),
        SYS_SEND => net::sys_send(),
        SYS_RECV => net::sys_recv(),
        SYS_CLOSE_SOCKET => net::sys_close_socket(),
        SYS_SETCONSOLEMODE => file::sys_setconsolemode(),
        SYS_LSEEK => file::sys_lseek(),
        SYS_SETUID => proc::sys_setuid(),
        SYS_GETUID => proc::sys_getuid(),
        SYS_SETGID => proc::sys_setgid(),
        SYS_GETGID => proc::sys_getgid(),
        SYS_CHOWN => file::sys_chown(),
        SYS_CHMOD => file::sys_chmod(),
        SYS_GETCWD => file::sys_getcwd(),
        SYS_SETVIDEOMODE => file::sys_setvideomode(),
        SYS_MAPVGA => file::sys_mapvga(),
        SYS_PS => proc::sys_ps(),
        SYS_CRASH => proc::sys_crash(),
        _ => {
            println!(
                "{}: unknown sys call {}",
                crate::proc::current_pid(),
                num
            );
            Err(())
        }
    };

    // SAFETY: as above.
    unsafe {
        (*data.tf).eax = match ret {
            Ok(v) => v as u32,
            Err(()) => -1i32 as u32,
        };
    }
}

pub(super) fn current_data() -> &'static mut ProcData {
    let p = myproc();
    assert!(!p.is_null(), "syscall without a process");
    // SAFETY: p is the current process and stays ours for the syscall.
    unsafe { &mut *(*p).data_raw() }
}

/// Fetch the word at user virtual address `addr`.
pub fn fetchint(addr: u32) -> Result<i32, ()> {
    let data = current_data();
    if addr as usize >= data.sz || addr as usize + 4 > data.sz {
        return Err(());
    }
    // SAFETY: the range is inside the process image, which is mapped.
    Ok(unsafe { core::ptr::read_unaligned(addr as usize as *const i32) })
}

/// Fetch the NUL-terminated string at `addr`; the returned slice
/// excludes the NUL. Valid until the process changes its image.
pub fn fetchstr(addr: u32) -> Result<&'static [u8], ()> {
    let data = current_data();
    let start = addr as usize;
    if start >= data.sz {
        return Err(());
    }
    for end in start..data.sz {
        // SAFETY: end is inside the process image.
        if unsafe { *(end as *const u8) } == 0 {
            // SAFETY: [start, end) is mapped and NUL-free.
            return Ok(unsafe {
                core::slice::from_raw_parts(start as *const u8, end - start)
            });
        }
    }
    Err(())
}

/// Fetch the nth 32-bit system call argument from the user stack.
pub fn argint(n: usize) -> Result<i32, ()> {
    let data = current_data();
    // SAFETY: tf points into the kernel stack.
    let esp = unsafe { (*data.tf).esp };
    fetchint(esp + 4 + 4 * n as u32)
}

/// Fetch the nth argument as a pointer to a block of `size` bytes,
/// checking that the whole block lies inside the process image.
pub fn argptr(n: usize, size: usize) -> Result<*mut u8, ()> {
    let addr = argint(n)?;
    let data = current_data();
    let addr = addr as u32 as usize;
    if addr >= data.sz || addr.checked_add(size).ok_or(())? > data.sz {
        return Err(());
    }
    Ok(addr as *mut u8)
}

/// Fetch the nth argument as a NUL-terminated string.
pub fn argstr(n: usize) -> Result<&'static [u8], ()> {
    let addr = argint(n)?;
    fetchstr(addr as u32)
}

/// Fetch the nth argument as a file descriptor, returning the index and
/// the open file it refers to.
pub fn argfd(n: usize) -> Result<(usize, &'static File), ()> {
    let fd = argint(n)?;
    let data = current_data();
    let fd = usize::try_from(fd).map_err(|_| ())?;
    let handle: &RcFile = data
        .open_files
        .get(fd)
        .ok_or(())?
        .as_ref()
        .ok_or(())?;
    Ok((fd, kernel().ftable.get(handle)))
}

/// Install an open file into the lowest free slot of the process
/// descriptor table.
pub fn fdalloc(file: RcFile) -> Result<usize, ()> {
    let data = current_data();
    for (fd, slot) in data.open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(file);
            return Ok(fd);
        }
    }
    kernel().ftable.close(file);
    Err(())
}

fn path_arg(bytes: &[u8]) -> &Path {
    // SAFETY: fetchstr stops at the NUL, so the slice has none.
    unsafe { Path::from_bytes(bytes) }
}

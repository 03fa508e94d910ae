//! Process-level system calls.

use super::{argint, current_data};
use crate::kernel::kernel;
use crate::proc::myproc;

pub fn sys_fork() -> Result<usize, ()> {
    kernel().procs().fork().map(|pid| pid as usize)
}

pub fn sys_exit() -> Result<usize, ()> {
    kernel().procs().exit_current()
    // Not reached.
}

pub fn sys_wait() -> Result<usize, ()> {
    kernel().procs().wait().map(|pid| pid as usize)
}

pub fn sys_kill() -> Result<usize, ()> {
    let pid = argint(0)?;
    kernel().procs().kill(pid).map(|()| 0)
}

pub fn sys_getpid() -> Result<usize, ()> {
    Ok(crate::proc::current_pid() as usize)
}

pub fn sys_sbrk() -> Result<usize, ()> {
    let n = argint(0)?;
    kernel().procs().grow_current(n)
}

/// Sleep for n ticks.
pub fn sys_sleep() -> Result<usize, ()> {
    let n = argint(0)? as u32;
    let mut ticks = kernel().ticks.lock();
    let t0 = *ticks;
    while ticks.wrapping_sub(t0) < n {
        let p = myproc();
        // SAFETY: p is the current process.
        if unsafe { (*p).killed() } {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

/// How many clock ticks have elapsed since boot.
pub fn sys_uptime() -> Result<usize, ()> {
    Ok(*kernel().ticks.lock() as usize)
}

/// Change the caller's user id. Only uid 0 may switch identities.
pub fn sys_setuid() -> Result<usize, ()> {
    let uid = argint(0)?;
    let data = current_data();
    if data.uid != 0 {
        return Err(());
    }
    data.uid = uid as u32;
    Ok(0)
}

pub fn sys_getuid() -> Result<usize, ()> {
    Ok(current_data().uid as usize)
}

pub fn sys_setgid() -> Result<usize, ()> {
    let gid = argint(0)?;
    let data = current_data();
    if data.uid != 0 {
        return Err(());
    }
    data.gid = gid as u32;
    Ok(0)
}

pub fn sys_getgid() -> Result<usize, ()> {
    Ok(current_data().gid as usize)
}

/// Print the process listing to the console.
pub fn sys_ps() -> Result<usize, ()> {
    kernel().procs().dump();
    Ok(0)
}

/// Deliberately crash the kernel, to exercise log recovery on the next
/// boot.
pub fn sys_crash() -> Result<usize, ()> {
    panic!("crash requested from user space");
}

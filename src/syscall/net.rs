//! Socket system calls.

use super::{argint, argptr};
use crate::kernel::kernel;

pub fn sys_socket() -> Result<usize, ()> {
    let typ = argint(0)?;
    kernel().net.socket(typ).map(|fd| fd as usize)
}

pub fn sys_connect() -> Result<usize, ()> {
    let fd = argint(0)?;
    let ip = argint(1)? as u32;
    let port = argint(2)?;
    let port = u16::try_from(port).map_err(|_| ())?;
    kernel().net.connect(fd, ip, port).map(|()| 0)
}

pub fn sys_send() -> Result<usize, ()> {
    let fd = argint(0)?;
    let n = argint(2)?;
    let n = usize::try_from(n).map_err(|_| ())?;
    let buf = argptr(1, n)?;
    // SAFETY: the source range was validated.
    let data = unsafe { core::slice::from_raw_parts(buf, n) };
    kernel().net.send(fd, data)
}

pub fn sys_recv() -> Result<usize, ()> {
    let fd = argint(0)?;
    let n = argint(2)?;
    let n = usize::try_from(n).map_err(|_| ())?;
    let buf = argptr(1, n)?;
    // SAFETY: the destination range was validated.
    let dst = unsafe { core::slice::from_raw_parts_mut(buf, n) };
    kernel().net.recv(fd, dst)
}

pub fn sys_close_socket() -> Result<usize, ()> {
    let fd = argint(0)?;
    kernel().net.close_socket(fd).map(|()| 0)
}

//! File-system system calls. Mostly argument checking, since user code is
//! not trusted, and calls into the file, fs and vm layers.

use core::cell::UnsafeCell;

use arrayvec::ArrayVec;
use zerocopy::AsBytes;

use super::{
    argfd, argint, argptr, argstr, current_data, fdalloc, fetchint, fetchstr, path_arg,
};
use crate::exec::exec;
use crate::file::{File, FileType};
use crate::fs::{self, perm_ok, InodeType, RcInode, Stat, PERM_R, PERM_W};
use crate::kernel::kernel;
use crate::param::MAXARG;
use crate::pipe::AllocatedPipe;
use crate::vm;

const O_RDONLY: i32 = 0x000;
const O_WRONLY: i32 = 0x001;
const O_RDWR: i32 = 0x002;
const O_CREATE: i32 = 0x200;

/// Default mode bits for newly created objects.
const MODE_FILE: u16 = 0o644;
const MODE_DIR: u16 = 0o755;
const MODE_DEV: u16 = 0o666;

fn cwd(data: &crate::proc::ProcData) -> Result<&RcInode, ()> {
    data.cwd.as_ref().ok_or(())
}

pub fn sys_dup() -> Result<usize, ()> {
    let (fd, _) = argfd(0)?;
    let data = current_data();
    let handle = data.open_files[fd].as_ref().ok_or(())?;
    let new = kernel().ftable.dup(handle);
    fdalloc(new)
}

pub fn sys_read() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let n = argint(2)?;
    let p = argptr(1, usize::try_from(n).map_err(|_| ())?)?;
    f.read(p, n)
}

pub fn sys_write() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let n = argint(2)?;
    let p = argptr(1, usize::try_from(n).map_err(|_| ())?)?;
    f.write(p, n)
}

pub fn sys_close() -> Result<usize, ()> {
    let (fd, _) = argfd(0)?;
    let data = current_data();
    let handle = data.open_files[fd].take().ok_or(())?;
    kernel().ftable.close(handle);
    Ok(0)
}

pub fn sys_fstat() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let st_ptr = argptr(1, core::mem::size_of::<Stat>())?;
    let st = f.stat()?;
    // SAFETY: the destination range was validated; write unaligned since
    // user code chooses the address.
    unsafe {
        core::ptr::copy_nonoverlapping(st.as_bytes().as_ptr(), st_ptr, st.as_bytes().len());
    }
    Ok(0)
}

/// Create the path new as a link to the same inode as old.
pub fn sys_link() -> Result<usize, ()> {
    let old = path_arg(argstr(0)?);
    let new = path_arg(argstr(1)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    fs::link(fs, old, new, data.uid, data.gid, cwd(data)?, &tx)?;
    Ok(0)
}

pub fn sys_unlink() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    fs::unlink(fs, path, data.uid, data.gid, cwd(data)?, &tx)?;
    Ok(0)
}

pub fn sys_open() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let omode = argint(1)?;
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let readable = omode & O_WRONLY == 0;
    let writable = omode & (O_WRONLY | O_RDWR) != 0;

    let ip_ref = if omode & O_CREATE != 0 {
        fs::create(
            fs,
            path,
            InodeType::File,
            MODE_FILE,
            data.uid,
            data.gid,
            cwd(data)?,
            &tx,
        )?
    } else {
        let ip_ref = fs.namei(path, cwd(data)?, &tx)?;
        let ip = fs.ilock(&ip_ref);

        if ip.typ == InodeType::Dir && omode != O_RDONLY {
            drop(ip);
            fs.iput(&tx, ip_ref);
            return Err(());
        }

        let mut needed = 0;
        if readable {
            needed |= PERM_R;
        }
        if writable {
            needed |= PERM_W;
        }
        if !perm_ok(data.uid, data.gid, &ip, needed) {
            drop(ip);
            fs.iput(&tx, ip_ref);
            return Err(());
        }
        drop(ip);
        ip_ref
    };

    let typ = {
        let ip = fs.ilock(&ip_ref);
        ip.typ
    };
    let ftype = match typ {
        InodeType::Device { major, minor } => FileType::Device {
            ip: ip_ref,
            major,
            minor,
            off: UnsafeCell::new(0),
        },
        _ => FileType::Inode {
            ip: ip_ref,
            off: UnsafeCell::new(0),
        },
    };

    match kernel().ftable.alloc(File::new(ftype, readable, writable)) {
        Ok(f) => fdalloc(f),
        Err(file) => {
            // Table full: put the reference the file carried back.
            match file.typ {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => fs.iput(&tx, ip),
                _ => {}
            }
            Err(())
        }
    }
}

pub fn sys_mkdir() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    let ip = fs::create(
        fs,
        path,
        InodeType::Dir,
        MODE_DIR,
        data.uid,
        data.gid,
        cwd(data)?,
        &tx,
    )?;
    fs.iput(&tx, ip);
    Ok(0)
}

pub fn sys_mknod() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let major = argint(1)? as u16;
    let minor = argint(2)? as u16;
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    let ip = fs::create(
        fs,
        path,
        InodeType::Device { major, minor },
        MODE_DEV,
        data.uid,
        data.gid,
        cwd(data)?,
        &tx,
    )?;
    fs.iput(&tx, ip);
    Ok(0)
}

pub fn sys_chdir() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let ip_ref = fs.namei(path, cwd(data)?, &tx)?;
    let ip = fs.ilock(&ip_ref);
    if ip.typ != InodeType::Dir || !perm_ok(data.uid, data.gid, &ip, fs::PERM_X) {
        drop(ip);
        fs.iput(&tx, ip_ref);
        return Err(());
    }
    drop(ip);

    if let Some(old) = data.cwd.replace(ip_ref) {
        fs.iput(&tx, old);
    }
    Ok(0)
}

pub fn sys_exec() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let uargv = argint(1)? as u32;

    let mut args: ArrayVec<&[u8], MAXARG> = ArrayVec::new();
    let mut complete = false;
    for i in 0..MAXARG {
        let uarg = fetchint(uargv.wrapping_add(4 * i as u32))? as u32;
        if uarg == 0 {
            complete = true;
            break;
        }
        args.push(fetchstr(uarg)?);
    }
    if !complete {
        return Err(());
    }

    exec(path, &args)
}

pub fn sys_pipe() -> Result<usize, ()> {
    let fd_array = argptr(0, 2 * core::mem::size_of::<i32>())? as *mut i32;

    let (rf, wf) = AllocatedPipe::alloc()?;
    let fd0 = match fdalloc(rf) {
        Ok(fd0) => fd0,
        Err(()) => {
            kernel().ftable.close(wf);
            return Err(());
        }
    };
    let fd1 = match fdalloc(wf) {
        Ok(fd1) => fd1,
        Err(()) => {
            let data = current_data();
            let handle = data.open_files[fd0].take().unwrap();
            kernel().ftable.close(handle);
            return Err(());
        }
    };

    // SAFETY: the destination range was validated.
    unsafe {
        core::ptr::write_unaligned(fd_array, fd0 as i32);
        core::ptr::write_unaligned(fd_array.add(1), fd1 as i32);
    }
    Ok(0)
}

/// Mount the file system on the named block device onto a directory.
pub fn sys_mount() -> Result<usize, ()> {
    let dev_path = path_arg(argstr(0)?);
    let dir_path = path_arg(argstr(1)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    // The device argument names a disk device node; its minor number is
    // the drive.
    let dev_ref = fs.namei(dev_path, cwd(data)?, &tx)?;
    let dev_ip = fs.ilock(&dev_ref);
    let minor = match dev_ip.typ {
        InodeType::Device { minor, .. } => minor,
        _ => {
            drop(dev_ip);
            fs.iput(&tx, dev_ref);
            return Err(());
        }
    };
    drop(dev_ip);
    fs.iput(&tx, dev_ref);

    if minor as usize >= crate::param::NDISK {
        return Err(());
    }

    let dir_ref = fs.namei(dir_path, cwd(data)?, &tx)?;
    let dir_ip = fs.ilock(&dir_ref);
    if dir_ip.typ != InodeType::Dir {
        drop(dir_ip);
        fs.iput(&tx, dir_ref);
        return Err(());
    }
    drop(dir_ip);

    let res = fs.mount(minor as u32, &dir_ref);
    fs.iput(&tx, dir_ref);
    res.map(|()| 0)
}

pub fn sys_umount() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let ip_ref = fs.namei(path, cwd(data)?, &tx)?;
    let res = fs.umount(&ip_ref);
    fs.iput(&tx, ip_ref);
    res.map(|()| 0)
}

pub fn sys_lseek() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let offset = argint(1)?;
    let whence = argint(2)?;
    f.seek(offset, whence).map(|off| off as usize)
}

pub fn sys_chown() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let uid = argint(1)?;
    let gid = argint(2)?;
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let ip_ref = fs.namei(path, cwd(data)?, &tx)?;
    let mut ip = fs.ilock(&ip_ref);
    // Only root or the owner may give a file away.
    if data.uid != 0 && data.uid != ip.uid as u32 {
        drop(ip);
        fs.iput(&tx, ip_ref);
        return Err(());
    }
    ip.uid = uid as u16;
    ip.gid = gid as u16;
    ip.update(&tx);
    drop(ip);
    fs.iput(&tx, ip_ref);
    Ok(0)
}

pub fn sys_chmod() -> Result<usize, ()> {
    let path = path_arg(argstr(0)?);
    let mode = argint(1)?;
    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let ip_ref = fs.namei(path, cwd(data)?, &tx)?;
    let mut ip = fs.ilock(&ip_ref);
    if data.uid != 0 && data.uid != ip.uid as u32 {
        drop(ip);
        fs.iput(&tx, ip_ref);
        return Err(());
    }
    // Preserve any high bits; only the permission bits change.
    ip.mode = (ip.mode & !0o777) | (mode as u16 & 0o777);
    ip.update(&tx);
    drop(ip);
    fs.iput(&tx, ip_ref);
    Ok(0)
}

pub fn sys_getcwd() -> Result<usize, ()> {
    let size = argint(1)?;
    let size = usize::try_from(size).map_err(|_| ())?;
    if size < 2 {
        return Err(());
    }
    let buf = argptr(0, size)?;

    let data = current_data();
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    // SAFETY: the destination range was validated.
    let out = unsafe { core::slice::from_raw_parts_mut(buf, size - 1) };
    let len = fs.getcwd(cwd(data)?, out, &tx)?;
    // SAFETY: len < size.
    unsafe { *buf.add(len) = 0 };
    Ok(0)
}

pub fn sys_setconsolemode() -> Result<usize, ()> {
    let mode = argint(0)?;
    kernel().console.set_raw(mode != 0);
    Ok(0)
}

pub fn sys_setvideomode() -> Result<usize, ()> {
    let mode = argint(0)?;
    crate::vga::set_mode(mode)?;
    Ok(0)
}

/// Map the VGA frame buffer at a caller-chosen user address.
pub fn sys_mapvga() -> Result<usize, ()> {
    let va = argint(0)? as u32 as usize;
    let data = current_data();
    unsafe { vm::mapvga(data.pgdir, va) }?;
    Ok(0)
}

//! File metadata returned by fstat. Layout shared with user programs.

use zerocopy::AsBytes;

pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEV: i16 = 3;

#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes)]
pub struct Stat {
    /// Type of file.
    pub typ: i16,
    pub _pad0: u16,

    /// File system's disk device.
    pub dev: i32,

    /// Inode number.
    pub ino: u32,

    /// Number of links to file.
    pub nlink: i16,
    pub _pad1: u16,

    /// Size of file in bytes.
    pub size: u32,

    /// Permission bits.
    pub mode: u32,

    /// Owner user and group id.
    pub uid: u32,
    pub gid: u32,

    /// Device number, for device nodes.
    pub rdev: u32,
}

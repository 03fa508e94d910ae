//! The mount table: redirection of a directory inode to the root of
//! another block device's file system. At most one file system may be
//! mounted per device.

use crate::lock::Spinlock;
use crate::param::NMOUNT;

#[derive(Copy, Clone)]
struct MountEntry {
    active: bool,

    /// The mounted block device.
    dev: u32,

    /// The directory the device is mounted on, as a revalidatable
    /// (device, inode number) pair.
    mp_dev: u32,
    mp_inum: u32,
}

pub struct MountTable {
    entries: Spinlock<[MountEntry; NMOUNT]>,
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            entries: Spinlock::new("mount", [MountEntry {
                active: false,
                dev: 0,
                mp_dev: 0,
                mp_inum: 0,
            }; NMOUNT]),
        }
    }

    /// Record that `dev` is mounted on the directory (mp_dev, mp_inum).
    /// Fails when the table is full or the device is already mounted.
    pub fn add(&self, dev: u32, mp_dev: u32, mp_inum: u32) -> Result<(), ()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.active && e.dev == dev) {
            return Err(());
        }
        for e in entries.iter_mut() {
            if !e.active {
                *e = MountEntry {
                    active: true,
                    dev,
                    mp_dev,
                    mp_inum,
                };
                return Ok(());
            }
        }
        Err(())
    }

    /// Remove the mount whose mount point is (mp_dev, mp_inum); returns
    /// the device that was mounted there.
    pub fn remove(&self, mp_dev: u32, mp_inum: u32) -> Result<u32, ()> {
        let mut entries = self.entries.lock();
        for e in entries.iter_mut() {
            if e.active && e.mp_dev == mp_dev && e.mp_inum == mp_inum {
                e.active = false;
                return Ok(e.dev);
            }
        }
        Err(())
    }

    /// If (dev, inum) is a mount point, the device mounted on it.
    pub fn mounted_dev(&self, dev: u32, inum: u32) -> Option<u32> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.active && e.mp_dev == dev && e.mp_inum == inum)
            .map(|e| e.dev)
    }

    /// If `dev` is a mounted device, the (device, inode number) of its
    /// mount point. Used when ".." crosses out of a mounted root.
    pub fn mount_point(&self, dev: u32) -> Option<(u32, u32)> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.active && e.dev == dev)
            .map(|e| (e.mp_dev, e.mp_inum))
    }
}

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 0;

/// Number of IDE drives the block driver serves.
pub const NDISK: usize = 2;

/// Maximum number of mounted file systems.
pub const NMOUNT: usize = 8;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size.
pub const BSIZE: usize = 512;

/// Size of file system image in blocks.
pub const FSSIZE: usize = 2000;

/// Block offset of the file system partition on drive 0.
pub const FSOFFSET: u32 = 0;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Size of the socket table.
pub const NSOCK: usize = 16;

/// Size of the packet buffer pool.
pub const NMBUF: usize = 64;

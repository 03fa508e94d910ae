//! Processes and CPUs.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::arch::{Context, TrapFrame};
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{MAXPROCNAME, NOFILE};

mod procs;
mod wait_channel;

pub use procs::{forkret, Procs};
pub use wait_channel::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Per-CPU state. Mutated only by its own CPU, with interrupts disabled.
pub struct Cpu {
    /// Local APIC id of this CPU.
    pub apicid: u8,

    /// swtch() here to enter the scheduler.
    pub scheduler: *mut Context,

    /// Depth of push_off nesting.
    pub noff: i32,

    /// Were interrupts enabled before push_off?
    pub intena: bool,

    /// The process running on this CPU, or null.
    pub proc: *mut Proc,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            apicid: 0,
            scheduler: ptr::null_mut(),
            noff: 0,
            intena: false,
            proc: ptr::null_mut(),
        }
    }
}

/// Fields guarded by the proc's `info` spinlock.
pub struct ProcInfo {
    /// Process state.
    pub state: ProcState,

    /// If non-null, sleeping on this wait channel.
    pub chan: *const WaitChannel,

    /// Process ID.
    pub pid: Pid,
}

/// Fields private to the process; no lock needs to be held, but only the
/// process itself (or its parent, once the process is a zombie) may touch
/// them.
pub struct ProcData {
    /// Bottom of the kernel stack for this process.
    pub kstack: usize,

    /// Size of user memory in bytes.
    pub sz: usize,

    /// Page directory.
    pub pgdir: *mut u32,

    /// Trap frame for the current syscall, at the top of the kernel stack.
    pub tf: *mut TrapFrame,

    /// swtch() here to run the process.
    pub context: *mut Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// User and group id.
    pub uid: u32,
    pub gid: u32,

    /// Process name, for debugging.
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pgdir: ptr::null_mut(),
            tf: ptr::null_mut(),
            context: ptr::null_mut(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            uid: 0,
            gid: 0,
            name: [0; MAXPROCNAME],
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(MAXPROCNAME - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n] = 0;
    }
}

/// Per-process state.
pub struct Proc {
    pub info: Spinlock<ProcInfo>,

    data: UnsafeCell<ProcData>,

    /// Parent process. Guarded by the proc table's wait lock.
    parent: UnsafeCell<*const Proc>,

    /// Wait channel signalled when a child of this process dies.
    pub child_waitchannel: WaitChannel,

    /// True when the process has been killed.
    killed: AtomicBool,
}

// SAFETY: shared fields are guarded by info/wait_lock; `data` is only
// touched by the owning process or its reaper.
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: ProcState::Unused,
                    chan: ptr::null(),
                    pid: 0,
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
            parent: UnsafeCell::new(ptr::null()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the process killed; it will exit on its next trip through the
    /// trap handler or sleeping-loop kill check.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }

    /// Raw pointer to the process-private data.
    ///
    /// # Safety
    ///
    /// Only the process itself, or the parent reaping it after it became a
    /// zombie, may dereference the result.
    pub unsafe fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }
}

/// The process running on this CPU, or null.
pub fn myproc() -> *mut Proc {
    // SAFETY: interrupts are pushed off around the per-CPU access.
    unsafe {
        crate::lock::push_off();
        let p = (*kernel().current_cpu_raw()).proc;
        crate::lock::pop_off();
        p
    }
}

/// Pid of the current process, or 0 when there is none (boot, hosted
/// tests).
pub fn current_pid() -> Pid {
    let p = myproc();
    if p.is_null() {
        return 0;
    }
    // SAFETY: reading our own pid; it only changes while the slot is
    // being recycled, which cannot happen while we are running.
    unsafe { (*(*p).info.get_mut_raw()).pid }
}

pub(crate) use procs::sched;

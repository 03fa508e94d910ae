//! The process table: creation, scheduling, sleep/wakeup, and teardown.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};

use array_macro::array;
use itertools::izip;

use super::{myproc, Pid, Proc, ProcInfo, ProcState, WaitChannel};
use crate::arch::{self, Context, TrapFrame, DPL_USER, FL_IF, PGSIZE, SEG_UCODE, SEG_UDATA};
use crate::kernel::kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::page::Page;
use crate::param::{NPROC, ROOTDEV};
use crate::println;
use crate::vm;

/// A user program that calls exec("/init"); hand-assembled from
///   push argv; push path; push 0; mov eax, SYS_exec; int 64
/// with the strings appended at the end.
static INITCODE: [u8; 42] = [
    0x68, 0x22, 0x00, 0x00, 0x00, // push $argv
    0x68, 0x1C, 0x00, 0x00, 0x00, // push $init
    0x6A, 0x00, // push $0
    0xB8, 0x07, 0x00, 0x00, 0x00, // mov eax, SYS_exec
    0xCD, 0x40, // int $T_SYSCALL
    0xB8, 0x02, 0x00, 0x00, 0x00, // exit: mov eax, SYS_exit
    0xCD, 0x40, // int $T_SYSCALL
    0xEB, 0xF7, // jmp exit
    0x2F, 0x69, 0x6E, 0x69, 0x74, 0x00, // "/init\0"
    0x1C, 0x00, 0x00, 0x00, // argv[0] = init
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
];

/// The process table.
pub struct Procs {
    nextpid: AtomicI32,

    pool: [Proc; NPROC],

    /// Guards every proc's parent pointer, and makes sure wakeups of
    /// waiting parents are not lost. Must be acquired before any proc's
    /// info lock.
    wait_lock: Spinlock<()>,

    /// The init process, once user_proc_init has run.
    initial_proc: core::sync::atomic::AtomicPtr<Proc>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            pool: array![_ => Proc::new(); NPROC],
            wait_lock: Spinlock::new("wait_lock", ()),
            initial_proc: core::sync::atomic::AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    fn initial_proc(&self) -> *const Proc {
        self.initial_proc.load(Ordering::Acquire)
    }

    /// Look for an Unused slot; if found, set it up to run in the kernel
    /// with a fresh kernel stack arranged so the first swtch lands in
    /// forkret and, from there, in trapret.
    fn alloc(&self) -> Result<&Proc, ()> {
        for p in &self.pool {
            let mut info = p.info.lock();
            if info.state != ProcState::Unused {
                continue;
            }
            info.pid = self.allocpid();
            info.state = ProcState::Embryo;
            drop(info);

            let Some(kstack) = kernel().kmem.lock().alloc() else {
                p.info.lock().state = ProcState::Unused;
                return Err(());
            };

            // SAFETY: the slot is Embryo, owned by us, not yet running.
            let data = unsafe { &mut *p.data_raw() };
            data.kstack = kstack.into_addr();
            let mut sp = data.kstack + PGSIZE;

            // Leave room for the trap frame.
            sp -= mem::size_of::<TrapFrame>();
            data.tf = sp as *mut TrapFrame;

            // Set up the new context to start executing at forkret, which
            // returns to trapret.
            sp -= mem::size_of::<usize>();
            // SAFETY: sp points into the owned kernel stack.
            unsafe { *(sp as *mut usize) = arch::trapret as usize };

            sp -= mem::size_of::<Context>();
            data.context = sp as *mut Context;
            // SAFETY: sp points into the owned kernel stack.
            unsafe {
                *data.context = Context::new();
                (*data.context).eip = forkret as usize as u32;
            }

            return Ok(p);
        }
        Err(())
    }

    /// Set up the first user process.
    pub fn user_proc_init(&self) {
        let p = self.alloc().expect("user_proc_init: no proc slot");
        // SAFETY: the slot is Embryo, owned by us.
        let data = unsafe { &mut *p.data_raw() };

        data.pgdir = unsafe { vm::setupkvm().expect("user_proc_init: out of memory") };
        unsafe { vm::inituvm(data.pgdir, &INITCODE) };
        data.sz = PGSIZE;

        // SAFETY: tf points into the owned kernel stack.
        unsafe {
            *data.tf = TrapFrame::zero();
            (*data.tf).cs = (SEG_UCODE << 3) | DPL_USER;
            (*data.tf).ds = (SEG_UDATA << 3) | DPL_USER;
            (*data.tf).es = (*data.tf).ds;
            (*data.tf).ss = (*data.tf).ds;
            (*data.tf).eflags = FL_IF;
            (*data.tf).esp = PGSIZE as u32;
            (*data.tf).eip = 0;
        }

        data.set_name(b"initcode");
        // iget does no disk I/O, so this is safe before the log is ready.
        data.cwd = Some(kernel().fs().itable.root());

        self.initial_proc
            .store(p as *const Proc as *mut Proc, Ordering::Release);

        p.info.lock().state = ProcState::Runnable;
    }

    /// Create a new process copying the current one; the child returns 0
    /// from the fork() system call.
    pub fn fork(&self) -> Result<Pid, ()> {
        let cur = myproc();
        assert!(!cur.is_null(), "fork");
        // SAFETY: cur is the current process.
        let cur_data = unsafe { &mut *(*cur).data_raw() };

        let np = self.alloc()?;
        // SAFETY: the slot is Embryo, owned by us.
        let np_data = unsafe { &mut *np.data_raw() };

        // Copy the user address space.
        match unsafe { vm::copyuvm(cur_data.pgdir, cur_data.sz) } {
            Some(pgdir) => np_data.pgdir = pgdir,
            None => {
                kernel()
                    .kmem
                    .lock()
                    // SAFETY: the kstack page belongs to the aborted slot.
                    .free(unsafe { Page::from_addr(np_data.kstack) });
                np_data.kstack = 0;
                np.info.lock().state = ProcState::Unused;
                return Err(());
            }
        }
        np_data.sz = cur_data.sz;

        // The child returns 0.
        // SAFETY: both trap frames live on owned kernel stacks.
        unsafe {
            *np_data.tf = *cur_data.tf;
            (*np_data.tf).eax = 0;
        }

        // Duplicate open file descriptors and the working directory.
        for (nf, f) in izip!(np_data.open_files.iter_mut(), cur_data.open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(kernel().ftable.dup(file));
            }
        }
        np_data.cwd = cur_data
            .cwd
            .as_ref()
            .map(|cwd| kernel().fs().itable.dup(cwd));

        np_data.uid = cur_data.uid;
        np_data.gid = cur_data.gid;
        np_data.name = cur_data.name;

        let pid = np.info.lock().pid;

        let parent_guard = self.wait_lock.lock();
        // SAFETY: parent pointers are guarded by wait_lock.
        unsafe { *np.parent.get() = cur };
        drop(parent_guard);

        np.info.lock().state = ProcState::Runnable;
        Ok(pid)
    }

    /// Exit the current process; it stays a zombie until its parent calls
    /// wait(). Does not return.
    pub fn exit_current(&self) -> ! {
        let p = myproc();
        assert!(!p.is_null(), "exit");
        assert!(p as *const Proc != self.initial_proc(), "init exiting");

        // SAFETY: p is the current process.
        let data = unsafe { &mut *(*p).data_raw() };

        // Close all open files.
        for f in data.open_files.iter_mut() {
            if let Some(file) = f.take() {
                kernel().ftable.close(file);
            }
        }

        if let Some(cwd) = data.cwd.take() {
            let tx = kernel().fs().begin_tx();
            kernel().fs().iput(&tx, cwd);
        }

        let parent_guard = self.wait_lock.lock();

        // Pass abandoned children to init.
        let initial = self.initial_proc();
        for child in &self.pool {
            // SAFETY: parent pointers are guarded by wait_lock.
            unsafe {
                if *child.parent.get() == p as *const Proc {
                    *child.parent.get() = initial;
                    (*initial).child_waitchannel.wakeup();
                }
            }
        }

        // Parent might be sleeping in wait().
        // SAFETY: our parent pointer is valid; init never exits.
        let parent = unsafe { *(*p).parent.get() };
        if !parent.is_null() {
            // SAFETY: parent is a live proc table entry.
            unsafe { (*parent).child_waitchannel.wakeup() };
        }

        // SAFETY: p is the current process.
        let mut guard = unsafe { (*p).info.lock() };
        guard.state = ProcState::Zombie;
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        unsafe { sched(&mut guard, p) };
        unreachable!("zombie exit");
    }

    /// Wait for a child to exit; returns its pid, or Err if this process
    /// has no children.
    pub fn wait(&self) -> Result<Pid, ()> {
        let p = myproc();
        assert!(!p.is_null(), "wait");

        let mut parent_guard = self.wait_lock.lock();
        loop {
            let mut havekids = false;
            for np in &self.pool {
                // SAFETY: parent pointers are guarded by wait_lock.
                if unsafe { *np.parent.get() } != p as *const Proc {
                    continue;
                }
                havekids = true;

                let mut info = np.info.lock();
                if info.state == ProcState::Zombie {
                    let pid = info.pid;

                    // SAFETY: the child is a zombie; we are its reaper.
                    let data = unsafe { &mut *np.data_raw() };
                    kernel()
                        .kmem
                        .lock()
                        // SAFETY: the kstack page belongs to the child.
                        .free(unsafe { Page::from_addr(data.kstack) });
                    data.kstack = 0;
                    unsafe { vm::freevm(data.pgdir) };
                    data.pgdir = ptr::null_mut();
                    data.sz = 0;
                    data.name[0] = 0;
                    data.uid = 0;
                    data.gid = 0;

                    // SAFETY: parent pointers are guarded by wait_lock.
                    unsafe { *np.parent.get() = ptr::null() };
                    np.clear_killed();
                    info.pid = 0;
                    info.chan = ptr::null();
                    info.state = ProcState::Unused;
                    return Ok(pid);
                }
            }

            // SAFETY: p is the current process.
            if !havekids || unsafe { (*p).killed() } {
                return Err(());
            }

            // Wait for a child to exit.
            // SAFETY: p is the current process.
            unsafe { (*p).child_waitchannel.sleep(&mut parent_guard) };
        }
    }

    /// Kill the process with the given pid. The victim exits when it next
    /// crosses the user/kernel boundary or checks its killed flag.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        for p in &self.pool {
            let mut info = p.info.lock();
            if info.pid == pid && info.state != ProcState::Unused {
                p.kill();
                if info.state == ProcState::Sleeping {
                    info.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Wake all processes sleeping on the given channel.
    /// Must be called without holding any proc's info lock.
    pub fn wakeup(&self, target: &WaitChannel) {
        let cur = myproc();
        for p in &self.pool {
            if ptr::eq(p, cur) {
                continue;
            }
            let mut info = p.info.lock();
            if info.state == ProcState::Sleeping && info.chan == target as *const WaitChannel {
                info.state = ProcState::Runnable;
            }
        }
    }

    /// Grow or shrink the current process's user memory by n bytes;
    /// returns the old size.
    pub fn grow_current(&self, n: i32) -> Result<usize, ()> {
        let p = myproc();
        // SAFETY: p is the current process.
        let data = unsafe { &mut *(*p).data_raw() };
        let old = data.sz;
        if n > 0 {
            data.sz = unsafe { vm::allocuvm(data.pgdir, old, old + n as usize) }?;
        } else if n < 0 {
            let new = old as isize + n as isize;
            if new < 0 {
                return Err(());
            }
            data.sz = unsafe { vm::deallocuvm(data.pgdir, old, new as usize) };
        }
        unsafe { vm::switchuvm(&*p) };
        Ok(old)
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_current(&self) {
        let p = myproc();
        if p.is_null() {
            return;
        }
        // SAFETY: p is the current process.
        let mut guard = unsafe { (*p).info.lock() };
        guard.state = ProcState::Runnable;
        unsafe { sched(&mut guard, p) };
    }

    /// Per-CPU scheduler: repeatedly pick a runnable process, switch to
    /// it, and regain control when it yields back.
    pub unsafe fn scheduler(&self) -> ! {
        let cpu = kernel().current_cpu_raw();
        // SAFETY: cpu points at this CPU's record; interrupts are off.
        unsafe { (*cpu).proc = ptr::null_mut() };

        loop {
            // Avoid deadlock by ensuring that devices can interrupt.
            unsafe { arch::intr_on() };

            for p in &self.pool {
                let mut info = p.info.lock();
                if info.state != ProcState::Runnable {
                    continue;
                }

                // Switch to the chosen process. It is the process's job to
                // release its lock and then reacquire it before jumping
                // back to us.
                info.state = ProcState::Running;
                // SAFETY: interrupts are off inside the lock; the proc's
                // page table and kernel stack are set up.
                unsafe {
                    (*cpu).proc = p as *const Proc as *mut Proc;
                    vm::switchuvm(p);
                    arch::swtch(
                        ptr::addr_of_mut!((*cpu).scheduler),
                        (*p.data_raw()).context,
                    );
                    vm::switchkvm();

                    // The process is done running for now.
                    (*cpu).proc = ptr::null_mut();
                }
                drop(info);
            }
        }
    }

    /// Print a process listing to the console. Runs when the user types
    /// ^P or calls the ps system call. No locks, so that a wedged machine
    /// can still be inspected.
    pub fn dump(&self) {
        println!();
        for p in &self.pool {
            // SAFETY: racy reads for debugging only.
            let info = unsafe { &*p.info.get_mut_raw() };
            if info.state == ProcState::Unused {
                continue;
            }
            let data = unsafe { &*p.data_raw() };
            let len = data
                .name
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(data.name.len());
            println!(
                "{} {} {} {}",
                info.pid,
                info.state.as_str(),
                data.uid,
                core::str::from_utf8(&data.name[..len]).unwrap_or("???")
            );
        }
    }
}

/// Switch to the scheduler. Must hold only the proc's info lock and have
/// changed the proc's state. Saves and restores intena because it is a
/// property of this kernel thread, not this CPU.
pub(crate) unsafe fn sched(guard: &mut SpinlockGuard<'_, ProcInfo>, p: *mut Proc) {
    assert!(!arch::intr_get(), "sched interruptible");
    assert_ne!(guard.state, ProcState::Running, "sched running");

    let cpu = kernel().current_cpu_raw();
    // SAFETY: interrupts are off; cpu is ours.
    unsafe {
        assert_eq!((*cpu).noff, 1, "sched locks");
        let intena = (*cpu).intena;
        arch::swtch(
            ptr::addr_of_mut!((*(*p).data_raw()).context),
            (*cpu).scheduler,
        );
        // We may have moved CPUs; fetch the record again.
        (*kernel().current_cpu_raw()).intena = intena;
    }
}

/// A fork child's first scheduling by the scheduler switches here; the
/// return path continues into trapret and from there to user space.
pub extern "C" fn forkret() {
    use core::sync::atomic::AtomicBool;
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding our info lock from the scheduler.
    let p = myproc();
    // SAFETY: the scheduler acquired the lock before switching to us.
    unsafe { (*p).info.unlock() };

    if FIRST.swap(false, Ordering::AcqRel) {
        // File system initialisation must run in the context of a regular
        // process (it sleeps), so it cannot run from kmain.
        kernel().fs().init(ROOTDEV, &kernel().ide);
    }

    // Return to trapret.
}

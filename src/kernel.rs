//! The kernel singleton: one struct owning every subsystem, constructed
//! as a zero-initialised static and brought up in `kmain`.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use array_macro::array;

use crate::arch;
use crate::bio::Bcache;
use crate::console::Console;
use crate::file::{Devsw, FileTable};
use crate::fs::Fs;
use crate::ide::Ide;
use crate::kalloc::Kmem;
use crate::lock::{Sleepablelock, Spinlock};
use crate::mouse::Mouse;
use crate::net::Net;
use crate::param::{NCPU, NDEV};
use crate::proc::{Cpu, Procs};

pub struct Kernel {
    panicked: AtomicBool,

    /// Physical page allocator.
    pub kmem: Spinlock<Kmem>,

    /// The tick counter; sleepers on `sleep(n)` wait on its channel.
    pub ticks: Sleepablelock<u32>,

    procs: Procs,

    // The current CPU's record is mutated through a shared reference, with
    // interrupts disabled; hence the UnsafeCell.
    cpus: [UnsafeCell<Cpu>; NCPU],
    ncpu: AtomicUsize,

    pub console: Console,
    printer: Spinlock<Printer>,

    /// Map from major device number to device read/write functions.
    pub devsw: Spinlock<[Devsw; NDEV]>,

    /// The disk block cache.
    pub bcache: Bcache,

    /// The IDE block driver.
    pub ide: Ide,

    pub ftable: FileTable,

    fs: Fs,

    /// The network stack, including the E1000 driver state.
    pub net: Net,

    pub mouse: Mouse,
}

// SAFETY: the UnsafeCell'd cpus are only accessed by their own CPU with
// interrupts disabled; everything else guards itself.
unsafe impl Sync for Kernel {}

static KERNEL: Kernel = Kernel::zero();

/// The kernel. Valid from the first line of kmain; the static is
/// const-constructed, so even early boot code may take references.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            kmem: Spinlock::new("kmem", Kmem::new()),
            ticks: Sleepablelock::new("time", 0),
            procs: Procs::new(),
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            ncpu: AtomicUsize::new(1),
            console: Console::new(),
            printer: Spinlock::new("println", Printer::new()),
            devsw: Spinlock::new("devsw", [Devsw::none(); NDEV]),
            bcache: Bcache::new(),
            ide: Ide::new(),
            ftable: FileTable::new(),
            fs: Fs::new(),
            net: Net::new(),
            mouse: Mouse::new(),
        }
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn fs(&self) -> &Fs {
        &self.fs
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// This CPU's record. The returned address is stable only while
    /// interrupts are disabled: the scheduler can move the thread to
    /// another CPU on a timer interrupt.
    pub fn current_cpu_raw(&self) -> *mut Cpu {
        self.cpus[arch::cpu_id()].get()
    }

    pub fn cpus_slice(&self) -> &[UnsafeCell<Cpu>; NCPU] {
        &self.cpus
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu.load(Ordering::Acquire)
    }

    pub fn set_ncpu(&self, n: usize) {
        self.ncpu.store(n, Ordering::Release);
    }

    /// Record a discovered CPU's APIC id. Boot only, before other CPUs run.
    pub fn set_cpu_apicid(&self, index: usize, apicid: u8) {
        // SAFETY: single-threaded boot.
        unsafe { (*self.cpus[index].get()).apicid = apicid };
    }

    /// Print the formatted string through the console printer. After a
    /// panic the lock is bypassed so the dying CPU can still report.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // SAFETY: all other CPUs spin once panicked is set.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }
}

pub struct Printer;

impl Printer {
    pub const fn new() -> Self {
        Self
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            kernel().console.putc_spin(c);
        }
        Ok(())
    }
}

/// print! prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! prints to the console, with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Invariant violations land here; freeze all CPUs and report.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("{}", info);
    loop {
        core::hint::spin_loop();
    }
}

/// C entry point, reached from the boot stub with paging on and a fresh
/// stack. Brings up every subsystem in dependency order, creates the
/// first user process, and becomes this CPU's scheduler.
#[cfg(all(target_arch = "x86", not(test)))]
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    use crate::arch::x86::{ioapic, lapic, mp, picirq, seg, timer, uart};
    use crate::arch::{p2v, pgroundup};
    use crate::{println, vm};

    extern "C" {
        // First address after the kernel, from the linker script.
        static end: [u8; 0];
    }

    let kernel = kernel();

    unsafe {
        // Phase 1: only the boot 4 MiB mapping exists yet.
        let first = pgroundup(end.as_ptr() as usize);
        kernel.kmem.lock().free_range(first, p2v(4 * 1024 * 1024));

        // Kernel page table; switch off the boot mapping.
        vm::kvmalloc();

        // Interrupt plumbing.
        mp::init();
        lapic::init();
        seg::seginit();
        picirq::init();
        if lapic::present() {
            ioapic::init();
        } else {
            timer::init();
        }

        // Console early, so panics are visible.
        kernel.console.init();
        uart::init();

        println!();
        println!("ox6 kernel is booting");
        println!();

        seg::trap_vector_init();

        // The rest of physical memory.
        kernel
            .kmem
            .lock()
            .free_range(p2v(4 * 1024 * 1024), p2v(crate::arch::PHYSTOP));

        // Devices.
        kernel.ide.init();
        kernel.mouse.init();
        kernel.net.init();

        seg::load_idt();

        // First user process, then run it.
        kernel.procs().user_proc_init();
        kernel.procs().scheduler()
    }
}

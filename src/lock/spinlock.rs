//! Spin locks.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::arch;

/// Mutual exclusion lock that busy-waits.
pub struct RawSpinlock {
    /// Name of the lock, for debugging.
    name: &'static str,

    /// The owner's CPU token when held, null otherwise.
    locked: AtomicPtr<u8>,
}

/// Locks that busy-wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock, spinning until it is free.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release`, so stores made inside one critical section are visible
    /// to loads in the next.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock against our own handler.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                arch::lock_token(),
                Ordering::Acquire,
                // Failure does not enter the critical section, so Relaxed
                // is enough.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { pop_off() };
    }

    /// Whether the executing CPU holds the lock.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == arch::lock_token()
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

/// push_off/pop_off are like intr_off/intr_on except that they are
/// matched: it takes two pop_offs to undo two push_offs. If interrupts
/// were initially off, push_off then pop_off leaves them off.
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn push_off() {
    use crate::kernel::kernel;

    let old = arch::intr_get();
    unsafe { arch::intr_off() };

    let cpu = kernel().current_cpu_raw();
    // SAFETY: interrupts are off, so this CPU's record is ours.
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).intena = old;
        }
        (*cpu).noff += 1;
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn pop_off() {
    use crate::kernel::kernel;

    assert!(!arch::intr_get(), "pop_off - interruptible");
    let cpu = kernel().current_cpu_raw();
    // SAFETY: interrupts are off, so this CPU's record is ours.
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).intena {
            arch::intr_on();
        }
    }
}

// On the host there are no interrupts to mask.
#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn push_off() {}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn pop_off() {}

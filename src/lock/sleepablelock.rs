//! Sleepable locks: spinlocks with an attached wait channel.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::{RawLock, RawSpinlock, Waitable};
use crate::proc::WaitChannel;

pub struct Sleepablelock<T> {
    lock: RawSpinlock,

    /// Sleepers waiting for the condition guarded by this lock.
    waitchannel: WaitChannel,

    data: UnsafeCell<T>,
}

// SAFETY: the lock serialises access to the data.
unsafe impl<T: Send> Sync for Sleepablelock<T> {}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    _marker: PhantomData<*const ()>,
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        self.lock.acquire();
        SleepablelockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a raw pointer to the inner data without locking. The caller
    /// must ensure that the access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Releases the lock and sleeps on the lock's wait channel; the lock
    /// is re-acquired before returning.
    pub fn sleep(&mut self) {
        let chan = &self.lock.waitchannel as *const WaitChannel;
        // SAFETY: chan outlives the guard.
        unsafe { (*chan).sleep(self) };
    }

    /// Wakes all sleepers on the lock's wait channel.
    pub fn wakeup(&self) {
        self.lock.waitchannel.wakeup();
    }

    /// Temporarily releases the lock while running `f`, then re-acquires.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<T> Waitable for SleepablelockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepablelockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and the guard is borrowed mutably.
        unsafe { &mut *self.lock.data.get() }
    }
}

//! Sleeping locks: long-term locks that suspend the waiting process.

use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, Sleepablelock};
use crate::proc::current_pid;

/// Long-term lock for processes. The inner value is the holder's pid, or
/// -1 when the lock is free.
pub struct RawSleeplock {
    locked: Sleepablelock<i32>,

    /// Name of the lock, for debugging.
    name: &'static str,
}

/// Locks that sleep instead of busy-waiting.
pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: Sleepablelock::new("sleep lock", -1),
            name,
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = current_pid();
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        assert_eq!(*guard, current_pid(), "release {}", self.name);
        *guard = -1;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        let guard = self.locked.lock();
        *guard == current_pid()
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleeplock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

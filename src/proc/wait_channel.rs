use core::ptr;

use super::{myproc, ProcState};
use crate::kernel::kernel;
use crate::lock::Waitable;

/// An opaque token identifying a group of sleepers waiting for the same
/// event. Must not be zero-sized: distinct channels need distinct
/// addresses, or wakeups would spuriously wake unrelated sleepers.
pub struct WaitChannel {
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically releases the guarded lock and sleeps on this channel;
    /// re-acquires the lock when awakened.
    ///
    /// The process inserts itself into the wait set (under its own proc
    /// lock) *before* releasing `lk`; a wakeup issued under `lk` after the
    /// release is therefore guaranteed to be observed.
    pub fn sleep<W: Waitable>(&self, lk: &mut W) {
        let p = myproc();
        assert!(!p.is_null(), "sleep without a process");

        // Must acquire the proc lock in order to change state and then
        // call sched. Once it is held, wakeups cannot be lost: wakeup
        // takes the same lock. So it is safe to release lk here.
        // SAFETY: p is the current process and outlives this call.
        let mut guard = unsafe { (*p).info.lock() };
        // SAFETY: paired with raw_acquire below; the guarded data is not
        // touched while the lock is released.
        unsafe { lk.raw_release() };

        guard.chan = self as *const WaitChannel;
        guard.state = ProcState::Sleeping;

        // SAFETY: the proc lock is held and the state has been changed.
        unsafe { super::sched(&mut guard, p) };

        // Tidy up.
        guard.chan = ptr::null();
        drop(guard);

        // SAFETY: paired with raw_release above.
        unsafe { lk.raw_acquire() };
    }

    /// Wakes all processes sleeping on this channel.
    /// Must be called without holding any proc lock.
    pub fn wakeup(&self) {
        kernel().procs().wakeup(self);
    }
}

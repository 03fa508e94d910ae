//! Stub machine layer for hosted builds.
//!
//! Interrupts do not exist on the host, so the interrupt operations are
//! no-ops and `intr_get` reports "off". Spinlock ownership tokens must
//! still be distinct between threads for the cargo test harness, which
//! runs tests concurrently.

use arrayvec::ArrayVec;

use crate::arch::{Context, KmapEntry};

/// No kernel ranges to map on the host.
pub fn kmap() -> ArrayVec<KmapEntry, 4> {
    ArrayVec::new()
}

pub unsafe fn intr_on() {}

pub unsafe fn intr_off() {}

pub fn intr_get() -> bool {
    false
}

pub fn cpu_id() -> usize {
    0
}

/// Opaque token identifying the executing "CPU" for lock ownership.
#[cfg(test)]
pub fn lock_token() -> *mut u8 {
    std::thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|t| t as *const u8 as *mut u8)
}

#[cfg(not(test))]
pub fn lock_token() -> *mut u8 {
    static TOKEN: u8 = 0;
    core::ptr::addr_of!(TOKEN) as *mut u8
}

pub unsafe fn swtch(_old: *mut *mut Context, _new: *mut Context) {}

pub unsafe extern "C" fn trapret() {}

pub unsafe fn lcr3(_pa: usize) {}

pub unsafe fn switch_user_segment(_esp0: usize) {}

pub fn halt() {}

pub unsafe fn inb(_port: u16) -> u8 {
    0
}

pub unsafe fn outb(_port: u16, _data: u8) {}

pub unsafe fn inl(_port: u16) -> u32 {
    0
}

pub unsafe fn outl(_port: u16, _data: u32) {}

pub unsafe fn insl(_port: u16, _dst: *mut u32, _cnt: usize) {}

pub unsafe fn outsl(_port: u16, _src: *const u32, _cnt: usize) {}

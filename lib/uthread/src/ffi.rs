//! A C-ABI-compatible shim over the safe [`crate::scheduler`]/[`crate::sem`]
//! API: `0`/`-1` return conventions and raw pointers in place of `Result`
//! and references, for callers migrating from the C library this crate's
//! design descends from. Gated behind the `ffi` feature - the safe Rust API
//! is what the demos and tests in this workspace actually use.
//!
//! [`Error::InvalidArgument`] is only ever reachable through this module:
//! the safe API takes `&Semaphore`/`&TcbHandle` instead of raw pointers, so
//! "null handle" isn't a state it can express.

use std::any::Any;
use std::ffi::c_void;
use std::os::raw::c_int;

use crate::error::Error;
use crate::scheduler::{self, TcbHandle};
use crate::sem::Semaphore;

fn check_not_null(ptr: *mut c_void) -> Result<(), Error> {
    if ptr.is_null() {
        Err(Error::InvalidArgument)
    } else {
        Ok(())
    }
}

/// Bundles a C entry function pointer with its raw argument so a single
/// non-capturing Rust `fn` ([`call_ffi_entry`]) can forward to it. A plain
/// `fn(Box<dyn Any>)` can't close over the caller-supplied `entry` pointer,
/// so it travels as data inside the boxed argument instead.
struct FfiEntry {
    entry: extern "C" fn(*mut c_void),
    arg: usize,
}

fn call_ffi_entry(payload: Box<dyn Any>) {
    let FfiEntry { entry, arg } = *payload
        .downcast::<FfiEntry>()
        .expect("uthread ffi: entry payload type mismatch");
    entry(arg as *mut c_void);
}

/// Equivalent of [`crate::run`]. Returns `0` on success, `-1` if bootstrap
/// failed.
#[no_mangle]
pub extern "C" fn uthread_run(
    preempt_enabled: bool,
    entry: extern "C" fn(*mut c_void),
    arg: *mut c_void,
) -> c_int {
    let payload: Box<dyn Any> = Box::new(FfiEntry {
        entry,
        arg: arg as usize,
    });
    match scheduler::run(preempt_enabled, call_ffi_entry, payload) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Equivalent of [`crate::create`]. Returns `0` on success, `-1` if the new
/// thread's stack or context could not be allocated.
#[no_mangle]
pub extern "C" fn uthread_create(entry: extern "C" fn(*mut c_void), arg: *mut c_void) -> c_int {
    let payload: Box<dyn Any> = Box::new(FfiEntry {
        entry,
        arg: arg as usize,
    });
    match scheduler::create(call_ffi_entry, payload) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Equivalent of [`crate::yield_now`].
#[no_mangle]
pub extern "C" fn uthread_yield() {
    scheduler::yield_now();
}

/// Equivalent of [`crate::exit`]. Never returns.
#[no_mangle]
pub extern "C" fn uthread_exit() -> ! {
    scheduler::exit()
}

/// Equivalent of [`crate::current`]. The returned pointer is a leaked
/// snapshot handle: there is no `uthread_tcb_release` in the original C
/// surface this mirrors, so (as in the source library, where a `Thread *`
/// was simply a long-lived pointer into process memory) callers are not
/// expected to free it. Pass it only to [`uthread_unblock`].
#[no_mangle]
pub extern "C" fn uthread_current() -> *mut c_void {
    Box::into_raw(Box::new(scheduler::current())) as *mut c_void
}

/// Equivalent of [`crate::block`].
#[no_mangle]
pub extern "C" fn uthread_block() {
    scheduler::block();
}

/// Equivalent of [`crate::unblock`]. `tcb` must have been returned by
/// [`uthread_current`]; a null pointer is a silent no-op, matching
/// [`crate::unblock`]'s own no-op-on-already-not-`Blocked` contract rather
/// than reporting [`Error::InvalidArgument`] (the external interface table
/// gives `unblock` no error return).
#[no_mangle]
pub extern "C" fn uthread_unblock(tcb: *mut c_void) {
    if check_not_null(tcb).is_err() {
        return;
    }
    // SAFETY: `tcb` was produced by `uthread_current` and not yet freed.
    let handle = unsafe { &*(tcb as *const TcbHandle) };
    scheduler::unblock(handle);
}

/// Equivalent of [`Semaphore::new`], boxed and handed out as an opaque
/// pointer. Never returns null - the external-interface table's "or null"
/// case describes an allocation failure this crate's `Semaphore` can't hit
/// (`Box::new` aborts the process on allocation failure, same as the rest of
/// this crate's safe API).
#[no_mangle]
pub extern "C" fn sem_create(count: u64) -> *mut c_void {
    Box::into_raw(Box::new(Semaphore::new(count))) as *mut c_void
}

/// Equivalent of [`Semaphore::try_destroy`]. Returns `0` on success, `-1` if
/// `sem` is null or still has blocked waiters (in which case the pointer is
/// *not* freed, matching [`Semaphore::try_destroy`]'s own behavior of
/// forgetting rather than dropping a non-quiescent semaphore).
#[no_mangle]
pub extern "C" fn sem_destroy(sem: *mut c_void) -> c_int {
    if check_not_null(sem).is_err() {
        return -1;
    }
    // SAFETY: `sem` was produced by `sem_create` and not yet destroyed.
    let boxed = unsafe { Box::from_raw(sem as *mut Semaphore) };
    match boxed.try_destroy() {
        Ok(()) => 0,
        Err(_) => {
            // `try_destroy` already forgot `boxed`; the pointer is still
            // valid for a future retry once the waiters drain.
            -1
        }
    }
}

/// Equivalent of [`Semaphore::down`]. Returns `0`, or `-1` if `sem` is null.
#[no_mangle]
pub extern "C" fn sem_down(sem: *mut c_void) -> c_int {
    if check_not_null(sem).is_err() {
        return -1;
    }
    // SAFETY: `sem` was produced by `sem_create` and outlives this call.
    let sem = unsafe { &*(sem as *const Semaphore) };
    sem.down();
    0
}

/// Equivalent of [`Semaphore::up`]. Returns `0`, or `-1` if `sem` is null.
#[no_mangle]
pub extern "C" fn sem_up(sem: *mut c_void) -> c_int {
    if check_not_null(sem).is_err() {
        return -1;
    }
    // SAFETY: `sem` was produced by `sem_create` and outlives this call.
    let sem = unsafe { &*(sem as *const Semaphore) };
    sem.up();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    static RAN: AtomicBool = AtomicBool::new(false);

    extern "C" fn entry(_arg: *mut c_void) {
        RAN.store(true, Ordering::SeqCst);
    }

    #[test]
    fn run_reports_success_and_invokes_entry() {
        RAN.store(false, Ordering::SeqCst);
        assert_eq!(uthread_run(false, entry, std::ptr::null_mut()), 0);
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn sem_round_trip_via_raw_pointers() {
        extern "C" fn use_sem(_arg: *mut c_void) {
            let sem = sem_create(1);
            assert_eq!(sem_down(sem), 0);
            assert_eq!(sem_up(sem), 0);
            assert_eq!(sem_destroy(sem), 0);
            assert_eq!(sem_destroy(std::ptr::null_mut()), -1);
        }
        assert_eq!(uthread_run(false, use_sem, std::ptr::null_mut()), 0);
    }

    #[test]
    fn unblock_tolerates_null() {
        uthread_unblock(std::ptr::null_mut());
    }
}

//! Stack allocation and machine-context switching.
//!
//! This is the "external collaborator" layer the rest of `uthread` is built
//! on: allocate a stack, bind a context to run a given entry function on
//! that stack, and switch between two contexts. Nothing here knows about
//! scheduling, readiness, or semaphores - it is a thin, safe-ish wrapper
//! around `mmap`-backed stacks and POSIX `ucontext_t` context switching.
//!
//! Analogous to [`MmapBox`](https://docs.rs/shadow)-style wrappers: the
//! unsafe raw-pointer plumbing is confined to this one small crate and
//! released deterministically via `Drop`.

use std::ffi::c_void;
use std::mem::MaybeUninit;

use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

/// Errors this crate can report. Kept tiny and specific rather than reusing
/// `uthread`'s broader `Error` enum, since this crate has no dependency on
/// (and shouldn't gain one on) the scheduler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtxError {
    /// `mmap`/`mprotect` failed, typically because the process is out of
    /// address space or hit `RLIMIT_AS`.
    AllocationFailed,
    /// The platform rejected the prepared context (`getcontext` failed).
    ContextInitFailed,
}

impl std::fmt::Display for CtxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtxError::AllocationFailed => write!(f, "stack allocation failed"),
            CtxError::ContextInitFailed => write!(f, "context initialization failed"),
        }
    }
}

impl std::error::Error for CtxError {}

/// Default stack size for a new user-level thread: 256 KiB, plus one guard
/// page. Matches the ballpark most small cooperative-threading libraries
/// use; large enough for several stack frames of ordinary application code,
/// small enough that thousands of threads don't exhaust address space.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// An owned, `mmap`-backed stack with a `PROT_NONE` guard page below it (the
/// stack grows down on every architecture this crate targets).
///
/// Overflowing the stack faults against the guard page instead of silently
/// corrupting whatever mapping happens to sit below it.
pub struct Stack {
    /// Base address of the full mapping, including the guard page.
    mapping: *mut c_void,
    /// Size of the full mapping (guard page + usable stack), in bytes.
    mapping_len: usize,
    /// Size of the usable (non-guard) region, in bytes.
    usable_len: usize,
}

// A `Stack` owns a private anonymous mapping; nothing else can reach it, and
// nothing about it is thread-affine. It is, however, never shared - see the
// crate-level safety note in `uthread`'s scheduler about why these types
// don't implement `Send`/`Sync` despite being technically movable.

impl Stack {
    /// Allocate a new stack of at least `size` usable bytes (rounded up to a
    /// whole number of pages), preceded by one `PROT_NONE` guard page.
    pub fn new(size: usize) -> Result<Self, CtxError> {
        let page_size = rustix::param::page_size();
        let usable_len = size.next_multiple_of(page_size).max(page_size);
        let mapping_len = usable_len + page_size;

        let mapping = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                mapping_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|_| CtxError::AllocationFailed)?;

        // The guard page is the first page of the mapping: since the stack
        // grows down from the top of the mapping, underflowing the usable
        // region runs into this page first.
        unsafe {
            rustix::mm::mprotect(mapping, page_size, MprotectFlags::empty())
        }
        .map_err(|_| {
            // best-effort cleanup; we're already on an error path
            let _ = unsafe { rustix::mm::munmap(mapping, mapping_len) };
            CtxError::AllocationFailed
        })?;

        Ok(Self {
            mapping,
            mapping_len,
            usable_len,
        })
    }

    /// Pointer to the lowest usable (non-guard) byte of the stack.
    fn usable_base(&self) -> *mut c_void {
        let guard_len = self.mapping_len - self.usable_len;
        unsafe { self.mapping.add(guard_len) }
    }

    /// Number of usable bytes.
    pub fn len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Err(err) = unsafe { rustix::mm::munmap(self.mapping, self.mapping_len) } {
            // Dropping a stack is infallible in the public API; a failed
            // munmap here means the address space bookkeeping is already
            // broken, so log loudly rather than panicking out of a `Drop`.
            log::error!("munmap of uthread stack failed: {err}");
        }
    }
}

/// An entry function bound to a context: called with the single opaque
/// `arg` pointer supplied to [`Context::new`] once the context is first
/// switched into.
pub type EntryFn = extern "C" fn(*mut c_void);

/// A switchable machine context: a saved register set, stack pointer, and
/// resume address, bound to a [`Stack`] and an [`EntryFn`].
///
/// Built on POSIX `ucontext_t`. The first [`switch`] into a freshly
/// constructed `Context` transfers control to `entry(arg)` running on
/// `stack`; it is the caller's responsibility to ensure `entry` never
/// returns (this library's scheduler wraps every entry function so that
/// returning from it calls `exit()`, which itself never returns).
pub struct Context {
    // Boxed so the context has a stable address: `makecontext`/`swapcontext`
    // both take raw pointers into this structure, and it must not move
    // after `getcontext`/`makecontext` have recorded pointers derived from it.
    ucontext: Box<MaybeUninit<libc::ucontext_t>>,
    // Kept alive for as long as the context might still be switched into.
    _stack: Option<Stack>,
}

/// The thunk passed to `makecontext` can only take plain integer arguments
/// (it is a C variadic call), so a 64-bit pointer is split into two 32-bit
/// halves and reassembled here before forwarding to the real entry point.
extern "C" fn trampoline(arg_hi: u32, arg_lo: u32) {
    let arg = (((arg_hi as u64) << 32) | (arg_lo as u64)) as *mut TrampolineArgs;
    // SAFETY: `arg` was produced by `Box::into_raw` in `Context::new` and is
    // passed through `makecontext` unmodified.
    let boxed = unsafe { Box::from_raw(arg) };
    let TrampolineArgs { entry, arg } = *boxed;
    entry(arg);
    // `entry` must never return in this library; see the `Context` docs.
    unreachable!("uthread entry function returned instead of exiting");
}

struct TrampolineArgs {
    entry: EntryFn,
    arg: *mut c_void,
}

impl Context {
    /// Create an unbound context representing "whatever is currently
    /// executing". Used once, for the idle thread that owns the pre-existing
    /// OS stack: its [`Context`] is populated lazily by the first
    /// [`switch`](Self::switch) call into it, rather than by `makecontext`.
    pub fn for_current_execution() -> Self {
        Self {
            ucontext: Box::new(MaybeUninit::uninit()),
            _stack: None,
        }
    }

    /// Initialize a new context that, when first switched into, calls
    /// `entry(arg)` running on `stack`.
    pub fn new(stack: Stack, entry: EntryFn, arg: *mut c_void) -> Result<Self, CtxError> {
        let mut ucontext = Box::new(MaybeUninit::<libc::ucontext_t>::uninit());

        // getcontext fills in a valid baseline (e.g. the current signal
        // mask) that makecontext then customizes.
        let rc = unsafe { libc::getcontext(ucontext.as_mut_ptr()) };
        if rc != 0 {
            return Err(CtxError::ContextInitFailed);
        }

        // SAFETY: getcontext just initialized this value.
        let uc = unsafe { ucontext.assume_init_mut() };
        uc.uc_stack.ss_sp = stack.usable_base();
        uc.uc_stack.ss_size = stack.len();
        // No context to return to: the trampoline never returns (see its
        // doc comment), so there's nothing meaningful to link to, and
        // linking to the zeroed default would resume garbage if we were
        // ever wrong about that.
        uc.uc_link = std::ptr::null_mut();

        let trampoline_args = Box::new(TrampolineArgs { entry, arg });
        let raw = Box::into_raw(trampoline_args) as u64;
        let arg_hi = (raw >> 32) as u32;
        let arg_lo = (raw & 0xffff_ffff) as u32;

        // SAFETY: `uc` was just validly initialized by `getcontext` and its
        // stack fields set above; `trampoline` matches the two-`u32`-args
        // shape `makecontext` is being told to expect via `argc == 2`.
        unsafe {
            let entry_fn: extern "C" fn() = std::mem::transmute(trampoline as extern "C" fn(u32, u32));
            libc::makecontext(ucontext.as_mut_ptr(), entry_fn, 2, arg_hi, arg_lo);
        }

        Ok(Self {
            ucontext,
            _stack: Some(stack),
        })
    }

    /// Switch execution from `from` to `to`. Saves the calling thread's
    /// register state into `from` and resumes `to` at its last-saved (or,
    /// for a freshly [`new`](Self::new)-ed context, initial) point.
    ///
    /// Returns when some later call to `switch` targets `from` again.
    pub fn switch(from: &mut Context, to: &Context) {
        // SAFETY: both contexts are heap-allocated with stable addresses
        // and outlive this call; `to` was either produced by `new` (and is
        // therefore a valid target for `swapcontext`) or had its contents
        // populated by a previous `switch` that targeted it as `from`.
        unsafe {
            libc::swapcontext(from.ucontext.as_mut_ptr(), to.ucontext.as_ptr() as *const _);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    static RAN: AtomicBool = AtomicBool::new(false);

    thread_local! {
        // Raw pointer back to the parent's ucontext_t, so the trampoline can
        // swap back to the test thread instead of looping forever. Only
        // ever read/written from the single OS thread running this test.
        static RETURN_TO: Cell<*mut libc::ucontext_t> = const { Cell::new(std::ptr::null_mut()) };
    }

    extern "C" fn set_flag_and_return(_arg: *mut c_void) {
        RAN.store(true, Ordering::SeqCst);
        let parent = RETURN_TO.with(|p| p.get());
        assert!(!parent.is_null());
        let mut here = MaybeUninit::<libc::ucontext_t>::uninit();
        // SAFETY: `parent` points at a live ucontext_t owned by the caller's
        // stack frame for the duration of this call.
        unsafe {
            libc::swapcontext(here.as_mut_ptr(), parent as *const _);
        }
        unreachable!("parent context should never switch back into a finished test thread");
    }

    #[test]
    fn stack_allocation_rounds_up_to_page_size() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.len() >= rustix::param::page_size());
    }

    #[test]
    fn context_switch_runs_entry_and_returns() {
        let stack = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        let mut parent = Context::for_current_execution();
        let child = Context::new(stack, set_flag_and_return, std::ptr::null_mut()).unwrap();

        RETURN_TO.with(|p| p.set(parent.ucontext.as_mut_ptr()));
        Context::switch(&mut parent, &child);

        assert!(RAN.load(Ordering::SeqCst));
    }
}

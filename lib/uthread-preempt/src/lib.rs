//! Virtual-time preemption.
//!
//! A periodic `SIGVTALRM`, delivered only while the process is actually
//! burning CPU (not while blocked in the kernel), forces the scheduler to
//! yield even if the running thread never calls `yield_now` itself. The
//! scheduler wraps every mutation of its ready/zombie queues and `current`
//! cell with [`disable`]/[`enable`] so the handler can never fire in the
//! middle of one.
//!
//! The handler itself can't capture any state (it has to be a bare
//! `extern "C" fn`), so the forced-yield callback is registered once, up
//! front, via [`register`].

use std::ffi::c_int;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// The signal used for preemption. Chosen deliberately over `SIGALRM`:
/// `ITIMER_VIRTUAL`/`SIGVTALRM` only ticks while the process is scheduled on
/// a CPU, so a thread blocked elsewhere (or simply not running) never
/// accumulates spurious preemptions.
const PREEMPT_SIGNAL: c_int = libc::SIGVTALRM;

/// Preemption frequency: 100 Hz, i.e. one tick every 10 ms of process CPU
/// time.
const HZ: i64 = 100;

static FORCED_YIELD: OnceLock<fn()> = OnceLock::new();

/// How many nested [`disable`] calls are outstanding. The signal is only
/// actually unmasked once this returns to zero, so callers may nest
/// critical sections (directly, or by calling a function that itself
/// disables/enables) without prematurely re-enabling preemption.
static DISABLE_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Errors reported by [`start`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PreemptError {
    /// Installing the signal handler or arming the timer failed at the OS
    /// level.
    SetupFailed,
}

impl std::fmt::Display for PreemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreemptError::SetupFailed => write!(f, "failed to install preemption timer"),
        }
    }
}

impl std::error::Error for PreemptError {}

/// Register the function the preemption signal handler forces a call to.
/// Must be called exactly once, before [`start`], typically by
/// `Scheduler::run`. The registered function must itself be
/// async-signal-safe to the extent practical: it will run with
/// `PREEMPT_SIGNAL` blocked (signal handlers are implicitly non-reentrant
/// for their own signal) but nothing else about the process is paused.
pub fn register(forced_yield: fn()) {
    // Silently ignore a second registration from a second `run()` in the
    // same process; the callback is always the same scheduler entry point.
    let _ = FORCED_YIELD.set(forced_yield);
}

extern "C" fn handle_preempt_signal(signo: c_int) {
    debug_assert_eq!(signo, PREEMPT_SIGNAL);
    match FORCED_YIELD.get() {
        Some(f) => f(),
        None => {
            // Can only happen if a timer from a previous `start`/`stop`
            // cycle somehow outlived `stop`; there is nothing safe to do
            // inside a signal handler except return.
        }
    }
}

/// Start preemption if `enabled`; a no-op otherwise. Installs the signal
/// handler and arms a repeating `ITIMER_VIRTUAL` at [`HZ`] Hz.
pub fn start(enabled: bool) -> Result<(), PreemptError> {
    if !enabled {
        log::debug!("preemption disabled by caller; not arming timer");
        return Ok(());
    }

    let action = libc::sigaction {
        sa_sigaction: handle_preempt_signal as usize,
        // No SA_NODEFER: the kernel masks PREEMPT_SIGNAL for us while the
        // handler runs, so the handler can never be reentered by itself.
        sa_flags: 0,
        sa_mask: unsafe { std::mem::zeroed() },
        sa_restorer: None,
    };
    let rc = unsafe { libc::sigaction(PREEMPT_SIGNAL, &action, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(PreemptError::SetupFailed);
    }

    let interval_usec = 1_000_000 / HZ;
    let interval = libc::timeval {
        tv_sec: 0,
        tv_usec: interval_usec,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(PreemptError::SetupFailed);
    }

    log::debug!("preemption timer armed at {HZ} Hz");
    Ok(())
}

/// Disarm the timer and restore default handling of the preemption signal.
pub fn stop() {
    let zero = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let timer = libc::itimerval {
        it_interval: zero,
        it_value: zero,
    };
    unsafe {
        libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut());
    }

    unsafe {
        libc::signal(PREEMPT_SIGNAL, libc::SIG_DFL);
    }
    DISABLE_DEPTH.store(0, Ordering::SeqCst);
    log::debug!("preemption timer stopped");
}

/// Mask the preemption signal, preventing the handler from firing. Calls
/// nest: preemption is only actually re-enabled once the matching number of
/// [`enable`] calls have been made.
pub fn disable() {
    if DISABLE_DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
        block_signal();
    }
}

/// Unmask the preemption signal once the nesting depth returns to zero.
pub fn enable() {
    let prev = DISABLE_DEPTH.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "enable() called without a matching disable()");
    if prev == 1 {
        unblock_signal();
    }
}

/// An RAII guard returned by [`disable_scope`] that re-enables preemption
/// (respecting nesting) when dropped.
#[must_use = "preemption stays disabled until this guard is dropped"]
pub struct DisableGuard(());

impl Drop for DisableGuard {
    fn drop(&mut self) {
        enable();
    }
}

/// Lexically-scoped equivalent of calling [`disable`] and later [`enable`].
/// Prefer this inside the scheduler wherever the disabled region is a
/// single Rust scope; use the raw [`disable`]/[`enable`] pair when the
/// region must straddle a context switch (the guard can't be held across
/// one, since the "enable" logically belongs to whichever thread resumes).
pub fn disable_scope() -> DisableGuard {
    disable();
    DisableGuard(())
}

fn block_signal() {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PREEMPT_SIGNAL);
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

fn unblock_signal() {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PREEMPT_SIGNAL);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

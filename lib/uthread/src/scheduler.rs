//! The ready/zombie queue scheduler: thread control blocks, the state
//! machine described in the crate docs, and the top-level [`run`] loop.
//!
//! All of this lives behind a single [`std::thread::LocalKey`] rather than
//! process-wide `static mut`s: the scheduler is a value, constructed by
//! [`run`] and torn down before it returns, so two sequential (never
//! concurrent - there is only one OS thread) calls to `run` in the same
//! process never see leftover state from a previous run.
//!
//! Every function here that touches `ready_queue`, `zombie_queue`, or
//! `current` does so with preemption disabled, per the critical-section
//! discipline the rest of the crate relies on: `uthread_preempt::disable_scope()`
//! wherever the disabled region is a single Rust scope, and the raw
//! `disable()`/`enable()` pair in [`yield_now`] and [`exit`], where the
//! region straddles a context switch or an early return the guard can't
//! span.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use uthread_ctx::{Context, Stack, DEFAULT_STACK_SIZE};
use uthread_queue::Fifo;

use crate::error::Error;

/// Lifecycle state of a [`Tcb`]. See the module docs for the full state
/// machine diagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Enqueued on the ready queue, eligible for dispatch.
    Ready,
    /// Presently executing; there is at most one `Running` thread.
    Running,
    /// Suspended on some synchronization object's waiter queue, awaiting
    /// `unblock`.
    Blocked,
    /// Exited; enqueued on the zombie queue awaiting reclamation by `run`'s
    /// cleanup phase.
    Zombie,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A thread control block. Opaque to callers outside this crate: the public
/// surface is [`TcbHandle`], `Rc`-shared and accessed only through
/// [`current`], [`block`], and [`unblock`]. `id` is for diagnostics only and
/// never influences a scheduling decision.
pub struct Tcb {
    id: u64,
    state: State,
    context: Context,
}

impl std::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// A reference-counted handle to a [`Tcb`]. Deliberately not `Send`/`Sync`:
/// every `Tcb` belongs to exactly one OS thread's scheduler and is never
/// meant to cross a thread boundary. See [`current`], [`block`], and
/// [`unblock`].
pub type TcbHandle = Rc<RefCell<Tcb>>;

/// An entry function bound to a user-level thread. Runs with ordinary
/// ownership of a boxed, type-erased argument rather than a raw `*mut
/// c_void`, since the scheduler crate has no reason to give up Rust's type
/// system at this boundary (the `ffi` module does that conversion at *its*
/// boundary instead).
pub type EntryFn = fn(Box<dyn Any>);

struct EntryPayload {
    entry: EntryFn,
    arg: Box<dyn Any>,
}

/// Trampoline bound into every non-idle [`Context`]. `uthread-ctx` requires
/// its entry function to never return; this one never does; it always
/// forwards into [`exit`], which itself never returns.
extern "C" fn run_entry(arg: *mut c_void) {
    // SAFETY: `arg` was produced by `Box::into_raw` in `create` below and is
    // passed through `uthread_ctx::Context::new`/`makecontext` unmodified.
    let payload = unsafe { Box::from_raw(arg as *mut EntryPayload) };
    (payload.entry)(payload.arg);
    exit();
}

struct Scheduler {
    ready_queue: Fifo<TcbHandle>,
    zombie_queue: Fifo<TcbHandle>,
    current: TcbHandle,
}

std::thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

fn forced_yield() {
    // Invoked directly from the signal handler's call to the registered
    // callback (see `uthread_preempt::register`). No logging or allocation
    // happens between here and the context switch inside `yield_now` other
    // than what `yield_now` itself already does with preemption masked.
    yield_now();
}

/// Returns a handle to the thread whose context is presently executing.
/// Never fails; panics if called outside [`run`].
///
/// Disables preemption for the duration of the lookup like every other
/// access to the scheduler's `RefCell`: the signal handler calls
/// `yield_now`, which takes its own mutable borrow, so even a read-only
/// access left unguarded here could have the handler fire mid-borrow and
/// panic on a `RefCell` double-borrow instead of the clean "never fails"
/// this function promises.
pub fn current() -> TcbHandle {
    let _guard = uthread_preempt::disable_scope();
    SCHEDULER.with(|cell| {
        let sched = cell.borrow();
        let sched = sched
            .as_ref()
            .expect("uthread::current() called outside Scheduler::run()");
        Rc::clone(&sched.current)
    })
}

/// Create a new user-level thread running `entry(arg)` and enqueue it
/// `Ready` at the tail of the ready queue. Fails with
/// [`Error::ResourceExhausted`] if the stack or context cannot be allocated.
pub fn create(entry: EntryFn, arg: Box<dyn Any>) -> Result<(), Error> {
    let stack = Stack::new(DEFAULT_STACK_SIZE)?;
    let payload = Box::new(EntryPayload { entry, arg });
    let raw_arg = Box::into_raw(payload) as *mut c_void;
    let context = match Context::new(stack, run_entry, raw_arg) {
        Ok(context) => context,
        Err(err) => {
            // the stack passed to `Context::new` is consumed on success and
            // dropped on failure along with it; the boxed payload, however,
            // never made it into a context and must be reclaimed here.
            // SAFETY: `raw_arg` still points at the box we just leaked above
            // and `Context::new` failed before taking ownership of it.
            drop(unsafe { Box::from_raw(raw_arg as *mut EntryPayload) });
            return Err(err.into());
        }
    };

    let id = next_id();
    let tcb = Rc::new(RefCell::new(Tcb {
        id,
        state: State::Ready,
        context,
    }));
    log::trace!("create: tcb {id} ready");

    let _guard = uthread_preempt::disable_scope();
    SCHEDULER.with(|cell| {
        let mut sched = cell.borrow_mut();
        let sched = sched
            .as_mut()
            .expect("uthread::create() called outside Scheduler::run()");
        sched.ready_queue.enqueue(tcb);
    });
    Ok(())
}

/// Atomically transition the running thread out and the next ready thread
/// in, then perform the raw context switch. If the ready queue is empty,
/// returns immediately without switching - the current thread keeps running.
///
/// This is also the body the preemption signal handler forces a call to.
/// `uthread-queue`'s `Fifo` allocates on `enqueue`, and the `log::trace!`
/// call below can too, so strictly this is not async-signal-safe in the
/// POSIX sense; it is, however, never *re-entrantly* unsafe, because the
/// preemption signal stays masked for the entire disabled region (both by
/// the OS while the handler itself runs, and by our own `disable()`/
/// `enable()` bracketing when reached the ordinary way) - this crate
/// accepts the same limitation the source library's malloc-based queue had,
/// rather than requiring a pre-sized or intrusive-list queue no caller of
/// this crate has asked for.
pub fn yield_now() {
    uthread_preempt::disable();

    let switch = SCHEDULER.with(|cell| {
        let mut sched = cell.borrow_mut();
        let sched = sched
            .as_mut()
            .expect("uthread::yield_now() called outside Scheduler::run()");

        let next = sched.ready_queue.dequeue()?;
        let prev = Rc::clone(&sched.current);

        // Tie-break: a thread yielded out of `Blocked` or `Zombie` was
        // already routed to its correct queue by whoever changed its
        // state; only a `Running` thread goes back on the ready queue.
        if prev.borrow().state == State::Running {
            prev.borrow_mut().state = State::Ready;
            sched.ready_queue.enqueue(Rc::clone(&prev));
        }

        next.borrow_mut().state = State::Running;
        sched.current = Rc::clone(&next);

        // Raw pointers into the two TCBs' contexts, taken while the
        // scheduler's RefCell borrow (and preemption) are still held, so
        // nothing can observe or mutate either Tcb between here and the
        // switch. The borrows used to form these pointers end at the end of
        // their statements; the pointers stay valid because both TCBs are
        // `Rc`-heap-allocated and kept alive by `prev`/`next` below.
        let prev_ctx = &mut prev.borrow_mut().context as *mut Context;
        let next_ctx = &next.borrow().context as *const Context;
        Some((prev, next, prev_ctx, next_ctx))
    });

    let Some((prev, next, prev_ctx, next_ctx)) = switch else {
        uthread_preempt::enable();
        return;
    };

    log::trace!(
        "yield_now: tcb {} -> tcb {}",
        prev.borrow().id,
        next.borrow().id
    );

    // Re-enable strictly before the switch, as the critical-section
    // discipline requires: the thread that resumes here later does so with
    // preemption already unmasked, exactly as if it had called `yield_now`
    // itself.
    uthread_preempt::enable();

    // SAFETY: `prev_ctx`/`next_ctx` point into live `Tcb`s kept alive by
    // `prev`/`next` for the duration of this call.
    unsafe {
        Context::switch(&mut *prev_ctx, &*next_ctx);
    }

    drop(prev);
    drop(next);
}

/// Move the running thread to `Zombie` and enqueue it for reclamation, then
/// yield. Never returns - the cleanup phase in [`run`] reclaims the TCB and
/// its stack after this thread is switched out for the last time.
///
/// Calling this from the idle thread before [`run`]'s loop terminates is
/// undefined; nothing in this crate does so.
pub fn exit() -> ! {
    uthread_preempt::disable();
    SCHEDULER.with(|cell| {
        let mut sched = cell.borrow_mut();
        let sched = sched
            .as_mut()
            .expect("uthread::exit() called outside Scheduler::run()");
        let current = Rc::clone(&sched.current);
        current.borrow_mut().state = State::Zombie;
        log::trace!("exit: tcb {} -> zombie", current.borrow().id);
        sched.zombie_queue.enqueue(current);
    });
    uthread_preempt::enable();
    yield_now();
    unreachable!("uthread::exit: a zombie thread was switched back into")
}

/// Block the running thread. Idempotent if already `Blocked`. The caller
/// (the semaphore module) must already have enqueued `current()` onto its
/// own waiter queue before calling this - there is no back-pointer from a
/// `Tcb` to the queue it's waiting on, so an un-registered blocked thread
/// would never be woken.
pub fn block() {
    let already_blocked = {
        let _guard = uthread_preempt::disable_scope();
        let already_blocked = SCHEDULER.with(|cell| {
            let sched = cell.borrow();
            let sched = sched
                .as_ref()
                .expect("uthread::block() called outside Scheduler::run()");
            sched.current.borrow().state == State::Blocked
        });
        if !already_blocked {
            SCHEDULER.with(|cell| {
                let sched = cell.borrow();
                let sched = sched
                    .as_ref()
                    .expect("uthread::block() called outside Scheduler::run()");
                let current = &sched.current;
                current.borrow_mut().state = State::Blocked;
                log::trace!("block: tcb {}", current.borrow().id);
            });
        }
        already_blocked
    };
    if already_blocked {
        return;
    }
    yield_now();
}

/// Move `tcb` from `Blocked` to `Ready` and enqueue it at the tail of the
/// ready queue. A no-op if `tcb` is not currently `Blocked`.
pub fn unblock(tcb: &TcbHandle) {
    let _guard = uthread_preempt::disable_scope();
    if tcb.borrow().state == State::Blocked {
        tcb.borrow_mut().state = State::Ready;
        log::trace!("unblock: tcb {}", tcb.borrow().id);
        SCHEDULER.with(|cell| {
            let mut sched = cell.borrow_mut();
            let sched = sched
                .as_mut()
                .expect("uthread::unblock() called outside Scheduler::run()");
            sched.ready_queue.enqueue(Rc::clone(tcb));
        });
    }
}

/// Bootstrap the scheduler, run `entry(arg)` and everything it (transitively,
/// via further [`create`] calls) spawns to completion, then tear everything
/// down.
///
/// Starts preemption if `preempt_enabled`, creates the idle TCB (which
/// adopts the calling context rather than a fresh stack) and the entry
/// thread, then repeatedly [`yield_now`]s while the ready queue is
/// non-empty. Once the last worker has exited, drains the zombie queue
/// (reclaiming every TCB's stack and context via `Drop`), stops preemption,
/// and returns.
pub fn run(preempt_enabled: bool, entry: EntryFn, arg: Box<dyn Any>) -> Result<(), Error> {
    let idle = Rc::new(RefCell::new(Tcb {
        id: next_id(),
        state: State::Running,
        context: Context::for_current_execution(),
    }));

    // The scheduler singleton must exist *before* the preemption timer is
    // armed: the handler can fire the instant `start` returns, and it
    // forces a call to `yield_now`, which assumes `SCHEDULER` is populated.
    SCHEDULER.with(|cell| {
        *cell.borrow_mut() = Some(Scheduler {
            ready_queue: Fifo::new(),
            zombie_queue: Fifo::new(),
            current: Rc::clone(&idle),
        });
    });

    uthread_preempt::register(forced_yield);
    if let Err(err) = uthread_preempt::start(preempt_enabled) {
        log::debug!("run: preemption setup failed: {err}");
        SCHEDULER.with(|cell| *cell.borrow_mut() = None);
        return Err(Error::ResourceExhausted);
    }
    log::debug!("run: starting (preempt_enabled={preempt_enabled})");

    if let Err(err) = create(entry, arg) {
        uthread_preempt::stop();
        SCHEDULER.with(|cell| *cell.borrow_mut() = None);
        return Err(err);
    }

    loop {
        let ready_is_empty = {
            let _guard = uthread_preempt::disable_scope();
            SCHEDULER.with(|cell| {
                cell.borrow()
                    .as_ref()
                    .expect("scheduler vanished mid-run")
                    .ready_queue
                    .is_empty()
            })
        };
        if ready_is_empty {
            break;
        }
        yield_now();
    }

    // Stop the timer before draining zombies: the drain only frees memory
    // and is not itself scheduler-critical, but doing it with the timer
    // still armed would mean a tick landing mid-drain forces a `yield_now`
    // that tries to borrow the same `RefCell` this loop is already holding.
    uthread_preempt::stop();

    let reclaimed = SCHEDULER.with(|cell| {
        let mut sched = cell.borrow_mut();
        let sched = sched.as_mut().expect("scheduler vanished mid-run");
        let mut count = 0usize;
        while sched.zombie_queue.dequeue().is_some() {
            count += 1;
        }
        count
    });
    log::debug!("run: reclaimed {reclaimed} zombie thread(s)");

    SCHEDULER.with(|cell| *cell.borrow_mut() = None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn no_arg() -> Box<dyn Any> {
        Box::new(())
    }

    #[test]
    fn hello_world_prints_in_order_and_drains_ready_queue() {
        init_logger();

        static OUTPUT: std::sync::Mutex<Vec<&str>> = std::sync::Mutex::new(Vec::new());

        fn entry(_arg: Box<dyn Any>) {
            OUTPUT.lock().unwrap().push("A");
            yield_now();
            OUTPUT.lock().unwrap().push("C");
        }

        OUTPUT.lock().unwrap().clear();
        run(false, entry, no_arg()).unwrap();
        assert_eq!(*OUTPUT.lock().unwrap(), vec!["A", "C"]);

        // `run` already tore the scheduler down; a second run must start
        // from a clean slate.
        OUTPUT.lock().unwrap().clear();
        run(false, entry, no_arg()).unwrap();
        assert_eq!(*OUTPUT.lock().unwrap(), vec!["A", "C"]);
    }

    #[test]
    fn three_threads_round_robin_deterministically_without_preemption() {
        init_logger();

        thread_local! {
            static LOG: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
        }

        fn worker(arg: Box<dyn Any>) {
            let id = *arg.downcast::<u32>().unwrap();
            for _ in 0..3 {
                LOG.with(|l| l.borrow_mut().push(format!("T{id}")));
                yield_now();
            }
        }

        fn entry(_arg: Box<dyn Any>) {
            LOG.with(|l| l.borrow_mut().push("entry".to_string()));
            for id in 1..=3u32 {
                create(worker, Box::new(id)).unwrap();
            }
        }

        LOG.with(|l| l.borrow_mut().clear());
        run(false, entry, no_arg()).unwrap();

        let log = LOG.with(|l| l.borrow().clone());
        assert_eq!(log[0], "entry");
        // three full rounds of T1,T2,T3 in FIFO creation order
        assert_eq!(&log[1..4], &["T1", "T2", "T3"]);
        assert_eq!(&log[4..7], &["T1", "T2", "T3"]);
        assert_eq!(&log[7..10], &["T1", "T2", "T3"]);
    }

    #[test]
    fn zombie_reclamation_after_ten_immediate_exits() {
        init_logger();

        fn worker(_arg: Box<dyn Any>) {
            // returning immediately falls through `run_entry` into `exit()`
        }

        fn entry(_arg: Box<dyn Any>) {
            for _ in 0..10 {
                create(worker, Box::new(())).unwrap();
            }
        }

        run(false, entry, no_arg()).unwrap();
        // if `run` returned at all, the ready queue drained and the zombie
        // queue was reclaimed; there is no outside hook in the safe API to
        // inspect allocator state directly; `uthread-ctx`'s own Stack/Drop
        // unit tests cover that the munmap path is exercised.
    }

    #[test]
    fn yield_with_empty_ready_queue_is_a_no_op() {
        init_logger();

        fn entry(_arg: Box<dyn Any>) {
            // no other threads were created; the ready queue is empty, so
            // this must return immediately rather than hang.
            yield_now();
            yield_now();
        }

        run(false, entry, no_arg()).unwrap();
    }

    #[test]
    fn round_robin_fairness_lower_bound() {
        init_logger();

        const N: u32 = 4;
        const K: u32 = 40;

        thread_local! {
            static COUNTS: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
        }

        fn worker(arg: Box<dyn Any>) {
            let idx = *arg.downcast::<usize>().unwrap();
            for _ in 0..(K / N) {
                COUNTS.with(|c| c.borrow_mut()[idx] += 1);
                yield_now();
            }
        }

        fn entry(_arg: Box<dyn Any>) {
            for idx in 0..N as usize {
                create(worker, Box::new(idx)).unwrap();
            }
        }

        COUNTS.with(|c| *c.borrow_mut() = vec![0; N as usize]);
        run(false, entry, no_arg()).unwrap();
        let counts = COUNTS.with(|c| c.borrow().clone());
        for count in counts {
            assert!(count >= K / N);
        }
    }

    #[test]
    fn not_send_not_sync() {
        // TcbHandle is Rc-backed and therefore neither Send nor Sync; this
        // is a compile-time property, asserted via static_assertions rather
        // than at runtime.
        static_assertions::assert_not_impl_any!(TcbHandle: Send, Sync);
        let _ = StdRc::strong_count;
    }

    #[test]
    fn current_reflects_the_running_thread() {
        init_logger();

        fn entry(_arg: Box<dyn Any>) {
            let me = current();
            assert_eq!(me.borrow().state, State::Running);
        }

        run(false, entry, no_arg()).unwrap();
    }

    #[test]
    fn block_and_unblock_resume_the_target_thread() {
        init_logger();

        thread_local! {
            static BLOCKED: RefCell<Option<TcbHandle>> = const { RefCell::new(None) };
            static RESUMED: Cell<bool> = const { Cell::new(false) };
        }

        fn blocker(_arg: Box<dyn Any>) {
            BLOCKED.with(|b| *b.borrow_mut() = Some(current()));
            block();
            RESUMED.with(|r| r.set(true));
        }

        fn entry(_arg: Box<dyn Any>) {
            create(blocker, Box::new(())).unwrap();
            yield_now(); // let the blocker run and block itself
            let target = BLOCKED.with(|b| b.borrow().clone()).unwrap();
            unblock(&target);
        }

        BLOCKED.with(|b| *b.borrow_mut() = None);
        RESUMED.with(|r| r.set(false));
        run(false, entry, no_arg()).unwrap();
        assert!(RESUMED.with(|r| r.get()));
    }
}

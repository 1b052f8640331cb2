//! A counting semaphore with a fair, FIFO blocked-waiter queue, built
//! entirely on top of the scheduler's [`block`](crate::scheduler::block)/
//! [`unblock`](crate::scheduler::unblock) interface.
//!
//! `Semaphore` is the canonical client of that interface: every other way a
//! thread gets suspended and resumed in this crate either goes through a
//! `Semaphore` or through the scheduler's own queues directly.

use std::cell::{Cell, RefCell};

use uthread_queue::Fifo;

use crate::error::Error;
use crate::scheduler::{self, TcbHandle};

/// A counting semaphore. `count` starts at the value passed to [`new`](Self::new)
/// and is decremented by [`down`](Self::down), incremented by
/// [`up`](Self::up). Not `Send`/`Sync` - like every other type in this
/// crate, a `Semaphore` belongs to the single OS thread running the
/// scheduler that created it.
pub struct Semaphore {
    count: Cell<u64>,
    waiters: RefCell<Fifo<TcbHandle>>,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub fn new(count: u64) -> Self {
        Self {
            count: Cell::new(count),
            waiters: RefCell::new(Fifo::new()),
        }
    }

    /// Convenience constructor for the common mutual-exclusion case: a
    /// binary semaphore with `count == 1`. Adds no new semantics over
    /// [`new(1)`](Self::new).
    pub fn new_mutex() -> Self {
        Self::new(1)
    }

    /// Decrement `count`, blocking until a unit is available.
    ///
    /// Tests and decrements atomically with preemption disabled. If none is
    /// available, registers `current()` on the waiter queue and blocks; on
    /// resumption it **retests** rather than assuming a unit is now its own
    /// (see the module docs on the wake hazard below) and loops.
    ///
    /// A third thread may `down` and consume the unit between this thread's
    /// wake-up and its next dispatch, because `up` both increments `count`
    /// and wakes a waiter as two separate steps. Retesting after every wake
    /// is what makes this a *signaling* semaphore rather than a hand-off
    /// one: `up` does not transfer ownership to the woken waiter, it only
    /// gives it another chance to compete for `count`.
    pub fn down(&self) {
        loop {
            let acquired = {
                let _guard = uthread_preempt::disable_scope();
                if self.count.get() > 0 {
                    self.count.set(self.count.get() - 1);
                    true
                } else {
                    self.waiters.borrow_mut().enqueue(scheduler::current());
                    false
                }
            };
            if acquired {
                return;
            }
            scheduler::block();
        }
    }

    /// Increment `count`, then wake the longest-waiting blocked thread (if
    /// any) and yield so it gets a prompt chance to run.
    ///
    /// The yield at the end is not required for correctness - preemption
    /// would get the woken thread running eventually regardless - but it
    /// noticeably improves responsiveness under purely cooperative
    /// scheduling, where nothing else would force a switch. This is a
    /// deliberate, documented choice rather than a runtime-configurable
    /// flag: a caller who wants the other behavior should read this comment
    /// and change the code, not flip a bit.
    pub fn up(&self) {
        let waiter = {
            let _guard = uthread_preempt::disable_scope();
            self.count.set(self.count.get() + 1);
            self.waiters.borrow_mut().dequeue()
        };

        if let Some(waiter) = waiter {
            scheduler::unblock(&waiter);
            scheduler::yield_now();
        }
    }

    /// `down`/`up` under a name suited to mutual-exclusion call sites. Adds
    /// no semantics beyond [`down`](Self::down)/[`up`](Self::up); provided
    /// because reading `mutex.lock(); ...; mutex.unlock();` at a critical
    /// section is clearer than `sem.down(); ...; sem.up();` even though
    /// they compile to the same calls.
    pub fn lock(&self) {
        self.down();
    }

    /// See [`lock`](Self::lock).
    pub fn unlock(&self) {
        self.up();
    }

    /// Consume the semaphore, returning `Err(Error::InUse)` instead of
    /// panicking if waiters are still blocked on it. Prefer this over a bare
    /// `drop(sem)` when the caller wants to handle a non-quiescent semaphore
    /// without unwinding.
    ///
    /// A thread that has merely obtained a `&Semaphore` but not yet called
    /// `down` is invisible to this check - there is no way to observe
    /// "about to call down" from here. Callers are responsible for ensuring
    /// external quiescence before destroying a semaphore they expect this to
    /// succeed on.
    pub fn try_destroy(self) -> Result<(), Error> {
        if !self.waiters.borrow().is_empty() {
            log::warn!(
                "semaphore not destroyed: {} waiter(s) still blocked",
                self.waiters.borrow().len()
            );
            // Don't let `Drop` re-report (or, in debug builds, panic on)
            // the same condition we just returned as an `Err`.
            std::mem::forget(self);
            return Err(Error::InUse);
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if !self.waiters.borrow().is_empty() {
            if cfg!(debug_assertions) {
                panic!(
                    "Semaphore dropped with {} waiter(s) still blocked; those threads will never wake",
                    self.waiters.borrow().len()
                );
            } else {
                log::error!(
                    "semaphore dropped with {} waiter(s) still blocked; those threads will never wake",
                    self.waiters.borrow().len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{create, run};
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn up_then_down_law_inside_scheduler() {
        init_logger();

        thread_local! {
            static OK: Cell<bool> = const { Cell::new(false) };
        }

        fn entry(_arg: Box<dyn Any>) {
            let sem = Semaphore::new(0);
            sem.up();
            sem.down();
            OK.with(|ok| ok.set(sem.try_destroy().is_ok()));
        }

        OK.with(|ok| ok.set(false));
        run(false, entry, Box::new(())).unwrap();
        assert!(OK.with(|ok| ok.get()));
    }

    #[test]
    fn mutual_exclusion_holds_across_many_iterations() {
        init_logger();

        thread_local! {
            static VIOLATED: Cell<bool> = const { Cell::new(false) };
        }

        struct Worker {
            mutex: Rc<Semaphore>,
            inside: Rc<Cell<u32>>,
            iterations: u32,
        }

        fn worker(arg: Box<dyn Any>) {
            let w = arg.downcast::<Worker>().unwrap();
            for _ in 0..w.iterations {
                w.mutex.down();
                if w.inside.get() != 0 {
                    VIOLATED.with(|v| v.set(true));
                }
                w.inside.set(1);
                w.inside.set(0);
                w.mutex.up();
                scheduler::yield_now();
            }
        }

        fn entry(_arg: Box<dyn Any>) {
            let mutex = Rc::new(Semaphore::new_mutex());
            let inside = Rc::new(Cell::new(0u32));
            for _ in 0..2 {
                let w = Worker {
                    mutex: Rc::clone(&mutex),
                    inside: Rc::clone(&inside),
                    iterations: 200,
                };
                create(worker, Box::new(w)).unwrap();
            }
        }

        VIOLATED.with(|v| v.set(false));
        run(false, entry, Box::new(())).unwrap();
        assert!(!VIOLATED.with(|v| v.get()));
    }

    #[test]
    fn producer_consumer_preserves_order() {
        init_logger();
        use std::collections::VecDeque;

        thread_local! {
            static RECEIVED: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
        }

        struct Shared {
            empty: Rc<Semaphore>,
            full: Rc<Semaphore>,
            buffer: Rc<RefCell<VecDeque<u32>>>,
        }

        struct Args {
            items: u32,
            shared: Shared,
        }

        fn producer(arg: Box<dyn Any>) {
            let a = arg.downcast::<Args>().unwrap();
            for i in 0..a.items {
                a.shared.empty.down();
                a.shared.buffer.borrow_mut().push_back(i);
                a.shared.full.up();
            }
        }

        fn consumer(arg: Box<dyn Any>) {
            let a = arg.downcast::<Args>().unwrap();
            for _ in 0..a.items {
                a.shared.full.down();
                let v = a.shared.buffer.borrow_mut().pop_front().unwrap();
                a.shared.empty.up();
                RECEIVED.with(|r| r.borrow_mut().push(v));
            }
        }

        fn entry(_arg: Box<dyn Any>) {
            let shared = Shared {
                empty: Rc::new(Semaphore::new(4)),
                full: Rc::new(Semaphore::new(0)),
                buffer: Rc::new(RefCell::new(VecDeque::new())),
            };
            const ITEMS: u32 = 50;
            create(
                producer,
                Box::new(Args {
                    items: ITEMS,
                    shared: Shared {
                        empty: Rc::clone(&shared.empty),
                        full: Rc::clone(&shared.full),
                        buffer: Rc::clone(&shared.buffer),
                    },
                }),
            )
            .unwrap();
            create(
                consumer,
                Box::new(Args {
                    items: ITEMS,
                    shared,
                }),
            )
            .unwrap();
        }

        RECEIVED.with(|r| r.borrow_mut().clear());
        run(false, entry, Box::new(())).unwrap();
        let received = RECEIVED.with(|r| r.borrow().clone());
        let expected: Vec<u32> = (0..50).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn try_destroy_fails_while_a_waiter_is_blocked() {
        init_logger();

        thread_local! {
            static DESTROY_OK: Cell<Option<bool>> = const { Cell::new(None) };
        }

        fn waiter(arg: Box<dyn Any>) {
            let ptr = *arg.downcast::<usize>().unwrap();
            // SAFETY: `ptr` is `entry`'s stack-local `sem` below. `entry`'s
            // frame stays alive (merely suspended, not returned-from) for
            // as long as this cooperatively scheduled thread might still
            // dereference it - both run on the same OS thread and address
            // space, there is no concurrent access.
            let sem = unsafe { &*(ptr as *const Semaphore) };
            sem.down();
        }

        fn entry(_arg: Box<dyn Any>) {
            let sem = Semaphore::new(0);
            let ptr = &sem as *const Semaphore as usize;
            create(waiter, Box::new(ptr)).unwrap();
            scheduler::yield_now(); // let the waiter block on `sem`
            DESTROY_OK.with(|r| r.set(Some(sem.try_destroy().is_ok())));
        }

        DESTROY_OK.with(|r| r.set(None));
        run(false, entry, Box::new(())).unwrap();
        assert_eq!(DESTROY_OK.with(|r| r.get()), Some(false));
    }

    #[test]
    fn not_send_not_sync() {
        static_assertions::assert_not_impl_any!(Semaphore: Send, Sync);
    }
}

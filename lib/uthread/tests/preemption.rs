//! Exercises the preemption subsystem end to end: a thread that never calls
//! `yield_now` must still be preempted often enough to let a cooperating
//! thread make progress. Unlike the deterministic round-robin tests in
//! `scheduler`'s own unit tests, this one genuinely depends on wall-clock
//! time (the preemption timer is virtual-CPU-time based, not
//! instruction-count based), so it lives here as an integration test rather
//! than inside the library's `#[cfg(test)]` module.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Args {
    ticks: Rc<Cell<u32>>,
    deadline: Instant,
}

fn busy_looper(arg: Box<dyn Any>) {
    let args = arg.downcast::<Args>().unwrap();
    // A pure compute loop with no explicit yield: if preemption is not
    // actually forcing a switch, `ticker` below never gets to run and
    // `ticks` stays at 0 until this loop's own deadline check fires.
    while Instant::now() < args.deadline {
        std::hint::black_box(0u64..1000);
    }
}

fn ticker(arg: Box<dyn Any>) {
    let args = arg.downcast::<Args>().unwrap();
    while Instant::now() < args.deadline {
        args.ticks.set(args.ticks.get() + 1);
        uthread::yield_now();
    }
}

fn bootstrap(arg: Box<dyn Any>) {
    let ticks = arg.downcast::<Rc<Cell<u32>>>().unwrap();
    let deadline = Instant::now() + Duration::from_millis(500);
    uthread::create(
        busy_looper,
        Box::new(Args {
            ticks: Rc::clone(&ticks),
            deadline,
        }),
    )
    .expect("failed to create busy-looping thread");
    uthread::create(
        ticker,
        Box::new(Args {
            ticks: Rc::clone(&ticks),
            deadline,
        }),
    )
    .expect("failed to create ticking thread");
}

#[test]
fn a_busy_loop_without_explicit_yields_is_still_preempted() {
    init_logger();

    let ticks = Rc::new(Cell::new(0u32));
    uthread::run(true, bootstrap, Box::new(Rc::clone(&ticks))).expect("uthread::run failed");

    // At 100 Hz over a 500ms budget shared with a competing busy loop, the
    // ticker should get dispatched at least a handful of times; this is a
    // liveness bound, not an exact count, since the two threads' scheduling
    // is not otherwise ordered.
    assert!(
        ticks.get() >= 5,
        "expected the cooperating thread to make progress under preemption, got {} ticks",
        ticks.get()
    );
}

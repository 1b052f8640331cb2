//! Two threads repeatedly enter a critical section guarded by a binary
//! semaphore (`uthread::Semaphore::new_mutex()`), each bumping and resetting
//! a shared counter that must never be observed as already-1 on entry. This
//! is the mutual-exclusion scenario from the library's test suite, run here
//! as a standalone program so it can be exercised under real preemption
//! (`--preempt`) instead of only deterministically in-process.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use clap::Parser;
use uthread::Semaphore;

/// Run two threads contending for a binary semaphore.
#[derive(Parser, Debug)]
struct Args {
    /// Number of down/critical/up cycles each thread performs.
    #[arg(long, default_value_t = 1000)]
    iterations: u32,

    /// Enable timer-driven preemption. With it on, the critical section is
    /// genuinely at risk of being preempted mid-section; the semaphore
    /// should still hold.
    #[arg(long)]
    preempt: bool,
}

struct Worker {
    id: u32,
    iterations: u32,
    mutex: Rc<Semaphore>,
    inside: Rc<Cell<u32>>,
}

fn worker_entry(arg: Box<dyn Any>) {
    let worker = arg.downcast::<Worker>().expect("worker payload type mismatch");
    for _ in 0..worker.iterations {
        worker.mutex.lock();
        let before = worker.inside.get();
        assert_eq!(before, 0, "mutual exclusion violated entering critical section");
        worker.inside.set(1);
        let after = worker.inside.get();
        assert_eq!(after, 1, "mutual exclusion violated inside critical section");
        worker.inside.set(0);
        worker.mutex.unlock();
        uthread::yield_now();
    }
    println!("worker {} finished {} iterations", worker.id, worker.iterations);
}

struct BootstrapArgs {
    iterations: u32,
    mutex: Rc<Semaphore>,
    inside: Rc<Cell<u32>>,
}

fn bootstrap(arg: Box<dyn Any>) {
    let args = arg
        .downcast::<BootstrapArgs>()
        .expect("bootstrap payload type mismatch");
    for id in 0..2 {
        let worker = Worker {
            id,
            iterations: args.iterations,
            mutex: Rc::clone(&args.mutex),
            inside: Rc::clone(&args.inside),
        };
        uthread::create(worker_entry, Box::new(worker)).expect("failed to create worker thread");
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let bootstrap_args = BootstrapArgs {
        iterations: args.iterations,
        mutex: Rc::new(Semaphore::new_mutex()),
        inside: Rc::new(Cell::new(0)),
    };

    uthread::run(args.preempt, bootstrap, Box::new(bootstrap_args)).expect("uthread::run failed");
    println!(
        "no mutual exclusion violation across {} iterations per worker",
        args.iterations
    );
}

//! A bounded-buffer producer and consumer, synchronized with the classic
//! pair of counting semaphores (`empty`, `full`) rather than a single mutex:
//! the producer blocks on `empty` (a free slot) before depositing and
//! signals `full` (a ready item) after; the consumer is the mirror image.
//! Corresponds to the producer/consumer scenario in the library's test
//! suite - every deposited value must be withdrawn exactly once, in order.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use clap::Parser;
use uthread::Semaphore;

/// Run a producer and a consumer over a bounded buffer.
#[derive(Parser, Debug)]
struct Args {
    /// Number of items the producer deposits (and the consumer withdraws).
    #[arg(long, default_value_t = 100)]
    items: u32,

    /// Capacity of the bounded buffer between producer and consumer.
    #[arg(long, default_value_t = 8)]
    capacity: u64,

    /// Enable timer-driven preemption.
    #[arg(long)]
    preempt: bool,
}

#[derive(Clone)]
struct Shared {
    empty: Rc<Semaphore>,
    full: Rc<Semaphore>,
    buffer: Rc<RefCell<VecDeque<u32>>>,
}

struct ProducerArgs {
    items: u32,
    shared: Shared,
}

struct ConsumerArgs {
    items: u32,
    shared: Shared,
}

fn producer_entry(arg: Box<dyn Any>) {
    let args = arg
        .downcast::<ProducerArgs>()
        .expect("producer payload type mismatch");
    for i in 0..args.items {
        args.shared.empty.down();
        args.shared.buffer.borrow_mut().push_back(i);
        args.shared.full.up();
    }
}

fn consumer_entry(arg: Box<dyn Any>) {
    let args = arg
        .downcast::<ConsumerArgs>()
        .expect("consumer payload type mismatch");
    let mut received = Vec::with_capacity(args.items as usize);
    for _ in 0..args.items {
        args.shared.full.down();
        let value = args
            .shared
            .buffer
            .borrow_mut()
            .pop_front()
            .expect("full.down() returned but the buffer was empty");
        args.shared.empty.up();
        received.push(value);
    }
    let expected: Vec<u32> = (0..args.items).collect();
    assert_eq!(received, expected, "items were not withdrawn in deposit order");
    println!("consumed {} item(s) in deposit order", received.len());
}

struct BootstrapArgs {
    items: u32,
    shared: Shared,
}

fn bootstrap(arg: Box<dyn Any>) {
    let args = arg
        .downcast::<BootstrapArgs>()
        .expect("bootstrap payload type mismatch");
    uthread::create(
        producer_entry,
        Box::new(ProducerArgs {
            items: args.items,
            shared: args.shared.clone(),
        }),
    )
    .expect("failed to create producer thread");
    uthread::create(
        consumer_entry,
        Box::new(ConsumerArgs {
            items: args.items,
            shared: args.shared,
        }),
    )
    .expect("failed to create consumer thread");
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let shared = Shared {
        empty: Rc::new(Semaphore::new(args.capacity)),
        full: Rc::new(Semaphore::new(0)),
        buffer: Rc::new(RefCell::new(VecDeque::new())),
    };

    let bootstrap_args = BootstrapArgs {
        items: args.items,
        shared,
    };
    uthread::run(args.preempt, bootstrap, Box::new(bootstrap_args)).expect("uthread::run failed");
}

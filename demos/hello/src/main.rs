//! The smallest possible `uthread` program: one thread that prints, yields
//! once, and prints again. Corresponds to the hello-world scenario in the
//! library's test suite - expected output `A C`, with an empty ready queue
//! once `uthread::run` returns.

use std::any::Any;

use clap::Parser;

/// Run the uthread hello-world scenario.
#[derive(Parser, Debug)]
struct Args {
    /// Enable timer-driven preemption. Unnecessary here - a single thread
    /// that yields voluntarily never needs to be forced - but wired through
    /// so this demo can also double as a smoke test for preemption startup.
    #[arg(long)]
    preempt: bool,
}

fn entry(_arg: Box<dyn Any>) {
    print!("A ");
    uthread::yield_now();
    println!("C");
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    uthread::run(args.preempt, entry, Box::new(())).expect("uthread::run failed");
}

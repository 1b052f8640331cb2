//! A generic FIFO queue of opaque elements.
//!
//! [`Fifo`] is the one data structure shared by the scheduler's ready/zombie
//! queues and by every [`Semaphore`](https://docs.rs/uthread)'s blocked-waiter
//! queue. It is deliberately boring: a [`VecDeque`]-backed ring buffer with
//! enqueue-at-tail / dequeue-at-head semantics, plus a deletion-safe iterator
//! and a predicate-based removal for the "find and unlink this exact waiter"
//! case that a by-pointer `queue_delete` would have handled in a C version of
//! this library.
//!
//! `enqueue` may allocate (the backing `VecDeque` grows by doubling). That
//! makes this queue unsafe to use from inside an async-signal handler if the
//! handler itself calls `enqueue` - the scheduler crate built on top of this
//! one avoids that hazard by only ever touching the queues with the
//! preemption signal masked, never from directly inside the handler itself.
//! A pre-sized or intrusive-list variant would remove the allocation but
//! isn't needed for the scheduler's current call patterns.

use std::collections::VecDeque;

/// An ordered FIFO collection of `T`. See the module docs for the allocation
/// caveat on [`Fifo::enqueue`].
#[derive(Debug)]
pub struct Fifo<T> {
    items: VecDeque<T>,
}

impl<T> Fifo<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Append `elem` to the tail of the queue.
    pub fn enqueue(&mut self, elem: T) {
        self.items.push_back(elem);
    }

    /// Remove and return the element at the head of the queue, if any.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove and return the first element (scanning from the head) for
    /// which `predicate` returns `true`. Leaves the relative order of the
    /// remaining elements unchanged.
    ///
    /// This is the Rust-idiomatic replacement for a C `queue_delete(queue,
    /// ptr)` that matches by pointer identity: instead of comparing opaque
    /// handles, the caller supplies the identity test (typically `|tcb|
    /// Rc::ptr_eq(tcb, &target)`).
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.items.iter().position(|item| predicate(item))?;
        self.items.remove(index)
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the queue from head to tail without removing anything.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

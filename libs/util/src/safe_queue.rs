// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A terminable blocking queue.
//!
//! [`SafeQueue::pop`] blocks until an element arrives; [`SafeQueue::terminate`]
//! unblocks every waiter — poppers get [`Terminated`], which is the end-of-
//! stream signal that lets a consumer thread shut down in bounded time.
//! [`SafeQueue::wait_for_space`] is the producer side of a cooperative bound:
//! block until the queue is below a limit before pushing.

use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::sync;

/// The queue was terminated; no further elements will be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated(pub(crate) ());

pub struct SafeQueue<T> {
    queue: Mutex<VecDeque<T>>,
    /// Signalled on push and on terminate.
    pushed: Condvar,
    /// Signalled on pop and on terminate.
    popped: Condvar,
    terminated: AtomicBool,
}

// === impl SafeQueue ===

impl<T> SafeQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pushed: Condvar::new(),
            popped: Condvar::new(),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Appends `value`.
    ///
    /// # Errors
    ///
    /// Fails with [`Terminated`] once the queue is terminated; the value is
    /// dropped.
    pub fn push(&self, value: T) -> Result<(), Terminated> {
        {
            let mut queue = sync::lock(&self.queue);
            if self.is_terminated() {
                return Err(Terminated(()));
            }
            queue.push_back(value);
        }
        self.pushed.notify_one();
        Ok(())
    }

    /// Blocks until the queue holds fewer than `max` elements or the queue is
    /// terminated. Returns whether there is space. The bound is cooperative:
    /// with several producers racing, the queue can briefly exceed it.
    pub fn wait_for_space(&self, max: usize) -> bool {
        let mut queue = sync::lock(&self.queue);
        while queue.len() >= max && !self.is_terminated() {
            queue = self
                .popped
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        queue.len() < max
    }

    /// Removes the front element, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Fails with [`Terminated`] once the queue is terminated; termination
    /// wakes every blocked popper.
    pub fn pop(&self) -> Result<T, Terminated> {
        let mut queue = sync::lock(&self.queue);
        loop {
            if self.is_terminated() {
                return Err(Terminated(()));
            }
            if let Some(value) = queue.pop_front() {
                drop(queue);
                self.popped.notify_one();
                return Ok(value);
            }
            queue = self
                .pushed
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes the front element if one is there right now.
    pub fn try_pop(&self) -> Option<T> {
        if self.is_terminated() {
            return None;
        }
        let value = sync::lock(&self.queue).pop_front();
        if value.is_some() {
            self.popped.notify_one();
        }
        value
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        sync::lock(&self.queue).clear();
        self.popped.notify_all();
    }

    /// Terminates the queue: drops buffered elements and unblocks every
    /// waiter. Terminal; the queue stays unusable.
    pub fn terminate(&self) {
        {
            let mut queue = sync::lock(&self.queue);
            self.terminated.store(true, Ordering::Release);
            queue.clear();
        }
        self.pushed.notify_all();
        self.popped.notify_all();
    }
}

impl<T> Default for SafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SafeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeQueue")
            .field("len", &self.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

// === impl Terminated ===

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("terminated")
    }
}

impl core::error::Error for Terminated {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = SafeQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Ok(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.pop(), Ok(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(SafeQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                queue.push(42).unwrap();
            })
        };
        assert_eq!(queue.pop(), Ok(42));
        producer.join().unwrap();
    }

    #[test]
    fn terminate_unblocks_all_poppers() {
        let queue: Arc<SafeQueue<i32>> = Arc::new(SafeQueue::new());
        let poppers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.pop())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        queue.terminate();
        for popper in poppers {
            assert_eq!(popper.join().unwrap(), Err(Terminated(())));
        }
        assert_eq!(queue.push(1), Err(Terminated(())));
    }

    #[test]
    fn wait_for_space_applies_backpressure() {
        let queue = Arc::new(SafeQueue::new());
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                assert!(queue.wait_for_space(2));
                queue.push(3).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Ok(1));
        producer.join().unwrap();
        assert_eq!(queue.len(), 2);
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Observer fanout.
//!
//! Observers are held weakly: dropping the handler unsubscribes it, which is
//! what lets a container observe the channels it owns without a reference
//! cycle. Notification order is registration order. An observer may remove
//! itself from inside a notification through the deferred queue; the queue is
//! drained at the start of the next fanout.

use std::sync::{Arc, Mutex, Weak};

use crate::sync;

/// The capability of receiving notifications from a `T`.
pub trait Handler<T: ?Sized>: Send + Sync {
    fn handle(&self, sender: &T);
}

/// A closure wrapped as a [`Handler`]. A blanket impl over `Fn` would
/// collide with the hand-written `Handler` impls on composite types, so the
/// wrapper is explicit.
pub struct FnHandler<F>(pub F);

impl<T: ?Sized, F> Handler<T> for FnHandler<F>
where
    F: Fn(&T) + Send + Sync,
{
    fn handle(&self, sender: &T) {
        (self.0)(sender);
    }
}

/// `Arc`s a closure as a shareable observer.
pub fn handler<T, F>(f: F) -> Arc<dyn Handler<T>>
where
    T: ?Sized + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

pub struct Observable<T: ?Sized> {
    observers: Mutex<Vec<Weak<dyn Handler<T>>>>,
    deferred_removals: Mutex<Vec<Weak<dyn Handler<T>>>>,
}

// === impl Observable ===

impl<T: ?Sized> Observable<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            deferred_removals: Mutex::new(Vec::new()),
        }
    }

    /// Registers `observer` at the back (or front) of the fanout order.
    /// Returns false when it is already registered.
    pub fn add_observer(&self, observer: &Arc<dyn Handler<T>>, to_front: bool) -> bool {
        let mut observers = sync::lock(&self.observers);
        if observers
            .iter()
            .any(|candidate| candidate.ptr_eq(&Arc::downgrade(observer)))
        {
            return false;
        }
        if to_front {
            observers.insert(0, Arc::downgrade(observer));
        } else {
            observers.push(Arc::downgrade(observer));
        }
        true
    }

    /// Unregisters `observer` immediately. Must not be called from inside a
    /// notification of the same observable; use
    /// [`Observable::remove_observer_deferred`] there.
    pub fn remove_observer(&self, observer: &Arc<dyn Handler<T>>) {
        let target = Arc::downgrade(observer);
        sync::lock(&self.observers).retain(|candidate| !candidate.ptr_eq(&target));
    }

    /// Queues `observer` for removal at the start of the next notification.
    pub fn remove_observer_deferred(&self, observer: &Arc<dyn Handler<T>>) {
        sync::lock(&self.deferred_removals).push(Arc::downgrade(observer));
    }

    pub fn is_observer(&self, observer: &Arc<dyn Handler<T>>) -> bool {
        let target = Arc::downgrade(observer);
        sync::lock(&self.observers)
            .iter()
            .any(|candidate| candidate.ptr_eq(&target))
    }

    pub fn observer_count(&self) -> usize {
        sync::lock(&self.observers)
            .iter()
            .filter(|candidate| candidate.strong_count() > 0)
            .count()
    }

    /// Notifies every live observer in registration order. The list is
    /// snapshotted before the fanout, so observers run without the list lock
    /// held and registration changes take effect from the next notification.
    pub fn notify_observers(&self, sender: &T) {
        let snapshot: Vec<Arc<dyn Handler<T>>> = {
            let removals = std::mem::take(&mut *sync::lock(&self.deferred_removals));
            let mut observers = sync::lock(&self.observers);
            if !removals.is_empty() {
                observers.retain(|candidate| !removals.iter().any(|dead| dead.ptr_eq(candidate)));
            }
            observers.retain(|candidate| candidate.strong_count() > 0);
            observers
                .iter()
                .filter_map(std::sync::Weak::upgrade)
                .collect()
        };

        for observer in snapshot {
            observer.handle(sender);
        }
    }
}

impl<T: ?Sized> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Unit;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn Handler<Unit>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let handler: Arc<dyn Handler<Unit>> = Arc::new(FnHandler(move |_: &Unit| {
            captured.fetch_add(1, Ordering::SeqCst);
        }));
        (count, handler)
    }

    #[test]
    fn fanout_in_registration_order() {
        let observable: Observable<Unit> = Observable::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first: Arc<dyn Handler<Unit>> = {
            let order = order.clone();
            Arc::new(FnHandler(move |_: &Unit| sync::lock(&order).push(1)))
        };
        let second: Arc<dyn Handler<Unit>> = {
            let order = order.clone();
            Arc::new(FnHandler(move |_: &Unit| sync::lock(&order).push(2)))
        };
        let front: Arc<dyn Handler<Unit>> = {
            let order = order.clone();
            Arc::new(FnHandler(move |_: &Unit| sync::lock(&order).push(0)))
        };

        assert!(observable.add_observer(&first, false));
        assert!(observable.add_observer(&second, false));
        assert!(observable.add_observer(&front, true));
        assert!(!observable.add_observer(&first, false));

        observable.notify_observers(&Unit);
        assert_eq!(*sync::lock(&order), vec![0, 1, 2]);
    }

    #[test]
    fn dropping_a_handler_unsubscribes_it() {
        let observable: Observable<Unit> = Observable::new();
        let (count, handler) = counter();
        observable.add_observer(&handler, false);
        observable.notify_observers(&Unit);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(handler);
        observable.notify_observers(&Unit);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(observable.observer_count(), 0);
    }

    #[test]
    fn removal_is_immediate_outside_and_deferred_inside() {
        let observable: Observable<Unit> = Observable::new();
        let (count, handler) = counter();
        observable.add_observer(&handler, false);
        observable.remove_observer(&handler);
        observable.notify_observers(&Unit);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        observable.add_observer(&handler, false);
        observable.remove_observer_deferred(&handler);
        // the deferred queue drains at the START of the next fanout, so this
        // notification no longer reaches the observer
        observable.notify_observers(&Unit);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!observable.is_observer(&handler));
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Element providers and the collector loop that drains them.
//!
//! A [`Provider`] is a pull source that may be finite (`providing()` goes
//! false at end of stream) or continuous. A [`Collector`] is the consuming
//! side of a dedicated thread: it pulls items and hands each one to a
//! callback on that thread, sleeping on a waitable while there is nothing to
//! pull.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sync;
use crate::waitable::Waitable;

/// A pull source of `T`.
pub trait Provider<T>: Send + Sync {
    /// Whether the stream may still produce. A finite provider turns false
    /// at end of stream; `provide` may still return `None` while this is
    /// true (nothing buffered right now).
    fn providing(&self) -> bool;

    fn provide(&self) -> Option<T>;
}

/// A finite provider draining a vector front to back.
pub struct VecProvider<T> {
    items: Mutex<VecDeque<T>>,
}

/// A provider backed by closures; `providing` defaults to always-true.
pub struct FnProvider<T> {
    provide: Box<dyn Fn() -> Option<T> + Send + Sync>,
    providing: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

/// Drains a shared provider on the calling thread.
pub struct Collector<T> {
    provider: Mutex<Option<Arc<dyn Provider<T>>>>,
    running: AtomicBool,
    waitable: Waitable,
    /// Poll interval (ns) while the provider is empty or absent.
    poll: AtomicI64,
}

// === impl VecProvider ===

impl<T: Send> VecProvider<T> {
    pub fn new(items: impl Into<VecDeque<T>>) -> Self {
        Self {
            items: Mutex::new(items.into()),
        }
    }
}

impl<T: Send> Provider<T> for VecProvider<T> {
    fn providing(&self) -> bool {
        !sync::lock(&self.items).is_empty()
    }

    fn provide(&self) -> Option<T> {
        sync::lock(&self.items).pop_front()
    }
}

// === impl FnProvider ===

impl<T> FnProvider<T> {
    pub fn new(provide: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            provide: Box::new(provide),
            providing: None,
        }
    }

    #[must_use]
    pub fn providing_when(mut self, providing: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.providing = Some(Box::new(providing));
        self
    }
}

impl<T: Send> Provider<T> for FnProvider<T> {
    fn providing(&self) -> bool {
        self.providing.as_ref().is_none_or(|providing| providing())
    }

    fn provide(&self) -> Option<T> {
        (self.provide)()
    }
}

// === impl Collector ===

impl<T> Collector<T> {
    pub fn new() -> Self {
        Self {
            provider: Mutex::new(None),
            running: AtomicBool::new(false),
            waitable: Waitable::new(),
            poll: AtomicI64::new(1_000_000),
        }
    }

    /// Installs (or replaces) the provider and wakes a sleeping run loop.
    pub fn set_provider(&self, provider: Arc<dyn Provider<T>>) {
        *sync::lock(&self.provider) = Some(provider);
        let _guard = self.waitable.guard();
        self.waitable.notify_all();
    }

    pub fn provider(&self) -> Option<Arc<dyn Provider<T>>> {
        sync::lock(&self.provider).clone()
    }

    /// How long the run loop sleeps between polls while nothing is
    /// collectable.
    pub fn set_poll_interval(&self, interval: Duration) {
        let nanos = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
        self.poll.store(nanos.max(1), Ordering::Release);
    }

    /// Whether a `collect` would have a chance right now.
    pub fn can_collect(&self) -> bool {
        self.provider()
            .is_some_and(|provider| provider.providing())
    }

    /// Pulls a single item if the provider is producing.
    pub fn collect(&self) -> Option<T> {
        let provider = self.provider()?;
        if !provider.providing() {
            return None;
        }
        provider.provide()
    }

    /// The blocking drain loop, intended for a dedicated thread: every
    /// pulled item goes to `on_item` on this thread; while there is nothing
    /// to pull the loop sleeps on the collector's waitable until [`stop`],
    /// a new provider, or the poll interval. Returns when stopped. Only one
    /// run loop at a time; a second call returns immediately.
    ///
    /// [`stop`]: Collector::stop
    pub fn run(&self, mut on_item: impl FnMut(T)) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let poll = || {
            Duration::from_nanos(self.poll.load(Ordering::Acquire).max(1).cast_unsigned())
        };
        while self.running.load(Ordering::Acquire) {
            match self.collect() {
                Some(item) => on_item(item),
                None => {
                    self.waitable
                        .wait_for(poll(), || !self.running.load(Ordering::Acquire));
                }
            }
        }
    }

    /// Stops a run loop. Idempotent; also safe to call before `run`, which
    /// then exits immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _guard = self.waitable.guard();
        self.waitable.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_provider_is_finite() {
        let provider = VecProvider::new(vec![1, 2, 3]);
        assert!(provider.providing());
        assert_eq!(provider.provide(), Some(1));
        assert_eq!(provider.provide(), Some(2));
        assert_eq!(provider.provide(), Some(3));
        assert!(!provider.providing());
        assert_eq!(provider.provide(), None);
    }

    #[test]
    fn fn_provider_consults_its_closures() {
        let provider = FnProvider::new(|| Some(7)).providing_when(|| false);
        assert!(!provider.providing());
        assert_eq!(provider.provide(), Some(7));
    }

    #[test]
    fn collector_drains_on_the_collecting_thread() {
        let collector: Arc<Collector<i32>> = Arc::new(Collector::new());
        collector.set_provider(Arc::new(VecProvider::new(vec![1, 2, 3])));

        let collected = Arc::new(Mutex::new(Vec::new()));
        let thread = {
            let collector = collector.clone();
            let collected = collected.clone();
            std::thread::spawn(move || {
                collector.run(|item| sync::lock(&collected).push(item));
            })
        };

        // the loop drains everything, then sleeps until stopped
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while sync::lock(&collected).len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        collector.stop();
        thread.join().unwrap();
        assert_eq!(*sync::lock(&collected), vec![1, 2, 3]);
    }

    #[test]
    fn collector_wakes_for_a_new_provider() {
        let collector: Arc<Collector<i32>> = Arc::new(Collector::new());
        let collected = Arc::new(Mutex::new(Vec::new()));
        let thread = {
            let collector = collector.clone();
            let collected = collected.clone();
            std::thread::spawn(move || {
                collector.run(|item| sync::lock(&collected).push(item));
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        assert!(sync::lock(&collected).is_empty());
        collector.set_provider(Arc::new(VecProvider::new(vec![9])));

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while sync::lock(&collected).is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        collector.stop();
        thread.join().unwrap();
        assert_eq!(*sync::lock(&collected), vec![9]);
    }
}

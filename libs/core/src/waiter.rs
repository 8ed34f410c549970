// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking on channel notifications. Mostly a test aid.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use weir_util::observable::{FnHandler, Handler};
use weir_util::waitable::Waitable;

use crate::channel::Channel;

/// Counts notifications of one channel and lets a thread wait for them.
/// Observation ends when the waiter is dropped.
pub struct ChannelWaiter {
    channel: Arc<Channel>,
    observer: Arc<dyn Handler<Channel>>,
    state: Arc<WaiterState>,
}

struct WaiterState {
    count: AtomicUsize,
    waitable: Waitable,
}

// === impl ChannelWaiter ===

impl ChannelWaiter {
    pub fn new(channel: &Arc<Channel>) -> Self {
        let state = Arc::new(WaiterState {
            count: AtomicUsize::new(0),
            waitable: Waitable::new(),
        });
        let observer: Arc<dyn Handler<Channel>> = {
            let state = state.clone();
            Arc::new(FnHandler(move |_: &Channel| {
                let _guard = state.waitable.guard();
                state.count.fetch_add(1, Ordering::SeqCst);
                state.waitable.notify_all();
            }))
        };
        channel.add_observer(&observer);
        Self {
            channel: channel.clone(),
            observer,
            state,
        }
    }

    /// Notifications seen since construction.
    pub fn count(&self) -> usize {
        self.state.count.load(Ordering::SeqCst)
    }

    /// Waits for at least one notification after this call.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let baseline = self.count();
        self.state
            .waitable
            .wait_for(timeout, || self.count() > baseline)
    }

    /// Waits until the total notification count reaches `target`.
    pub fn wait_for_count(&self, timeout: Duration, target: usize) -> bool {
        self.state
            .waitable
            .wait_for(timeout, || self.count() >= target)
    }
}

impl Drop for ChannelWaiter {
    fn drop(&mut self) {
        self.channel.remove_observer(&self.observer);
    }
}

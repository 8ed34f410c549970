// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The replay device.
//!
//! A worker thread collects [`PlayableRecord`]s from a provider and schedules
//! one task per record on the device's own child scheduler, at
//! `run_in = record.timestamp − first_timestamp`: playback is anchored at
//! the scheduler's start of run, so inter-record deltas replay as captured.
//! Records travel to the scheduler through a bounded queue — the worker
//! blocks while the queue is full, which is the backpressure that keeps an
//! arbitrarily large capture from ballooning memory. Since records arrive in
//! timestamp order and the queue is FIFO, the fired task simply pops the
//! front record and writes it into the alias-mapped destination channel.
//!
//! End of stream is decided on the worker, where no record can be in
//! flight: once the provider stops providing and every scheduled record has
//! played, the `end` channel (declared at init, linkable) is pulsed and the
//! worker retires.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use weir_util::config::{ConfigError, Configurable};
use weir_util::named::{Anchor, downcast_arc};
use weir_util::observable::Handler;
use weir_util::provider::{Collector, Provider};
use weir_util::safe_queue::SafeQueue;
use weir_util::scheduler::Scheduler;
use weir_util::sync;
use weir_util::task::Task;
use weir_util::time::Timestamp;
use weir_util::types::Type;
use weir_util::worker::Worker;

use crate::channel::Channel;
use crate::device::{Device, DeviceBase, device_anchor, device_service};
use crate::mem_recorder::MemRecorder;
use crate::records::PlayableRecord;

const CHANNEL_END: &str = "end";
const SCHEDULER_NAME: &str = "scheduler";
const DEFAULT_QUEUE_LIMIT: usize = 128;

pub struct Player {
    base: DeviceBase,
    this: Weak<Player>,
    running: AtomicBool,
    ended: AtomicBool,

    provider_path: Mutex<String>,
    provider: Mutex<Option<Arc<dyn Provider<PlayableRecord>>>>,
    collector: Arc<Collector<PlayableRecord>>,
    worker: Worker,
    /// Recreated on every start; terminated on stop to unblock everyone.
    queue: Mutex<Arc<SafeQueue<PlayableRecord>>>,
    queue_limit: AtomicUsize,

    scheduler: Mutex<Option<Arc<Scheduler>>>,
    /// Configured `alias → destination channel path` pairs.
    aliases: Mutex<BTreeMap<String, String>>,
    /// Resolved at start.
    destinations: Mutex<HashMap<String, Arc<Channel>>>,
    first_timestamp: Mutex<Option<Timestamp>>,
    end_channel: Mutex<Option<Arc<Channel>>>,

    /// Records handed to the scheduler; only the worker writes this.
    scheduled: AtomicUsize,
    /// Records whose replay completed, written by the scheduler thread.
    played: AtomicUsize,
}

// === impl Player ===

impl Player {
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Player> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Player>| {
            let anchor: Weak<dyn Anchor> = this.clone();
            Player {
                base: DeviceBase::new(name, anchor),
                this: this.clone(),
                running: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                provider_path: Mutex::new(String::new()),
                provider: Mutex::new(None),
                collector: Arc::new(Collector::new()),
                worker: Worker::new(),
                queue: Mutex::new(Arc::new(SafeQueue::new())),
                queue_limit: AtomicUsize::new(DEFAULT_QUEUE_LIMIT),
                scheduler: Mutex::new(None),
                aliases: Mutex::new(BTreeMap::new()),
                destinations: Mutex::new(HashMap::new()),
                first_timestamp: Mutex::new(None),
                end_channel: Mutex::new(None),
                scheduled: AtomicUsize::new(0),
                played: AtomicUsize::new(0),
            }
        })
    }

    /// Installs the provider directly, overriding any configured path.
    pub fn set_provider(&self, provider: Arc<dyn Provider<PlayableRecord>>) {
        *sync::lock(&self.provider) = Some(provider);
    }

    /// Declares one `ALIAS=DEST_CHANNEL_PATH` replay pair.
    pub fn add_alias(&self, conf: &str) -> Result<(), ConfigError> {
        let Some((alias, path)) = conf.split_once('=') else {
            tracing::error!(
                device = %self.named().full_name(),
                conf,
                "wrong replay configuration, expected ALIAS=CHANNEL_PATH",
            );
            return Err(ConfigError::InvalidValue {
                key: "record".to_owned(),
                value: conf.to_owned(),
            });
        };
        sync::lock(&self.aliases).insert(alias.to_owned(), path.to_owned());
        Ok(())
    }

    /// Bound of the collector→scheduler queue.
    pub fn set_queue_limit(&self, limit: usize) {
        self.queue_limit.store(limit.max(1), Ordering::Release);
    }

    /// Whether the provider's stream ended and everything queued has played.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn queue(&self) -> Arc<SafeQueue<PlayableRecord>> {
        sync::lock(&self.queue).clone()
    }

    /// The worker thread body: pull records through the collector, queue and
    /// schedule each one, and retire with an end pulse once the stream is
    /// over and every scheduled record has played. Only the worker provides
    /// and schedules, so "nothing in flight" is its own local knowledge.
    fn collect_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            match self.collector.collect() {
                Some(record) => self.enqueue(record),
                None => {
                    // an exhausted provider ends the stream even when it
                    // never produced a single record
                    let stream_over = !self.collector.can_collect();
                    let drained = self.played.load(Ordering::Acquire)
                        >= self.scheduled.load(Ordering::Acquire);
                    if stream_over && drained {
                        if !self.ended.swap(true, Ordering::AcqRel) {
                            self.finish();
                        }
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Queues one record (blocking on the bound) and schedules its replay.
    fn enqueue(&self, record: PlayableRecord) {
        let delay = {
            let mut first = sync::lock(&self.first_timestamp);
            let first = *first.get_or_insert(record.timestamp);
            record.timestamp.saturating_since(first)
        };

        let queue = self.queue();
        if !queue.wait_for_space(self.queue_limit.load(Ordering::Acquire)) {
            return;
        }
        if queue.push(record).is_err() {
            return;
        }

        let Some(scheduler) = sync::lock(&self.scheduler).clone() else {
            return;
        };
        let this = self.this.clone();
        scheduler.add_task(Arc::new(
            Task::new(move || {
                if let Some(player) = this.upgrade() {
                    player.play_next();
                }
                true
            })
            .after(delay),
        ));
        self.scheduled.fetch_add(1, Ordering::AcqRel);
    }

    /// Scheduler task body: pop the front record and write it into its
    /// destination.
    fn play_next(&self) {
        if let Some(record) = self.queue().try_pop() {
            let destination = sync::lock(&self.destinations).get(&record.name).cloned();
            match destination {
                Some(destination) => {
                    if let Err(error) = destination.write_array(&record.value) {
                        tracing::warn!(
                            device = %self.named().full_name(),
                            alias = %record.name,
                            %error,
                            "replayed write failed",
                        );
                    }
                }
                None => tracing::warn!(
                    device = %self.named().full_name(),
                    alias = %record.name,
                    "no destination channel for alias",
                ),
            }
        }
        self.played.fetch_add(1, Ordering::AcqRel);
    }

    /// End of stream: pulse `end` and let the worker retire.
    fn finish(&self) {
        tracing::debug!(device = %self.named().full_name(), "playback ended");
        if let Some(end) = sync::lock(&self.end_channel).clone()
            && let Err(error) = end.write(0, true)
        {
            tracing::warn!(device = %self.named().full_name(), %error, "could not pulse end channel");
        }
        self.running.store(false, Ordering::Release);
    }
}

impl Device for Player {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn on_init(&self) -> bool {
        // the scheduler is a child service: the device cascade starts and
        // stops it around this device's own hooks
        let scheduler = Scheduler::new(SCHEDULER_NAME);
        if !self.base.node().add_child(&scheduler, true) {
            return false;
        }
        *sync::lock(&self.scheduler) = Some(scheduler);

        if sync::lock(&self.provider).is_none() {
            let path = sync::lock(&self.provider_path).clone();
            let found = self
                .named()
                .find(&path)
                .and_then(downcast_arc::<MemRecorder>);
            let Some(store) = found else {
                tracing::error!(
                    device = %self.named().full_name(),
                    path = %path,
                    "record provider not found",
                );
                return false;
            };
            *sync::lock(&self.provider) = Some(store);
        }

        self.base
            .container()
            .add_unlinked_channel(CHANNEL_END, Type::Bool, 1, true);
        true
    }

    fn on_start(&self) -> bool {
        let container = self.base.container();
        let Some(end_channel) = container.get_channel(CHANNEL_END) else {
            return false;
        };
        *sync::lock(&self.end_channel) = Some(end_channel);

        {
            let mut destinations = sync::lock(&self.destinations);
            for (alias, path) in sync::lock(&self.aliases).iter() {
                let Some(channel) = container.find_channel(path) else {
                    tracing::error!(
                        device = %self.named().full_name(),
                        alias = %alias,
                        path = %path,
                        "destination channel not found",
                    );
                    return false;
                };
                destinations.insert(alias.clone(), channel);
            }
        }

        let Some(provider) = sync::lock(&self.provider).clone() else {
            tracing::error!(device = %self.named().full_name(), "no provider to play from");
            return false;
        };
        self.collector.set_provider(provider);

        *sync::lock(&self.queue) = Arc::new(SafeQueue::new());
        *sync::lock(&self.first_timestamp) = None;
        self.scheduled.store(0, Ordering::Release);
        self.played.store(0, Ordering::Release);
        self.ended.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.worker.start(self.named().name(), move || {
            this.collect_loop();
            true
        })
    }

    fn on_stop(&self) -> bool {
        self.running.store(false, Ordering::Release);
        self.queue().terminate();
        self.worker.stop();
        // unplayed tasks must not survive into a later start: they would pop
        // from a queue that no longer holds their records
        if let Some(scheduler) = sync::lock(&self.scheduler).clone() {
            scheduler.clear_tasks();
        }
        sync::lock(&self.destinations).clear();
        *sync::lock(&self.end_channel) = None;
        true
    }

    fn on_reset(&self) -> bool {
        sync::lock(&self.aliases).clear();
        *sync::lock(&self.provider) = None;
        sync::lock(&self.provider_path).clear();
        *sync::lock(&self.scheduler) = None;
        *sync::lock(&self.first_timestamp) = None;
        true
    }
}

impl Handler<Channel> for Player {
    fn handle(&self, _sender: &Channel) {}
}

impl Configurable for Player {
    fn set_conf(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "provider" => {
                *sync::lock(&self.provider_path) = value.to_owned();
                Ok(())
            }
            "record" => self.add_alias(value),
            other => Err(ConfigError::UnknownKey(other.to_owned())),
        }
    }
}

device_anchor!(Player);
device_service!(Player, |device: &Player| device
    .running
    .load(Ordering::Acquire));

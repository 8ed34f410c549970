// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The capture device.
//!
//! Observes a configured set of channels under aliases and forwards every
//! notification as `(alias, timestamp, payload clone)` to a [`RecordSink`],
//! then bumps its `records` counter channel so consumers can watch progress
//! without polling. Coalesced writes never notify, so they are never
//! captured: a recording cannot distinguish "idle" from "unchanged", which
//! is exactly what makes replays faithful.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weir_util::config::{ConfigError, Configurable};
use weir_util::named::{Anchor, downcast_arc};
use weir_util::observable::Handler;
use weir_util::sync;
use weir_util::types::Type;

use crate::channel::Channel;
use crate::device::{Device, DeviceBase, device_anchor, device_service};
use crate::mem_recorder::MemRecorder;
use crate::records::RecordSink;

const CHANNEL_RECORDS: &str = "records";

pub struct Recorder {
    base: DeviceBase,
    this: Weak<Recorder>,
    running: AtomicBool,
    /// Configured `alias → channel path` pairs.
    aliases: Mutex<BTreeMap<String, String>>,
    sink_path: Mutex<String>,
    sink: Mutex<Option<Arc<dyn RecordSink>>>,
    /// Resolved at start: observed channel (by address) → alias.
    observed: Mutex<HashMap<usize, String>>,
    records_channel: Mutex<Option<Arc<Channel>>>,
    records: AtomicU32,
}

// === impl Recorder ===

impl Recorder {
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Recorder> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Recorder>| {
            let anchor: Weak<dyn Anchor> = this.clone();
            Recorder {
                base: DeviceBase::new(name, anchor),
                this: this.clone(),
                running: AtomicBool::new(false),
                aliases: Mutex::new(BTreeMap::new()),
                sink_path: Mutex::new(String::new()),
                sink: Mutex::new(None),
                observed: Mutex::new(HashMap::new()),
                records_channel: Mutex::new(None),
                records: AtomicU32::new(0),
            }
        })
    }

    /// Installs the sink directly, overriding any configured path.
    pub fn set_sink(&self, sink: Arc<dyn RecordSink>) {
        *sync::lock(&self.sink) = Some(sink);
    }

    /// Declares one `ALIAS=CHANNEL_PATH` capture pair.
    pub fn add_recorded_channel(&self, conf: &str) -> Result<(), ConfigError> {
        let Some((alias, path)) = conf.split_once('=') else {
            tracing::error!(
                device = %self.named().full_name(),
                conf,
                "wrong record configuration, expected ALIAS=CHANNEL_PATH",
            );
            return Err(ConfigError::InvalidValue {
                key: "record".to_owned(),
                value: conf.to_owned(),
            });
        };
        sync::lock(&self.aliases).insert(alias.to_owned(), path.to_owned());
        Ok(())
    }

    pub fn remove_recorded_channel(&self, alias: &str) {
        sync::lock(&self.aliases).remove(alias);
    }

    /// Captures forwarded to the sink since the last reset.
    pub fn record_count(&self) -> u32 {
        self.records.load(Ordering::Acquire)
    }
}

impl Device for Recorder {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn on_init(&self) -> bool {
        if sync::lock(&self.sink).is_none() {
            let path = sync::lock(&self.sink_path).clone();
            let found = self
                .named()
                .find(&path)
                .and_then(downcast_arc::<MemRecorder>);
            let Some(store) = found else {
                tracing::error!(
                    device = %self.named().full_name(),
                    path = %path,
                    "record sink not found",
                );
                return false;
            };
            *sync::lock(&self.sink) = Some(store);
        }
        self.base
            .container()
            .add_unlinked_channel(CHANNEL_RECORDS, Type::UInt, 1, true);
        true
    }

    fn on_start(&self) -> bool {
        let container = self.base.container();
        let Some(records_channel) = container.get_channel(CHANNEL_RECORDS) else {
            return false;
        };
        *sync::lock(&self.records_channel) = Some(records_channel);

        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let observer: Arc<dyn Handler<Channel>> = this;
        let mut observed = sync::lock(&self.observed);
        for (alias, path) in sync::lock(&self.aliases).iter() {
            let Some(channel) = container.find_channel(path) else {
                tracing::error!(
                    device = %self.named().full_name(),
                    alias = %alias,
                    path = %path,
                    "channel to record not found",
                );
                return false;
            };
            observed.insert(Arc::as_ptr(&channel) as usize, alias.clone());
            container.observe_channel(&observer, &channel);
        }
        drop(observed);

        self.running.store(true, Ordering::Release);
        true
    }

    fn on_stop(&self) -> bool {
        self.running.store(false, Ordering::Release);
        sync::lock(&self.observed).clear();
        *sync::lock(&self.records_channel) = None;
        true
    }

    fn on_reset(&self) -> bool {
        self.records.store(0, Ordering::Release);
        *sync::lock(&self.sink) = None;
        true
    }
}

impl Handler<Channel> for Recorder {
    fn handle(&self, sender: &Channel) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let address = std::ptr::from_ref(sender) as usize;
        let Some(alias) = sync::lock(&self.observed).get(&address).cloned() else {
            return;
        };
        if let Some(sink) = sync::lock(&self.sink).clone() {
            sink.record(&alias, sender);
        }

        let count = self.records.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(records_channel) = sync::lock(&self.records_channel).clone()
            && let Err(error) = records_channel.write(0, count)
        {
            tracing::warn!(
                device = %self.named().full_name(),
                %error,
                "could not bump the records counter",
            );
        }
    }
}

impl Configurable for Recorder {
    fn set_conf(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "handler" => {
                *sync::lock(&self.sink_path) = value.to_owned();
                Ok(())
            }
            "record" => self.add_recorded_channel(value),
            "unrecord" => {
                self.remove_recorded_channel(value);
                Ok(())
            }
            other => Err(ConfigError::UnknownKey(other.to_owned())),
        }
    }
}

device_anchor!(Recorder);
device_service!(Recorder, |device: &Recorder| device
    .running
    .load(Ordering::Acquire));

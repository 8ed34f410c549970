// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The in-memory record store.
//!
//! A [`MemRecorder`] is both the canonical [`RecordSink`] (a recorder device
//! feeds it captures) and a [`Provider`] of [`PlayableRecord`]s (a player
//! drains it in timestamp order). With `stop_providing_when_empty` set, the
//! provider signals end of stream once drained — that is how a finite replay
//! terminates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weir_util::config::{ConfigError, Configurable, parse_bool};
use weir_util::named::{Anchor, Named};
use weir_util::provider::Provider;
use weir_util::service::{Service, ServiceController};
use weir_util::sync;

use crate::channel::Channel;
use crate::records::{PlayableRecord, RecordSink, RecordStore};

pub struct MemRecorder {
    named: Named,
    controller: ServiceController,
    store: Mutex<RecordStore>,
    providing: AtomicBool,
    running: AtomicBool,
    stop_when_empty: AtomicBool,
}

// === impl MemRecorder ===

impl MemRecorder {
    /// Creates a detached store. Setup and Init are optional; `start()`
    /// (which opens providing) is legal immediately.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<MemRecorder> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<MemRecorder>| {
            let this: Weak<dyn Anchor> = this.clone();
            let controller = ServiceController::new();
            controller.optional_setup();
            controller.optional_init();
            MemRecorder {
                named: Named::new(name, this),
                controller,
                store: Mutex::new(RecordStore::new()),
                providing: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop_when_empty: AtomicBool::new(false),
            }
        })
    }

    pub fn named(&self) -> &Named {
        &self.named
    }

    /// When set, `providing()` turns false once the store drains.
    pub fn set_stop_providing_when_empty(&self, active: bool) {
        self.stop_when_empty.store(active, Ordering::Release);
    }

    pub fn add_record(&self, record: PlayableRecord) {
        sync::lock(&self.store).insert(record);
    }

    pub fn add_records(&self, records: impl IntoIterator<Item = PlayableRecord>) {
        let mut store = sync::lock(&self.store);
        for record in records {
            store.insert(record);
        }
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.store).len()
    }

    pub fn is_empty(&self) -> bool {
        sync::lock(&self.store).is_empty()
    }

    pub fn clear(&self) {
        sync::lock(&self.store).clear();
    }

    /// Captured records per alias, in playback order. Test and inspection
    /// aid.
    pub fn recorded_values(&self) -> Vec<(String, PlayableRecord)> {
        sync::lock(&self.store)
            .iter()
            .map(|record| (record.name.clone(), record.clone()))
            .collect()
    }
}

impl RecordSink for MemRecorder {
    fn record(&self, alias: &str, channel: &Channel) {
        self.add_record(PlayableRecord::capture(alias, channel));
    }
}

impl Provider<PlayableRecord> for MemRecorder {
    fn providing(&self) -> bool {
        self.providing.load(Ordering::Acquire)
    }

    fn provide(&self) -> Option<PlayableRecord> {
        let mut store = sync::lock(&self.store);
        let record = store.pop_first();
        if store.is_empty() && self.stop_when_empty.load(Ordering::Acquire) {
            self.providing.store(false, Ordering::Release);
        }
        record
    }
}

impl Service for MemRecorder {
    fn controller(&self) -> Option<&ServiceController> {
        Some(&self.controller)
    }

    fn service_name(&self) -> String {
        self.named.full_name()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn do_start(&self) -> bool {
        self.running.store(true, Ordering::Release);
        self.providing.store(true, Ordering::Release);
        true
    }

    fn do_stop(&self) -> bool {
        self.providing.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        true
    }

    fn do_reset(&self) -> bool {
        self.clear();
        true
    }
}

impl Configurable for MemRecorder {
    fn set_conf(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "stop_providing_when_empty" => {
                self.set_stop_providing_when_empty(parse_bool(key, value)?);
                Ok(())
            }
            other => Err(ConfigError::UnknownKey(other.to_owned())),
        }
    }
}

impl Anchor for MemRecorder {
    fn named(&self) -> &Named {
        &self.named
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn description(&self) -> String {
        format!("{} records", self.len())
    }
}

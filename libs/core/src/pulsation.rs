// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The heartbeat device.
//!
//! Declares `heartbeat: uint[1]` and `activate: bool[1]` (both linkable) and
//! steps at the configured `frequency`, incrementing the beat counter while
//! `activate` holds true. The beat counter continues from whatever value the
//! (possibly linked) heartbeat channel already holds.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weir_util::config::{ConfigError, Configurable, parse_value};
use weir_util::named::Anchor;
use weir_util::observable::Handler;
use weir_util::sync;
use weir_util::types::Type;
use weir_util::worker::{Runnable, StepWorker};

use crate::channel::Channel;
use crate::device::{Device, DeviceBase, device_anchor, device_service};

const CHANNEL_HEARTBEAT: &str = "heartbeat";
const CHANNEL_ACTIVATE: &str = "activate";

pub struct Pulsation {
    base: DeviceBase,
    this: Weak<Pulsation>,
    step: StepWorker,
    beats: AtomicU32,
    heartbeat: Mutex<Option<Arc<Channel>>>,
    activate: Mutex<Option<Arc<Channel>>>,
}

// === impl Pulsation ===

impl Pulsation {
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Pulsation> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Pulsation>| {
            let anchor: Weak<dyn Anchor> = this.clone();
            Pulsation {
                base: DeviceBase::new(name, anchor),
                this: this.clone(),
                step: StepWorker::new(),
                beats: AtomicU32::new(0),
                heartbeat: Mutex::new(None),
                activate: Mutex::new(None),
            }
        })
    }

    pub fn set_frequency(&self, hz: f64) -> bool {
        self.step.set_frequency(hz)
    }

    pub fn frequency(&self) -> f64 {
        self.step.frequency()
    }

    fn this(&self) -> Option<Arc<Pulsation>> {
        self.this.upgrade()
    }
}

impl Device for Pulsation {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn on_init(&self) -> bool {
        let container = self.base.container();
        container.add_unlinked_channel(CHANNEL_HEARTBEAT, Type::UInt, 1, true);
        container.add_unlinked_channel(CHANNEL_ACTIVATE, Type::Bool, 1, true);
        true
    }

    fn on_start(&self) -> bool {
        if self.step.frequency() == 0.0 {
            tracing::error!(
                device = %self.named().full_name(),
                "cannot start without a frequency configured",
            );
            return false;
        }
        let container = self.base.container();
        let Some(heartbeat) = container.get_channel(CHANNEL_HEARTBEAT) else {
            return false;
        };
        let Some(activate) = container.get_channel(CHANNEL_ACTIVATE) else {
            return false;
        };
        let Some(this) = self.this() else {
            return false;
        };

        self.beats
            .store(heartbeat.read::<u32>(0).unwrap_or(0), Ordering::Release);

        let observer: Arc<dyn Handler<Channel>> = this.clone();
        container.observe_channel(&observer, &activate);
        if activate.read::<bool>(0) != Ok(true) {
            self.step.pause();
        }

        *sync::lock(&self.heartbeat) = Some(heartbeat);
        *sync::lock(&self.activate) = Some(activate);

        if !self.step.start(self.named().name(), this) {
            tracing::error!(device = %self.named().full_name(), "could not start");
            return false;
        }
        true
    }

    fn on_stop(&self) -> bool {
        let stopped = self.step.stop();
        *sync::lock(&self.heartbeat) = None;
        *sync::lock(&self.activate) = None;
        if !stopped {
            tracing::error!(device = %self.named().full_name(), "could not stop");
        }
        stopped
    }

    fn on_reset(&self) -> bool {
        self.beats.store(0, Ordering::Release);
        true
    }
}

impl Runnable for Pulsation {
    fn run(&self) -> bool {
        let beats = self.beats.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(heartbeat) = sync::lock(&self.heartbeat).as_ref()
            && let Err(error) = heartbeat.write(0, beats)
        {
            tracing::warn!(device = %self.named().full_name(), %error, "missed a beat");
        }
        true
    }
}

impl Handler<Channel> for Pulsation {
    fn handle(&self, sender: &Channel) {
        let is_activate = sync::lock(&self.activate)
            .as_ref()
            .is_some_and(|activate| std::ptr::eq(Arc::as_ptr(activate), sender));
        if !is_activate {
            return;
        }
        if sender.read::<bool>(0) == Ok(true) {
            self.step.resume();
        } else {
            self.step.pause();
        }
    }
}

impl Configurable for Pulsation {
    fn set_conf(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "frequency" => {
                let hz: f64 = parse_value(key, value)?;
                if self.set_frequency(hz) {
                    Ok(())
                } else {
                    Err(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        value: value.to_owned(),
                    })
                }
            }
            other => Err(ConfigError::UnknownKey(other.to_owned())),
        }
    }
}

device_anchor!(Pulsation);
device_service!(Pulsation, |device: &Pulsation| device.step.is_running());

#[cfg(test)]
mod tests {
    use super::*;
    use weir_util::observable::FnHandler;
    use crate::device::Core;
    use crate::waiter::ChannelWaiter;
    use std::time::Duration;
    use weir_util::service::Service;

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    fn pulsation_beats_once(core: &Arc<Core>) {
        let pulsation = Pulsation::new("pulsation");
        // 1000 Hz = 1 beat per millisecond
        pulsation.configure("frequency=1000.0").unwrap();
        assert!(core.node().add_child(&pulsation, true));

        assert!(core.init());
        assert!(core.start());

        let activate = pulsation.base().container().get_channel("activate").unwrap();
        let beat = pulsation.base().container().get_channel("heartbeat").unwrap();

        {
            let waiter = ChannelWaiter::new(&beat);
            activate.write(0, true).unwrap();
            // at 1 kHz, four beats take ~4 ms; allow a full second
            assert!(waiter.wait_for_count(Duration::from_secs(1), 4));
        }

        let first = beat.read::<u32>(0).unwrap();
        assert!(first >= 4);

        // deactivating pauses the beat
        activate.write(0, false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let paused_at = beat.read::<u32>(0).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(beat.read::<u32>(0).unwrap(), paused_at);

        assert!(core.stop());
        assert!(core.reset());
    }

    #[test]
    fn beats_while_activated_and_survives_reset() {
        let _trace = init_tracing();
        let core = Core::new("core");
        pulsation_beats_once(&core);
        // after reset the tree is empty and the cycle works again
        assert_eq!(core.node().child_count(), 0);
        pulsation_beats_once(&core);
    }

    #[test]
    fn start_without_frequency_fails() {
        let core = Core::new("core");
        let pulsation = Pulsation::new("pulsation");
        core.node().add_child(&pulsation, true);
        assert!(core.init());
        assert!(!core.start());
    }

    #[test]
    fn increasing_beat_values_reach_observers_in_order() {
        let pulsation = Pulsation::new("pulsation");
        pulsation.configure("frequency=1000.0").unwrap();
        assert!(pulsation.init());
        assert!(pulsation.start());

        let beat = pulsation.base().container().get_channel("heartbeat").unwrap();
        let activate = pulsation.base().container().get_channel("activate").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn Handler<Channel>> = {
            let seen = seen.clone();
            Arc::new(FnHandler(move |chan: &Channel| {
                sync::lock(&seen).push(chan.read::<u32>(0).unwrap());
            }))
        };
        beat.add_observer(&observer);

        let waiter = ChannelWaiter::new(&beat);
        activate.write(0, true).unwrap();
        assert!(waiter.wait_for_count(Duration::from_secs(1), 4));
        assert!(pulsation.stop());

        let seen = sync::lock(&seen);
        assert!(seen.len() >= 4);
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "beats must increase by one");
        }
    }
}

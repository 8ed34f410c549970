// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sampling device.
//!
//! Copies configured input channels to output channels at a fixed rate.
//! Between ticks, notifications only mark an input dirty; the tick itself
//! copies each dirty input's current bytes to its output, so several writes
//! inside one period collapse into a single output write carrying the
//! latest value. The dirty set is swapped out before copying — a slow copy
//! never blocks new notifications.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weir_util::config::{ConfigError, Configurable, parse_value};
use weir_util::named::Anchor;
use weir_util::observable::Handler;
use weir_util::sync;
use weir_util::worker::{Runnable, StepWorker};

use crate::channel::Channel;
use crate::device::{Device, DeviceBase, device_anchor, device_service};

pub struct Sampler {
    base: DeviceBase,
    this: Weak<Sampler>,
    step: StepWorker,
    running: AtomicBool,
    /// Configured `out path → in path` pairs.
    pairs: Mutex<BTreeMap<String, String>>,
    /// Resolved at start: input channel (by address) → (input, output).
    wires: Mutex<HashMap<usize, (Arc<Channel>, Arc<Channel>)>>,
    /// Inputs written since the last tick, by address.
    dirty: Mutex<HashSet<usize>>,
}

// === impl Sampler ===

impl Sampler {
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Sampler> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Sampler>| {
            let anchor: Weak<dyn Anchor> = this.clone();
            Sampler {
                base: DeviceBase::new(name, anchor),
                this: this.clone(),
                step: StepWorker::new(),
                running: AtomicBool::new(false),
                pairs: Mutex::new(BTreeMap::new()),
                wires: Mutex::new(HashMap::new()),
                dirty: Mutex::new(HashSet::new()),
            }
        })
    }

    pub fn set_frequency(&self, hz: f64) -> bool {
        self.step.set_frequency(hz)
    }

    /// Declares one `OUT_PATH=IN_PATH` sampling pair.
    pub fn add_sample(&self, conf: &str) -> Result<(), ConfigError> {
        let Some((out_path, in_path)) = conf.split_once('=') else {
            tracing::error!(
                device = %self.named().full_name(),
                conf,
                "wrong sampling configuration, expected OUT_PATH=IN_PATH",
            );
            return Err(ConfigError::InvalidValue {
                key: "sample".to_owned(),
                value: conf.to_owned(),
            });
        };
        sync::lock(&self.pairs).insert(out_path.to_owned(), in_path.to_owned());
        Ok(())
    }
}

impl Device for Sampler {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn on_start(&self) -> bool {
        let container = self.base.container();
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let observer: Arc<dyn Handler<Channel>> = this.clone();

        let mut ok = true;
        {
            let mut wires = sync::lock(&self.wires);
            for (out_path, in_path) in sync::lock(&self.pairs).iter() {
                let (Some(input), Some(output)) = (
                    container.find_channel(in_path),
                    container.find_channel(out_path),
                ) else {
                    tracing::error!(
                        device = %self.named().full_name(),
                        input = %in_path,
                        output = %out_path,
                        "cannot resolve sampling pair",
                    );
                    ok = false;
                    continue;
                };
                container.observe_channel(&observer, &input);
                wires.insert(Arc::as_ptr(&input) as usize, (input, output));
            }
        }

        if ok && !self.step.start(self.named().name(), this) {
            tracing::error!(device = %self.named().full_name(), "could not start worker");
            return false;
        }
        self.running.store(ok, Ordering::Release);
        ok
    }

    fn on_stop(&self) -> bool {
        self.running.store(false, Ordering::Release);
        if !self.step.stop() {
            tracing::error!(device = %self.named().full_name(), "could not stop worker");
        }
        sync::lock(&self.wires).clear();
        sync::lock(&self.dirty).clear();
        true
    }

    fn on_reset(&self) -> bool {
        sync::lock(&self.pairs).clear();
        true
    }
}

impl Runnable for Sampler {
    fn run(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        // swap the dirty set out so new notifications land while we copy
        let dirty = std::mem::take(&mut *sync::lock(&self.dirty));
        if dirty.is_empty() {
            return true;
        }
        let wires = sync::lock(&self.wires);
        for address in dirty {
            let Some((input, output)) = wires.get(&address) else {
                continue;
            };
            if let Err(error) = output.write_channel(input) {
                tracing::warn!(
                    device = %self.named().full_name(),
                    output = %output.named().full_name(),
                    %error,
                    "sample copy failed",
                );
            }
        }
        true
    }
}

impl Handler<Channel> for Sampler {
    fn handle(&self, sender: &Channel) {
        let address = std::ptr::from_ref(sender) as usize;
        if sync::lock(&self.wires).contains_key(&address) {
            sync::lock(&self.dirty).insert(address);
        }
    }
}

impl Configurable for Sampler {
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
            "sample" => self.add_sample(value),
            other => Err(ConfigError::UnknownKey(other.to_owned())),
        }
    }
}

device_anchor!(Sampler);
device_service!(Sampler, |device: &Sampler| device
    .running
    .load(Ordering::Acquire));

#[cfg(test)]
mod tests {
    use super::*;
    use weir_util::observable::FnHandler;
    use crate::device::Core;
    use crate::waiter::ChannelWaiter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use weir_util::array::Array;
    use weir_util::service::Service;
    use weir_util::types::Type;

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn samples_collapse_to_the_latest_value() {
        let _trace = init_tracing();
        let core = Core::new("core");
        let sampler = Sampler::new("sampler");
        sampler.configure("frequency=100.0").unwrap();
        sampler
            .configure("sample=..out_channel=..in_channel")
            .unwrap();
        core.node().add_child(&sampler, true);

        core.add_channel("in_channel", Type::Int, 3).unwrap();
        core.add_channel("out_channel", Type::Int, 3).unwrap();

        assert!(core.init());
        assert!(core.start());

        let input = core.get_channel("in_channel").unwrap();
        let output = core.get_channel("out_channel").unwrap();

        let notifications = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Handler<Channel>> = {
            let notifications = notifications.clone();
            Arc::new(FnHandler(move |_: &Channel| {
                notifications.fetch_add(1, Ordering::SeqCst);
            }))
        };
        output.add_observer(&observer);

        let waiter = ChannelWaiter::new(&output);
        input.write_array(&Array::from_values(&[0i32, 0, 1])).unwrap();
        assert!(waiter.wait_for(Duration::from_secs(1)));
        assert_eq!(output.clone_array().to_vec::<i32>().unwrap(), vec![0, 0, 1]);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // three quick writes inside one period: one output write, latest value
        input.write_array(&Array::from_values(&[1i32, 2, 3])).unwrap();
        input.write_array(&Array::from_values(&[2i32, 3, 4])).unwrap();
        input.write_array(&Array::from_values(&[3i32, 4, 5])).unwrap();
        assert!(waiter.wait_for(Duration::from_secs(1)));
        assert_eq!(output.clone_array().to_vec::<i32>().unwrap(), vec![3, 4, 5]);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);

        assert!(core.stop());
    }

    #[test]
    fn unresolved_pairs_fail_start() {
        let core = Core::new("core");
        let sampler = Sampler::new("sampler");
        sampler.configure("frequency=100.0").unwrap();
        sampler.configure("sample=..missing_out=..missing_in").unwrap();
        core.node().add_child(&sampler, true);

        assert!(core.init());
        assert!(!core.start());
    }

    #[test]
    fn sample_configuration_needs_two_paths() {
        let sampler = Sampler::new("sampler");
        assert!(sampler.set_conf("sample", "only_one_path").is_err());
        assert!(matches!(
            sampler.set_conf("nope", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Devices: channel containers with a service lifecycle.
//!
//! A device cascades every lifecycle operation over its children in
//! insertion order before running its own `on_*` hook. Start additionally
//! resolves the declarative links once all child services run; a failed
//! start stops the already-started children in reverse order, leaving the
//! subtree as it was found. Stop first detaches every channel observation
//! the device installed. Reset cascades, then removes all children — owned
//! ones are destroyed — and is best-effort: every child is attempted and
//! children are cleared even when some child failed.
//!
//! Setup is optional for devices: `init()` is legal straight from `None`.
//! Devices build their channels in `on_init`, which makes start time the
//! moment the graph can be wired.

use std::sync::{Arc, Weak};

use weir_util::named::Anchor;
use weir_util::observable::Handler;
use weir_util::service::{Service, ServiceController, ServiceState};

use crate::channel::Channel;
use crate::container::ChannelContainer;

/// The container + controller pair every device embeds.
pub struct DeviceBase {
    container: ChannelContainer,
    controller: ServiceController,
}

/// A channel container with a lifecycle and channel notifications.
///
/// Implementors supply [`Device::base`] and the `on_*` hooks; the
/// [`Service`] impl (see [`device_service!`]) routes `do_*` through the
/// cascade helpers here.
pub trait Device: Anchor + Service + Handler<Channel> {
    fn base(&self) -> &DeviceBase;

    fn on_setup(&self) -> bool {
        true
    }

    fn on_init(&self) -> bool {
        true
    }

    fn on_start(&self) -> bool {
        true
    }

    fn on_stop(&self) -> bool {
        true
    }

    fn on_reset(&self) -> bool {
        true
    }
}

// === impl DeviceBase ===

impl DeviceBase {
    /// Creates the base for the composite `this`. Setup is declared
    /// optional on the controller.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>, this: Weak<dyn Anchor>) -> Self {
        let controller = ServiceController::new();
        controller.optional_setup();
        Self {
            container: ChannelContainer::new(name, this),
            controller,
        }
    }

    pub fn container(&self) -> &ChannelContainer {
        &self.container
    }

    pub fn controller(&self) -> &ServiceController {
        &self.controller
    }

    pub fn node(&self) -> &weir_util::node::Node {
        self.container.node()
    }

    pub fn state(&self) -> ServiceState {
        self.controller.state()
    }
}

impl Drop for DeviceBase {
    /// A root-positioned device dropped while still Running stops its child
    /// services. The concrete device is already gone at this point, so only
    /// the cascade runs — no `on_stop` hook.
    fn drop(&mut self) {
        if self.node().named().parent().is_some() {
            return;
        }
        if self.controller.state() != ServiceState::Running {
            return;
        }
        tracing::warn!(
            device = %self.node().named().name(),
            "device dropped while running; stopping child services",
        );
        for child in self.node().children() {
            if let Some(service) = child.service()
                && service.is_running()
            {
                service.stop();
            }
        }
    }
}

// === cascade helpers ===

/// Applies `op` to every child service in insertion order; stops at the
/// first failure.
fn cascade(device: &dyn Device, op: fn(&dyn Service) -> bool, label: &str) -> bool {
    let node = device.base().node();
    for name in node.children_keys() {
        let Some(child) = node.get_child(&name) else {
            continue;
        };
        let Some(service) = child.service() else {
            continue;
        };
        if !op(service) {
            tracing::error!(
                device = %node.named().full_name(),
                child = %name,
                operation = %label,
                "child service failed",
            );
            return false;
        }
    }
    true
}

pub(crate) fn run_setup(device: &dyn Device) -> bool {
    cascade(device, |s: &dyn Service| s.setup(), "setup") && device.on_setup()
}

pub(crate) fn run_init(device: &dyn Device) -> bool {
    cascade(device, |s: &dyn Service| s.init(), "init") && device.on_init()
}

/// Start cascade: children first, then link resolution, then the hook. On
/// failure every already-started child is stopped again in reverse start
/// order.
pub(crate) fn run_start(device: &dyn Device) -> bool {
    let node = device.base().node();
    let mut started: Vec<Arc<dyn Anchor>> = Vec::new();
    let mut ok = true;

    for name in node.children_keys() {
        let Some(child) = node.get_child(&name) else {
            continue;
        };
        let child_ok = {
            let Some(service) = child.service() else {
                continue;
            };
            service.start()
        };
        if child_ok {
            started.push(child);
        } else {
            tracing::error!(
                device = %node.named().full_name(),
                child = %name,
                "could not start child service",
            );
            ok = false;
            break;
        }
    }

    ok = ok && node.resolve_links();

    if !ok {
        for child in started.iter().rev() {
            if let Some(service) = child.service() {
                service.stop();
            }
        }
        return false;
    }

    device.on_start()
}

/// Stop cascade: observations first, then every child service (all of them,
/// even after a failure), then the hook.
pub(crate) fn run_stop(device: &dyn Device) -> bool {
    device.base().container().remove_channels_observation();

    let node = device.base().node();
    let mut ok = true;
    for name in node.children_keys() {
        let Some(child) = node.get_child(&name) else {
            continue;
        };
        if let Some(service) = child.service()
            && !service.stop()
        {
            tracing::error!(
                device = %node.named().full_name(),
                child = %name,
                "could not stop child service",
            );
            ok = false;
        }
    }
    device.on_stop() && ok
}

/// Reset cascade, best-effort: every child is attempted, children are
/// removed regardless, failures only taint the verdict.
pub(crate) fn run_reset(device: &dyn Device) -> bool {
    let node = device.base().node();
    let mut ok = true;
    for name in node.children_keys() {
        let Some(child) = node.get_child(&name) else {
            continue;
        };
        if let Some(service) = child.service()
            && !service.reset()
        {
            tracing::error!(
                device = %node.named().full_name(),
                child = %name,
                "could not reset child service",
            );
            ok = false;
        }
    }
    node.remove_children();
    device.on_reset() && ok
}

/// Implements [`Anchor`] for a device type by delegating to its
/// [`DeviceBase`].
macro_rules! device_anchor {
    ($ty:ty) => {
        impl weir_util::named::Anchor for $ty {
            fn named(&self) -> &weir_util::named::Named {
                $crate::device::Device::base(self).node().named()
            }

            fn node(&self) -> Option<&weir_util::node::Node> {
                Some($crate::device::Device::base(self).node())
            }

            fn service(&self) -> Option<&dyn weir_util::service::Service> {
                Some(self)
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }

            fn as_any_arc(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn std::any::Any + Send + Sync> {
                self
            }

            fn description(&self) -> String {
                $crate::device::Device::base(self).state().to_string()
            }

            fn on_check_link(
                &self,
                name: &str,
                child: &std::sync::Arc<dyn weir_util::named::Anchor>,
            ) -> bool {
                $crate::device::Device::base(self)
                    .container()
                    .check_link(name, child)
            }
        }
    };
}

/// Implements [`Service`] for a device type: the controller comes from the
/// base, `do_*` run the device cascades. The second form overrides
/// `is_running` (the default is the Running controller state).
macro_rules! device_service {
    ($ty:ty) => {
        device_service!($ty, |device: &$ty| {
            $crate::device::Device::base(device).state()
                == weir_util::service::ServiceState::Running
        });
    };
    ($ty:ty, $is_running:expr) => {
        impl weir_util::service::Service for $ty {
            fn controller(&self) -> Option<&weir_util::service::ServiceController> {
                Some($crate::device::Device::base(self).controller())
            }

            fn service_name(&self) -> String {
                weir_util::named::Anchor::named(self).full_name()
            }

            fn is_running(&self) -> bool {
                ($is_running)(self)
            }

            fn do_setup(&self) -> bool {
                $crate::device::run_setup(self)
            }

            fn do_init(&self) -> bool {
                $crate::device::run_init(self)
            }

            fn do_start(&self) -> bool {
                $crate::device::run_start(self)
            }

            fn do_stop(&self) -> bool {
                $crate::device::run_stop(self)
            }

            fn do_reset(&self) -> bool {
                $crate::device::run_reset(self)
            }
        }
    };
}

pub(crate) use device_anchor;
pub(crate) use device_service;

/// The plain concrete device: a root (or grouping) container with no
/// behavior of its own.
pub struct Core {
    base: DeviceBase,
}

// === impl Core ===

impl Core {
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Core> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Core>| {
            let this: Weak<dyn Anchor> = this.clone();
            Core {
                base: DeviceBase::new(name, this),
            }
        })
    }

    pub fn node(&self) -> &weir_util::node::Node {
        self.base.node()
    }

    pub fn container(&self) -> &ChannelContainer {
        self.base.container()
    }

    pub fn add_channel(
        &self,
        name: &str,
        ty: weir_util::types::Type,
        len: usize,
    ) -> Option<Arc<Channel>> {
        self.base.container().add_channel(name, ty, len)
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.base.container().get_channel(name)
    }

    pub fn tree_str(&self) -> String {
        self.node().tree_str()
    }
}

impl Device for Core {
    fn base(&self) -> &DeviceBase {
        &self.base
    }
}

impl Handler<Channel> for Core {
    fn handle(&self, _sender: &Channel) {}
}

device_anchor!(Core);
device_service!(Core);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::ChannelWaiter;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use weir_util::config::Configurable;
    use weir_util::named::downcast_arc;
    use weir_util::node::Node;
    use weir_util::sync;
    use weir_util::types::Type;

    struct SomeDevice {
        base: DeviceBase,
        running: AtomicBool,
        /// Element count declared for the linked channel `c2`.
        c2_len: usize,
    }

    impl SomeDevice {
        fn new(name: &str, c2_len: usize) -> Arc<SomeDevice> {
            Arc::new_cyclic(|this: &Weak<SomeDevice>| {
                let anchor: Weak<dyn Anchor> = this.clone();
                SomeDevice {
                    base: DeviceBase::new(name, anchor),
                    running: AtomicBool::new(false),
                    c2_len,
                }
            })
        }

        fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
            self.base.container().get_channel(name)
        }
    }

    impl Device for SomeDevice {
        fn base(&self) -> &DeviceBase {
            &self.base
        }

        fn on_init(&self) -> bool {
            let container = self.base.container();
            container.add_channel("c1", Type::Byte, 1);
            // deferred when `c2` is declared as a link
            container.add_unlinked_channel("c2", Type::Int, self.c2_len, true);
            true
        }

        fn on_start(&self) -> bool {
            self.running.store(true, Ordering::SeqCst);
            true
        }

        fn on_stop(&self) -> bool {
            self.running.store(false, Ordering::SeqCst);
            true
        }
    }

    impl Handler<Channel> for SomeDevice {
        fn handle(&self, _sender: &Channel) {}
    }

    device_anchor!(SomeDevice);
    device_service!(SomeDevice, |device: &SomeDevice| device
        .running
        .load(Ordering::SeqCst));

    #[test]
    fn lifecycle_wires_links_at_start_and_clears_at_reset() {
        let root = Node::new("root");
        let declared = Channel::new("declared_channel", Type::Int, 1);
        root.add_child(&declared, true);
        let extra = Channel::new("extra_channel", Type::Double, 1);
        root.add_child(&extra, true);

        let device = SomeDevice::new("device", 1);
        root.add_child(&device, true);
        device.base().node().add_link("c2", "..declared_channel");
        device.base().node().add_link("c3", "..extra_channel");

        assert!(device.get_channel("c1").is_none());
        assert!(device.get_channel("c2").is_none());
        assert!(device.get_channel("c3").is_none());

        // init creates the unlinked channels only
        assert!(device.init());
        assert!(device.get_channel("c1").is_some());
        assert!(device.get_channel("c2").is_none());
        assert!(device.get_channel("c3").is_none());

        // start resolves the links
        assert!(device.start());
        assert!(device.is_running());
        assert!(device.get_channel("c1").is_some());
        let c2 = device.get_channel("c2").unwrap();
        assert!(Arc::ptr_eq(&c2, &declared));
        assert!(device.get_channel("c3").is_some());
        // the linked channel kept its own parent
        assert_eq!(c2.named().full_name(), "root.declared_channel");

        // stop keeps the tree, reset clears it
        assert!(device.stop());
        assert!(device.get_channel("c2").is_some());
        assert!(device.reset());
        assert!(device.get_channel("c1").is_none());
        assert!(device.get_channel("c2").is_none());
        assert!(device.get_channel("c3").is_none());
    }

    #[test]
    fn mismatched_link_shape_fails_start() {
        let root = Node::new("root");
        let declared = Channel::new("declared_channel", Type::Int, 1);
        root.add_child(&declared, true);

        // the device declares c2 as int[2]; the link target is int[1]
        let device = SomeDevice::new("device", 2);
        root.add_child(&device, true);
        device.base().node().add_link("c2", "..declared_channel");

        assert!(device.init());
        assert!(!device.start());
        assert_eq!(device.state(), weir_util::service::ServiceState::Error);
        // nothing was wired or observed
        assert!(device.get_channel("c2").is_none());
        assert_eq!(device.base().container().observation_count(), 0);
        assert_eq!(declared.observer_count(), 0);
    }

    #[test]
    fn failed_child_start_unwinds_started_children() {
        let core = Core::new("core");
        let good = crate::pulsation::Pulsation::new("good");
        good.configure("frequency=1000.0").unwrap();
        core.node().add_child(&good, true);
        // no frequency: this child's start fails
        let bad = crate::pulsation::Pulsation::new("bad");
        core.node().add_child(&bad, true);

        assert!(core.init());
        assert!(!core.start());
        // the good child was started, then stopped again in the unwind
        assert!(!good.is_running());
    }

    #[test]
    fn children_cascade_in_insertion_order() {
        let core = Core::new("core");
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Probe {
            base: DeviceBase,
            label: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Device for Probe {
            fn base(&self) -> &DeviceBase {
                &self.base
            }

            fn on_init(&self) -> bool {
                sync::lock(&self.order).push(self.label);
                true
            }
        }

        impl Handler<Channel> for Probe {
            fn handle(&self, _sender: &Channel) {}
        }

        device_anchor!(Probe);
        device_service!(Probe);

        for label in ["first", "second", "third"] {
            let order = order.clone();
            let probe = Arc::new_cyclic(|this: &Weak<Probe>| {
                let anchor: Weak<dyn Anchor> = this.clone();
                Probe {
                    base: DeviceBase::new(label, anchor),
                    label,
                    order,
                }
            });
            core.node().add_child(&probe, true);
        }

        assert!(core.init());
        assert_eq!(*sync::lock(&order), vec!["first", "second", "third"]);
    }

    #[test]
    fn linked_heartbeat_pulses_through_the_link() {
        // wire a pulsation's heartbeat onto a pre-declared root channel
        let core = Core::new("core");
        core.add_channel("beat", Type::UInt, 1).unwrap();
        let pulsation = crate::pulsation::Pulsation::new("pulsation");
        pulsation.configure("frequency=500.0").unwrap();
        core.node().add_child(&pulsation, true);
        pulsation
            .base()
            .node()
            .add_link("heartbeat", "..beat");

        assert!(core.init());
        assert!(core.start());

        let beat = core.get_channel("beat").unwrap();
        let linked = downcast_arc::<Channel>(
            pulsation.base().node().get_child("heartbeat").unwrap(),
        )
        .unwrap();
        assert!(Arc::ptr_eq(&beat, &linked));

        let waiter = ChannelWaiter::new(&beat);
        pulsation
            .base()
            .container()
            .get_channel("activate")
            .unwrap()
            .write(0, true)
            .unwrap();
        assert!(waiter.wait_for_count(std::time::Duration::from_secs(1), 3));

        assert!(core.stop());
    }
}

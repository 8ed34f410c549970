// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Channel-owning tree nodes.
//!
//! A container creates channels as owned children — or, when a name is
//! declared as a link, records the expected shape instead and leaves the
//! actual channel to link resolution. The recorded expectation is what
//! `check_link` holds a resolved target against: a strict declaration
//! rejects a channel whose element type or length disagrees.
//!
//! The container also keeps a ledger of every observer registration it
//! installed, so a lifecycle Stop can detach them all at once: after
//! [`ChannelContainer::remove_channels_observation`] no channel observes the
//! container any more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use weir_util::named::{Anchor, downcast_arc};
use weir_util::node::Node;
use weir_util::observable::Handler;
use weir_util::sync;
use weir_util::types::Type;

use crate::channel::Channel;

pub struct ChannelContainer {
    node: Node,
    expectations: Mutex<HashMap<String, Expectation>>,
    observed: Mutex<Vec<Observation>>,
}

/// The declared shape of a channel deferred to link resolution.
#[derive(Debug, Clone, Copy)]
struct Expectation {
    ty: Type,
    len: usize,
    strict: bool,
}

struct Observation {
    channel: Arc<Channel>,
    observer: Weak<dyn Handler<Channel>>,
}

// === impl ChannelContainer ===

impl ChannelContainer {
    /// Creates the container component of a composite resident.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>, this: Weak<dyn Anchor>) -> Self {
        Self {
            node: Node::embedded(name, this),
            expectations: Mutex::new(HashMap::new()),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Creates a channel as an owned child. `None` (with an error log) when
    /// the name is invalid or already taken.
    pub fn add_channel(&self, name: &str, ty: Type, len: usize) -> Option<Arc<Channel>> {
        if !weir_util::named::is_valid_name(name) || ty == Type::None {
            tracing::error!(
                container = %self.node.named().full_name(),
                channel = %name,
                "invalid channel declaration",
            );
            return None;
        }
        let channel = Channel::new(name, ty, len);
        if !self.node.add_child(&channel, true) {
            tracing::error!(
                container = %self.node.named().full_name(),
                channel = %name,
                "cannot add channel",
            );
            return None;
        }
        Some(channel)
    }

    /// The declarative-wiring primitive: when `name` is declared as a link
    /// on this container, no channel is created — the expected shape is
    /// recorded for link resolution and `None` is returned. Otherwise this
    /// is [`ChannelContainer::add_channel`].
    pub fn add_unlinked_channel(
        &self,
        name: &str,
        ty: Type,
        len: usize,
        check_match: bool,
    ) -> Option<Arc<Channel>> {
        if self.node.is_link(name) {
            sync::lock(&self.expectations).insert(
                name.to_owned(),
                Expectation {
                    ty,
                    len,
                    strict: check_match,
                },
            );
            return None;
        }
        self.add_channel(name, ty, len)
    }

    /// Resolves `path` relative to this container to a channel.
    pub fn find_channel(&self, path: &str) -> Option<Arc<Channel>> {
        let found = self.node.named().find(path)?;
        let channel = downcast_arc::<Channel>(found);
        if channel.is_none() {
            tracing::error!(
                container = %self.node.named().full_name(),
                path,
                "found node is not a channel",
            );
        }
        channel
    }

    /// The direct child channel `name`.
    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        downcast_arc::<Channel>(self.node.get_child(name)?)
    }

    /// Registers `observer` on `channel` and records the registration so
    /// Stop can undo it.
    pub fn observe_channel(
        &self,
        observer: &Arc<dyn Handler<Channel>>,
        channel: &Arc<Channel>,
    ) -> bool {
        if channel.add_observer(observer) {
            sync::lock(&self.observed).push(Observation {
                channel: channel.clone(),
                observer: Arc::downgrade(observer),
            });
        }
        true
    }

    /// [`ChannelContainer::observe_channel`] by direct child name.
    pub fn observe_channel_named(
        &self,
        observer: &Arc<dyn Handler<Channel>>,
        name: &str,
    ) -> bool {
        let Some(channel) = self.get_channel(name) else {
            tracing::error!(
                container = %self.node.named().full_name(),
                channel = %name,
                "cannot find channel to observe",
            );
            return false;
        };
        self.observe_channel(observer, &channel)
    }

    /// Detaches every observer this container installed.
    pub fn remove_channels_observation(&self) {
        let observations = std::mem::take(&mut *sync::lock(&self.observed));
        for observation in observations {
            if let Some(observer) = observation.observer.upgrade() {
                observation.channel.remove_observer(&observer);
            }
        }
    }

    /// The `on_check_link` verdict for this container: non-channels pass,
    /// channels with no recorded expectation pass, strict expectations
    /// require the exact element type and length.
    pub fn check_link(&self, name: &str, child: &Arc<dyn Anchor>) -> bool {
        let Some(channel) = child.as_any().downcast_ref::<Channel>() else {
            return true;
        };
        let Some(expectation) = sync::lock(&self.expectations).get(name).copied() else {
            return true;
        };
        if !expectation.strict {
            return true;
        }

        let mut ok = true;
        if expectation.ty != channel.ty() {
            tracing::error!(
                container = %self.node.named().full_name(),
                link = %name,
                expected = %expectation.ty,
                actual = %channel.ty(),
                "linked channel has the wrong element type",
            );
            ok = false;
        }
        if expectation.len != channel.len() {
            tracing::error!(
                container = %self.node.named().full_name(),
                link = %name,
                expected = expectation.len,
                actual = channel.len(),
                "linked channel has the wrong length",
            );
            ok = false;
        }
        ok
    }

    /// Number of live observer registrations installed by this container.
    pub fn observation_count(&self) -> usize {
        sync::lock(&self.observed).len()
    }
}

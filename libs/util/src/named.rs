// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tree residency and hierarchical addressing.
//!
//! Everything that lives in the runtime tree implements [`Anchor`] and embeds
//! a [`Named`]: a validated name, a weak reference to itself (so the tree can
//! hand out `Arc`s) and a weak reference to its parent. Paths use `.` as the
//! segment separator; a leading `/` anchors at the root, a leading `.` means
//! "start here" and every further leading `.` steps up one parent before the
//! descent begins.

use std::any::Any;
use std::sync::{Arc, RwLock, Weak};

use crate::node::Node;
use crate::service::Service;
use crate::sync;

/// The path segment separator.
pub const SEPARATOR: char = '.';

/// A resident of the runtime tree.
///
/// The accessors with `Option` returns are capability probes: a plain channel
/// is not a [`Node`] and not a [`Service`], a device is all three.
pub trait Anchor: Send + Sync + 'static {
    fn named(&self) -> &Named;

    /// The node facet, if this resident can hold children.
    fn node(&self) -> Option<&Node> {
        None
    }

    /// The service facet, if this resident has a lifecycle.
    fn service(&self) -> Option<&dyn Service> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// One-line description used by tree dumps.
    fn description(&self) -> String {
        String::new()
    }

    /// Veto hook consulted before a link resolves onto this resident under
    /// `name`. Containers override it to enforce declared channel shapes.
    fn on_check_link(&self, _name: &str, _child: &Arc<dyn Anchor>) -> bool {
        true
    }
}

/// The name-and-parent component embedded by every [`Anchor`].
pub struct Named {
    name: String,
    this: Weak<dyn Anchor>,
    parent: RwLock<Weak<dyn Anchor>>,
}

/// Whether `name` can be used as a tree name: non-empty and free of the path
/// characters `.` and `/`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATOR) && !name.contains('/')
}

/// Downcasts a tree resident to its concrete type.
pub fn downcast_arc<T: Anchor>(anchor: Arc<dyn Anchor>) -> Option<Arc<T>> {
    anchor.as_any_arc().downcast::<T>().ok()
}

// === impl Named ===

impl Named {
    /// Creates the component for the resident `this`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name (see [`is_valid_name`]);
    /// names are compile-time constants or validated configuration by the
    /// time they reach a constructor.
    pub fn new(name: impl Into<String>, this: Weak<dyn Anchor>) -> Self {
        let name = name.into();
        assert!(is_valid_name(&name), "invalid tree name: '{name}'");
        Self {
            name,
            this,
            parent: RwLock::new(Weak::<Node>::new()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resident owning this component. `None` only while the owner is
    /// being dropped.
    pub fn this(&self) -> Option<Arc<dyn Anchor>> {
        self.this.upgrade()
    }

    pub fn parent(&self) -> Option<Arc<dyn Anchor>> {
        sync::read(&self.parent).upgrade()
    }

    /// Attaches to `parent`. A resident may be inserted into at most one
    /// parent; re-attaching to the same parent is a no-op, anything else
    /// fails.
    pub(crate) fn set_parent(&self, parent: &Arc<dyn Anchor>) -> bool {
        let mut slot = sync::write(&self.parent);
        if let Some(current) = slot.upgrade() {
            return Arc::ptr_eq(&current, parent);
        }
        *slot = Arc::downgrade(parent);
        true
    }

    pub(crate) fn clear_parent(&self) {
        *sync::write(&self.parent) = Weak::<Node>::new();
    }

    /// The dotted path from the root down to this resident.
    pub fn full_name(&self) -> String {
        let mut segments = vec![self.name.clone()];
        let mut ancestor = self.parent();
        while let Some(current) = ancestor {
            segments.push(current.named().name().to_owned());
            ancestor = current.named().parent();
        }
        segments.reverse();
        segments.join(".")
    }

    /// The topmost ancestor, or the resident itself when detached.
    pub fn root(&self) -> Option<Arc<dyn Anchor>> {
        let mut current = self.this()?;
        while let Some(parent) = current.named().parent() {
            current = parent;
        }
        Some(current)
    }

    /// Whether this resident's entry in its parent is owning.
    pub fn is_owned_by_parent(&self) -> bool {
        match (self.parent(), self.this()) {
            (Some(parent), Some(this)) => parent
                .node()
                .is_some_and(|node| node.has_ownership(&this) == Some(true)),
            _ => false,
        }
    }

    /// Resolves `path` relative to this resident.
    ///
    /// Returns `None` on any missing segment, on stepping above the root or
    /// on descending through a resident with no node facet. Never panics.
    pub fn find(&self, path: &str) -> Option<Arc<dyn Anchor>> {
        let mut current = self.this()?;
        let rest = if let Some(stripped) = path.strip_prefix('/') {
            current = self.root()?;
            stripped
        } else {
            // the first leading `.` is "start here", each further one climbs
            let mut rest = path;
            let mut first = true;
            while let Some(stripped) = rest.strip_prefix(SEPARATOR) {
                if !first {
                    current = current.named().parent()?;
                }
                first = false;
                rest = stripped;
            }
            rest
        };

        for segment in rest.split(SEPARATOR).filter(|s| !s.is_empty()) {
            current = current.node()?.get_child(segment)?;
        }
        Some(current)
    }
}

impl core::fmt::Debug for Named {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Named")
            .field("name", &self.name)
            .field("full_name", &self.full_name())
            .finish()
    }
}

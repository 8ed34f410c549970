// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tree nodes: ordered children, ownership flags and deferred links.
//!
//! A link is a declared, non-owning reference from a local name to a target
//! path somewhere else in the tree. Links stay pending until
//! [`Node::resolve_links`] installs the target as a non-owning child — the
//! target keeps its real parent, the installing node only gains an entry.
//! Structural mutation is not safe under concurrency; tree shape changes
//! belong to the Setup/Init/Reset lifecycle phases.

use std::any::Any;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, Weak};

use crate::named::{Anchor, Named, is_valid_name};
use crate::sync;

pub struct Node {
    named: Named,
    children: Mutex<Vec<ChildEntry>>,
    links: Mutex<Vec<Link>>,
}

struct ChildEntry {
    name: String,
    child: Arc<dyn Anchor>,
    /// Owning entries drop their child with the node; linked entries never
    /// own and never reparent.
    owned: bool,
    linked: bool,
}

struct Link {
    name: String,
    target: String,
}

/// Accounting for one sweep of [`Node::resolve_links`].
struct Pass {
    ok: bool,
    resolved: usize,
}

impl Default for Pass {
    fn default() -> Self {
        Self {
            ok: true,
            resolved: 0,
        }
    }
}

// === impl Node ===

impl Node {
    /// Creates a standalone node.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Node> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Node>| {
            let this: Weak<dyn Anchor> = this.clone();
            Node::embedded(name, this)
        })
    }

    /// Creates the node component of a composite resident: `this` is the
    /// composite that embeds the node and answers for it in the tree.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn embedded(name: impl Into<String>, this: Weak<dyn Anchor>) -> Node {
        Node {
            named: Named::new(name, this),
            children: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn named(&self) -> &Named {
        &self.named
    }

    /// Inserts `child` under its own name, reparenting it. Fails (with a
    /// warning) when the name is taken, the name is invalid, or the child
    /// already has a different parent.
    pub fn add_child(&self, child: &Arc<impl Anchor>, owned: bool) -> bool {
        let anchor: Arc<dyn Anchor> = child.clone();
        self.add_child_anchor(anchor, owned)
    }

    pub fn add_child_anchor(&self, child: Arc<dyn Anchor>, owned: bool) -> bool {
        let name = child.named().name().to_owned();
        if !is_valid_name(&name) {
            tracing::warn!(node = %self.named.full_name(), child = %name, "invalid child name");
            return false;
        }
        let Some(this) = self.named.this() else {
            return false;
        };

        let mut children = sync::lock(&self.children);
        if children.iter().any(|entry| entry.name == name) {
            tracing::warn!(
                node = %self.named.full_name(),
                child = %name,
                "a child with this name already exists",
            );
            return false;
        }
        if !child.named().set_parent(&this) {
            tracing::warn!(
                node = %self.named.full_name(),
                child = %name,
                "child already has a parent",
            );
            return false;
        }
        children.push(ChildEntry {
            name,
            child,
            owned,
            linked: false,
        });
        true
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<dyn Anchor>> {
        sync::lock(&self.children)
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.child.clone())
    }

    /// Child names in insertion order.
    pub fn children_keys(&self) -> Vec<String> {
        sync::lock(&self.children)
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Child residents in insertion order.
    pub fn children(&self) -> Vec<Arc<dyn Anchor>> {
        sync::lock(&self.children)
            .iter()
            .map(|entry| entry.child.clone())
            .collect()
    }

    pub fn child_count(&self) -> usize {
        sync::lock(&self.children).len()
    }

    /// Removes the child entry under `name`. A reparented (non-linked) child
    /// is detached; a linked entry is simply dropped, its target keeps its
    /// real parent.
    pub fn remove_child(&self, name: &str) -> bool {
        let mut children = sync::lock(&self.children);
        let Some(index) = children.iter().position(|entry| entry.name == name) else {
            return false;
        };
        let entry = children.remove(index);
        if !entry.linked {
            entry.child.named().clear_parent();
        }
        true
    }

    /// Removes every child entry; owned children are dropped with their last
    /// reference. Link declarations stay — their installed entries vanish, so
    /// they are pending again.
    pub fn remove_children(&self) {
        let entries = std::mem::take(&mut *sync::lock(&self.children));
        for entry in &entries {
            if !entry.linked {
                entry.child.named().clear_parent();
            }
        }
    }

    /// Whether the entry holding `child` is owning; `None` when `child` is
    /// not a child of this node.
    pub fn has_ownership(&self, child: &Arc<dyn Anchor>) -> Option<bool> {
        sync::lock(&self.children)
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.child, child))
            .map(|entry| entry.owned)
    }

    pub fn set_child_ownership(&self, name: &str, owned: bool) -> bool {
        let mut children = sync::lock(&self.children);
        match children.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.owned = owned;
                true
            }
            None => false,
        }
    }

    /// Declares a link from `name` to `target_path`. One declaration per
    /// local name; a second one fails.
    pub fn add_link(&self, name: impl Into<String>, target_path: impl Into<String>) -> bool {
        let name = name.into();
        let mut links = sync::lock(&self.links);
        if links.iter().any(|link| link.name == name) {
            tracing::warn!(
                node = %self.named.full_name(),
                link = %name,
                "a link with this name is already declared",
            );
            return false;
        }
        links.push(Link {
            name,
            target: target_path.into(),
        });
        true
    }

    /// Whether `name` is declared as a link on this node.
    pub fn is_link(&self, name: &str) -> bool {
        sync::lock(&self.links).iter().any(|link| link.name == name)
    }

    /// Declared links as `(local name, target path)` pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        sync::lock(&self.links)
            .iter()
            .map(|link| (link.name.clone(), link.target.clone()))
            .collect()
    }

    /// Resolves every pending link on this node and every node reachable
    /// below it. A link is pending while no child entry exists under its
    /// local name. Chains — a link whose target path runs through another
    /// link's installed child — resolve in one call: the walk repeats until
    /// a pass makes no progress. Returns false if any link stays
    /// unresolved — because the target path does not resolve or the owner's
    /// `on_check_link` vetoes it — but keeps everything that did resolve.
    pub fn resolve_links(&self) -> bool {
        let Some(this) = self.named.this() else {
            return false;
        };
        loop {
            let mut pass = Pass::default();
            let mut visited = HashSet::new();
            Self::resolve_links_from(&this, &mut visited, &mut pass);
            if pass.ok {
                return true;
            }
            if pass.resolved == 0 {
                return false;
            }
        }
    }

    fn resolve_links_from(
        anchor: &Arc<dyn Anchor>,
        visited: &mut HashSet<*const ()>,
        pass: &mut Pass,
    ) {
        if !visited.insert(Arc::as_ptr(anchor).cast::<()>()) {
            return;
        }
        let Some(node) = anchor.node() else {
            return;
        };

        node.resolve_own_links(anchor, pass);
        for child in node.children() {
            Self::resolve_links_from(&child, visited, pass);
        }
    }

    fn resolve_own_links(&self, owner: &Arc<dyn Anchor>, pass: &mut Pass) {
        let pending: Vec<(String, String)> = self
            .links()
            .into_iter()
            .filter(|(name, _)| self.get_child(name).is_none())
            .collect();

        for (name, target) in pending {
            let Some(found) = self.named.find(&target) else {
                tracing::error!(
                    node = %self.named.full_name(),
                    link = %name,
                    target = %target,
                    "link target not found",
                );
                pass.ok = false;
                continue;
            };
            if !owner.on_check_link(&name, &found) {
                pass.ok = false;
                continue;
            }
            if self.install_linked_child(&name, found) {
                pass.resolved += 1;
            } else {
                pass.ok = false;
            }
        }
    }

    fn install_linked_child(&self, name: &str, child: Arc<dyn Anchor>) -> bool {
        let mut children = sync::lock(&self.children);
        if children.iter().any(|entry| entry.name == name) {
            return false;
        }
        children.push(ChildEntry {
            name: name.to_owned(),
            child,
            owned: false,
            linked: true,
        });
        true
    }

    /// An indented dump of the subtree. Linked entries render as pointers to
    /// their target instead of expanding, so cyclic links stay printable.
    pub fn tree_str(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        let description = self
            .named
            .this()
            .map(|this| this.description())
            .unwrap_or_default();
        Self::write_line(out, depth, self.named.name(), &description);

        let entries: Vec<(String, Arc<dyn Anchor>, bool)> = sync::lock(&self.children)
            .iter()
            .map(|entry| (entry.name.clone(), entry.child.clone(), entry.linked))
            .collect();
        for (name, child, linked) in entries {
            if linked {
                let target = format!("-> {}", child.named().full_name());
                Self::write_line(out, depth + 1, &name, &target);
            } else if let Some(node) = child.node() {
                node.write_tree(out, depth + 1);
            } else {
                Self::write_line(out, depth + 1, &name, &child.description());
            }
        }
    }

    fn write_line(out: &mut String, depth: usize, name: &str, description: &str) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        if description.is_empty() {
            let _ = writeln!(out, "{name}");
        } else {
            let _ = writeln!(out, "{name} ({description})");
        }
    }
}

impl Anchor for Node {
    fn named(&self) -> &Named {
        &self.named
    }

    fn node(&self) -> Option<&Node> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.named.name())
            .field("children", &self.children_keys())
            .finish()
    }
}

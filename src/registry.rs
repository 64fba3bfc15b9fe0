//! Which editor is on screen right now.
//!
//! The network layer asks the registry for the displayed editor that matches a request's tool
//! so unsaved edits can be applied on the way out. Entries hold weak references only: a tab set
//! registers itself on creation, keeps the returned [`Registration`], and is removed from the
//! registry when it is dropped.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    editor::TabSet,
    http::{EditorContext, MessageKind, ToolSource},
};

struct Entry {
    tabs: Weak<TabSet>,
    kind: MessageKind,
    context: EditorContext,
}

#[derive(Default)]
pub struct EditorRegistry {
    entries: DashMap<Uuid, Entry>,
}

/// Deregisters its tab set when dropped.
pub struct Registration {
    id: Uuid,
    registry: Weak<EditorRegistry>,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl std::fmt::Debug for EditorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl EditorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start tracking `tabs`. The entry lives until the returned handle is dropped.
    pub fn register(self: &Arc<Self>, tabs: &Arc<TabSet>) -> Registration {
        let id = tabs.id();
        self.entries.insert(
            id,
            Entry {
                tabs: Arc::downgrade(tabs),
                kind: tabs.kind(),
                context: tabs.context().clone(),
            },
        );
        debug!(tabs = %id, kind = %tabs.kind(), tool = ?tabs.context().tool, "registered editor");
        Registration {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn deregister(&self, id: Uuid) {
        if self.entries.remove(&id).is_some() {
            debug!(tabs = %id, "deregistered editor");
        }
    }

    /// The displayed, live editor of `kind` created in `tool`.
    ///
    /// When several match, the one displayed most recently wins.
    pub fn find_displayed(&self, kind: MessageKind, tool: &ToolSource) -> Option<Arc<TabSet>> {
        // Upgrades happen outside the map: dropping the last strong reference here would
        // deregister, which needs the shard lock.
        let snapshot: Vec<(Uuid, Weak<TabSet>, bool)> = self
            .entries
            .iter()
            .map(|e| {
                let wanted = e.kind == kind && e.context.matches(tool);
                (*e.key(), e.tabs.clone(), wanted)
            })
            .collect();

        let mut dead = Vec::new();
        let mut best: Option<Arc<TabSet>> = None;

        for (id, weak, wanted) in snapshot {
            let Some(tabs) = weak.upgrade() else {
                dead.push(id);
                continue;
            };
            if !wanted {
                continue;
            }
            let Some(since) = tabs.displayed_since() else {
                continue;
            };
            let newer = best
                .as_ref()
                .and_then(|b| b.displayed_since())
                .is_none_or(|current| since > current);
            if newer {
                best = Some(tabs);
            }
        }

        for id in dead {
            trace!(tabs = %id, "pruning dead editor");
            self.entries.remove(&id);
        }
        best
    }

    /// Live registered editors.
    pub fn live(&self) -> Vec<Arc<TabSet>> {
        let weak: Vec<Weak<TabSet>> = self.entries.iter().map(|e| e.tabs.clone()).collect();
        weak.into_iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

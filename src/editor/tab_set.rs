use std::{
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    catalog::{CallbackCatalog, Direction},
    editor::{EditorSlot, UiDispatcher, Visibility, WidgetKind},
    error::CallbackSite,
    http::{EditorContext, EditorMode, HttpMessage, HttpService, MessageKind},
    registry::Registration,
    script::ScriptExecutor,
};

#[derive(Debug, Default)]
struct TabState {
    slots: Vec<Arc<EditorSlot>>,
    focused: Option<Uuid>,
    current: Option<(HttpMessage, HttpService)>,
    generation: u64,
}

/// Every editor slot of one message-editing surface.
///
/// One `TabSet` exists per editor the host opens. It is rebuilt from the catalog whenever the
/// script changes and refreshed whenever the host shows it a new message.
pub struct TabSet {
    id: Uuid,
    kind: MessageKind,
    context: EditorContext,
    widgets: WidgetKind,
    executor: Arc<ScriptExecutor>,
    ui: Arc<dyn UiDispatcher>,
    state: RwLock<TabState>,
    displayed_since: Mutex<Option<Instant>>,
    registration: Mutex<Option<Registration>>,
}

impl TabSet {
    pub fn new(
        kind: MessageKind,
        context: EditorContext,
        widgets: WidgetKind,
        executor: Arc<ScriptExecutor>,
        ui: Arc<dyn UiDispatcher>,
    ) -> Arc<Self> {
        let tabs = Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            context,
            widgets,
            executor,
            ui,
            state: RwLock::new(TabState::default()),
            displayed_since: Mutex::new(None),
            registration: Mutex::new(None),
        });
        let catalog = tabs.executor.catalog();
        tabs.rebuild(&catalog);
        tabs
    }

    fn read(&self) -> RwLockReadGuard<'_, TabState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TabState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn context(&self) -> &EditorContext {
        &self.context
    }

    /// Discard every slot and create fresh, hidden ones for the catalog's channels of this kind.
    pub fn rebuild(&self, catalog: &CallbackCatalog) {
        let editable_surface = self.context.mode != EditorMode::ReadOnly;
        let slots: Vec<Arc<EditorSlot>> = catalog
            .channels_for(self.kind)
            .enumerate()
            .map(|(position, channel)| {
                let editable = editable_surface && channel.editable();
                Arc::new(EditorSlot::new(
                    channel.clone(),
                    channel.label(position),
                    editable,
                    self.widgets.create(editable),
                    self.ui.clone(),
                ))
            })
            .collect();

        let mut state = self.write();
        debug!(tabs = %self.id, kind = %self.kind, slots = slots.len(), "rebuilt editor slots");
        state.slots = slots;
        state.focused = None;
        state.generation = self.executor.generation();
    }

    /// Rebuild from the executor's current catalog and re-run the last message, if any.
    pub fn reload(&self) -> Vec<Arc<EditorSlot>> {
        let catalog = self.executor.catalog();
        self.rebuild(&catalog);
        let current = self.read().current.clone();
        match current {
            Some((message, service)) => self.refresh(&message, &service),
            None => Vec::new(),
        }
    }

    /// Ask every slot's inbound callback for content and return the visible slots in order.
    ///
    /// A failing callback disables only its own slot. An empty message hides everything without
    /// calling the script.
    pub fn refresh(&self, message: &HttpMessage, service: &HttpService) -> Vec<Arc<EditorSlot>> {
        if self.read().generation != self.executor.generation() {
            let catalog = self.executor.catalog();
            self.rebuild(&catalog);
        }

        let slots = {
            let mut state = self.write();
            state.current = Some((message.clone(), service.clone()));
            state.slots.clone()
        };

        if message.is_empty() {
            for slot in &slots {
                slot.set_visibility(Visibility::Hidden);
            }
            self.write().focused = None;
            return Vec::new();
        }

        for slot in &slots {
            let channel = slot.channel();
            if !channel.has_inbound() {
                slot.set_visibility(Visibility::Hidden);
                continue;
            }

            let visibility = match self
                .executor
                .invoke_inbound(channel, &channel.name, message, service)
            {
                Ok(Some(content)) if !content.is_empty() => {
                    slot.set_content(content);
                    Visibility::Shown
                }
                Ok(_) => Visibility::Hidden,
                Err(e) => {
                    let site = CallbackSite {
                        kind: self.kind,
                        direction: Direction::Inbound,
                        channel: channel.name.clone(),
                    };
                    error!(
                        kind = %site.kind,
                        channel = %site.channel,
                        direction = %site.direction,
                        callback = channel.inbound.as_deref().unwrap_or_default(),
                        error = %e,
                        "{site} failed, disabling tab for this message"
                    );
                    Visibility::Disabled
                }
            };
            slot.set_visibility(visibility);
        }

        let visible: Vec<Arc<EditorSlot>> =
            slots.into_iter().filter(|s| s.is_visible()).collect();

        let mut state = self.write();
        if let Some(focused) = state.focused {
            if !visible.iter().any(|s| s.id() == focused) {
                state.focused = None;
            }
        }
        info!(tabs = %self.id, kind = %self.kind, visible = visible.len(), "refreshed editor tabs");
        visible
    }

    pub fn slots(&self) -> Vec<Arc<EditorSlot>> {
        self.read().slots.clone()
    }

    /// Visible slots in display order.
    pub fn visible_slots(&self) -> Vec<Arc<EditorSlot>> {
        self.read()
            .slots
            .iter()
            .filter(|s| s.is_visible())
            .cloned()
            .collect()
    }

    pub fn slot(&self, label: &str) -> Option<Arc<EditorSlot>> {
        self.read().slots.iter().find(|s| s.label() == label).cloned()
    }

    /// Focus the visible slot labelled `label`. Returns false when there is no such tab.
    pub fn select(&self, label: &str) -> bool {
        let mut state = self.write();
        let Some(id) = state
            .slots
            .iter()
            .find(|s| s.label() == label && s.is_visible())
            .map(|s| s.id())
        else {
            return false;
        };
        state.focused = Some(id);
        true
    }

    pub fn focused(&self) -> Option<Arc<EditorSlot>> {
        let state = self.read();
        let id = state.focused?;
        state.slots.iter().find(|s| s.id() == id).cloned()
    }

    /// The slot whose content should become the outgoing message.
    ///
    /// The focused slot if it is dirty, otherwise the first dirty visible slot in display order.
    /// When several unfocused slots are dirty the earliest one wins.
    pub fn authoritative_slot(&self) -> Option<Arc<EditorSlot>> {
        if let Some(focused) = self.focused() {
            if focused.is_visible() && focused.is_dirty() {
                return Some(focused);
            }
        }
        self.visible_slots().into_iter().find(|s| s.is_dirty())
    }

    pub fn is_modified(&self) -> bool {
        self.authoritative_slot().is_some()
    }

    /// Selected bytes of the authoritative slot, or of the focused one when nothing is dirty.
    pub fn selected_data(&self) -> Option<Vec<u8>> {
        self.authoritative_slot()
            .or_else(|| self.focused())
            .and_then(|s| s.selected_bytes())
    }

    /// The message and service last passed to [`refresh`](Self::refresh).
    pub fn current(&self) -> Option<(HttpMessage, HttpService)> {
        self.read().current.clone()
    }

    /// Record whether the host currently shows this editor.
    pub fn set_displayed(&self, displayed: bool) {
        let mut since = self
            .displayed_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *since = match (displayed, *since) {
            (true, Some(at)) => Some(at),
            (true, None) => Some(Instant::now()),
            (false, _) => None,
        };
    }

    pub fn is_displayed(&self) -> bool {
        self.displayed_since().is_some()
    }

    pub fn displayed_since(&self) -> Option<Instant> {
        *self
            .displayed_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep `registration` alive for as long as this tab set lives.
    pub(crate) fn attach(&self, registration: Registration) {
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
    }
}

impl std::fmt::Debug for TabSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabSet")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("slots", &self.read().slots.len())
            .finish()
    }
}

use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    catalog::Channel,
    editor::{EditorWidget, UiDispatcher},
};

/// Where a slot is in its edit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPhase {
    /// Never populated.
    Empty,
    /// Holds content from the last programmatic set.
    Populated,
    /// The user changed the content since the last programmatic set.
    Dirty,
}

/// Whether the slot shows a tab for the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Hidden,
    Shown,
    /// The inbound callback failed for the current message.
    Disabled,
}

#[derive(Debug)]
struct SlotState {
    phase: SlotPhase,
    content: Vec<u8>,
    visibility: Visibility,
    selection: Option<(usize, usize)>,
    /// sequence number of the last programmatic set
    set_seq: u64,
}

/// Live editor state of one channel for the message currently under edit.
///
/// Content, phase and visibility are authoritative here and readable from any thread. The
/// widget is only a mirror and is updated through the UI dispatcher.
pub struct EditorSlot {
    id: Uuid,
    channel: Channel,
    label: String,
    editable: bool,
    state: RwLock<SlotState>,
    widget: Arc<dyn EditorWidget>,
    /// last programmatic set the widget has actually received
    applied_seq: Arc<AtomicU64>,
    ui: Arc<dyn UiDispatcher>,
}

impl EditorSlot {
    /// `editable` is the channel's flag narrowed by the editor mode.
    pub fn new(
        channel: Channel,
        label: String,
        editable: bool,
        widget: Arc<dyn EditorWidget>,
        ui: Arc<dyn UiDispatcher>,
    ) -> Self {
        let slot = Self {
            id: Uuid::new_v4(),
            channel,
            label,
            editable,
            state: RwLock::new(SlotState {
                phase: SlotPhase::Empty,
                content: Vec::new(),
                visibility: Visibility::Hidden,
                selection: None,
                set_seq: 0,
            }),
            widget,
            applied_seq: Arc::new(AtomicU64::new(0)),
            ui,
        };
        let widget = slot.widget.clone();
        slot.ui.dispatch(Box::new(move || widget.set_editable(editable)));
        slot
    }

    fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn editable(&self) -> bool {
        self.editable
    }

    pub fn widget(&self) -> &Arc<dyn EditorWidget> {
        &self.widget
    }

    /// Programmatic set: the slot becomes `Populated` and is no longer dirty.
    ///
    /// The widget catches up once the UI runs the queued update. Until then its stale state is
    /// not synced back.
    pub fn set_content(&self, content: Vec<u8>) {
        let seq = {
            let mut state = self.write();
            state.content = content.clone();
            state.phase = SlotPhase::Populated;
            state.selection = None;
            state.set_seq += 1;
            state.set_seq
        };
        let widget = self.widget.clone();
        let applied = self.applied_seq.clone();
        self.ui.dispatch(Box::new(move || {
            widget.set_content(&content);
            applied.fetch_max(seq, Ordering::AcqRel);
        }));
    }

    /// Record a user edit. Ignored for slots that were never populated or cannot be edited.
    pub fn user_edit(&self, content: Vec<u8>) -> bool {
        let mut state = self.write();
        self.record_edit(&mut state, content)
    }

    fn record_edit(&self, state: &mut SlotState, content: Vec<u8>) -> bool {
        if !self.editable() {
            debug!(label = %self.label, "ignoring edit of read-only slot");
            return false;
        }
        if state.phase == SlotPhase::Empty {
            debug!(label = %self.label, "ignoring edit of empty slot");
            return false;
        }
        state.content = content;
        state.phase = SlotPhase::Dirty;
        true
    }

    /// Pull user edits and selection out of the widget. Call on the UI thread.
    ///
    /// Skipped while a programmatic set is still queued for the widget.
    pub fn sync_from_widget(&self) {
        let edited = self.widget.is_user_modified().then(|| self.widget.content());
        let selection = self.widget.selection_range();

        let mut state = self.write();
        if self.applied_seq.load(Ordering::Acquire) < state.set_seq {
            trace!(label = %self.label, "widget update pending, not syncing");
            return;
        }
        if let Some(content) = edited {
            if self.record_edit(&mut state, content) {
                trace!(label = %self.label, "synced user edit from widget");
            }
        }
        state.selection = selection;
    }

    pub fn content(&self) -> Vec<u8> {
        self.read().content.clone()
    }

    pub fn phase(&self) -> SlotPhase {
        self.read().phase
    }

    pub fn is_dirty(&self) -> bool {
        self.phase() == SlotPhase::Dirty
    }

    pub fn visibility(&self) -> Visibility {
        self.read().visibility
    }

    pub fn is_visible(&self) -> bool {
        self.visibility() == Visibility::Shown
    }

    pub(crate) fn set_visibility(&self, visibility: Visibility) {
        self.write().visibility = visibility;
    }

    /// Record a selection of `start..end`, clamped to the content.
    pub fn select(&self, start: usize, end: usize) {
        let mut state = self.write();
        let len = state.content.len();
        let (start, end) = (start.min(len), end.min(len));
        state.selection = (start < end).then_some((start, end));
    }

    pub fn selection(&self) -> Option<(usize, usize)> {
        self.read().selection
    }

    /// Bytes under the current selection.
    pub fn selected_bytes(&self) -> Option<Vec<u8>> {
        let state = self.read();
        let (start, end) = state.selection?;
        state.content.get(start..end).map(<[u8]>::to_vec)
    }
}

impl std::fmt::Debug for EditorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("EditorSlot")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("phase", &state.phase)
            .field("visibility", &state.visibility)
            .field("len", &state.content.len())
            .finish()
    }
}

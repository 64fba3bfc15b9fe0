//! Editor tabs: widgets, per-channel slots and the tab set that owns them.

pub mod slot;
pub mod tab_set;
pub mod ui;
pub mod widget;

pub use slot::{EditorSlot, SlotPhase, Visibility};
pub use tab_set::TabSet;
pub use ui::{ImmediateDispatcher, QueuedDispatcher, UiDispatcher, UiLoop, UiTask};
pub use widget::{BufferWidget, EditorWidget, HexWidget, WidgetKind};

//! Text editing surfaces.
//!
//! The host owns the real editing component; the core only needs it to hold bytes, tell
//! programmatic sets apart from user edits and report a selection. The in-memory widgets here
//! are what the CLI and the tests drive.

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, script::helpers};

/// An editing surface as seen by an [`EditorSlot`](super::EditorSlot).
pub trait EditorWidget: Send + Sync {
    /// Programmatic set. Clears the user-modified flag.
    fn set_content(&self, content: &[u8]);
    fn content(&self) -> Vec<u8>;
    /// True only for edits made by the user since the last [`set_content`](Self::set_content).
    fn is_user_modified(&self) -> bool;
    fn selection_range(&self) -> Option<(usize, usize)>;
    fn set_editable(&self, _editable: bool) {}
}

#[derive(Debug, Default)]
struct BufferState {
    content: Vec<u8>,
    modified: bool,
    selection: Option<(usize, usize)>,
    editable: bool,
}

/// Raw byte editor.
#[derive(Debug, Default)]
pub struct BufferWidget {
    state: Mutex<BufferState>,
}

impl BufferWidget {
    pub fn new(editable: bool) -> Self {
        Self {
            state: Mutex::new(BufferState {
                editable,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the user typing `content`. Ignored when the widget is read-only.
    pub fn user_edit(&self, content: &[u8]) -> bool {
        let mut state = self.state();
        if !state.editable {
            return false;
        }
        state.content = content.to_vec();
        state.modified = true;
        true
    }

    /// Select `start..end`, clamped to the content.
    pub fn select(&self, start: usize, end: usize) {
        let mut state = self.state();
        let len = state.content.len();
        let (start, end) = (start.min(len), end.min(len));
        state.selection = (start < end).then_some((start, end));
    }

    pub fn is_editable(&self) -> bool {
        self.state().editable
    }
}

impl EditorWidget for BufferWidget {
    fn set_content(&self, content: &[u8]) {
        let mut state = self.state();
        state.content = content.to_vec();
        state.modified = false;
        state.selection = None;
    }

    fn content(&self) -> Vec<u8> {
        self.state().content.clone()
    }

    fn is_user_modified(&self) -> bool {
        self.state().modified
    }

    fn selection_range(&self) -> Option<(usize, usize)> {
        self.state().selection
    }

    fn set_editable(&self, editable: bool) {
        self.state().editable = editable;
    }
}

const HEX_ROW: usize = 16;

fn hex_rows(bytes: &[u8]) -> String {
    bytes
        .chunks(HEX_ROW)
        .map(|row| {
            row.iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hex editor: shows bytes as rows of hex pairs and parses edited hex text back.
#[derive(Debug, Default)]
pub struct HexWidget {
    buffer: BufferWidget,
}

impl HexWidget {
    pub fn new(editable: bool) -> Self {
        Self {
            buffer: BufferWidget::new(editable),
        }
    }

    /// Current content rendered as hex, sixteen bytes per row.
    pub fn text(&self) -> String {
        hex_rows(&self.buffer.content())
    }

    /// Apply hex text typed by the user. Invalid hex leaves the content untouched.
    pub fn user_edit_text(&self, text: &str) -> Result<bool, String> {
        let bytes = helpers::from_hex(text)?;
        Ok(self.buffer.user_edit(&bytes))
    }

    /// Select whole bytes `start..end`.
    pub fn select(&self, start: usize, end: usize) {
        self.buffer.select(start, end);
    }
}

impl EditorWidget for HexWidget {
    fn set_content(&self, content: &[u8]) {
        self.buffer.set_content(content);
    }

    fn content(&self) -> Vec<u8> {
        self.buffer.content()
    }

    fn is_user_modified(&self) -> bool {
        self.buffer.is_user_modified()
    }

    fn selection_range(&self) -> Option<(usize, usize)> {
        self.buffer.selection_range()
    }

    fn set_editable(&self, editable: bool) {
        self.buffer.set_editable(editable);
    }
}

/// Which widget new slots get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
    #[default]
    Raw,
    Hex,
}

impl WidgetKind {
    pub fn create(&self, editable: bool) -> Arc<dyn EditorWidget> {
        match self {
            WidgetKind::Raw => Arc::new(BufferWidget::new(editable)),
            WidgetKind::Hex => Arc::new(HexWidget::new(editable)),
        }
    }

    /// Text a user of this widget would see for `bytes`.
    pub fn render(&self, bytes: &[u8]) -> String {
        match self {
            WidgetKind::Raw => String::from_utf8_lossy(bytes).into_owned(),
            WidgetKind::Hex => hex_rows(bytes),
        }
    }

    /// Bytes for text typed into this widget.
    pub fn parse_edit(&self, text: &str) -> Result<Vec<u8>, String> {
        match self {
            WidgetKind::Raw => Ok(text.as_bytes().to_vec()),
            WidgetKind::Hex => helpers::from_hex(text),
        }
    }
}

impl FromStr for WidgetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "" => Ok(WidgetKind::Raw),
            "hex" => Ok(WidgetKind::Hex),
            other => Err(ConfigError::Invalid {
                key: "SCALPEL_EDITOR".into(),
                reason: format!("unknown editor `{other}`, expected raw or hex"),
            }),
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetKind::Raw => f.write_str("raw"),
            WidgetKind::Hex => f.write_str("hex"),
        }
    }
}

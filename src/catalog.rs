//! Channel discovery from script callback names.
//!
//! A script exposes editor tabs purely through naming:
//!
//! | Callback                          | Meaning                                        |
//! |-----------------------------------|------------------------------------------------|
//! | `<kind>_edit_in[_<channel>]`      | produce initial editor content from a message  |
//! | `<kind>_edit_out[_<channel>]`     | produce a new message from edited content      |
//!
//! `<kind>` is `request` or `response`. A missing suffix is the unnamed channel `""`, which is
//! displayed with a positional label. Parsing is pure so the whole grammar is testable without
//! an engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::http::MessageKind;

pub const EDIT_INFIX: &str = "_edit_";
pub const IN_SUFFIX: &str = "in";
pub const OUT_SUFFIX: &str = "out";
const SEPARATOR: char = '_';

/// Which way a callback moves data between the message and the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// message -> editor content
    Inbound,
    /// editor content -> message
    Outbound,
}

impl Direction {
    fn suffix(&self) -> &'static str {
        match self {
            Direction::Inbound => IN_SUFFIX,
            Direction::Outbound => OUT_SUFFIX,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// The prefix every callback of `kind`/`direction` starts with, e.g. `request_edit_in`.
pub fn callback_prefix(kind: MessageKind, direction: Direction) -> String {
    format!("{}{}{}", kind.as_str(), EDIT_INFIX, direction.suffix())
}

/// A callback name that follows the editor naming convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackName {
    pub raw: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub channel: String,
}

impl CallbackName {
    /// Parse `raw`, returning `None` for names outside the convention.
    pub fn parse(raw: &str) -> Option<Self> {
        for kind in MessageKind::ALL {
            for direction in [Direction::Inbound, Direction::Outbound] {
                let prefix = callback_prefix(kind, direction);
                if let Some(rest) = raw.strip_prefix(prefix.as_str()) {
                    let channel = rest.strip_prefix(SEPARATOR).unwrap_or(rest);
                    return Some(Self {
                        raw: raw.to_string(),
                        kind,
                        direction,
                        channel: channel.to_string(),
                    });
                }
            }
        }
        None
    }
}

/// One editing capability, scoped to requests or responses.
///
/// The callback names are kept verbatim so the engine is always asked for a function that
/// actually exists, even when two spellings collapsed into the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub kind: MessageKind,
    pub name: String,
    pub inbound: Option<String>,
    pub outbound: Option<String>,
}

impl Channel {
    fn new(kind: MessageKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            inbound: None,
            outbound: None,
        }
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Editable iff an outbound callback exists. Independent of whether any call succeeds.
    pub fn editable(&self) -> bool {
        self.has_outbound()
    }

    pub fn callback(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Inbound => self.inbound.as_deref(),
            Direction::Outbound => self.outbound.as_deref(),
        }
    }

    /// Tab caption: the channel name, or the tab position for the unnamed channel.
    pub fn label(&self, position: usize) -> String {
        if self.name.trim().is_empty() {
            position.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// Every channel discovered in one script, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackCatalog {
    channels: Vec<Channel>,
}

impl CallbackCatalog {
    /// Group callback names into channels. Names outside the convention are ignored.
    ///
    /// When two names collapse into the same `(kind, direction, channel)` slot the first one
    /// wins and a warning is logged; the catalog is still produced.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut channels: Vec<Channel> = Vec::new();

        for name in names {
            let Some(parsed) = CallbackName::parse(name.as_ref()) else {
                continue;
            };

            let index = match channels
                .iter()
                .position(|c| c.kind == parsed.kind && c.name == parsed.channel)
            {
                Some(i) => i,
                None => {
                    channels.push(Channel::new(parsed.kind, &parsed.channel));
                    channels.len() - 1
                }
            };

            let channel = &mut channels[index];
            let slot = match parsed.direction {
                Direction::Inbound => &mut channel.inbound,
                Direction::Outbound => &mut channel.outbound,
            };
            if let Some(existing) = slot.as_deref() {
                if existing != parsed.raw {
                    warn!(
                        kind = %parsed.kind,
                        direction = %parsed.direction,
                        channel = %parsed.channel,
                        kept = %existing,
                        ignored = %parsed.raw,
                        "two callbacks map to the same editor channel"
                    );
                }
            } else {
                *slot = Some(parsed.raw);
            }
        }

        Self { channels }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channels of one message kind, in discovery order.
    pub fn channels_for(&self, kind: MessageKind) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(move |c| c.kind == kind)
    }

    pub fn get(&self, kind: MessageKind, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.kind == kind && c.name == name)
    }

    /// Channels that can ever produce a visible tab.
    pub fn displayable(&self, kind: MessageKind) -> impl Iterator<Item = &Channel> {
        self.channels_for(kind).filter(|c| c.has_inbound())
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
